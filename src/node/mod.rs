//! Nodes of a variational message-passing graph.
//!
//! Every node carries moments `u = (u⁰, u¹, …)`, where `u^k` has shape
//! `plates + dims[k]`. Moments flow from parents to children; messages flow
//! back from children to parents. Deterministic nodes transform the moments
//! of their parents and re-project the messages of their children.
//!
//! A child keeps its parents alive through [`NodeRef`]; a parent only holds
//! weak references to its children, so dropping the last handle to a child
//! detaches it.

mod constant;
mod slice;
mod sum_multiply;

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use candle_core::{Device, Tensor};

use crate::config::{default_device, NodeOptions, MASK_DTYPE, MOMENT_DTYPE};
use crate::error::{Result, VmpError};
use crate::tensor::plates::{any_to_shape, broadcasted_shape, is_shape_subset, reduce_message_to_parent};
use crate::tensor::Index;

pub use constant::Constant;
pub use slice::Slice;
pub use sum_multiply::{dot, Arg, ContractSpec, Key, Parent, SumMultiply};

/// Ordered moment arrays of a node, one per moment order.
pub type Moments = Vec<Tensor>;

/// Shared handle to a node.
pub type NodeRef = Rc<dyn Node>;

/// State shared by every node implementation.
pub struct NodeCore {
    name: Option<String>,
    dims: Vec<Vec<usize>>,
    plates: Vec<usize>,
    parents: Vec<NodeRef>,
    children: RefCell<Vec<(Weak<dyn Node>, usize)>>,
    moments: RefCell<Option<Moments>>,
    mask: RefCell<Tensor>,
    device: Device,
}

impl NodeCore {
    /// Create the core of a node with the given dimensions.
    ///
    /// Plates default to the broadcast of the parents' plates. Explicit plates
    /// in `options` must be a broadcast of them.
    pub(crate) fn new(
        parents: Vec<NodeRef>,
        dims: Vec<Vec<usize>>,
        plates: Option<Vec<usize>>,
        options: &NodeOptions,
    ) -> Result<Self> {
        let derived = match plates {
            Some(plates) => plates,
            None => {
                let shapes: Vec<&[usize]> = parents.iter().map(|p| p.plates()).collect();
                broadcasted_shape(&shapes)?
            }
        };
        let plates = match &options.plates {
            Some(explicit) => {
                if broadcasted_shape(&[derived.as_slice(), explicit.as_slice()])? != *explicit {
                    return Err(VmpError::Broadcast(format!(
                        "plates {:?} do not broadcast to the given plates {:?}",
                        derived, explicit
                    )));
                }
                explicit.clone()
            }
            None => derived,
        };

        let device = parents
            .first()
            .map(|p| p.core().device.clone())
            .unwrap_or_else(default_device);
        let mask = Tensor::new(1u8, &device)?;

        Ok(Self {
            name: options.name.clone(),
            dims,
            plates,
            parents,
            children: RefCell::new(Vec::new()),
            moments: RefCell::new(None),
            mask: RefCell::new(mask),
            device,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Register a freshly built node as a child of each of its parents.
pub(crate) fn wire<N: Node + 'static>(node: N) -> Rc<N> {
    let node = Rc::new(node);
    let weak: Weak<dyn Node> = Rc::downgrade(&node) as Weak<dyn Node>;
    for (index, parent) in node.parents().iter().enumerate() {
        parent.core().children.borrow_mut().push((weak.clone(), index));
    }
    node
}

/// The message-passing protocol.
///
/// Implementors provide [`core`](Node::core) and
/// [`compute_moments`](Node::compute_moments). Nodes whose messages need the
/// generic plate reconciliation provide
/// [`message_and_mask_to_parent`](Node::message_and_mask_to_parent) and keep
/// the default [`message_to_parent`](Node::message_to_parent); nodes that do
/// their own reduction override the latter.
pub trait Node {
    fn core(&self) -> &NodeCore;

    /// Moments from the current parent moments, bypassing the cache.
    fn compute_moments(&self) -> Result<Moments>;

    /// Raw message to parent `index` and the mask it applies under, both
    /// shaped by this node's plates.
    fn message_and_mask_to_parent(&self, index: usize) -> Result<(Moments, Tensor)> {
        Err(VmpError::Unsupported(format!(
            "message to parent {} of {}",
            index,
            self.label()
        )))
    }

    /// Message to parent `index`, reconciled to the parent's plates.
    fn message_to_parent(&self, index: usize) -> Result<Moments> {
        let parent = self.parent(index)?;
        let (message, mask) = self.message_and_mask_to_parent(index)?;
        message
            .iter()
            .zip(parent.dims())
            .map(|(m, dims)| {
                reduce_message_to_parent(m, &mask, dims.len(), self.plates(), parent.plates())
            })
            .collect()
    }

    /// This node's mask reduced to the plates of parent `index`.
    fn mask_to_parent(&self, index: usize) -> Result<Tensor> {
        let parent = self.parent(index)?;
        any_to_shape(&self.mask(), parent.plates())
    }

    /// Moments as seen by children.
    fn message_to_child(&self) -> Result<Moments> {
        self.get_moments()
    }

    fn name(&self) -> Option<&str> {
        self.core().name.as_deref()
    }

    /// Name for logs and errors.
    fn label(&self) -> String {
        self.name().map_or_else(|| "<unnamed>".to_string(), str::to_string)
    }

    fn dims(&self) -> &[Vec<usize>] {
        &self.core().dims
    }

    fn plates(&self) -> &[usize] {
        &self.core().plates
    }

    /// Shape of moment order `k`: plates followed by `dims[k]`.
    fn shape(&self, k: usize) -> Vec<usize> {
        let mut shape = self.plates().to_vec();
        shape.extend_from_slice(&self.dims()[k]);
        shape
    }

    fn parents(&self) -> &[NodeRef] {
        &self.core().parents
    }

    fn parent(&self, index: usize) -> Result<&NodeRef> {
        let parents = self.parents();
        parents.get(index).ok_or(VmpError::ParentIndex {
            index,
            count: parents.len(),
        })
    }

    /// Live children with the parent index this node has in each.
    fn children(&self) -> Vec<(NodeRef, usize)> {
        self.core()
            .children
            .borrow()
            .iter()
            .filter_map(|(child, index)| child.upgrade().map(|c| (c, *index)))
            .collect()
    }

    fn mask(&self) -> Tensor {
        self.core().mask.borrow().clone()
    }

    /// Replace the mask. Nonzero entries are valid.
    fn set_mask(&self, mask: &Tensor) -> Result<()> {
        if !is_shape_subset(mask.dims(), self.plates()) {
            return Err(VmpError::Shape(format!(
                "mask of shape {:?} does not broadcast to plates {:?}",
                mask.dims(),
                self.plates()
            )));
        }
        let mask = if mask.dtype() == MASK_DTYPE {
            mask.clone()
        } else {
            mask.to_dtype(MOMENT_DTYPE)?.ne(0.0)?
        };
        *self.core().mask.borrow_mut() = mask;
        Ok(())
    }

    /// Cached moments, computed on first use.
    fn get_moments(&self) -> Result<Moments> {
        if let Some(u) = self.core().moments.borrow().as_ref() {
            return Ok(u.clone());
        }
        log::trace!("computing moments of {}", self.label());
        let u = self.compute_moments()?;
        *self.core().moments.borrow_mut() = Some(u.clone());
        Ok(u)
    }

    /// Drop cached moments here and in every descendant.
    fn invalidate(&self) {
        self.core().moments.borrow_mut().take();
        for (child, _) in self.children() {
            child.invalidate();
        }
    }

    /// Moments of every parent, with `None` in place of `exclude`.
    fn message_from_parents(&self, exclude: Option<usize>) -> Result<Vec<Option<Moments>>> {
        self.parents()
            .iter()
            .enumerate()
            .map(|(i, parent)| {
                if Some(i) == exclude {
                    Ok(None)
                } else {
                    parent.message_to_child().map(Some)
                }
            })
            .collect()
    }

    /// Sum of the children's messages, starting from zeros shaped `dims`.
    fn message_from_children(&self) -> Result<Moments> {
        let device = self.core().device();
        let mut total: Moments = self
            .dims()
            .iter()
            .map(|d| Tensor::zeros(d.as_slice(), MOMENT_DTYPE, device))
            .collect::<candle_core::Result<_>>()?;
        for (child, index) in self.children() {
            let message = child.message_to_parent(index)?;
            for (acc, m) in total.iter_mut().zip(message) {
                *acc = acc.broadcast_add(&m)?;
            }
        }
        Ok(total)
    }

    /// Recompute the mask from the children and propagate it upwards.
    ///
    /// The mask becomes the logical OR of the children's masks. A node
    /// without children keeps its current mask.
    fn update_mask(&self) -> Result<()> {
        let mut combined: Option<Tensor> = None;
        for (child, index) in self.children() {
            let m = child.mask_to_parent(index)?;
            combined = Some(match combined {
                None => m,
                Some(acc) => acc.broadcast_maximum(&m)?,
            });
        }
        if let Some(mask) = combined {
            if !is_shape_subset(mask.dims(), self.plates()) {
                return Err(VmpError::Shape(format!(
                    "children's mask of shape {:?} does not broadcast to plates {:?} of {}",
                    mask.dims(),
                    self.plates(),
                    self.label()
                )));
            }
            *self.core().mask.borrow_mut() = mask;
        }
        for parent in self.parents() {
            parent.update_mask()?;
        }
        Ok(())
    }
}

/// Indexing sugar for node handles.
pub trait NodeExt {
    /// A view of the node's plates, see [`Slice`].
    fn index(&self, index: &[Index]) -> Result<Rc<Slice>>;
}

impl NodeExt for NodeRef {
    fn index(&self, index: &[Index]) -> Result<Rc<Slice>> {
        Slice::new(self.clone(), index, NodeOptions::default())
    }
}

impl<N: Node + 'static> NodeExt for Rc<N> {
    fn index(&self, index: &[Index]) -> Result<Rc<Slice>> {
        let node: NodeRef = self.clone();
        Slice::new(node, index, NodeOptions::default())
    }
}
