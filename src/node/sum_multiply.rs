//! Sum-product contraction of Gaussian moments.
//!
//! `SumMultiply` computes an einsum over the moments of its parents. Each
//! parent's variable axes are labelled with keys; keys missing from the output
//! are summed out. Given independent parents, the first moment of the result
//! is the contraction of the first moments and the second moment is the
//! contraction of the second moments, with every key doubled for the second
//! copy of the axes.
//!
//! # Example
//!
//! ```ignore
//! // y_i = sum_j A_ij x_j, plate-wise
//! let y = SumMultiply::from_notation("ij,j->i", vec![a.into(), x.into()])?;
//! ```
//!
//! Messages to a parent contract the child message with the other parents'
//! moments and the node mask. Plates that would only be broadcast and summed
//! again are accounted for with a multiplier instead of being materialized.

use std::fmt;
use std::rc::Rc;

use candle_core::Tensor;
use indexmap::IndexMap;
use rustc_hash::FxHashSet;

use super::constant::{outer, Constant};
use super::{wire, Moments, Node, NodeCore, NodeRef};
use crate::config::{ContractOptions, NodeOptions, MOMENT_DTYPE};
use crate::error::{Result, VmpError};
use crate::syntax::parse_pattern;
use crate::tensor::plates::{broadcasted_shape, plate_multiplier};
use crate::tensor::{einsum_keyed, Operand};

/// Axis label, either a notation character or a positional integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Label(char),
    Id(usize),
}

impl From<char> for Key {
    fn from(c: char) -> Self {
        Key::Label(c)
    }
}

impl From<usize> for Key {
    fn from(id: usize) -> Self {
        Key::Id(id)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Label(c) => write!(f, "{}", c),
            Key::Id(id) => write!(f, "{}", id),
        }
    }
}

/// A contraction operand before validation.
#[derive(Clone)]
pub enum Parent {
    Node(NodeRef),
    /// Fixed array, wrapped as a constant Gaussian
    Literal(Tensor),
}

impl From<NodeRef> for Parent {
    fn from(node: NodeRef) -> Self {
        Parent::Node(node)
    }
}

impl From<&NodeRef> for Parent {
    fn from(node: &NodeRef) -> Self {
        Parent::Node(node.clone())
    }
}

impl From<Tensor> for Parent {
    fn from(t: Tensor) -> Self {
        Parent::Literal(t)
    }
}

/// One positional argument: an operand or a key list.
#[derive(Clone)]
pub enum Arg {
    Parent(Parent),
    Keys(Vec<Key>),
}

impl Arg {
    pub fn node(node: NodeRef) -> Self {
        Arg::Parent(Parent::Node(node))
    }

    pub fn literal(t: Tensor) -> Self {
        Arg::Parent(Parent::Literal(t))
    }

    pub fn keys<K: Into<Key>>(keys: impl IntoIterator<Item = K>) -> Self {
        Arg::Keys(keys.into_iter().map(Into::into).collect())
    }
}

/// The two ways to describe a contraction.
#[derive(Clone)]
pub enum ContractSpec {
    /// `"ik,k,kj->ij"` with one parent per input term
    Notation { pattern: String, parents: Vec<Parent> },
    /// `node, keys, node, keys, ..., [out_keys]`
    Positional(Vec<Arg>),
}

impl ContractSpec {
    fn arg_count(&self) -> usize {
        match self {
            ContractSpec::Notation { parents, .. } => parents.len() + 1,
            ContractSpec::Positional(args) => args.len(),
        }
    }

    /// Split into operands, their key lists and the output keys.
    fn resolve(self) -> Result<(Vec<Parent>, Vec<Vec<Key>>, Vec<Key>)> {
        match self {
            ContractSpec::Notation { pattern, parents } => {
                let pattern = parse_pattern(&pattern)?;
                if pattern.arity() != parents.len() {
                    return Err(VmpError::Pattern(format!(
                        "{} input nodes given for {} input terms in '{}'",
                        parents.len(),
                        pattern.arity(),
                        pattern
                    )));
                }
                let keysets = pattern
                    .inputs
                    .iter()
                    .map(|term| term.iter().map(|&c| Key::Label(c)).collect())
                    .collect();
                let out = pattern.output.iter().map(|&c| Key::Label(c)).collect();
                Ok((parents, keysets, out))
            }
            ContractSpec::Positional(mut args) => {
                let out = if args.len() % 2 == 1 {
                    match args.pop() {
                        Some(Arg::Keys(keys)) => keys,
                        _ => {
                            return Err(VmpError::Pattern(
                                "the last argument must be the output keys".into(),
                            ))
                        }
                    }
                } else {
                    Vec::new()
                };
                let mut parents = Vec::with_capacity(args.len() / 2);
                let mut keysets = Vec::with_capacity(args.len() / 2);
                let mut iter = args.into_iter();
                while let Some(first) = iter.next() {
                    match (first, iter.next()) {
                        (Arg::Parent(p), Some(Arg::Keys(keys))) => {
                            parents.push(p);
                            keysets.push(keys);
                        }
                        _ => {
                            return Err(VmpError::Pattern(format!(
                                "argument {} must be a node followed by its keys",
                                2 * parents.len()
                            )))
                        }
                    }
                }
                Ok((parents, keysets, out))
            }
        }
    }
}

/// Node computing a sum of products over the moments of Gaussian parents.
pub struct SumMultiply {
    core: NodeCore,
    n_keys: usize,
    in_keys: Vec<Vec<usize>>,
    out_keys: Vec<usize>,
}

impl SumMultiply {
    /// Contraction from notation, e.g. `"ik,k,kj->ij"`. Without `->` the
    /// result is a full reduction.
    pub fn from_notation(pattern: &str, parents: Vec<Parent>) -> Result<Rc<Self>> {
        Self::build(
            ContractSpec::Notation {
                pattern: pattern.to_string(),
                parents,
            },
            ContractOptions::default(),
        )
    }

    /// Contraction from positional arguments
    /// `node1, keys1, node2, keys2, ..., [out_keys]`.
    pub fn new(args: Vec<Arg>) -> Result<Rc<Self>> {
        Self::build(ContractSpec::Positional(args), ContractOptions::default())
    }

    pub fn build(spec: ContractSpec, options: ContractOptions) -> Result<Rc<Self>> {
        let count = spec.arg_count();
        if count < 2 {
            return Err(VmpError::InsufficientInput(count));
        }
        if options.iterator_axis.is_some() {
            return Err(VmpError::Unsupported("iterator axis".into()));
        }

        let (parents, keysets, out) = spec.resolve()?;

        let parents: Vec<NodeRef> = parents
            .into_iter()
            .zip(&keysets)
            .map(|(p, keys)| -> Result<NodeRef> {
                match p {
                    Parent::Node(node) => Ok(node),
                    Parent::Literal(t) => {
                        Ok(Constant::gaussian(&t, keys.len(), NodeOptions::default())? as NodeRef)
                    }
                }
            })
            .collect::<Result<_>>()?;

        for (n, (parent, keys)) in parents.iter().zip(&keysets).enumerate() {
            let dims = parent.dims();
            if dims.len() != 2 || dims[1].len() != 2 * dims[0].len() {
                return Err(VmpError::NotGaussian(n));
            }
            let d0 = &dims[0];
            if dims[1][..d0.len()] != d0[..] || dims[1][d0.len()..] != d0[..] {
                return Err(VmpError::NotGaussian(n));
            }
            if keys.len() != d0.len() {
                return Err(VmpError::KeyCount {
                    node: n,
                    keys: keys.len(),
                    dims: d0.len(),
                });
            }
            let unique: FxHashSet<&Key> = keys.iter().collect();
            if unique.len() != keys.len() {
                return Err(VmpError::DuplicateKeys(n));
            }
        }

        // Dense key ids in order of first appearance, with broadcasted sizes
        let mut table: IndexMap<Key, usize> = IndexMap::new();
        for (parent, keys) in parents.iter().zip(&keysets) {
            for (key, &size) in keys.iter().zip(&parent.dims()[0]) {
                let entry = table.entry(*key).or_insert(1);
                if *entry == 1 {
                    *entry = size;
                }
            }
        }

        let unique_out: FxHashSet<&Key> = out.iter().collect();
        if unique_out.len() != out.len() {
            return Err(VmpError::DuplicateOutputKeys);
        }
        let entry = |key: &Key| {
            table
                .get_full(key)
                .map(|(id, _, &size)| (id, size))
                .ok_or_else(|| VmpError::UnknownOutputKey(key.to_string()))
        };
        for key in &out {
            entry(key)?;
        }

        for (parent, keys) in parents.iter().zip(&keysets) {
            for (key, &size) in keys.iter().zip(&parent.dims()[0]) {
                let (_, reconciled) = entry(key)?;
                if size != 1 && size != reconciled {
                    return Err(VmpError::Broadcast(format!(
                        "axes using key {} do not broadcast ({} vs {})",
                        key, size, reconciled
                    )));
                }
            }
        }

        let n_keys = table.len();
        let in_keys: Vec<Vec<usize>> = keysets
            .iter()
            .map(|keys| keys.iter().map(|key| entry(key).map(|(id, _)| id)).collect::<Result<_>>())
            .collect::<Result<_>>()?;
        let (out_keys, d0): (Vec<usize>, Vec<usize>) =
            out.iter().map(entry).collect::<Result<Vec<_>>>()?.into_iter().unzip();

        let mut d1 = d0.clone();
        d1.extend_from_slice(&d0);

        let core = NodeCore::new(parents, vec![d0, d1], None, &options.node)?;
        log::debug!(
            "sum-multiply {} over {} keys: inputs {:?} -> output {:?}, plates {:?}",
            options.node.name.as_deref().unwrap_or("<unnamed>"),
            n_keys,
            in_keys,
            out_keys,
            core.plates
        );

        Ok(wire(Self {
            core,
            n_keys,
            in_keys,
            out_keys,
        }))
    }

    /// Dense key ids of each parent's variable axes.
    pub fn in_keys(&self) -> &[Vec<usize>] {
        &self.in_keys
    }

    /// Dense key ids of the output axes.
    pub fn out_keys(&self) -> &[usize] {
        &self.out_keys
    }

    /// Mean and covariance `u¹ - u⁰ ⊗ u⁰` of the result.
    pub fn parameters(&self) -> Result<(Tensor, Tensor)> {
        let u = self.get_moments()?;
        let ndim = self.dims()[0].len();
        let cov = u[1].broadcast_sub(&outer(&u[0], ndim)?)?;
        Ok((u[0].clone(), cov))
    }

    /// Variable-axis keys of `keys` for moment order `k`.
    fn dim_keys(&self, keys: &[usize], k: usize) -> Vec<usize> {
        if k == 0 {
            keys.to_vec()
        } else {
            keys.iter().map(|key| key + self.n_keys).chain(keys.iter().copied()).collect()
        }
    }

    /// Number of plate axes of an order-`k` array whose variable axes carry
    /// `n_dims` keys.
    fn plate_count(u: &Tensor, n_dims: usize, k: usize) -> Result<usize> {
        u.rank().checked_sub((k + 1) * n_dims).ok_or_else(|| {
            VmpError::Shape(format!(
                "moment {} of shape {:?} has fewer than {} variable axes",
                k,
                u.dims(),
                (k + 1) * n_dims
            ))
        })
    }
}

/// Plate keys for `count` right-aligned axes above `base`.
fn plate_keys(base: usize, count: usize) -> Vec<usize> {
    (0..count).map(|j| base + count - j).collect()
}

impl Node for SumMultiply {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn compute_moments(&self) -> Result<Moments> {
        let u_parents: Vec<Moments> = self
            .message_from_parents(None)?
            .into_iter()
            .flatten()
            .collect();

        (0..2)
            .map(|k| -> Result<Tensor> {
                let base = (k + 1) * self.n_keys;
                let mut keys = Vec::with_capacity(u_parents.len());
                let mut out_plates = 0;
                for (u, in_keys) in u_parents.iter().zip(&self.in_keys) {
                    let count = Self::plate_count(&u[k], in_keys.len(), k)?;
                    out_plates = out_plates.max(count);
                    let mut all = plate_keys(base, count);
                    all.extend(self.dim_keys(in_keys, k));
                    keys.push(all);
                }
                let mut out = plate_keys(base, out_plates);
                out.extend(self.dim_keys(&self.out_keys, k));

                let operands: Vec<Operand<'_>> = u_parents
                    .iter()
                    .zip(&keys)
                    .map(|(u, keys)| Operand::new(&u[k], keys))
                    .collect();
                einsum_keyed(&operands, &out)
            })
            .collect()
    }

    fn message_to_parent(&self, index: usize) -> Result<Moments> {
        let parent = self.parent(index)?.clone();
        let u_parents = self.message_from_parents(Some(index))?;
        let m = self.message_from_children()?;
        let mask = self.mask().to_dtype(MOMENT_DTYPE)?;
        log::trace!("message from {} to parent {}", self.label(), index);

        let parent_plates = parent.plates().len();
        let mask_plates = mask.dims().to_vec();
        (0..2)
            .map(|k| -> Result<Tensor> {
                let base = (k + 1) * self.n_keys;
                let parent_dims = self.dim_keys(&self.in_keys[index], k);
                let mut parent_keys = plate_keys(base, parent_plates);
                parent_keys.extend_from_slice(&parent_dims);

                let mut placeholder_shape = vec![1; parent_plates];
                placeholder_shape.extend_from_slice(&parent.dims()[k]);
                let placeholder = Tensor::ones(placeholder_shape, MOMENT_DTYPE, self.core.device())?;

                // Plates of everything except the placeholder
                let mut result_rank = mask_plates.len();
                let mut result_plates = mask_plates.clone();

                let mut tensors: Vec<&Tensor> = vec![&placeholder, &mask];
                let mut keys: Vec<Vec<usize>> = vec![parent_keys.clone(), plate_keys(base, mask.rank())];

                for (u, in_keys) in u_parents.iter().zip(&self.in_keys) {
                    let Some(u) = u else { continue };
                    let count = Self::plate_count(&u[k], in_keys.len(), k)?;
                    result_rank = result_rank.max(count);
                    result_plates = broadcasted_shape(&[result_plates.as_slice(), &u[k].dims()[..count]])?;
                    let mut all = plate_keys(base, count);
                    all.extend(self.dim_keys(in_keys, k));
                    tensors.push(&u[k]);
                    keys.push(all);
                }

                let count = Self::plate_count(&m[k], self.out_keys.len(), k)?;
                result_rank = result_rank.max(count);
                result_plates = broadcasted_shape(&[result_plates.as_slice(), &m[k].dims()[..count]])?;
                let mut all = plate_keys(base, count);
                all.extend(self.dim_keys(&self.out_keys, k));
                tensors.push(&m[k]);
                keys.push(all);

                // Unit axes of the parent are summed here and put back after
                let parent_shape = parent.shape(k);
                let removed: Vec<usize> = (0..parent_keys.len())
                    .filter(|&j| parent_shape[j] == 1)
                    .collect();
                let wanted: Vec<usize> = parent_keys
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| parent_shape[*j] != 1)
                    .map(|(_, &key)| key)
                    .collect();

                let operands: Vec<Operand<'_>> = tensors
                    .iter()
                    .zip(&keys)
                    .map(|(t, keys)| Operand::new(t, keys))
                    .collect();
                let msg = einsum_keyed(&operands, &wanted)?;

                let mut shape = msg.dims().to_vec();
                for &ax in &removed {
                    shape.insert(ax, 1);
                }
                if parent_plates > result_rank {
                    shape.drain(..parent_plates - result_rank);
                }
                let msg = msg.reshape(shape)?;

                let r = plate_multiplier(self.plates(), &[result_plates.as_slice(), parent.plates()])?;
                if r != 1 {
                    Ok(msg.affine(r as f64, 0.0)?)
                } else {
                    Ok(msg)
                }
            })
            .collect()
    }
}

/// Inner product of vectors sharing one axis: `"i,i,...,i->"`.
pub fn dot(parents: Vec<Parent>) -> Result<Rc<SumMultiply>> {
    let pattern = vec!["i"; parents.len()].join(",");
    SumMultiply::from_notation(&pattern, parents)
}
