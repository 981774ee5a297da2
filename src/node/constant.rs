//! Parentless node with fixed moments.

use std::rc::Rc;

use candle_core::Tensor;

use super::{wire, Moments, Node, NodeCore};
use crate::config::{NodeOptions, MOMENT_DTYPE};
use crate::error::{Result, VmpError};
use crate::tensor::plates::plates_of;

/// A node whose moments never change.
pub struct Constant {
    core: NodeCore,
    moments: Moments,
}

impl Constant {
    /// Wrap fixed moments with the given per-order dimensions.
    ///
    /// Plates are read off the order-0 array unless given in `options`; every
    /// moment array must broadcast to `plates + dims[k]`.
    pub fn new(moments: Moments, dims: Vec<Vec<usize>>, options: NodeOptions) -> Result<Rc<Self>> {
        if moments.len() != dims.len() {
            return Err(VmpError::Shape(format!(
                "{} moment arrays given for {} moment orders",
                moments.len(),
                dims.len()
            )));
        }
        let moments: Moments = moments
            .into_iter()
            .map(|u| u.to_dtype(MOMENT_DTYPE))
            .collect::<candle_core::Result<_>>()?;

        let mut plates = match moments.first() {
            Some(u) => plates_of(u, dims[0].len())?,
            None => Vec::new(),
        };
        for (k, (u, d)) in moments.iter().zip(&dims).enumerate() {
            let own = plates_of(u, d.len())?;
            if &u.dims()[own.len()..] != d.as_slice() {
                return Err(VmpError::Shape(format!(
                    "moment {} has shape {:?}, expected dimensions {:?}",
                    k,
                    u.dims(),
                    d
                )));
            }
            if own.len() > plates.len() {
                plates = own;
            }
        }

        let core = NodeCore::new(Vec::new(), dims, Some(plates), &options)?;
        log::debug!(
            "constant {} with plates {:?} and dims {:?}",
            options.name.as_deref().unwrap_or("<unnamed>"),
            core.plates,
            core.dims
        );
        Ok(wire(Self { core, moments }))
    }

    /// Constant Gaussian moments of `value` whose trailing `ndim` axes are
    /// variable dimensions: `u⁰ = x` and `u¹ = x ⊗ x`.
    pub fn gaussian(value: &Tensor, ndim: usize, options: NodeOptions) -> Result<Rc<Self>> {
        let x = value.to_dtype(MOMENT_DTYPE)?;
        let plates = plates_of(&x, ndim)?;
        let d0 = x.dims()[plates.len()..].to_vec();
        let xx = outer(&x, ndim)?;
        let mut d1 = d0.clone();
        d1.extend_from_slice(&d0);
        Self::new(vec![x, xx], vec![d0, d1], options)
    }
}

/// Outer product over the trailing `ndim` axes, keeping leading axes
/// elementwise: `plates + d` becomes `plates + d + d`.
pub(crate) fn outer(x: &Tensor, ndim: usize) -> Result<Tensor> {
    let dims = x.dims();
    let mut left = dims.to_vec();
    left.extend(std::iter::repeat(1).take(ndim));
    let mut right = dims[..dims.len() - ndim].to_vec();
    right.extend(std::iter::repeat(1).take(ndim));
    right.extend_from_slice(&dims[dims.len() - ndim..]);
    Ok(x.reshape(left)?.broadcast_mul(&x.reshape(right)?)?)
}

impl Node for Constant {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn compute_moments(&self) -> Result<Moments> {
        Ok(self.moments.clone())
    }
}
