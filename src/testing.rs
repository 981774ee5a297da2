//! Helpers shared by the unit tests.

use std::rc::Rc;

use candle_core::{DType, Device, Tensor};
use rustc_hash::FxHashMap;

use crate::config::NodeOptions;
use crate::error::Result;
use crate::node::{wire, Moments, Node, NodeCore, NodeRef};

/// Flatten a tensor into row-major `f64` values.
pub fn values(t: &Tensor) -> Vec<f64> {
    t.to_dtype(DType::F64)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f64>())
        .unwrap()
}

/// Assert equal shapes and elementwise agreement within `tol`.
pub fn assert_close(a: &Tensor, b: &Tensor, tol: f64) {
    assert_eq!(a.dims(), b.dims(), "shape mismatch");
    for (i, (x, y)) in values(a).iter().zip(values(b)).enumerate() {
        assert!(
            approx::abs_diff_eq!(*x, y, epsilon = tol),
            "element {} differs: {} vs {}",
            i,
            x,
            y
        );
    }
}

/// Contraction by explicit loops over every key assignment.
///
/// Unit axes broadcast. Output axes take the largest size of their key.
pub fn reference_einsum(operands: &[(&Tensor, &[usize])], out_keys: &[usize]) -> Tensor {
    let mut sizes: FxHashMap<usize, usize> = FxHashMap::default();
    for (t, keys) in operands {
        for (&k, &d) in keys.iter().zip(t.dims()) {
            let e = sizes.entry(k).or_insert(1);
            *e = (*e).max(d);
        }
    }
    let mut all_keys: Vec<usize> = sizes.keys().copied().collect();
    all_keys.sort_unstable();

    let data: Vec<(Vec<f64>, Vec<usize>, Vec<usize>)> = operands
        .iter()
        .map(|(t, keys)| (values(t), t.dims().to_vec(), keys.to_vec()))
        .collect();
    let out_shape: Vec<usize> = out_keys.iter().map(|k| sizes[k]).collect();
    let mut out = vec![0.0; out_shape.iter().product()];

    let total: usize = all_keys.iter().map(|k| sizes[k]).product();
    let mut assignment: FxHashMap<usize, usize> = FxHashMap::default();
    for flat in 0..total {
        let mut rest = flat;
        for k in all_keys.iter().rev() {
            assignment.insert(*k, rest % sizes[k]);
            rest /= sizes[k];
        }
        let mut product = 1.0;
        for (vals, dims, keys) in &data {
            let mut offset = 0;
            for (&k, &d) in keys.iter().zip(dims) {
                let i = if d == 1 { 0 } else { assignment[&k] };
                offset = offset * d + i;
            }
            product *= vals[offset];
        }
        let mut o = 0;
        for (k, &d) in out_keys.iter().zip(&out_shape) {
            o = o * d + assignment[k];
        }
        out[o] += product;
    }

    Tensor::from_vec(out, out_shape, &Device::Cpu).unwrap()
}

/// Child node that sends a fixed message to its only parent.
pub struct Sink {
    core: NodeCore,
    message: Moments,
}

impl Node for Sink {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn compute_moments(&self) -> Result<Moments> {
        Ok(Vec::new())
    }

    fn message_to_parent(&self, index: usize) -> Result<Moments> {
        self.parent(index)?;
        Ok(self.message.clone())
    }
}

/// Attach a [`Sink`] below `parent`. Keep the returned handle alive for as
/// long as the message should be seen.
pub fn attach(parent: NodeRef, message: Moments) -> Rc<Sink> {
    let dims = parent.dims().to_vec();
    let core = NodeCore::new(vec![parent], dims, None, &NodeOptions::default()).unwrap();
    wire(Sink { core, message })
}
