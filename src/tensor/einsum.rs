//! Einsum implementation for tensor contractions.
//!
//! Einsum notation: "ij,jk->ik" means contract index j
//! - Left of -> : input tensor indices
//! - Right of -> : output tensor indices
//! - Indices missing from the output are summed over (contracted)
//!
//! The keyed form takes integer keys per axis, like numpy's sublist form:
//! `einsum_keyed(&[Operand::new(&a, &[0, 1]), Operand::new(&b, &[1, 2])], &[0, 2])`.
//! Axes sharing a key broadcast against each other (sizes equal or 1).
//!
//! Contractions run pairwise on candle's batched `matmul`, so the cost of a
//! chain like `"ij,jk,kl->il"` stays that of its matrix products.

use candle_core::Tensor;
use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{Result, VmpError};
use crate::syntax::parse_pattern;

/// One operand of a keyed contraction: a tensor and one key per axis.
#[derive(Debug, Clone, Copy)]
pub struct Operand<'a> {
    pub tensor: &'a Tensor,
    pub keys: &'a [usize],
}

impl<'a> Operand<'a> {
    pub fn new(tensor: &'a Tensor, keys: &'a [usize]) -> Self {
        Self { tensor, keys }
    }
}

/// Infer the broadcasted size of every key.
fn infer_size_dict(operands: &[Operand<'_>]) -> Result<FxHashMap<usize, usize>> {
    let mut size_dict: FxHashMap<usize, usize> = FxHashMap::default();

    for (n, op) in operands.iter().enumerate() {
        if op.tensor.rank() != op.keys.len() {
            return Err(VmpError::Pattern(format!(
                "operand {} has {} axes but {} keys",
                n,
                op.tensor.rank(),
                op.keys.len()
            )));
        }
        let unique: FxHashSet<usize> = op.keys.iter().copied().collect();
        if unique.len() != op.keys.len() {
            return Err(VmpError::Unsupported(format!(
                "repeated key in operand {} (diagonal extraction)",
                n
            )));
        }
        for (&key, &size) in op.keys.iter().zip(op.tensor.dims()) {
            let entry = size_dict.entry(key).or_insert(1);
            if *entry == 1 {
                *entry = size;
            } else if size != 1 && size != *entry {
                return Err(VmpError::Broadcast(format!(
                    "key {} has sizes {} and {}",
                    key, *entry, size
                )));
            }
        }
    }

    Ok(size_dict)
}

/// Contract keyed operands into the axes named by `out_keys`.
///
/// Operands are folded in left to right, one pair at a time. Before each
/// pair step, keys that only one side uses and that nothing later needs are
/// summed away. The pair itself is reshaped into a batched `matmul`:
/// shared kept keys form the batch, shared dropped keys the contracted
/// dimension, and the remaining keys of each side its free dimension. No
/// intermediate is larger than an operand or a pair's result.
pub fn einsum_keyed(operands: &[Operand<'_>], out_keys: &[usize]) -> Result<Tensor> {
    let size_dict = infer_size_dict(operands)?;

    let mut out_set: FxHashSet<usize> = FxHashSet::default();
    for &key in out_keys {
        if !size_dict.contains_key(&key) {
            return Err(VmpError::UnknownOutputKey(key.to_string()));
        }
        if !out_set.insert(key) {
            return Err(VmpError::DuplicateOutputKeys);
        }
    }

    let (first, rest) = operands
        .split_first()
        .ok_or_else(|| VmpError::Pattern("einsum needs at least one operand".into()))?;
    let mut acc = Term::from(first);
    for (n, op) in rest.iter().enumerate() {
        // Keys still needed after this step
        let mut keep = out_set.clone();
        keep.extend(rest[n + 1..].iter().flat_map(|later| later.keys.iter().copied()));
        acc = contract_pair(acc, Term::from(op), &keep)?;
    }

    let acc = acc.reduce(|key| out_set.contains(&key))?;
    acc.arranged(out_keys)
}

/// A partial result: a tensor and the key of each of its axes.
struct Term {
    tensor: Tensor,
    keys: Vec<usize>,
}

impl From<&Operand<'_>> for Term {
    fn from(op: &Operand<'_>) -> Self {
        Self {
            tensor: op.tensor.clone(),
            keys: op.keys.to_vec(),
        }
    }
}

impl Term {
    fn axis(&self, key: usize) -> Result<usize> {
        self.keys
            .iter()
            .position(|&k| k == key)
            .ok_or_else(|| VmpError::Pattern(format!("key {} is not an axis of {:?}", key, self.keys)))
    }

    fn dims_of(&self, keys: &[usize]) -> Result<Vec<usize>> {
        keys.iter()
            .map(|&key| Ok(self.tensor.dim(self.axis(key)?)?))
            .collect()
    }

    /// Sum out every axis whose key is not kept.
    fn reduce(self, keep: impl Fn(usize) -> bool) -> Result<Self> {
        let Term { mut tensor, mut keys } = self;
        for ax in (0..keys.len()).rev() {
            if !keep(keys[ax]) {
                tensor = tensor.sum(ax)?;
                keys.remove(ax);
            }
        }
        Ok(Term { tensor, keys })
    }

    /// Contiguous tensor with its axes in `order`, which must name every
    /// key of the term once.
    fn arranged(&self, order: &[usize]) -> Result<Tensor> {
        let axes: Vec<usize> = order.iter().map(|&key| self.axis(key)).collect::<Result<_>>()?;
        if axes.len() != self.keys.len() {
            return Err(VmpError::Pattern(format!(
                "cannot arrange keys {:?} as {:?}",
                self.keys, order
            )));
        }
        if axes.iter().enumerate().all(|(i, &a)| i == a) {
            Ok(self.tensor.contiguous()?)
        } else {
            Ok(self.tensor.permute(axes)?.contiguous()?)
        }
    }
}

/// Multiply two terms and sum their shared keys that are not in `keep`.
fn contract_pair(a: Term, b: Term, keep: &FxHashSet<usize>) -> Result<Term> {
    let mut a = a.reduce(|key| keep.contains(&key) || b.keys.contains(&key))?;
    let mut b = b.reduce(|key| keep.contains(&key) || a.keys.contains(&key))?;

    let (mut batch, mut summed, mut left) = (Vec::new(), Vec::new(), Vec::new());
    for &key in &a.keys {
        match (b.keys.contains(&key), keep.contains(&key)) {
            (true, true) => batch.push(key),
            (true, false) => summed.push(key),
            (false, _) => left.push(key),
        }
    }
    let right: Vec<usize> = b.keys.iter().copied().filter(|key| !a.keys.contains(key)).collect();

    // Reconcile shared keys that are broadcast (size 1) on one side: batch
    // keys are expanded, contracted keys are summed on the full side first
    for &key in batch.iter().chain(&summed) {
        let (ia, ib) = (a.axis(key)?, b.axis(key)?);
        let (sa, sb) = (a.tensor.dim(ia)?, b.tensor.dim(ib)?);
        if sa == sb {
            continue;
        }
        match (sa == 1, keep.contains(&key)) {
            (true, true) => a.tensor = expand_axis(&a.tensor, ia, sb)?,
            (false, true) => b.tensor = expand_axis(&b.tensor, ib, sa)?,
            (true, false) => b.tensor = b.tensor.sum_keepdim(ib)?,
            (false, false) => a.tensor = a.tensor.sum_keepdim(ia)?,
        }
    }

    let batch_dims = a.dims_of(&batch)?;
    let left_dims = a.dims_of(&left)?;
    let right_dims = b.dims_of(&right)?;
    let nb: usize = batch_dims.iter().product();
    let m: usize = left_dims.iter().product();
    let k: usize = a.dims_of(&summed)?.iter().product();
    let n: usize = right_dims.iter().product();

    let lhs = a.arranged(&[&batch[..], &left[..], &summed[..]].concat())?;
    let rhs = b.arranged(&[&batch[..], &summed[..], &right[..]].concat())?;
    let product = lhs.reshape((nb, m, k))?.matmul(&rhs.reshape((nb, k, n))?)?;

    let shape = [batch_dims, left_dims, right_dims].concat();
    Ok(Term {
        tensor: product.reshape(shape)?,
        keys: [batch, left, right].concat(),
    })
}

fn expand_axis(tensor: &Tensor, ax: usize, size: usize) -> Result<Tensor> {
    let mut shape = tensor.dims().to_vec();
    shape[ax] = size;
    Ok(tensor.broadcast_as(shape)?)
}

/// Execute einsum operation from string notation.
///
/// Without `->` the result is fully reduced to a scalar.
pub fn einsum(notation: &str, inputs: &[&Tensor]) -> Result<Tensor> {
    let pattern = parse_pattern(notation)?;
    if pattern.arity() != inputs.len() {
        return Err(VmpError::Pattern(format!(
            "{} operands given for {} input patterns in '{}'",
            inputs.len(),
            pattern.arity(),
            notation
        )));
    }

    // Convert labels to integer keys
    let mut char_map: IndexMap<char, usize> = IndexMap::new();
    for &c in pattern.inputs.iter().flatten() {
        let next = char_map.len();
        char_map.entry(c).or_insert(next);
    }
    let out_keys: Vec<usize> = pattern
        .output
        .iter()
        .map(|c| {
            char_map
                .get(c)
                .copied()
                .ok_or_else(|| VmpError::UnknownOutputKey(c.to_string()))
        })
        .collect::<Result<_>>()?;
    let in_keys: Vec<Vec<usize>> = pattern
        .inputs
        .iter()
        .map(|keys| keys.iter().map(|c| char_map[c]).collect())
        .collect();

    let operands: Vec<Operand<'_>> = inputs
        .iter()
        .zip(&in_keys)
        .map(|(t, keys)| Operand::new(t, keys))
        .collect();
    einsum_keyed(&operands, &out_keys)
}
