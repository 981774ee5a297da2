//! Multi-axis indexing over plate axes.
//!
//! An index is a list of [`Index`] entries, normalized once against the
//! plates of the indexed node. The normalized form gathers moments on the way
//! down and scatters messages on the way up. Variable-dimension axes (the
//! trailing `ndims` axes of every array) are never indexed.

use candle_core::Tensor;

use crate::error::{Result, VmpError};
use crate::tensor::plates::{prepend_unit_axes, squeeze_to_rank};

/// One entry of a multi-axis subscript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Index {
    /// Select a single position; the axis disappears
    At(isize),
    /// Select a strided range with standard slice clamping
    Slice {
        start: Option<isize>,
        stop: Option<isize>,
        step: Option<isize>,
    },
    /// Insert a new unit axis
    NewAxis,
    /// Expand to all remaining axes
    Ellipsis,
}

impl Index {
    /// The full range `:`.
    pub fn full() -> Self {
        Index::Slice {
            start: None,
            stop: None,
            step: None,
        }
    }

    /// `start:stop`.
    pub fn range(start: isize, stop: isize) -> Self {
        Index::Slice {
            start: Some(start),
            stop: Some(stop),
            step: None,
        }
    }

    /// `start:`.
    pub fn range_from(start: isize) -> Self {
        Index::Slice {
            start: Some(start),
            stop: None,
            step: None,
        }
    }

    /// `:stop`.
    pub fn range_to(stop: isize) -> Self {
        Index::Slice {
            start: None,
            stop: Some(stop),
            step: None,
        }
    }

    /// `::step`.
    pub fn step(step: isize) -> Self {
        Index::Slice {
            start: None,
            stop: None,
            step: Some(step),
        }
    }

    /// `start:stop:step` with any part optional.
    pub fn slice(start: Option<isize>, stop: Option<isize>, step: Option<isize>) -> Self {
        Index::Slice { start, stop, step }
    }

    fn consumes_axis(&self) -> bool {
        matches!(self, Index::At(_) | Index::Slice { .. })
    }
}

/// A normalized per-axis operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AxisOp {
    /// Select `index` on source axis `axis`
    At { axis: usize, index: usize },
    /// Select `len` positions `start, start + step, ...` on source axis `axis`
    Range {
        axis: usize,
        start: usize,
        step: isize,
        len: usize,
    },
    /// Produce a unit axis without consuming a source axis
    NewAxis,
}

impl AxisOp {
    fn positions(start: usize, step: isize, len: usize) -> Vec<u32> {
        (0..len)
            .map(|i| (start as isize + i as isize * step) as u32)
            .collect()
    }
}

/// An index resolved against concrete source plates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedIndex {
    ops: Vec<AxisOp>,
    source_plates: Vec<usize>,
    plates: Vec<usize>,
}

impl NormalizedIndex {
    /// Normalize `index` against `source_plates`.
    ///
    /// The first ellipsis expands to as many full ranges as needed; any
    /// further ellipsis stands for a single full range. Axes not mentioned at
    /// the end are passed through.
    pub fn new(index: &[Index], source_plates: &[usize]) -> Result<Self> {
        let consuming = index.iter().filter(|i| i.consumes_axis()).count();
        let ellipses = index.iter().filter(|i| matches!(i, Index::Ellipsis)).count();
        let explicit = consuming + ellipses.saturating_sub(1);
        if explicit > source_plates.len() {
            return Err(VmpError::TooManyIndices {
                given: explicit,
                plates: source_plates.len(),
            });
        }
        let fill = source_plates.len() - explicit;

        let mut ops = Vec::with_capacity(index.len() + fill);
        let mut axis = 0;
        let mut seen_ellipsis = false;
        for entry in index {
            match *entry {
                Index::At(i) => {
                    ops.push(normalize_at(axis, i, source_plates[axis])?);
                    axis += 1;
                }
                Index::Slice { start, stop, step } => {
                    ops.push(normalize_slice(axis, source_plates[axis], start, stop, step)?);
                    axis += 1;
                }
                Index::NewAxis => ops.push(AxisOp::NewAxis),
                Index::Ellipsis => {
                    let n = if seen_ellipsis { 1 } else { fill };
                    seen_ellipsis = true;
                    for _ in 0..n {
                        ops.push(full_range(axis, source_plates[axis]));
                        axis += 1;
                    }
                }
            }
        }
        while axis < source_plates.len() {
            ops.push(full_range(axis, source_plates[axis]));
            axis += 1;
        }

        let plates = ops
            .iter()
            .filter_map(|op| match op {
                AxisOp::At { .. } => None,
                AxisOp::Range { len, .. } => Some(*len),
                AxisOp::NewAxis => Some(1),
            })
            .collect();

        Ok(Self {
            ops,
            source_plates: source_plates.to_vec(),
            plates,
        })
    }

    /// Plates after indexing.
    pub fn plates(&self) -> &[usize] {
        &self.plates
    }

    /// Plates of the indexed source.
    pub fn source_plates(&self) -> &[usize] {
        &self.source_plates
    }

    /// True if the index selects every source position in order.
    pub fn is_identity(&self) -> bool {
        self.ops.iter().all(|op| match *op {
            AxisOp::Range {
                axis,
                start,
                step,
                len,
            } => start == 0 && step == 1 && len == self.source_plates[axis],
            _ => false,
        })
    }

    /// Apply the index to an array shaped `plates + dims` with `ndims`
    /// variable axes.
    ///
    /// The array may be broadcast: missing leading plates are skipped, new
    /// axes in front of the first present plate are dropped, and unit plates
    /// stay unit under any index. The result never shares storage with the
    /// input.
    pub fn gather(&self, tensor: &Tensor, ndims: usize) -> Result<Tensor> {
        let rank = tensor.rank();
        if rank < ndims || rank - ndims > self.source_plates.len() {
            return Err(VmpError::Shape(format!(
                "array of shape {:?} does not match plates {:?} with {} variable dimensions",
                tensor.dims(),
                self.source_plates,
                ndims
            )));
        }
        if self.is_identity() {
            return Ok(tensor.copy()?);
        }
        let missing = self.source_plates.len() - (rank - ndims);

        let mut out = tensor.clone();
        let mut ax = 0;
        let mut reached = false;
        for op in &self.ops {
            match *op {
                AxisOp::NewAxis => {
                    if reached {
                        out = out.unsqueeze(ax)?;
                        ax += 1;
                    }
                }
                AxisOp::At { axis, index } => {
                    if axis < missing {
                        continue;
                    }
                    reached = true;
                    let i = if out.dim(ax)? == 1 { 0 } else { index };
                    out = out.narrow(ax, i, 1)?.squeeze(ax)?;
                }
                AxisOp::Range {
                    axis,
                    start,
                    step,
                    len,
                } => {
                    if axis < missing {
                        continue;
                    }
                    reached = true;
                    if out.dim(ax)? != 1 {
                        out = select_range(&out, ax, start, step, len)?;
                    }
                    ax += 1;
                }
            }
        }
        Ok(out.copy()?)
    }

    /// Adjoint of [`gather`](Self::gather): map an array shaped by the
    /// indexed plates back onto the source plates.
    ///
    /// Positions outside the selection are zero. A unit message axis under a
    /// range covering the whole source axis stays unit; leading unit axes
    /// beyond the indexed plates are dropped.
    pub fn scatter(&self, tensor: &Tensor, ndims: usize) -> Result<Tensor> {
        let rank = tensor.rank();
        if rank < ndims {
            return Err(VmpError::Shape(format!(
                "array of shape {:?} has fewer than {} variable dimensions",
                tensor.dims(),
                ndims
            )));
        }
        let view_rank = self.plates.len();
        let out = squeeze_to_rank(tensor, view_rank + ndims)?;
        let mut out = prepend_unit_axes(&out, view_rank + ndims)?;
        for (j, (&size, &want)) in out.dims().iter().zip(&self.plates).enumerate() {
            if size != 1 && size != want {
                return Err(VmpError::Shape(format!(
                    "message plate {} has size {} but the indexed plates are {:?}",
                    j, size, self.plates
                )));
            }
        }
        if self.is_identity() {
            return Ok(out);
        }

        let mut ax = 0;
        for op in &self.ops {
            match *op {
                AxisOp::NewAxis => {
                    out = out.squeeze(ax)?;
                }
                AxisOp::At { axis, index } => {
                    out = out.unsqueeze(ax)?;
                    let size = self.source_plates[axis];
                    if size > 1 {
                        out = scatter_axis(&out, ax, &[index as u32], size)?;
                    }
                    ax += 1;
                }
                AxisOp::Range {
                    axis,
                    start,
                    step,
                    len,
                } => {
                    let size = self.source_plates[axis];
                    let current = out.dim(ax)?;
                    let covers = len == size;
                    if !(current == 1 && covers) {
                        if current == 1 && len > 1 {
                            let mut shape = out.dims().to_vec();
                            shape[ax] = len;
                            out = out.broadcast_as(shape)?;
                        }
                        let identity = start == 0 && step == 1 && covers;
                        if !identity {
                            let positions = AxisOp::positions(start, step, len);
                            out = scatter_axis(&out, ax, &positions, size)?;
                        }
                    }
                    ax += 1;
                }
            }
        }
        Ok(out)
    }
}

fn full_range(axis: usize, size: usize) -> AxisOp {
    AxisOp::Range {
        axis,
        start: 0,
        step: 1,
        len: size,
    }
}

fn normalize_at(axis: usize, index: isize, size: usize) -> Result<AxisOp> {
    let n = size as isize;
    let i = if index < 0 { index + n } else { index };
    if i < 0 || i >= n {
        return Err(VmpError::IndexOutOfRange { index, axis, size });
    }
    Ok(AxisOp::At {
        axis,
        index: i as usize,
    })
}

/// Resolve a slice the way sequence slicing does: out-of-range bounds are
/// clamped, negative bounds count from the end. Empty results are rejected.
fn normalize_slice(
    axis: usize,
    size: usize,
    start: Option<isize>,
    stop: Option<isize>,
    step: Option<isize>,
) -> Result<AxisOp> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(VmpError::ZeroStep);
    }
    let n = size as isize;
    let (lower, upper) = if step > 0 { (0, n) } else { (-1, n - 1) };
    let clamp = |bound: Option<isize>, default: isize| match bound {
        None => default,
        Some(b) if b < 0 => (b + n).max(lower),
        Some(b) => b.min(upper),
    };
    let start = clamp(start, if step > 0 { lower } else { upper });
    let stop = clamp(stop, if step > 0 { upper } else { lower });

    let len = if step > 0 && stop > start {
        (stop - start - 1) / step + 1
    } else if step < 0 && start > stop {
        (start - stop - 1) / (-step) + 1
    } else {
        0
    };
    if len == 0 {
        return Err(VmpError::EmptySlice(axis));
    }

    Ok(AxisOp::Range {
        axis,
        start: start as usize,
        step,
        len: len as usize,
    })
}

fn select_range(tensor: &Tensor, ax: usize, start: usize, step: isize, len: usize) -> Result<Tensor> {
    if step == 1 {
        return Ok(tensor.narrow(ax, start, len)?);
    }
    let positions = AxisOp::positions(start, step, len);
    let ids = Tensor::from_vec(positions, len, tensor.device())?;
    Ok(tensor.index_select(&ids, ax)?)
}

/// Write `tensor` into zeros of length `size` along `ax` at `positions`.
fn scatter_axis(tensor: &Tensor, ax: usize, positions: &[u32], size: usize) -> Result<Tensor> {
    let mut shape = tensor.dims().to_vec();
    shape[ax] = size;
    let zeros = Tensor::zeros(shape, tensor.dtype(), tensor.device())?;
    let ids = Tensor::from_vec(positions.to_vec(), positions.len(), tensor.device())?;
    let source = tensor.contiguous()?;
    Ok(zeros.index_add(&ids, &source, ax)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{assert_close, values};
    use candle_core::{DType, Device};
    use rstest::rstest;

    const ALL: Index = Index::Slice {
        start: None,
        stop: None,
        step: None,
    };

    #[rstest]
    // Integer indices
    #[case(&[3, 4], &[Index::At(2), Index::At(-4)], &[])]
    #[case(&[3, 4, 5], &[Index::At(2), Index::At(1)], &[5])]
    // Full slices
    #[case(&[3, 4, 5], &[ALL, Index::At(1), ALL], &[3, 5])]
    #[case(&[3, 4, 5], &[Index::At(1), ALL, ALL], &[4, 5])]
    #[case(&[3, 4, 5], &[ALL, ALL, Index::At(1)], &[3, 4])]
    // Steps
    #[case(&[9], &[Index::step(3)], &[3])]
    #[case(&[10], &[Index::step(3)], &[4])]
    #[case(&[11], &[Index::step(3)], &[4])]
    // Bounds
    #[case(&[10], &[Index::range_from(3)], &[7])]
    #[case(&[10], &[Index::range_to(7)], &[7])]
    #[case(&[10], &[Index::range(6, 7)], &[1])]
    #[case(&[10], &[Index::range_from(-20)], &[10])]
    #[case(&[10], &[Index::range_to(20)], &[10])]
    #[case(&[3], &[Index::slice(Some(-4), None, Some(4))], &[1])]
    #[case(&[5], &[Index::step(-2)], &[3])]
    // One ellipsis
    #[case(&[3, 4, 5, 6], &[Index::Ellipsis, Index::At(2), Index::At(1)], &[3, 4])]
    #[case(&[3, 4, 5, 6], &[Index::At(2), Index::Ellipsis, Index::At(1)], &[4, 5])]
    #[case(&[3, 4, 5, 6], &[Index::At(2), Index::At(1), Index::Ellipsis], &[5, 6])]
    // Multiple ellipsis
    #[case(&[3, 4, 5], &[Index::Ellipsis, Index::At(2), Index::Ellipsis], &[3, 5])]
    #[case(&[3, 4, 5], &[Index::Ellipsis, Index::At(2), Index::Ellipsis, Index::Ellipsis], &[4, 5])]
    #[case(&[3, 4, 5], &[Index::Ellipsis, Index::Ellipsis, Index::Ellipsis, Index::Ellipsis], &[3, 4, 5])]
    // New axes
    #[case(&[3], &[Index::NewAxis], &[1, 3])]
    #[case(&[3], &[ALL, Index::NewAxis], &[3, 1])]
    #[case(&[3, 4], &[Index::NewAxis, ALL, Index::NewAxis, ALL], &[1, 3, 1, 4])]
    fn test_normalized_plates(
        #[case] source: &[usize],
        #[case] index: &[Index],
        #[case] expected: &[usize],
    ) {
        let normalized = NormalizedIndex::new(index, source).unwrap();
        assert_eq!(normalized.plates(), expected);
    }

    #[rstest]
    #[case(&[3], &[ALL, ALL])]
    #[case(&[3], &[Index::Ellipsis, Index::Ellipsis, Index::Ellipsis])]
    fn test_too_many_indices(#[case] source: &[usize], #[case] index: &[Index]) {
        let err = NormalizedIndex::new(index, source).unwrap_err();
        assert!(matches!(err, VmpError::TooManyIndices { .. }));
    }

    #[rstest]
    #[case(&[3], &[Index::At(3)])]
    #[case(&[3], &[Index::At(-4)])]
    #[case(&[3, 4], &[Index::At(2), Index::At(-5)])]
    fn test_index_out_of_range(#[case] source: &[usize], #[case] index: &[Index]) {
        let err = NormalizedIndex::new(index, source).unwrap_err();
        assert!(matches!(err, VmpError::IndexOutOfRange { .. }));
    }

    #[rstest]
    #[case(&[Index::range_from(3)])]
    #[case(&[Index::range_to(-3)])]
    fn test_empty_slice(#[case] index: &[Index]) {
        let err = NormalizedIndex::new(index, &[3]).unwrap_err();
        assert!(matches!(err, VmpError::EmptySlice(0)));
    }

    #[test]
    fn test_zero_step() {
        let err = NormalizedIndex::new(&[Index::step(0)], &[3]).unwrap_err();
        assert!(matches!(err, VmpError::ZeroStep));
    }

    #[test]
    fn test_identity() {
        let full = NormalizedIndex::new(&[Index::Ellipsis], &[2, 3]).unwrap();
        assert!(full.is_identity());
        let partial = NormalizedIndex::new(&[Index::range_to(1)], &[2, 3]).unwrap();
        assert!(!partial.is_identity());

        // Identity views pass broadcast arrays through unchanged
        let u = arange(&[1, 3, 2]);
        let g = full.gather(&u, 1).unwrap();
        assert_eq!(g.dims(), &[1, 3, 2]);
        assert_eq!(values(&g), values(&u));
        let m = arange(&[3, 2]);
        let s = full.scatter(&m, 1).unwrap();
        assert_eq!(s.dims(), &[3, 2]);
        assert_eq!(values(&s), values(&m));
    }

    fn arange(shape: &[usize]) -> Tensor {
        let n: usize = shape.iter().product();
        let data: Vec<f64> = (0..n).map(|i| i as f64).collect();
        Tensor::from_vec(data, shape.to_vec(), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_gather_integer_and_ranges() {
        let u = arange(&[3, 4]);
        let idx = NormalizedIndex::new(&[Index::At(2), Index::At(1)], &[3, 4]).unwrap();
        assert_eq!(values(&idx.gather(&u, 0).unwrap()), vec![9.0]);

        let idx = NormalizedIndex::new(&[Index::step(2), Index::At(2)], &[3, 4]).unwrap();
        assert_eq!(values(&idx.gather(&u, 0).unwrap()), vec![2.0, 10.0]);

        let idx = NormalizedIndex::new(&[Index::range_from(1), Index::At(2)], &[3, 4]).unwrap();
        assert_eq!(values(&idx.gather(&u, 0).unwrap()), vec![6.0, 10.0]);

        let idx = NormalizedIndex::new(&[Index::step(-1), Index::At(0)], &[3, 4]).unwrap();
        assert_eq!(values(&idx.gather(&u, 0).unwrap()), vec![8.0, 4.0, 0.0]);
    }

    #[test]
    fn test_gather_broadcast_source() {
        // Source moments lack the leading plate
        let u = arange(&[4]);
        let idx = NormalizedIndex::new(&[Index::At(2), Index::At(1)], &[3, 4]).unwrap();
        let out = idx.gather(&u, 0).unwrap();
        assert_eq!(out.rank(), 0);
        assert_eq!(values(&out), vec![1.0]);

        // Unit plate gets index 0
        let u = arange(&[3, 1]);
        let out = idx.gather(&u, 0).unwrap();
        assert_eq!(values(&out), vec![2.0]);

        // Range over a unit plate keeps it
        let u = arange(&[1, 4]);
        let idx = NormalizedIndex::new(&[Index::slice(Some(0), Some(2), Some(2)), Index::At(2)], &[3, 4])
            .unwrap();
        let out = idx.gather(&u, 0).unwrap();
        assert_eq!(out.dims(), &[1]);
        assert_eq!(values(&out), vec![2.0]);
    }

    #[test]
    fn test_gather_new_axes() {
        // Leading new axes before any present plate are dropped
        let u = arange(&[3]);
        let idx = NormalizedIndex::new(&[Index::NewAxis, Index::NewAxis, Index::At(2)], &[3]).unwrap();
        assert_eq!(idx.gather(&u, 0).unwrap().rank(), 0);

        let u = arange(&[3]);
        let idx = NormalizedIndex::new(
            &[Index::At(1), Index::NewAxis, Index::NewAxis, Index::At(2)],
            &[4, 3],
        )
        .unwrap();
        assert_eq!(idx.gather(&u, 0).unwrap().rank(), 0);

        // New axes after a present plate are kept
        let u = arange(&[3, 4]);
        let idx = NormalizedIndex::new(
            &[Index::At(2), Index::NewAxis, Index::NewAxis, Index::At(1)],
            &[3, 4],
        )
        .unwrap();
        let out = idx.gather(&u, 0).unwrap();
        assert_eq!(out.dims(), &[1, 1]);
        assert_eq!(values(&out), vec![9.0]);
    }

    #[test]
    fn test_gather_keeps_variable_axes() {
        let u = arange(&[2, 3, 4]);
        let idx = NormalizedIndex::new(&[Index::Ellipsis, Index::At(2)], &[2, 3]).unwrap();
        let out = idx.gather(&u, 1).unwrap();
        assert_eq!(out.dims(), &[2, 4]);
        assert_close(&out, &u.narrow(1, 2, 1).unwrap().squeeze(1).unwrap(), 0.0);
    }

    #[test]
    fn test_scatter_slices() {
        let idx = NormalizedIndex::new(
            &[ALL, Index::range_to(2), Index::range_from(1), Index::step(2)],
            &[2, 3, 4, 5],
        )
        .unwrap();
        assert_eq!(idx.plates(), &[2, 2, 3, 3]);
        let m = Tensor::ones((2, 2, 3, 3), DType::F64, &Device::Cpu).unwrap();
        let out = idx.scatter(&m, 0).unwrap();
        assert_eq!(out.dims(), &[2, 3, 4, 5]);
        let v = values(&out);
        let at = |a: usize, b: usize, c: usize, d: usize| v[((a * 3 + b) * 4 + c) * 5 + d];
        assert_eq!(at(1, 1, 3, 4), 1.0);
        assert_eq!(at(0, 2, 3, 4), 0.0);
        assert_eq!(at(0, 0, 0, 0), 0.0);
        assert_eq!(at(0, 0, 1, 1), 0.0);
        assert_eq!(v.iter().sum::<f64>(), 36.0);
    }

    #[test]
    fn test_scatter_broadcast_message() {
        // [0:, 1:, -2:, -3:] on (3,3,3,3) with a scalar-like message
        let idx = NormalizedIndex::new(
            &[Index::range_from(0), Index::range_from(1), Index::range_from(-2), Index::range_from(-3)],
            &[3, 3, 3, 3],
        )
        .unwrap();
        let m = Tensor::new(&[[2.0f64]], &Device::Cpu).unwrap();
        let out = idx.scatter(&m, 0).unwrap();
        assert_eq!(out.dims(), &[1, 3, 3, 1]);
        assert_eq!(values(&out), vec![0.0, 0.0, 0.0, 0.0, 2.0, 2.0, 0.0, 2.0, 2.0]);
    }

    #[test]
    fn test_scatter_new_axes_and_integers() {
        let idx = NormalizedIndex::new(
            &[Index::NewAxis, ALL, Index::NewAxis, Index::At(1)],
            &[2, 3],
        )
        .unwrap();
        assert_eq!(idx.plates(), &[1, 2, 1]);
        let m = Tensor::new(&[[[1.0f64], [2.0]]], &Device::Cpu).unwrap();
        let out = idx.scatter(&m, 0).unwrap();
        assert_eq!(out.dims(), &[2, 3]);
        assert_eq!(values(&out), vec![0.0, 1.0, 0.0, 0.0, 2.0, 0.0]);
    }

    #[test]
    fn test_scatter_rejects_mismatched_message() {
        let idx = NormalizedIndex::new(&[ALL], &[3]).unwrap();
        let m = Tensor::ones(4, DType::F64, &Device::Cpu).unwrap();
        assert!(idx.scatter(&m, 0).is_err());
    }
}
