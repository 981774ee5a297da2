//! Plate-shape utilities.
//!
//! Plates are leading batch axes shared by structurally identical variables.
//! Shapes are aligned from the right, as in standard broadcasting, and a plate
//! of size 1 (or a missing leading plate) broadcasts against any size.

use candle_core::Tensor;

use crate::config::MOMENT_DTYPE;
use crate::error::{Result, VmpError};

/// Broadcast several shapes together.
pub fn broadcasted_shape(shapes: &[&[usize]]) -> Result<Vec<usize>> {
    let rank = shapes.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut out = vec![1; rank];
    for shape in shapes {
        let offset = rank - shape.len();
        for (j, &size) in shape.iter().enumerate() {
            let current = out[offset + j];
            if current == 1 {
                out[offset + j] = size;
            } else if size != 1 && size != current {
                return Err(VmpError::Broadcast(format!(
                    "{:?}",
                    shapes.iter().map(|s| s.to_vec()).collect::<Vec<_>>()
                )));
            }
        }
    }
    Ok(out)
}

/// True if `shape` broadcasts to `target` without growing it.
pub fn is_shape_subset(shape: &[usize], target: &[usize]) -> bool {
    if shape.len() > target.len() {
        return false;
    }
    let offset = target.len() - shape.len();
    shape
        .iter()
        .enumerate()
        .all(|(j, &size)| size == 1 || size == target[offset + j])
}

/// Replication factor for plates that every other shape holds as unit or
/// lacks entirely.
///
/// Summing a message that is constant along such an axis is the same as
/// multiplying it by the axis length, which is what this returns (multiplied
/// over all such axes).
pub fn plate_multiplier(plates: &[usize], others: &[&[usize]]) -> Result<usize> {
    for other in others {
        broadcasted_shape(&[plates, other])?;
    }
    let n = plates.len();
    let mut r = 1;
    for j in 1..=n {
        let unit_everywhere = others
            .iter()
            .all(|other| j > other.len() || other[other.len() - j] == 1);
        if unit_everywhere {
            r *= plates[n - j];
        }
    }
    Ok(r)
}

/// Leading `rank - ndims` sizes of a tensor, i.e. its plate part.
pub fn plates_of(tensor: &Tensor, ndims: usize) -> Result<Vec<usize>> {
    let dims = tensor.dims();
    if dims.len() < ndims {
        return Err(VmpError::Shape(format!(
            "array of shape {:?} has fewer than {} variable dimensions",
            dims, ndims
        )));
    }
    Ok(dims[..dims.len() - ndims].to_vec())
}

/// Append `n` trailing unit axes, e.g. to line a plate mask up with moments.
pub fn append_unit_axes(tensor: &Tensor, n: usize) -> Result<Tensor> {
    if n == 0 {
        return Ok(tensor.clone());
    }
    let mut shape = tensor.dims().to_vec();
    shape.extend(std::iter::repeat(1).take(n));
    Ok(tensor.reshape(shape)?)
}

/// Prepend unit axes until the tensor has at least `rank` axes.
pub fn prepend_unit_axes(tensor: &Tensor, rank: usize) -> Result<Tensor> {
    let current = tensor.rank();
    if current >= rank {
        return Ok(tensor.clone());
    }
    let mut shape = vec![1; rank - current];
    shape.extend_from_slice(tensor.dims());
    Ok(tensor.reshape(shape)?)
}

/// Drop leading unit axes until the tensor has at most `rank` axes.
///
/// Fails if one of the dropped axes is not unit.
pub fn squeeze_to_rank(tensor: &Tensor, rank: usize) -> Result<Tensor> {
    let dims = tensor.dims();
    if dims.len() <= rank {
        return Ok(tensor.clone());
    }
    let extra = dims.len() - rank;
    if dims[..extra].iter().any(|&d| d != 1) {
        return Err(VmpError::Shape(format!(
            "cannot squeeze array of shape {:?} to {} axes",
            dims, rank
        )));
    }
    Ok(tensor.reshape(dims[extra..].to_vec())?)
}

/// Sum a tensor down to `shape`.
///
/// Leading axes beyond the target rank are summed out, and axes where the
/// target has size 1 are summed with the axis kept. A tensor with fewer axes
/// than the target is left as is, since it already broadcasts.
pub fn sum_to_shape(tensor: &Tensor, shape: &[usize]) -> Result<Tensor> {
    let mut out = tensor.clone();
    while out.rank() > shape.len() {
        out = out.sum(0)?;
    }
    let offset = shape.len() - out.rank();
    for ax in 0..out.rank() {
        let size = out.dim(ax)?;
        let want = shape[offset + ax];
        if want == 1 && size != 1 {
            out = out.sum_keepdim(ax)?;
        } else if size != want && size != 1 {
            return Err(VmpError::Shape(format!(
                "array of shape {:?} cannot be summed to {:?}",
                tensor.dims(),
                shape
            )));
        }
    }
    Ok(out)
}

/// Reduce a boolean mask to `plates` with logical OR.
///
/// Leading axes beyond the plates are reduced away; axes where the plates
/// are unit are reduced with the axis kept.
pub fn any_to_shape(mask: &Tensor, plates: &[usize]) -> Result<Tensor> {
    let mut out = mask.clone();
    while out.rank() > plates.len() {
        out = out.max(0)?;
    }
    let offset = plates.len() - out.rank();
    for ax in 0..out.rank() {
        if plates[offset + ax] == 1 && out.dim(ax)? != 1 {
            out = out.max_keepdim(ax)?;
        }
    }
    Ok(out)
}

/// Reconcile one moment-order message with a parent's plates.
///
/// `message` has shape `message_plates + dims` with `ndims` variable axes,
/// `mask` is shaped by plates only. Both must broadcast to the node's own
/// `plates`. The masked message is summed over plates the parent lacks or
/// holds as unit; axes that are unit everywhere are accounted for with the
/// plate multiplier instead of being broadcast and summed.
pub fn reduce_message_to_parent(
    message: &Tensor,
    mask: &Tensor,
    ndims: usize,
    plates: &[usize],
    parent_plates: &[usize],
) -> Result<Tensor> {
    let message_plates = plates_of(message, ndims)?;
    let mask_plates = mask.dims().to_vec();

    if !is_shape_subset(&message_plates, plates) {
        return Err(VmpError::Shape(format!(
            "message plates {:?} do not broadcast to plates {:?}",
            message_plates, plates
        )));
    }
    if !is_shape_subset(&mask_plates, plates) {
        return Err(VmpError::Shape(format!(
            "mask plates {:?} do not broadcast to plates {:?}",
            mask_plates, plates
        )));
    }
    if !is_shape_subset(parent_plates, plates) {
        return Err(VmpError::Shape(format!(
            "parent plates {:?} do not broadcast to plates {:?}",
            parent_plates, plates
        )));
    }

    let r = plate_multiplier(plates, &[message_plates.as_slice(), mask_plates.as_slice(), parent_plates])?;

    let mask = append_unit_axes(&mask.to_dtype(MOMENT_DTYPE)?, ndims)?;
    let masked = message.broadcast_mul(&mask)?;

    let dims = &message.dims()[message.rank() - ndims..];
    let mut target = parent_plates.to_vec();
    target.extend_from_slice(dims);
    let reduced = sum_to_shape(&masked, &target)?;

    if r != 1 {
        Ok(reduced.affine(r as f64, 0.0)?)
    } else {
        Ok(reduced)
    }
}
