//! View of a node's plates.
//!
//! `Slice` selects, strides, drops and inserts plate axes of another node
//! without touching its variable dimensions. Moments are gathered through the
//! index; messages and masks are scattered back, zero (or invalid) outside
//! the selection.

use std::rc::Rc;

use candle_core::Tensor;

use super::{wire, Moments, Node, NodeCore, NodeRef};
use crate::config::{NodeOptions, MOMENT_DTYPE};
use crate::error::{Result, VmpError};
use crate::tensor::plates::append_unit_axes;
use crate::tensor::{Index, NormalizedIndex};

pub struct Slice {
    core: NodeCore,
    index: NormalizedIndex,
}

impl Slice {
    /// View `node` through `index`. The index is normalized against the
    /// node's plates here, so indexing errors surface at construction.
    pub fn new(node: NodeRef, index: &[Index], options: NodeOptions) -> Result<Rc<Self>> {
        let index = NormalizedIndex::new(index, node.plates())?;
        log::debug!(
            "slice of {} from plates {:?} to {:?}",
            node.label(),
            node.plates(),
            index.plates()
        );
        let dims = node.dims().to_vec();
        let plates = index.plates().to_vec();
        let core = NodeCore::new(vec![node], dims, Some(plates), &options)?;
        Ok(wire(Self { core, index }))
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index != 0 {
            return Err(VmpError::ParentIndex { index, count: 1 });
        }
        Ok(())
    }
}

impl Node for Slice {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn compute_moments(&self) -> Result<Moments> {
        let u = self.parents()[0].message_to_child()?;
        u.iter()
            .zip(self.dims())
            .map(|(u, d)| self.index.gather(u, d.len()))
            .collect()
    }

    fn message_to_parent(&self, index: usize) -> Result<Moments> {
        self.check_index(index)?;
        let m = self.message_from_children()?;
        let mask = self.mask().to_dtype(MOMENT_DTYPE)?;
        log::trace!("scattering message of {} to its parent", self.label());
        m.iter()
            .zip(self.dims())
            .map(|(m, d)| {
                let masked = m.broadcast_mul(&append_unit_axes(&mask, d.len())?)?;
                self.index.scatter(&masked, d.len())
            })
            .collect()
    }

    fn mask_to_parent(&self, index: usize) -> Result<Tensor> {
        self.check_index(index)?;
        let mask = self.mask().to_dtype(MOMENT_DTYPE)?;
        Ok(self.index.scatter(&mask, 0)?.ne(0.0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MASK_DTYPE;
    use crate::node::{Constant, NodeExt};
    use crate::testing::{self, assert_close, values, Sink};
    use candle_core::{DType, Device};
    use rstest::rstest;

    const ALL: Index = Index::Slice {
        start: None,
        stop: None,
        step: None,
    };

    fn arange(shape: &[usize]) -> Tensor {
        let n: usize = shape.iter().product();
        let data: Vec<f64> = (0..n).map(|i| i as f64).collect();
        Tensor::from_vec(data, shape.to_vec(), &Device::Cpu).unwrap()
    }

    /// Node with plates `plates` and moments `u` of possibly fewer plates.
    fn source(u: Tensor, ndim: usize, plates: &[usize]) -> NodeRef {
        let dims = vec![u.dims()[u.rank() - ndim..].to_vec()];
        Constant::new(vec![u], dims, NodeOptions::default().with_plates(plates)).unwrap()
    }

    fn attach(view: &Rc<Slice>, message: Tensor, mask: Option<Tensor>) -> Rc<Sink> {
        let sink = testing::attach(view.clone(), vec![message]);
        if let Some(mask) = mask {
            sink.set_mask(&mask).unwrap();
        }
        sink
    }

    #[rstest]
    #[case(&[3, 4], &[Index::At(2), Index::At(-4)], &[])]
    #[case(&[10], &[Index::step(3)], &[4])]
    #[case(&[3, 4, 5, 6], &[Index::At(2), Index::Ellipsis, Index::At(1)], &[4, 5])]
    #[case(&[3, 4], &[Index::NewAxis, ALL, Index::NewAxis, ALL], &[1, 3, 1, 4])]
    fn test_view_plates(#[case] plates: &[usize], #[case] index: &[Index], #[case] expected: &[usize]) {
        let mut shape = plates.to_vec();
        shape.push(2);
        let x = source(arange(&shape), 1, plates);
        let y = x.index(index).unwrap();
        assert_eq!(y.plates(), expected);
        assert_eq!(y.dims(), x.dims());
    }

    #[rstest]
    #[case(&[3, 4], &[Index::At(2), Index::At(-5)])]
    #[case(&[3], &[ALL, ALL])]
    #[case(&[3], &[Index::range_from(3)])]
    fn test_view_rejects_index(#[case] plates: &[usize], #[case] index: &[Index]) {
        let x = source(arange(plates), 0, plates);
        assert!(x.index(index).is_err());
    }

    #[test]
    fn test_moments_gather_plates_only() {
        let x = source(arange(&[3, 4, 2]), 1, &[3, 4]);
        let y = x.index(&[Index::step(2), Index::At(1)]).unwrap();
        let u = y.get_moments().unwrap();
        assert_eq!(u[0].dims(), &[2, 2]);
        assert_eq!(values(&u[0]), vec![2.0, 3.0, 18.0, 19.0]);
    }

    #[test]
    fn test_moments_of_broadcast_source() {
        // Moments lack the leading plate and hold the second as unit
        let x = source(arange(&[1, 2]), 1, &[5, 3]);
        let y = x.index(&[Index::At(4), Index::range_from(1)]).unwrap();
        assert_eq!(y.plates(), &[2]);
        let u = y.get_moments().unwrap();
        assert_eq!(u[0].dims(), &[1, 2]);
        assert_eq!(values(&u[0]), vec![0.0, 1.0]);
    }

    #[test]
    fn test_view_of_view() {
        let x = source(arange(&[4, 3]), 0, &[4, 3]);
        let y = x.index(&[Index::step(2)]).unwrap();
        let z = y.index(&[Index::At(-1), Index::range_to(2)]).unwrap();
        assert_eq!(z.plates(), &[2]);
        assert_eq!(values(&z.get_moments().unwrap()[0]), vec![6.0, 7.0]);
    }

    #[test]
    fn test_full_view_is_identity() {
        let x = source(arange(&[3, 4]), 0, &[3, 4]);
        let y = x.index(&[Index::Ellipsis]).unwrap();
        assert_close(&y.get_moments().unwrap()[0], &x.get_moments().unwrap()[0], 0.0);

        let m = Tensor::randn(0f64, 1f64, (3, 4), &Device::Cpu).unwrap();
        let _sink = attach(&y, m.clone(), None);
        assert_close(&y.message_to_parent(0).unwrap()[0], &m, 0.0);
    }

    #[test]
    fn test_message_scattered_to_selection() {
        let x = source(arange(&[4, 3]), 1, &[4]);
        let y = x.index(&[Index::range(1, 3)]).unwrap();
        let m = Tensor::ones((2, 3), DType::F64, &Device::Cpu).unwrap();
        let _sink = attach(&y, m, None);
        let out = y.message_to_parent(0).unwrap();
        assert_eq!(out[0].dims(), &[4, 3]);
        let rows: Vec<f64> = out[0].sum(1).unwrap().to_vec1().unwrap();
        assert_eq!(rows, vec![0.0, 3.0, 3.0, 0.0]);
    }

    #[test]
    fn test_message_masked_before_scatter() {
        let x = source(arange(&[4]), 0, &[4]);
        let y = x.index(&[Index::step(2)]).unwrap();
        let m = Tensor::new(&[5.0f64, 7.0], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[0u8, 1], &Device::Cpu).unwrap();
        let _sink = attach(&y, m, Some(mask));
        y.update_mask().unwrap();
        let out = y.message_to_parent(0).unwrap();
        assert_eq!(values(&out[0]), vec![0.0, 0.0, 7.0, 0.0]);
    }

    #[test]
    fn test_unit_message_stays_unit_over_full_axis() {
        let x = source(arange(&[3, 4]), 0, &[3, 4]);
        let y = x.index(&[Index::At(1)]).unwrap();
        let m = Tensor::full(2.0f64, (1,), &Device::Cpu).unwrap();
        let _sink = attach(&y, m, None);
        let out = y.message_to_parent(0).unwrap();
        assert_eq!(out[0].dims(), &[3, 1]);
        assert_eq!(values(&out[0]), vec![0.0, 2.0, 0.0]);
    }

    #[test]
    fn test_mask_scattered_to_parent() {
        let x = source(arange(&[5]), 0, &[5]);
        let y = x.index(&[Index::range_from(1), Index::NewAxis]).unwrap();
        assert_eq!(y.plates(), &[4, 1]);
        let m = Tensor::zeros((4, 1), DType::F64, &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1u8], [0], [0], [1]], &Device::Cpu).unwrap();
        let _sink = attach(&y, m, Some(mask));
        y.update_mask().unwrap();
        let parent_mask = y.mask_to_parent(0).unwrap();
        assert_eq!(parent_mask.dtype(), MASK_DTYPE);
        let parent_mask: Vec<u8> = parent_mask.to_vec1().unwrap();
        assert_eq!(parent_mask, vec![0, 1, 0, 0, 1]);
        // Propagated to the source through update_mask
        let source_mask: Vec<u8> = x.mask().to_vec1().unwrap();
        assert_eq!(source_mask, parent_mask);
    }

    #[test]
    fn test_only_parent_zero() {
        let x = source(arange(&[3]), 0, &[3]);
        let y = x.index(&[ALL]).unwrap();
        assert!(matches!(y.message_to_parent(1), Err(VmpError::ParentIndex { .. })));
    }
}
