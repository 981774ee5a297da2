//! Tensor operations for the message-passing core.
//!
//! This module provides the keyed einsum engine, plate-shape utilities and
//! the gather/scatter machinery behind node indexing.

mod einsum;
pub mod index;
pub mod plates;

pub use einsum::{einsum, einsum_keyed, Operand};
pub use index::{Index, NormalizedIndex};
