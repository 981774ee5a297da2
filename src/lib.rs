//! vmp: contraction and indexing nodes for variational message passing
//!
//! A model is a graph of nodes that exchange moments (expected sufficient
//! statistics) with their neighbours. This crate provides the deterministic
//! nodes that recombine Gaussian moments and the plate machinery they share.
//!
//! # Key Insight
//!
//! For independent Gaussian parents, the first and second moments of any
//! sum of products are themselves sums of products of the parents' moments.
//! `"ij,j->i"` over means gives the mean of `A x`; the same pattern with every
//! key doubled over second moments gives `E[(A x)(A x)ᵀ]`.
//!
//! # Modules
//!
//! - [`tensor`]: keyed einsum, plate broadcasting and multi-axis indexing
//! - [`syntax`]: the `"ik,k,kj->ij"` contraction notation
//! - [`node`]: the node protocol, [`SumMultiply`], [`Slice`] and [`Constant`]

pub mod config;
pub mod error;
pub mod node;
pub mod syntax;
pub mod tensor;

#[cfg(test)]
mod testing;

pub use config::{ContractOptions, NodeOptions};
pub use error::{Result, VmpError};
pub use node::{dot, Arg, Constant, ContractSpec, Key, Moments, Node, NodeExt, NodeRef, Parent, Slice, SumMultiply};
pub use syntax::{parse_pattern, ContractionPattern};
pub use tensor::{einsum, einsum_keyed, Index, Operand};
