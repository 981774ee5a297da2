//! Error types for the message-passing core.

use thiserror::Error;

/// The main error type for node construction and message computation.
#[derive(Debug, Error)]
pub enum VmpError {
    /// Candle tensor operation failed
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Not enough arguments to build a node
    #[error("not enough inputs: expected at least 2 arguments, got {0}")]
    InsufficientInput(usize),

    /// Malformed contraction pattern or argument list
    #[error("invalid contraction pattern: {0}")]
    Pattern(String),

    /// Parent does not carry first and second Gaussian moments
    #[error("node {0} is not Gaussian")]
    NotGaussian(usize),

    /// Key list length does not match the parent's dimensionality
    #[error("wrong number of keys ({keys}) for node number {node} with {dims} dimensions")]
    KeyCount { node: usize, keys: usize, dims: usize },

    /// A key appears twice in one parent's key list
    #[error("axis keys for node number {0} are not unique")]
    DuplicateKeys(usize),

    /// A key appears twice in the output key list
    #[error("output keys are not unique")]
    DuplicateOutputKeys,

    /// An output key that no input uses
    #[error("output key {0} does not appear in any input")]
    UnknownOutputKey(String),

    /// Axis sizes that cannot be reconciled by broadcasting
    #[error("shapes do not broadcast: {0}")]
    Broadcast(String),

    /// Explicitly unsupported feature
    #[error("not supported: {0}")]
    Unsupported(String),

    /// Integer index outside the axis
    #[error("index {index} is out of range for axis {axis} with size {size}")]
    IndexOutOfRange { index: isize, axis: usize, size: usize },

    /// More consuming index entries than plate axes
    #[error("too many indices: {given} given for {plates} plate axes")]
    TooManyIndices { given: usize, plates: usize },

    /// A range that selects nothing
    #[error("empty slice on axis {0}")]
    EmptySlice(usize),

    /// A range with zero step
    #[error("slice step cannot be zero")]
    ZeroStep,

    /// Parent index larger than the number of parents
    #[error("parent index {index} out of range for {count} parents")]
    ParentIndex { index: usize, count: usize },

    /// Runtime shape mismatch between messages, masks and plates
    #[error("shape mismatch: {0}")]
    Shape(String),
}

/// Result type for message-passing operations.
pub type Result<T> = std::result::Result<T, VmpError>;
