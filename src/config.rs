//! Runtime configuration: compute device, array dtypes and node options.

use candle_core::{DType, Device};

/// Element type of every moment and message array.
pub const MOMENT_DTYPE: DType = DType::F64;

/// Element type of validity masks (0 = masked out, 1 = valid).
pub const MASK_DTYPE: DType = DType::U8;

/// Pick the compute device, using Metal GPU if available, otherwise CPU.
pub fn default_device() -> Device {
    #[cfg(feature = "metal")]
    let device = Device::new_metal(0).unwrap_or(Device::Cpu);
    #[cfg(not(feature = "metal"))]
    let device = Device::Cpu;
    device
}

/// Options shared by every node constructor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeOptions {
    /// Human-readable name used in logs and error messages
    pub name: Option<String>,
    /// Explicit plates; parents' plates must broadcast to them
    pub plates: Option<Vec<usize>>,
}

impl NodeOptions {
    /// Set explicit plates.
    pub fn with_plates(mut self, plates: impl Into<Vec<usize>>) -> Self {
        self.plates = Some(plates.into());
        self
    }
}

/// Options for the sum-product contraction node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractOptions {
    pub node: NodeOptions,
    /// Plate axis to iterate over instead of contracting in one go.
    /// Not supported; construction fails when set.
    pub iterator_axis: Option<usize>,
}

impl From<NodeOptions> for ContractOptions {
    fn from(node: NodeOptions) -> Self {
        Self {
            node,
            iterator_axis: None,
        }
    }
}
