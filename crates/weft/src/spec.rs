//! Core identifiers and type metadata shared by the planner and the executor.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Enumerates scalar element types with a well-defined storage size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    I1,
    Si8,
    Ui8,
    Si16,
    Ui16,
    Si32,
    Ui32,
    Si64,
    Ui64,
    Bf16,
    F16,
    F32,
    F64,
}

impl DType {
    /// Returns the storage size of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::I1 | DType::Si8 | DType::Ui8 => 1,
            DType::Si16 | DType::Ui16 | DType::Bf16 | DType::F16 => 2,
            DType::Si32 | DType::Ui32 | DType::F32 => 4,
            DType::Si64 | DType::Ui64 | DType::F64 => 8,
        }
    }
}

/// Names a symbolic dynamic dimension (e.g. `?batch`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimSymbol(Arc<str>);

impl DimSymbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::<str>::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for DimSymbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DimSymbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(DimSymbol::new(name))
    }
}

/// Represents a single axis extent in a tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Static(usize),
    Dynamic(DimSymbol),
}

/// Logical tensor shape; dimensions may be static or symbolic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymShape {
    dims: Vec<Dimension>,
}

impl SymShape {
    pub fn new(dims: impl Into<Vec<Dimension>>) -> Self {
        Self { dims: dims.into() }
    }

    /// Builds a fully static shape.
    pub fn from_static(dims: &[usize]) -> Self {
        Self {
            dims: dims.iter().map(|d| Dimension::Static(*d)).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    /// Returns static dimensions when all dims are static.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        let mut dims = Vec::with_capacity(self.dims.len());
        for dim in &self.dims {
            match dim {
                Dimension::Static(value) => dims.push(*value),
                Dimension::Dynamic(_) => return None,
            }
        }
        Some(dims)
    }

    /// Returns element count when all dims are static.
    pub fn element_count(&self) -> Option<usize> {
        let dims = self.static_dims()?;
        let mut count = 1usize;
        for dim in dims {
            count = count.checked_mul(dim)?;
        }
        Some(count)
    }

    /// Structural equality over symbolic shapes: same rank and, dimension by
    /// dimension, either both static with the same extent or both symbolic
    /// with the same non-empty name. Anything else compares unequal.
    pub fn same_shape(&self, other: &SymShape) -> bool {
        if self.rank() != other.rank() {
            return false;
        }
        self.dims.iter().zip(other.dims.iter()).all(|(a, b)| match (a, b) {
            (Dimension::Static(x), Dimension::Static(y)) => x == y,
            (Dimension::Dynamic(x), Dimension::Dynamic(y)) => {
                !x.as_str().is_empty() && x.as_str() == y.as_str()
            }
            _ => false,
        })
    }
}

/// Tensor metadata coupling dtype and symbolic shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: SymShape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: SymShape) -> Self {
        Self { dtype, shape }
    }

    /// Total byte length when the shape is fully static.
    pub fn byte_len(&self) -> Option<usize> {
        self.shape
            .element_count()?
            .checked_mul(self.dtype.size_in_bytes())
    }

    /// Two specs describe buffers of the same size when their element sizes
    /// match and their symbolic shapes are structurally equal.
    pub fn same_size(&self, other: &TensorSpec) -> bool {
        self.dtype.size_in_bytes() == other.dtype.size_in_bytes()
            && self.shape.same_shape(&other.shape)
    }
}

/// Static typing information for a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Tensor(TensorSpec),
    /// Non-tensor payload identified by a type tag. Opaque values never
    /// participate in buffer sharing.
    Opaque(String),
}

impl ValueType {
    pub fn as_tensor(&self) -> Option<&TensorSpec> {
        match self {
            ValueType::Tensor(spec) => Some(spec),
            ValueType::Opaque(_) => None,
        }
    }
}

/// Unique index of a value (graph input, initializer, outer-scope reference,
/// or node output) within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique index of a node. Node indices may be sparse; arrays indexed by node
/// are sized by the graph's `max_node_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution queue a kernel is dispatched on. Queue 0 is the default
/// synchronous queue; any other queue is asynchronous and requires fence
/// coordination around values that cross it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueId(pub u32);

impl QueueId {
    pub const DEFAULT: QueueId = QueueId(0);

    pub fn is_default(self) -> bool {
        self.0 == 0
    }
}

/// Memory-type hint a kernel declares for one of its arguments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemType {
    #[default]
    Default,
    /// The argument must live in CPU-accessible memory even when the kernel
    /// itself runs elsewhere (e.g. a shape input to a device kernel).
    CpuInput,
    CpuOutput,
}

/// Identifies an execution provider (the device backend a kernel is bound to).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderId(Arc<str>);

impl ProviderId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::<str>::from(name.into()))
    }

    pub fn cpu() -> Self {
        Self::new("cpu")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ProviderId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ProviderId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(ProviderId::new(name))
    }
}

/// Describes where an allocator would place a buffer: the owning provider and
/// the memory type within that provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceMemoryInfo {
    pub provider: ProviderId,
    pub mem_type: MemType,
}

impl DeviceMemoryInfo {
    pub fn new(provider: ProviderId, mem_type: MemType) -> Self {
        Self { provider, mem_type }
    }

    pub fn cpu() -> Self {
        Self::new(ProviderId::cpu(), MemType::Default)
    }
}

impl fmt::Display for DeviceMemoryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mem_type {
            MemType::Default => write!(f, "{}", self.provider),
            MemType::CpuInput => write!(f, "{} (cpu input)", self.provider),
            MemType::CpuOutput => write!(f, "{} (cpu output)", self.provider),
        }
    }
}
