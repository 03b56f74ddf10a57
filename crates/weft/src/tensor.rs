//! Runtime value containers moved through the execution frame.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::spec::DType;

/// Dense host tensor: dtype, concrete dimensions, and raw little-endian
/// storage.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorValue {
    dtype: DType,
    dims: Vec<usize>,
    bytes: Vec<u8>,
}

impl TensorValue {
    /// Builds a zero-filled tensor of the given dtype and dimensions.
    pub fn zeros(dtype: DType, dims: Vec<usize>) -> Self {
        let len = dims.iter().product::<usize>() * dtype.size_in_bytes();
        Self {
            dtype,
            dims,
            bytes: vec![0; len],
        }
    }

    /// Builds an f32 tensor from a flat slice; `data.len()` must equal the
    /// element count of `dims`.
    pub fn from_f32(dims: Vec<usize>, data: &[f32]) -> Self {
        debug_assert_eq!(dims.iter().product::<usize>(), data.len());
        let mut bytes = Vec::with_capacity(data.len() * 4);
        for value in data {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Self {
            dtype: DType::F32,
            dims,
            bytes,
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decodes the storage as f32 elements; `None` for other dtypes.
    pub fn as_f32(&self) -> Option<Vec<f32>> {
        if self.dtype != DType::F32 {
            return None;
        }
        Some(
            self.bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
        )
    }
}

/// A value flowing through a run: either a dense tensor or an opaque payload
/// that never participates in buffer sharing.
#[derive(Clone)]
pub enum MlValue {
    Tensor(TensorValue),
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl MlValue {
    pub fn is_tensor(&self) -> bool {
        matches!(self, MlValue::Tensor(_))
    }

    pub fn as_tensor(&self) -> Option<&TensorValue> {
        match self {
            MlValue::Tensor(tensor) => Some(tensor),
            MlValue::Opaque(_) => None,
        }
    }

    pub fn into_tensor(self) -> Option<TensorValue> {
        match self {
            MlValue::Tensor(tensor) => Some(tensor),
            MlValue::Opaque(_) => None,
        }
    }
}

impl From<TensorValue> for MlValue {
    fn from(tensor: TensorValue) -> Self {
        MlValue::Tensor(tensor)
    }
}

impl fmt::Debug for MlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlValue::Tensor(tensor) => f.debug_tuple("Tensor").field(tensor).finish(),
            MlValue::Opaque(_) => f.write_str("Opaque(..)"),
        }
    }
}
