//! Host-backed tensor used for eager data, device transfers, and interpreter values.

use std::sync::{Arc, RwLock, RwLockReadGuard};

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};

use super::{DType, Shape, TensorSpec};

/// Single scalar extracted from (or used to fill) a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl ScalarValue {
    pub fn to_f64(self) -> f64 {
        match self {
            ScalarValue::Bool(value) => f64::from(u8::from(value)),
            ScalarValue::Int(value) => value as f64,
            ScalarValue::Float(value) => value,
        }
    }

    pub fn is_floating_point(self) -> bool {
        matches!(self, ScalarValue::Float(_))
    }

    pub fn is_integral(self) -> bool {
        matches!(self, ScalarValue::Int(_))
    }
}

/// Typed element buffer behind a [`Tensor`].
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    Bool(Vec<bool>),
}

impl Storage {
    /// Builds a buffer of `dtype` from `f64` values, truncating toward zero for integers.
    pub fn from_f64(dtype: DType, values: &[f64]) -> Self {
        match dtype {
            DType::F32 => Storage::F32(values.iter().map(|&v| v as f32).collect()),
            DType::F64 => Storage::F64(values.to_vec()),
            DType::I32 => Storage::I32(values.iter().map(|&v| v as i32).collect()),
            DType::I64 => Storage::I64(values.iter().map(|&v| v as i64).collect()),
            DType::Bool => Storage::Bool(values.iter().map(|&v| v != 0.0).collect()),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Storage::F32(_) => DType::F32,
            Storage::F64(_) => DType::F64,
            Storage::I32(_) => DType::I32,
            Storage::I64(_) => DType::I64,
            Storage::Bool(_) => DType::Bool,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Storage::F32(values) => values.len(),
            Storage::F64(values) => values.len(),
            Storage::I32(values) => values.len(),
            Storage::I64(values) => values.len(),
            Storage::Bool(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_f64(&self, index: usize) -> f64 {
        match self {
            Storage::F32(values) => f64::from(values[index]),
            Storage::F64(values) => values[index],
            Storage::I32(values) => f64::from(values[index]),
            Storage::I64(values) => values[index] as f64,
            Storage::Bool(values) => f64::from(u8::from(values[index])),
        }
    }

    pub fn set_f64(&mut self, index: usize, value: f64) {
        match self {
            Storage::F32(values) => values[index] = value as f32,
            Storage::F64(values) => values[index] = value,
            Storage::I32(values) => values[index] = value as i32,
            Storage::I64(values) => values[index] = value as i64,
            Storage::Bool(values) => values[index] = value != 0.0,
        }
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        (0..self.len()).map(|index| self.get_f64(index)).collect()
    }

    /// Elements at `indices`, in order, in this buffer's element type.
    pub fn gather(&self, indices: &[usize]) -> Storage {
        fn pick<T: Copy>(values: &[T], indices: &[usize]) -> Vec<T> {
            indices.iter().map(|&index| values[index]).collect()
        }
        match self {
            Storage::F32(values) => Storage::F32(pick(values, indices)),
            Storage::F64(values) => Storage::F64(pick(values, indices)),
            Storage::I32(values) => Storage::I32(pick(values, indices)),
            Storage::I64(values) => Storage::I64(pick(values, indices)),
            Storage::Bool(values) => Storage::Bool(pick(values, indices)),
        }
    }

    /// Writes `source[i]` to `indices[i]`. Both buffers must share an element type.
    pub fn scatter(&mut self, indices: &[usize], source: &Storage) -> Result<()> {
        fn put<T: Copy>(values: &mut [T], indices: &[usize], source: &[T]) {
            for (&index, &value) in indices.iter().zip(source) {
                values[index] = value;
            }
        }
        ensure!(
            indices.len() == source.len(),
            "scatter of {} values into {} positions",
            source.len(),
            indices.len()
        );
        match (self, source) {
            (Storage::F32(values), Storage::F32(source)) => put(values, indices, source),
            (Storage::F64(values), Storage::F64(source)) => put(values, indices, source),
            (Storage::I32(values), Storage::I32(source)) => put(values, indices, source),
            (Storage::I64(values), Storage::I64(source)) => put(values, indices, source),
            (Storage::Bool(values), Storage::Bool(source)) => put(values, indices, source),
            (target, source) => bail!(
                "cannot scatter {:?} values into {:?} storage",
                source.dtype(),
                target.dtype()
            ),
        }
        Ok(())
    }

    /// Copy truncated or zero-extended to `len` elements.
    pub fn resized(&self, len: usize) -> Storage {
        let mut storage = self.clone();
        match &mut storage {
            Storage::F32(values) => values.resize(len, 0.0),
            Storage::F64(values) => values.resize(len, 0.0),
            Storage::I32(values) => values.resize(len, 0),
            Storage::I64(values) => values.resize(len, 0),
            Storage::Bool(values) => values.resize(len, false),
        }
        storage
    }

    /// Converts the buffer into another element type.
    pub fn cast(&self, dtype: DType) -> Storage {
        if self.dtype() == dtype {
            return self.clone();
        }
        match (self, dtype) {
            (Storage::I64(values), DType::I32) => {
                Storage::I32(values.iter().map(|&v| v as i32).collect())
            }
            (Storage::I32(values), DType::I64) => {
                Storage::I64(values.iter().map(|&v| i64::from(v)).collect())
            }
            _ => Storage::from_f64(dtype, &self.to_f64_vec()),
        }
    }
}

/// Host tensor whose clones share one storage buffer, mirroring eager framework tensors.
///
/// Use [`Tensor::deep_copy`] to obtain an independent buffer.
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Shape,
    dtype: DType,
    storage: Arc<RwLock<Storage>>,
}

impl Tensor {
    /// Wraps a typed buffer, validating the length against the shape.
    pub fn from_storage(shape: Shape, storage: Storage) -> Result<Self> {
        if storage.len() != shape.num_elements() {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                storage.len(),
                shape.dims()
            );
        }
        Ok(Tensor {
            shape,
            dtype: storage.dtype(),
            storage: Arc::new(RwLock::new(storage)),
        })
    }

    /// Constructs an `F32` tensor from raw values.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Result<Self> {
        Self::from_storage(shape, Storage::F32(data))
    }

    /// Constructs an `F64` tensor from raw values.
    pub fn from_f64(shape: Shape, data: Vec<f64>) -> Result<Self> {
        Self::from_storage(shape, Storage::F64(data))
    }

    /// Constructs an `I64` tensor from raw values.
    pub fn from_i64(shape: Shape, data: Vec<i64>) -> Result<Self> {
        Self::from_storage(shape, Storage::I64(data))
    }

    /// Builds a tensor of the requested dtype from `f64` values.
    pub fn from_f64_values(spec: &TensorSpec, values: &[f64]) -> Result<Self> {
        Self::from_storage(spec.shape.clone(), Storage::from_f64(spec.dtype, values))
    }

    /// Rank-0 tensor holding a single scalar.
    pub fn scalar(value: ScalarValue, dtype: DType) -> Self {
        let storage = Storage::from_f64(dtype, &[value.to_f64()]);
        Tensor {
            shape: Shape::scalar(),
            dtype,
            storage: Arc::new(RwLock::new(storage)),
        }
    }

    /// Returns the total number of elements stored in the tensor.
    pub fn len(&self) -> usize {
        self.shape.num_elements()
    }

    /// Reports whether the tensor contains zero elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Provides access to the tensor shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Returns the scalar dtype of the tensor payload.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn spec(&self) -> TensorSpec {
        TensorSpec::new(self.dtype, self.shape.clone())
    }

    /// Read access to the underlying buffer.
    pub fn storage(&self) -> RwLockReadGuard<'_, Storage> {
        self.storage.read().expect("tensor storage poisoned")
    }

    /// Copies the elements out as `f64`.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.storage().to_f64_vec()
    }

    /// Extracts the single element of a one-element tensor.
    pub fn item(&self) -> Result<ScalarValue> {
        ensure!(
            self.len() == 1,
            "item() requires a single-element tensor, got shape {:?}",
            self.shape.dims()
        );
        let storage = self.storage();
        Ok(match &*storage {
            Storage::F32(values) => ScalarValue::Float(f64::from(values[0])),
            Storage::F64(values) => ScalarValue::Float(values[0]),
            Storage::I32(values) => ScalarValue::Int(i64::from(values[0])),
            Storage::I64(values) => ScalarValue::Int(values[0]),
            Storage::Bool(values) => ScalarValue::Bool(values[0]),
        })
    }

    /// Writes one element; the change is visible through every tensor sharing this storage.
    pub fn set_f64(&self, index: usize, value: f64) -> Result<()> {
        ensure!(
            index < self.len(),
            "index {index} out of bounds for {} elements",
            self.len()
        );
        let mut storage = self.storage.write().expect("tensor storage poisoned");
        storage.set_f64(index, value);
        Ok(())
    }

    /// Returns a tensor with its own copy of the buffer.
    pub fn deep_copy(&self) -> Self {
        let storage = self.storage().clone();
        Tensor {
            shape: self.shape.clone(),
            dtype: self.dtype,
            storage: Arc::new(RwLock::new(storage)),
        }
    }

    /// Reports whether both tensors read and write the same buffer.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Converts to `dtype`; returns a storage-sharing clone when the dtype already matches.
    pub fn to_dtype(&self, dtype: DType) -> Self {
        if dtype == self.dtype {
            return self.clone();
        }
        let storage = self.storage().cast(dtype);
        Tensor {
            shape: self.shape.clone(),
            dtype,
            storage: Arc::new(RwLock::new(storage)),
        }
    }
}
