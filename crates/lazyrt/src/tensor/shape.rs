//! Lightweight wrappers for tensor shapes and typed shape metadata.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::DType;

/// Stores the logical dimensions of a tensor. An empty dimension list is a rank-0 scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Constructs a new shape from the provided dimensions.
    pub fn new<D: Into<Vec<usize>>>(dims: D) -> Self {
        Shape { dims: dims.into() }
    }

    /// Shape of a rank-0 tensor.
    pub fn scalar() -> Self {
        Shape { dims: Vec::new() }
    }

    /// Borrow the raw dimension slice for downstream calculations.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the rank (number of axes) of the shape.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Computes the total number of elements implied by the shape.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Maps a possibly negative dimension index onto `0..rank`.
    ///
    /// Panics when the index falls outside the valid range; callers are expected to
    /// hand in dimensions that were validated against the same shape.
    pub fn canonical_dim(&self, dim: i64) -> usize {
        let rank = self.rank() as i64;
        let canonical = if dim < 0 { dim + rank } else { dim };
        assert!(
            (0..rank).contains(&canonical),
            "dimension {dim} out of range for rank {rank}"
        );
        canonical as usize
    }
}

/// Element type plus dimensions; the static type of every IR value and device buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        TensorSpec { dtype, shape }
    }

    /// Same dimensions, different element type.
    pub fn with_dtype(&self, dtype: DType) -> Self {
        TensorSpec {
            dtype,
            shape: self.shape.clone(),
        }
    }

    pub fn num_elements(&self) -> usize {
        self.shape.num_elements()
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}{:?}", self.dtype, self.shape.dims())
    }
}
