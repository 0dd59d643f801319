//! Descriptions of the transforms a view applies to its alias.

use serde::{Deserialize, Serialize};

use crate::ir::ops::permuted_shape;
use crate::tensor::{Shape, TensorSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewType {
    /// The tensor's own identity after being promoted to a view.
    NoOp,
    Narrow,
    Permute,
    Reshape,
    Resize,
    Select,
}

/// Strided slice `start..end` by `stride` along `dim`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectInfo {
    pub dim: usize,
    pub start: usize,
    pub end: usize,
    pub stride: usize,
}

impl SelectInfo {
    pub fn new(dim: usize, start: usize, end: usize, stride: usize) -> Self {
        assert!(stride > 0, "select stride must be positive");
        assert!(start <= end, "select start {start} is past end {end}");
        SelectInfo {
            dim,
            start,
            end,
            stride,
        }
    }

    /// Number of elements the slice keeps along `dim`.
    pub fn extent(&self) -> usize {
        (self.end - self.start).div_ceil(self.stride)
    }

    pub fn output_shape(&self, source: &Shape) -> Shape {
        assert!(
            self.dim < source.rank(),
            "select dim {} out of range for rank {}",
            self.dim,
            source.rank()
        );
        assert!(
            self.end <= source.dims()[self.dim],
            "select end {} exceeds extent {}",
            self.end,
            source.dims()[self.dim]
        );
        let mut dims = source.dims().to_vec();
        dims[self.dim] = self.extent();
        Shape::new(dims)
    }
}

/// One step of a view chain: how `shape` is derived from `source_shape`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewInfo {
    pub view_type: ViewType,
    pub shape: TensorSpec,
    pub source_shape: TensorSpec,
    /// Narrow offsets, one per dimension.
    pub indices: Vec<usize>,
    pub permutation: Vec<usize>,
    pub select: Option<SelectInfo>,
}

impl ViewInfo {
    fn plain(view_type: ViewType, shape: TensorSpec, source_shape: TensorSpec) -> Self {
        ViewInfo {
            view_type,
            shape,
            source_shape,
            indices: Vec::new(),
            permutation: Vec::new(),
            select: None,
        }
    }

    pub fn no_op(source_shape: TensorSpec) -> Self {
        Self::plain(ViewType::NoOp, source_shape.clone(), source_shape)
    }

    /// Same elements, new dimensions. Element counts must match.
    pub fn reshape(shape: TensorSpec, source_shape: TensorSpec) -> Self {
        assert_eq!(
            shape.num_elements(),
            source_shape.num_elements(),
            "reshape view {} -> {} changes the element count",
            source_shape,
            shape
        );
        Self::plain(ViewType::Reshape, shape, source_shape)
    }

    pub fn resize(source_shape: TensorSpec, dims: Shape) -> Self {
        let shape = TensorSpec::new(source_shape.dtype, dims);
        Self::plain(ViewType::Resize, shape, source_shape)
    }

    pub fn narrow(source_shape: TensorSpec, offsets: Vec<usize>, sizes: Shape) -> Self {
        assert_eq!(
            offsets.len(),
            source_shape.shape.rank(),
            "narrow offsets rank mismatch"
        );
        let shape = TensorSpec::new(source_shape.dtype, sizes);
        ViewInfo {
            indices: offsets,
            ..Self::plain(ViewType::Narrow, shape, source_shape)
        }
    }

    pub fn permute(source_shape: TensorSpec, permutation: Vec<usize>) -> Self {
        let shape = TensorSpec::new(
            source_shape.dtype,
            permuted_shape(&source_shape.shape, &permutation),
        );
        ViewInfo {
            permutation,
            ..Self::plain(ViewType::Permute, shape, source_shape)
        }
    }

    pub fn select(source_shape: TensorSpec, select: SelectInfo) -> Self {
        let shape = TensorSpec::new(source_shape.dtype, select.output_shape(&source_shape.shape));
        ViewInfo {
            select: Some(select),
            ..Self::plain(ViewType::Select, shape, source_shape)
        }
    }
}
