//! Enumerates the scalar element types carried by lazy tensors and IR values.

use serde::{Deserialize, Serialize};

/// Logical dtype identifier shared between host tensors, IR specs, and device data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit floating point following IEEE-754 semantics.
    F32,
    /// 64-bit floating point.
    F64,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer, the default integral type of traced programs.
    I64,
    /// Boolean predicate stored one element per byte.
    Bool,
}

impl DType {
    /// Returns `true` for floating-point element types.
    pub fn is_floating_point(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Returns `true` for signed integer element types (booleans excluded).
    pub fn is_integral(self) -> bool {
        matches!(self, DType::I32 | DType::I64)
    }
}
