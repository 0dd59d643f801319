//! Node constructors with the shape inference each operation needs.

use anyhow::{ensure, Result};

use crate::backend::BackendDataRef;
use crate::tensor::{DType, ScalarValue, Shape, TensorSpec};
use crate::view::SelectInfo;

use super::node::{BinaryOp, Node, OpKind, Value};

/// Leaf node reading device-resident data.
pub fn device_data(data: BackendDataRef) -> Value {
    let spec = data.spec().clone();
    Node::new(OpKind::DeviceData(data), [], [spec]).into()
}

/// Rank-0 constant.
pub fn scalar(value: ScalarValue, dtype: DType) -> Value {
    Node::new(
        OpKind::Scalar(value),
        [],
        [TensorSpec::new(dtype, Shape::scalar())],
    )
    .into()
}

pub fn cast(input: Value, dtype: DType) -> Value {
    let spec = input.spec().with_dtype(dtype);
    Node::new(OpKind::Cast(dtype), [input], [spec]).into()
}

/// Elementwise binary op. Operands must share dimensions unless one side is rank-0.
pub fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value> {
    let lhs_spec = lhs.spec().clone();
    let rhs_spec = rhs.spec().clone();
    let shape = if lhs_spec.shape.rank() == 0 {
        rhs_spec.shape.clone()
    } else {
        ensure!(
            rhs_spec.shape.rank() == 0 || lhs_spec.shape == rhs_spec.shape,
            "{} operands have incompatible shapes {} and {}",
            OpKind::Binary(op).name(),
            lhs_spec,
            rhs_spec
        );
        lhs_spec.shape.clone()
    };
    let dtype = promote_types(lhs_spec.dtype, rhs_spec.dtype);
    Ok(Node::new(OpKind::Binary(op), [lhs, rhs], [TensorSpec::new(dtype, shape)]).into())
}

/// Reinterprets `input` under `shape`; element counts must agree.
pub fn reshape(input: Value, shape: Shape) -> Value {
    assert_eq!(
        input.spec().num_elements(),
        shape.num_elements(),
        "reshape of {} into {:?} changes the element count",
        input.spec(),
        shape.dims()
    );
    let spec = TensorSpec::new(input.spec().dtype, shape);
    Node::new(OpKind::Reshape, [input], [spec]).into()
}

pub fn resize(input: Value, shape: Shape) -> Value {
    let spec = TensorSpec::new(input.spec().dtype, shape);
    Node::new(OpKind::Resize, [input], [spec]).into()
}

pub fn permute(input: Value, permutation: Vec<usize>) -> Value {
    let spec = TensorSpec::new(
        input.spec().dtype,
        permuted_shape(&input.spec().shape, &permutation),
    );
    Node::new(OpKind::Permute(permutation), [input], [spec]).into()
}

pub fn narrow(input: Value, offsets: Vec<usize>, sizes: Shape) -> Value {
    let source = input.spec().shape.clone();
    assert_eq!(offsets.len(), source.rank(), "narrow offsets rank mismatch");
    assert_eq!(sizes.rank(), source.rank(), "narrow sizes rank mismatch");
    for ((offset, size), extent) in offsets.iter().zip(sizes.dims()).zip(source.dims()) {
        assert!(
            offset + size <= *extent,
            "narrow [{offset}, {}) exceeds extent {extent}",
            offset + size
        );
    }
    let spec = TensorSpec::new(input.spec().dtype, sizes);
    Node::new(OpKind::Narrow { offsets }, [input], [spec]).into()
}

pub fn narrow_update(base: Value, update: Value, offsets: Vec<usize>) -> Value {
    let spec = base.spec().clone();
    Node::new(OpKind::NarrowUpdate { offsets }, [base, update], [spec]).into()
}

pub fn select(input: Value, select: SelectInfo) -> Value {
    let shape = select.output_shape(&input.spec().shape);
    let spec = TensorSpec::new(input.spec().dtype, shape);
    Node::new(OpKind::Select(select), [input], [spec]).into()
}

pub fn select_update(base: Value, update: Value, select: SelectInfo) -> Value {
    let spec = base.spec().clone();
    Node::new(OpKind::SelectUpdate(select), [base, update], [spec]).into()
}

/// Dimensions of `shape` reordered by `permutation`.
pub fn permuted_shape(shape: &Shape, permutation: &[usize]) -> Shape {
    assert_eq!(
        permutation.len(),
        shape.rank(),
        "permutation {permutation:?} does not match rank {}",
        shape.rank()
    );
    Shape::new(
        permutation
            .iter()
            .map(|&axis| shape.dims()[axis])
            .collect::<Vec<_>>(),
    )
}

/// Permutation undoing `permutation`.
pub fn inverse_permutation(permutation: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0; permutation.len()];
    for (index, &axis) in permutation.iter().enumerate() {
        inverse[axis] = index;
    }
    inverse
}

fn promote_types(lhs: DType, rhs: DType) -> DType {
    use DType::*;
    match (lhs, rhs) {
        (F64, _) | (_, F64) => F64,
        (F32, _) | (_, F32) => F32,
        (I64, _) | (_, I64) => I64,
        (I32, _) | (_, I32) => I32,
        (Bool, Bool) => Bool,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverse_permutation_round_trips() {
        let perm = vec![2, 0, 1];
        let inverse = inverse_permutation(&perm);
        assert_eq!(inverse, vec![1, 2, 0]);
        let shape = Shape::new([2, 3, 4]);
        let permuted = permuted_shape(&shape, &perm);
        assert_eq!(permuted.dims(), &[4, 2, 3]);
        assert_eq!(permuted_shape(&permuted, &inverse), shape);
    }

    #[test]
    fn binary_promotes_integer_with_float() -> Result<()> {
        let lhs = scalar(ScalarValue::Int(2), DType::I64);
        let rhs = scalar(ScalarValue::Float(0.5), DType::F32);
        let out = binary(BinaryOp::Mul, lhs, rhs)?;
        assert_eq!(out.spec().dtype, DType::F32);
        Ok(())
    }
}
