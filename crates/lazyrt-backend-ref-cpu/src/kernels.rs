//! Host kernels for every IR operation. Arithmetic runs in `f64`; ops that only move
//! elements keep the buffer's own element type.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Result};
use lazyrt::ir::{post_order, BinaryOp, Node, OpKind, Value};
use lazyrt::view::SelectInfo;
use lazyrt::tensor::Storage;
use lazyrt::{Tensor, TensorSpec};

/// Evaluates `roots`, sharing work between roots that reach the same nodes.
pub(crate) fn evaluate(roots: &[Value]) -> Result<Vec<Tensor>> {
    let mut results: HashMap<*const Node, Tensor> = HashMap::new();
    let order = post_order(roots);
    for node in &order {
        ensure!(
            node.num_outputs() == 1,
            "cpu executor cannot run multi-output node {}",
            node.op().name()
        );
        let inputs = node
            .operands()
            .iter()
            .map(|operand| {
                results
                    .get(&Arc::as_ptr(operand.node()))
                    .cloned()
                    .ok_or_else(|| {
                        anyhow!("operand of {} evaluated out of order", node.op().name())
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        let output = execute_node(node, &inputs)?;
        results.insert(Arc::as_ptr(node), output);
    }
    roots
        .iter()
        .map(|root| {
            results
                .get(&Arc::as_ptr(root.node()))
                .cloned()
                .ok_or_else(|| anyhow!("root {} was not evaluated", root.node().op().name()))
        })
        .collect()
}

fn execute_node(node: &Node, inputs: &[Tensor]) -> Result<Tensor> {
    let output = node.spec(0);
    match node.op() {
        OpKind::DeviceData(data) => data
            .downcast::<Tensor>()
            .cloned()
            .ok_or_else(|| anyhow!("device data {} is not a ready cpu buffer", data.spec())),
        OpKind::Scalar(value) => Ok(Tensor::scalar(*value, output.dtype)),
        OpKind::Cast(dtype) => Ok(expect_single(inputs)?.to_dtype(*dtype)),
        OpKind::Binary(op) => op_binary(inputs, output, *op),
        OpKind::Reshape => op_reshape(inputs, output),
        OpKind::Resize => op_resize(inputs, output),
        OpKind::Permute(perm) => op_permute(inputs, output, perm),
        OpKind::Narrow { offsets } => op_narrow(inputs, output, offsets),
        OpKind::NarrowUpdate { offsets } => op_narrow_update(inputs, output, offsets),
        OpKind::Select(select) => op_select(inputs, output, select),
        OpKind::SelectUpdate(select) => op_select_update(inputs, output, select),
    }
}

fn op_binary(inputs: &[Tensor], output: &TensorSpec, op: BinaryOp) -> Result<Tensor> {
    let [lhs, rhs] = inputs else {
        bail!("elementwise binary expects 2 inputs, got {}", inputs.len());
    };
    let a = lhs.to_f64_vec();
    let b = rhs.to_f64_vec();
    let len = output.num_elements();
    ensure!(
        (a.len() == len || a.len() == 1) && (b.len() == len || b.len() == 1),
        "elementwise size mismatch: {} and {} for {}",
        a.len(),
        b.len(),
        output
    );
    let at = |values: &[f64], index: usize| values[if values.len() == 1 { 0 } else { index }];
    let result: Vec<f64> = (0..len)
        .map(|index| {
            let (x, y) = (at(&a, index), at(&b, index));
            match op {
                BinaryOp::Add => x + y,
                BinaryOp::Sub => x - y,
                BinaryOp::Mul => x * y,
                BinaryOp::Div => x / y,
            }
        })
        .collect();
    Tensor::from_f64_values(output, &result)
}

fn op_reshape(inputs: &[Tensor], output: &TensorSpec) -> Result<Tensor> {
    let input = expect_single(inputs)?;
    ensure!(
        input.len() == output.num_elements(),
        "reshape element count mismatch: {} -> {}",
        input.spec(),
        output
    );
    let storage = input.storage().clone();
    typed(output, storage)
}

fn op_resize(inputs: &[Tensor], output: &TensorSpec) -> Result<Tensor> {
    let input = expect_single(inputs)?;
    let storage = input.storage().resized(output.num_elements());
    typed(output, storage)
}

fn op_permute(inputs: &[Tensor], output: &TensorSpec, perm: &[usize]) -> Result<Tensor> {
    let input = expect_single(inputs)?;
    let input_dims = input.shape().dims();
    ensure!(perm.len() == input_dims.len(), "permute rank mismatch");
    let out_dims = output.shape.dims();
    let input_strides = compute_strides(input_dims);
    let indices: Vec<usize> = (0..output.num_elements())
        .map(|idx| {
            unravel_index(idx, out_dims)
                .iter()
                .enumerate()
                .map(|(out_axis, &c)| c * input_strides[perm[out_axis]])
                .sum()
        })
        .collect();
    let storage = input.storage().gather(&indices);
    typed(output, storage)
}

fn op_narrow(inputs: &[Tensor], output: &TensorSpec, offsets: &[usize]) -> Result<Tensor> {
    let input = expect_single(inputs)?;
    let input_dims = input.shape().dims();
    let out_dims = output.shape.dims();
    check_block(input_dims, out_dims, offsets)?;
    let strides = compute_strides(input_dims);
    let indices: Vec<usize> = (0..output.num_elements())
        .map(|idx| block_index(idx, out_dims, offsets, &strides))
        .collect();
    let storage = input.storage().gather(&indices);
    typed(output, storage)
}

fn op_narrow_update(inputs: &[Tensor], output: &TensorSpec, offsets: &[usize]) -> Result<Tensor> {
    let [base, update] = inputs else {
        bail!("narrow update expects 2 inputs, got {}", inputs.len());
    };
    let base_dims = base.shape().dims();
    let update_dims = update.shape().dims();
    check_block(base_dims, update_dims, offsets)?;
    let strides = compute_strides(base_dims);
    let indices: Vec<usize> = (0..update.len())
        .map(|idx| block_index(idx, update_dims, offsets, &strides))
        .collect();
    scatter(base, update, &indices, output)
}

fn op_select(inputs: &[Tensor], output: &TensorSpec, select: &SelectInfo) -> Result<Tensor> {
    let input = expect_single(inputs)?;
    let strides = compute_strides(input.shape().dims());
    let out_dims = output.shape.dims();
    let indices: Vec<usize> = (0..output.num_elements())
        .map(|idx| strided_index(idx, out_dims, select, &strides))
        .collect();
    let storage = input.storage().gather(&indices);
    typed(output, storage)
}

fn op_select_update(
    inputs: &[Tensor],
    output: &TensorSpec,
    select: &SelectInfo,
) -> Result<Tensor> {
    let [base, update] = inputs else {
        bail!("select update expects 2 inputs, got {}", inputs.len());
    };
    let expected = select.output_shape(base.shape());
    ensure!(
        update.shape() == &expected,
        "select update of shape {:?} does not fit slice {:?}",
        update.shape().dims(),
        expected.dims()
    );
    let strides = compute_strides(base.shape().dims());
    let indices: Vec<usize> = (0..update.len())
        .map(|idx| strided_index(idx, expected.dims(), select, &strides))
        .collect();
    scatter(base, update, &indices, output)
}

/// Wraps moved elements as `output`, casting only when the element type changes.
fn typed(output: &TensorSpec, storage: Storage) -> Result<Tensor> {
    let storage = if storage.dtype() == output.dtype {
        storage
    } else {
        storage.cast(output.dtype)
    };
    Tensor::from_storage(output.shape.clone(), storage)
}

/// Copy of `base` with `update` written at `indices`.
fn scatter(
    base: &Tensor,
    update: &Tensor,
    indices: &[usize],
    output: &TensorSpec,
) -> Result<Tensor> {
    let mut storage = base.storage().clone();
    let values = update.storage().cast(storage.dtype());
    storage.scatter(indices, &values)?;
    typed(output, storage)
}

fn check_block(outer: &[usize], inner: &[usize], offsets: &[usize]) -> Result<()> {
    ensure!(
        outer.len() == inner.len() && offsets.len() == outer.len(),
        "narrow rank mismatch"
    );
    for ((offset, size), extent) in offsets.iter().zip(inner).zip(outer) {
        ensure!(offset + size <= *extent, "narrow out of bounds");
    }
    Ok(())
}

/// Flat index into the outer tensor of element `idx` of a block at `offsets`.
fn block_index(idx: usize, block_dims: &[usize], offsets: &[usize], strides: &[usize]) -> usize {
    unravel_index(idx, block_dims)
        .iter()
        .enumerate()
        .map(|(dim, &c)| (offsets[dim] + c) * strides[dim])
        .sum()
}

fn strided_index(
    idx: usize,
    slice_dims: &[usize],
    select: &SelectInfo,
    strides: &[usize],
) -> usize {
    unravel_index(idx, slice_dims)
        .iter()
        .enumerate()
        .map(|(dim, &c)| {
            let source = if dim == select.dim {
                select.start + c * select.stride
            } else {
                c
            };
            source * strides[dim]
        })
        .sum()
}

fn expect_single(inputs: &[Tensor]) -> Result<&Tensor> {
    match inputs {
        [input] => Ok(input),
        _ => bail!("operation expects single input, got {}", inputs.len()),
    }
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazyrt::ir::ops;
    use lazyrt::{BackendData, BackendDevice, DType, Shape};

    fn leaf(dims: &[usize], values: &[f64]) -> Value {
        let spec = TensorSpec::new(DType::F32, Shape::new(dims.to_vec()));
        let tensor = Tensor::from_f64_values(&spec, values).unwrap();
        ops::device_data(BackendData::new(
            BackendDevice::cpu(0),
            spec,
            Arc::new(tensor),
        ))
    }

    fn run(value: Value) -> Vec<f64> {
        evaluate(&[value]).unwrap().remove(0).to_f64_vec()
    }

    #[test]
    fn permute_transposes_matrix() {
        let x = leaf(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(
            run(ops::permute(x, vec![1, 0])),
            vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]
        );
    }

    #[test]
    fn narrow_update_writes_block() {
        let base = leaf(&[3, 3], &[0.0; 9]);
        let update = leaf(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(
            run(ops::narrow_update(base, update, vec![1, 1])),
            vec![0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 0.0, 3.0, 4.0]
        );
    }

    #[test]
    fn select_takes_strided_rows() {
        let x = leaf(&[4, 2], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        let select = SelectInfo::new(0, 1, 4, 2);
        assert_eq!(run(ops::select(x, select)), vec![2.0, 3.0, 6.0, 7.0]);
    }

    #[test]
    fn resize_zero_extends() {
        let x = leaf(&[2], &[5.0, 6.0]);
        assert_eq!(run(ops::resize(x, Shape::new([4]))), vec![5.0, 6.0, 0.0, 0.0]);
    }

    #[test]
    fn moving_ops_keep_large_integers_exact() -> Result<()> {
        let big = (1i64 << 53) + 1;
        let spec = TensorSpec::new(DType::I64, Shape::new([2, 2]));
        let tensor = Tensor::from_i64(spec.shape.clone(), vec![big, 1, 2, -big])?;
        let x = ops::device_data(BackendData::new(BackendDevice::cpu(0), spec, Arc::new(tensor)));

        let flipped = evaluate(&[ops::permute(x.clone(), vec![1, 0])])?.remove(0);
        assert_eq!(*flipped.storage(), Storage::I64(vec![big, 2, 1, -big]));
        let corner = ops::narrow(x, vec![1, 1], Shape::new([1, 1]));
        let corner = evaluate(&[ops::reshape(corner, Shape::new([1]))])?.remove(0);
        assert_eq!(*corner.storage(), Storage::I64(vec![-big]));
        Ok(())
    }

    #[test]
    fn scalar_operand_broadcasts() -> Result<()> {
        let x = leaf(&[3], &[1.0, 2.0, 3.0]);
        let two = ops::scalar(lazyrt::ScalarValue::Float(2.0), DType::F32);
        assert_eq!(run(ops::binary(BinaryOp::Mul, x, two)?), vec![2.0, 4.0, 6.0]);
        Ok(())
    }
}
