use std::sync::Arc;

use anyhow::Result;
use lazyrt::ir::{ops, BinaryOp};
use lazyrt::{
    BackendDevice, BackendImpl, DType, GraphExecutor, LazyConfig, LazyTensor, ScalarValue,
    Shape, Tensor,
};
use lazyrt_backend_ref_cpu::{cpu_context, CpuBackend};

fn cpu() -> BackendDevice {
    BackendDevice::cpu(0)
}

fn host(data: &[f32]) -> Tensor {
    Tensor::from_vec(Shape::new([data.len()]), data.to_vec()).expect("valid host tensor")
}

#[test]
fn one_sync_materializes_every_pending_tensor() -> Result<()> {
    let (ctx, executor) = cpu_context(LazyConfig::default());
    let a = LazyTensor::from_tensor(&ctx, host(&[1.0, 2.0]), cpu());
    let b = LazyTensor::from_tensor(&ctx, host(&[3.0, 4.0]), cpu());
    let shared = ops::binary(BinaryOp::Add, a.get_ir_value()?, b.get_ir_value()?)?;
    let doubled = LazyTensor::from_ir_value(
        &ctx,
        ops::binary(BinaryOp::Mul, shared.clone(), shared.clone())?,
        cpu(),
    )?;
    let halved = LazyTensor::from_ir_value(
        &ctx,
        ops::binary(BinaryOp::Div, shared, ops::scalar(ScalarValue::Float(2.0), a.dtype()))?,
        cpu(),
    )?;

    executor.sync_tensors_graph(&[doubled.clone(), halved.clone()], &[cpu()], true, false)?;
    assert_eq!(executor.sync_count(), 1);
    assert!(doubled.current_ir_value().is_none());
    assert!(halved.current_data_handle().is_some());
    assert_eq!(doubled.to_tensor(false)?.to_f64_vec(), vec![16.0, 36.0]);
    assert_eq!(halved.to_tensor(false)?.to_f64_vec(), vec![2.0, 3.0]);
    assert_eq!(executor.sync_count(), 1);
    Ok(())
}

#[test]
fn sync_without_pending_ir_is_a_no_op() -> Result<()> {
    let (ctx, executor) = cpu_context(LazyConfig::default());
    let t = LazyTensor::from_tensor(&ctx, host(&[1.0]), cpu());
    executor.sync_tensors_graph(&[t], &[cpu()], true, false)?;
    assert_eq!(executor.sync_count(), 0);
    Ok(())
}

#[test]
fn reading_device_data_waits_on_a_barrier() -> Result<()> {
    let (ctx, executor) = cpu_context(LazyConfig::default());
    let a = LazyTensor::from_tensor(&ctx, host(&[1.0, 2.0]), cpu());
    let sum = LazyTensor::from_ir_value(
        &ctx,
        ops::binary(BinaryOp::Add, a.get_ir_value()?, a.get_ir_value()?)?,
        cpu(),
    )?;
    assert_eq!(executor.barrier_count(), 0);

    assert_eq!(sum.to_tensor(false)?.to_f64_vec(), vec![2.0, 4.0]);
    assert_eq!(executor.barrier_count(), 1);
    sum.to_tensor(false)?;
    assert_eq!(executor.barrier_count(), 1);
    Ok(())
}

#[test]
fn scalar_device_data_is_cached() -> Result<()> {
    let (_, executor) = cpu_context(LazyConfig::default());
    let one = Tensor::scalar(ScalarValue::Float(3.0), DType::F32);
    let first = executor.get_device_data(&one, &cpu())?;
    let second = executor.get_device_data(&one.deep_copy(), &cpu())?;
    assert!(Arc::ptr_eq(&first, &second));

    let other = Tensor::scalar(ScalarValue::Float(4.0), DType::F32);
    let third = executor.get_device_data(&other, &cpu())?;
    assert!(!Arc::ptr_eq(&first, &third));
    Ok(())
}

#[test]
fn uploads_do_not_alias_host_memory() -> Result<()> {
    let backend = CpuBackend::new();
    let source = host(&[1.0, 2.0]);
    let data = backend.tensor_to_data_handle(&source, &cpu())?;
    source.set_f64(0, 10.0)?;

    let downloaded = backend.data_handle_to_tensor(&data, DType::F64)?;
    assert_eq!(downloaded.dtype(), DType::F64);
    assert_eq!(downloaded.to_f64_vec(), vec![1.0, 2.0]);
    Ok(())
}

#[test]
fn executor_tracks_live_tensors() {
    let (ctx, executor) = cpu_context(LazyConfig::default());
    let t = LazyTensor::from_tensor(&ctx, host(&[1.0]), cpu());
    let id = t.unique_id();
    assert!(executor.is_registered(id));
    assert_eq!(executor.live_tensors(), 1);

    drop(t);
    assert!(!executor.is_registered(id));
    assert_eq!(executor.live_tensors(), 0);
}

#[test]
fn trim_counter_counts_up_from_one() {
    let (_, executor) = cpu_context(LazyConfig::default());
    assert_eq!(executor.inc_trim_counter(), 1);
    assert_eq!(executor.inc_trim_counter(), 2);
}
