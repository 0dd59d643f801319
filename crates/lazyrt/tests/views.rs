use std::sync::Arc;

use anyhow::Result;
use lazyrt::view::{SelectInfo, ViewInfo};
use lazyrt::{BackendDevice, DType, LazyConfig, LazyContext, LazyTensor, Shape, Tensor, TensorSpec};
use lazyrt_backend_ref_cpu::cpu_context;

fn context() -> Arc<LazyContext> {
    cpu_context(LazyConfig::default()).0
}

fn cpu() -> BackendDevice {
    BackendDevice::cpu(0)
}

fn host(dims: &[usize], data: &[f32]) -> Tensor {
    Tensor::from_vec(Shape::new(dims.to_vec()), data.to_vec()).expect("valid host tensor")
}

fn values(tensor: &LazyTensor) -> Result<Vec<f64>> {
    Ok(tensor.to_tensor(false)?.to_f64_vec())
}

fn narrow_view(base: &LazyTensor, offset: usize, len: usize) -> Result<LazyTensor> {
    let info = ViewInfo::narrow(base.shape(), vec![offset], Shape::new([len]));
    base.create_view_tensor(info)
}

#[test]
fn writes_through_view_reach_base() -> Result<()> {
    let ctx = context();
    let base = LazyTensor::from_tensor(&ctx, host(&[4], &[1.0, 2.0, 3.0, 4.0]), cpu());
    let view = narrow_view(&base, 1, 2)?;
    assert_ne!(view.view_alias_id(), 0);
    assert_eq!(view.view_alias_id(), base.view_alias_id());
    assert_eq!(values(&view)?, vec![2.0, 3.0]);

    view.update_from_tensor(host(&[2], &[9.0, 9.0]), true)?;
    assert!(base.current_tensor_data().is_none());
    assert_eq!(values(&base)?, vec![1.0, 9.0, 9.0, 4.0]);
    assert_eq!(values(&view)?, vec![9.0, 9.0]);
    Ok(())
}

#[test]
fn writes_to_base_reach_view() -> Result<()> {
    let ctx = context();
    let base = LazyTensor::from_tensor(&ctx, host(&[4], &[1.0, 2.0, 3.0, 4.0]), cpu());
    let view = narrow_view(&base, 2, 2)?;
    assert_eq!(values(&view)?, vec![3.0, 4.0]);

    base.update_from_tensor(host(&[4], &[10.0, 20.0, 30.0, 40.0]), true)?;
    assert_eq!(values(&view)?, vec![30.0, 40.0]);
    Ok(())
}

#[test]
fn permuted_view_writes_back_transposed() -> Result<()> {
    let ctx = context();
    let base = LazyTensor::from_tensor(
        &ctx,
        host(&[2, 3], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]),
        cpu(),
    );
    let view = base.create_view_tensor(ViewInfo::permute(base.shape(), vec![1, 0]))?;
    assert_eq!(view.shape().shape, Shape::new([3, 2]));
    assert_eq!(values(&view)?, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);

    view.update_from_tensor(host(&[3, 2], &[10.0, 13.0, 11.0, 14.0, 12.0, 15.0]), true)?;
    assert_eq!(values(&base)?, vec![10.0, 11.0, 12.0, 13.0, 14.0, 15.0]);
    Ok(())
}

#[test]
fn same_numel_update_goes_through_reshape() -> Result<()> {
    let ctx = context();
    let base = LazyTensor::from_tensor(&ctx, host(&[4], &[1.0, 2.0, 3.0, 4.0]), cpu());
    let square = TensorSpec::new(DType::F32, Shape::new([2, 2]));
    let view = base.create_view_tensor(ViewInfo::reshape(square, base.shape()))?;
    assert_eq!(view.size(0), 2);

    let flat = LazyTensor::from_tensor(&ctx, host(&[4], &[5.0, 6.0, 7.0, 8.0]), cpu());
    view.set_ir_value(flat.get_ir_value()?)?;
    assert_eq!(view.shape().shape, Shape::new([4]));
    assert_eq!(values(&base)?, vec![5.0, 6.0, 7.0, 8.0]);
    Ok(())
}

#[test]
#[should_panic(expected = "changes the element count")]
fn view_update_with_other_numel_panics() {
    let ctx = context();
    let base = LazyTensor::from_tensor(&ctx, host(&[4], &[1.0, 2.0, 3.0, 4.0]), cpu());
    let view = narrow_view(&base, 0, 2).expect("view");
    let wrong = LazyTensor::from_tensor(&ctx, host(&[3], &[0.0; 3]), cpu());
    let value = wrong.get_ir_value().expect("ir");
    let _ = view.set_ir_value(value);
}

#[test]
fn out_update_with_other_numel_drops_view() -> Result<()> {
    let ctx = context();
    let base = LazyTensor::from_tensor(&ctx, host(&[4], &[1.0, 2.0, 3.0, 4.0]), cpu());
    let view = narrow_view(&base, 1, 2)?;

    view.update_from_tensor_out(host(&[3], &[7.0, 8.0, 9.0]))?;
    assert_eq!(view.view_alias_id(), 0);
    assert_eq!(values(&view)?, vec![7.0, 8.0, 9.0]);
    assert_eq!(values(&base)?, vec![1.0, 2.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn out_update_with_same_numel_writes_through() -> Result<()> {
    let ctx = context();
    let base = LazyTensor::from_tensor(&ctx, host(&[4], &[1.0, 2.0, 3.0, 4.0]), cpu());
    let view = narrow_view(&base, 0, 2)?;
    let source = LazyTensor::from_tensor(&ctx, host(&[2], &[5.0, 6.0]), cpu());

    view.update_from_lazy_tensor_out(&source)?;
    assert_ne!(view.view_alias_id(), 0);
    assert_eq!(values(&base)?, vec![5.0, 6.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn current_view_can_be_modified_in_place() -> Result<()> {
    let ctx = context();
    let t = LazyTensor::from_tensor(
        &ctx,
        host(&[4, 2], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]),
        cpu(),
    );
    let every_other_row = SelectInfo::new(0, 0, 4, 2);
    t.modify_current_view(ViewInfo::select(t.shape(), every_other_row))?;
    assert_ne!(t.view_alias_id(), 0);
    assert_eq!(t.shape().shape, Shape::new([2, 2]));
    assert_eq!(values(&t)?, vec![0.0, 1.0, 4.0, 5.0]);

    let generation = t.generation();
    let second_column = ViewInfo::narrow(t.shape(), vec![0, 1], Shape::new([2, 1]));
    t.modify_current_view(second_column)?;
    assert!(t.generation() > generation);
    assert_eq!(values(&t)?, vec![1.0, 5.0]);
    Ok(())
}

#[test]
fn sub_views_compose() -> Result<()> {
    let ctx = context();
    let base = LazyTensor::from_tensor(
        &ctx,
        host(&[2, 3], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]),
        cpu(),
    );
    let row = base.create_view_tensor(ViewInfo::narrow(
        base.shape(),
        vec![1, 0],
        Shape::new([1, 3]),
    ))?;
    let tail = row.create_view_tensor(ViewInfo::narrow(
        row.shape(),
        vec![0, 1],
        Shape::new([1, 2]),
    ))?;
    assert_eq!(tail.view_alias_id(), base.view_alias_id());
    assert_eq!(values(&tail)?, vec![4.0, 5.0]);

    tail.update_from_tensor(host(&[1, 2], &[-1.0, -2.0]), true)?;
    assert_eq!(values(&base)?, vec![0.0, 1.0, 2.0, 3.0, -1.0, -2.0]);
    assert_eq!(values(&row)?, vec![3.0, -1.0, -2.0]);
    Ok(())
}

#[test]
fn alias_lives_as_long_as_its_views() -> Result<()> {
    let ctx = context();
    let base = LazyTensor::from_tensor(&ctx, host(&[4], &[1.0, 2.0, 3.0, 4.0]), cpu());
    let view = narrow_view(&base, 0, 2)?;
    assert_eq!(ctx.live_aliases(), 1);

    drop(base);
    assert_eq!(ctx.live_aliases(), 1);
    assert_eq!(values(&view)?, vec![1.0, 2.0]);
    drop(view);
    assert_eq!(ctx.live_aliases(), 0);
    Ok(())
}

#[test]
fn setting_device_data_with_sync_drops_view() -> Result<()> {
    let ctx = context();
    let base = LazyTensor::from_tensor(&ctx, host(&[4], &[1.0, 2.0, 3.0, 4.0]), cpu());
    let view = narrow_view(&base, 0, 2)?;
    let handle = view.get_data_handle()?;

    view.set_data_handle(handle);
    assert_eq!(view.view_alias_id(), 0);
    assert_eq!(values(&view)?, vec![1.0, 2.0]);
    Ok(())
}

#[test]
fn detached_view_keeps_alias_after_base_moves_on() -> Result<()> {
    let ctx = context();
    let base = LazyTensor::from_tensor(&ctx, host(&[4], &[1.0, 2.0, 3.0, 4.0]), cpu());
    let detached = base.create_view(ViewInfo::narrow(base.shape(), vec![1], Shape::new([2])))?;

    base.set_tensor(host(&[4], &[0.0; 4]));
    assert_eq!(base.view_alias_id(), 0);
    assert_eq!(ctx.live_aliases(), 1);

    let view = LazyTensor::from_view(&ctx, detached, cpu());
    assert_eq!(ctx.live_aliases(), 1);
    assert_eq!(values(&view)?, vec![2.0, 3.0]);
    drop(view);
    assert_eq!(ctx.live_aliases(), 0);
    Ok(())
}

#[test]
fn detached_sub_view_outlives_its_parents() -> Result<()> {
    let ctx = context();
    let base = LazyTensor::from_tensor(&ctx, host(&[4], &[1.0, 2.0, 3.0, 4.0]), cpu());
    let head = narrow_view(&base, 0, 3)?;
    let detached = head.create_view(ViewInfo::narrow(head.shape(), vec![1], Shape::new([2])))?;
    assert_eq!(detached.alias_id().0, base.view_alias_id());

    drop(head);
    drop(base);
    assert_eq!(ctx.live_aliases(), 1);
    let tail = LazyTensor::from_view(&ctx, detached, cpu());
    assert_eq!(values(&tail)?, vec![2.0, 3.0]);
    Ok(())
}

#[test]
fn dropping_a_detached_view_releases_its_alias() -> Result<()> {
    let ctx = context();
    let base = LazyTensor::from_tensor(&ctx, host(&[4], &[1.0, 2.0, 3.0, 4.0]), cpu());
    let detached = base.create_view(ViewInfo::narrow(base.shape(), vec![0], Shape::new([2])))?;
    drop(detached);
    assert_eq!(ctx.live_aliases(), 1);
    drop(base);
    assert_eq!(ctx.live_aliases(), 0);
    Ok(())
}
