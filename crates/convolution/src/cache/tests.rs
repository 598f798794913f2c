use super::{next_owner_id, CacheLayout, ConvCache, StackCache};
use crate::{
    core::{ConvConfig, GridError},
    masked::MaskedConv2d,
};
use candle_core::{DType, Device, Tensor};
use layers::Mode;
use static_assertions::assert_impl_all;

assert_impl_all!(ConvCache: Send, Sync, Clone);
assert_impl_all!(StackCache: Send, Sync, Clone);

fn allclose(a: &Tensor, b: &Tensor, tol: f32) -> Result<(), GridError> {
    let max = a
        .to_dtype(DType::F32)?
        .sub(&b.to_dtype(DType::F32)?)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?;
    assert!(max <= tol, "max diff {max} exceeded tolerance {tol}");
    Ok(())
}

fn stepwise(conv: &MaskedConv2d, grid: &Tensor) -> Result<Tensor, GridError> {
    let mut cache = ConvCache::new();
    let steps = grid.dims()[1];
    let mut outputs = Vec::with_capacity(steps);
    for t in 0..steps {
        let row = grid.narrow(1, t, 1)?;
        outputs.push(conv.forward_cached(&row, &mut cache, Mode::Eval)?);
    }
    assert_eq!(cache.steps(), steps);
    Ok(Tensor::cat(&outputs, 1)?)
}

#[test]
fn single_step_decoding_matches_full_grid() -> Result<(), GridError> {
    let device = Device::Cpu;
    let configs = [
        ConvConfig::new(3, 4, 3),
        ConvConfig::new(3, 4, 3).with_double_masking(true),
        ConvConfig::new(2, 2, 5).with_dilation(2, 1),
        ConvConfig::new(2, 3, 1),
    ];
    for config in configs {
        let conv = MaskedConv2d::new(config, &device, DType::F32)?;
        let grid = Tensor::randn(0f32, 1.0, (2, 6, 4, conv.config().in_channels), &device)?;
        allclose(&stepwise(&conv, &grid)?, &conv.forward(&grid)?, 1e-5)?;
    }
    Ok(())
}

#[test]
fn multi_row_chunks_match_full_grid() -> Result<(), GridError> {
    let device = Device::Cpu;
    let conv = MaskedConv2d::new(ConvConfig::new(2, 2, 3).with_dilation(2, 1), &device, DType::F32)?;
    let grid = Tensor::randn(0f32, 1.0, (1, 5, 3, 2), &device)?;
    let mut cache = ConvCache::new();
    let head = conv.forward_cached(&grid.narrow(1, 0, 3)?, &mut cache, Mode::Eval)?;
    let tail = conv.forward_cached(&grid.narrow(1, 3, 2)?, &mut cache, Mode::Eval)?;
    allclose(&Tensor::cat(&[&head, &tail], 1)?, &conv.forward(&grid)?, 1e-5)
}

#[test]
fn cache_keeps_only_the_trailing_window() -> Result<(), GridError> {
    let device = Device::Cpu;
    let conv = MaskedConv2d::new(ConvConfig::new(2, 2, 5), &device, DType::F32)?;
    let grid = Tensor::randn(0f32, 1.0, (1, 4, 3, 2), &device)?;
    let mut cache = ConvCache::new();
    for t in 0..4 {
        conv.forward_cached(&grid.narrow(1, t, 1)?, &mut cache, Mode::Eval)?;
    }
    let history = cache
        .history()
        .ok_or_else(|| GridError::cache("history missing"))?;
    assert_eq!(history.dims(), &[1, 2, 3, 2]);
    allclose(history, &grid.narrow(1, 2, 2)?, 0.0)?;
    assert_eq!(
        cache.layout(),
        Some(&CacheLayout {
            batch: 1,
            history_rows: 2,
            source_len: 3,
            channels: 2
        })
    );
    Ok(())
}

#[test]
fn width_change_is_a_cache_mismatch() -> Result<(), GridError> {
    let device = Device::Cpu;
    let conv = MaskedConv2d::new(ConvConfig::new(2, 2, 3), &device, DType::F32)?;
    let mut cache = ConvCache::new();
    let row = Tensor::zeros((1, 1, 3, 2), DType::F32, &device)?;
    conv.forward_cached(&row, &mut cache, Mode::Eval)?;
    let wider = Tensor::zeros((1, 1, 4, 2), DType::F32, &device)?;
    let result = conv.forward_cached(&wider, &mut cache, Mode::Eval);
    assert!(matches!(result, Err(GridError::CacheMismatch(_))));

    cache.reset();
    conv.forward_cached(&wider, &mut cache, Mode::Eval)?;
    assert_eq!(cache.steps(), 1);
    Ok(())
}

#[test]
fn stack_cache_is_bound_to_its_owner() {
    let owner = next_owner_id();
    let other = next_owner_id();
    assert_ne!(owner, other);

    let mut cache = StackCache::new(owner, 3);
    assert!(cache.check(owner, 3).is_ok());
    assert!(matches!(
        cache.check(other, 3),
        Err(GridError::CacheMismatch(_))
    ));
    assert!(cache.check(owner, 2).is_err());
    assert!(cache.slot_mut(2).is_ok());
    assert!(cache.slot_mut(3).is_err());
    assert_eq!(cache.steps(), 0);
}
