use super::*;
use candle_core::{DType, Device, Tensor};

use crate::core::GridError;

#[test]
fn single_masked_kernel_hides_future_rows_only() {
    let mask = build_kernel_mask(3, false);
    assert_eq!(
        mask,
        vec![true, true, true, true, true, true, false, false, false]
    );
    assert_eq!(live_taps(3, false).len(), 6);
}

#[test]
fn double_masked_kernel_hides_future_columns() {
    let mask = build_kernel_mask(5, true);
    // Row 1 of a 5x5 kernel: columns 0..=2 live.
    assert_eq!(&mask[5..10], &[true, true, true, false, false]);
    // Rows past the centre are dead.
    assert!(mask[15..].iter().all(|live| !live));
    assert_eq!(
        live_taps(5, true),
        vec![
            (0, 0),
            (0, 1),
            (0, 2),
            (1, 0),
            (1, 1),
            (1, 2),
            (2, 0),
            (2, 1),
            (2, 2)
        ]
    );
}

#[test]
fn kernel_mask_tensor_matches_pattern() -> Result<(), GridError> {
    let mask = kernel_mask_tensor(&Device::Cpu, DType::F32, 2, 3, 3, true)?;
    assert_eq!(mask.dims(), &[2, 3, 3, 3]);
    let values = mask.flatten_all()?.to_vec1::<f32>()?;
    let pattern = build_kernel_mask(3, true);
    for (idx, value) in values.iter().enumerate() {
        let expected = if pattern[idx % 9] { 1.0 } else { 0.0 };
        assert_eq!(*value, expected);
    }
    Ok(())
}

#[test]
fn lengths_and_booleans_agree() -> Result<(), GridError> {
    let device = Device::Cpu;
    let from_lengths = PaddingMask::from_lengths(&device, &[3, 1], 4)?;
    let from_bools = PaddingMask::from_booleans(
        &device,
        &[
            vec![false, false, false, true],
            vec![false, true, true, true],
        ],
    )?;
    assert_eq!(
        from_lengths.tensor().to_vec2::<u8>()?,
        from_bools.tensor().to_vec2::<u8>()?
    );
    assert_eq!(from_lengths.lengths()?, vec![3, 1]);
    assert_eq!(from_lengths.all_padding()?, vec![false, false]);
    Ok(())
}

#[test]
fn ragged_boolean_rows_are_rejected() {
    let result = PaddingMask::from_booleans(&Device::Cpu, &[vec![false], vec![false, true]]);
    assert!(matches!(result, Err(GridError::InvalidShape { .. })));
}

#[test]
fn grid_mask_zeroes_padded_cells() -> Result<(), GridError> {
    let device = Device::Cpu;
    let source = PaddingMask::from_lengths(&device, &[2], 3)?;
    let target = PaddingMask::from_lengths(&device, &[1], 2)?;
    let mask = GridMask::new(Some(source), Some(target));
    let grid = Tensor::ones((1, 2, 3, 2), DType::F32, &device)?;
    let masked = mask.apply(&grid)?;
    let cells = masked.sum(3)?.squeeze(0)?.to_vec2::<f32>()?;
    assert_eq!(cells, vec![vec![2.0, 2.0, 0.0], vec![0.0, 0.0, 0.0]]);
    Ok(())
}

#[test]
fn grid_mask_rejects_wrong_geometry() -> Result<(), GridError> {
    let device = Device::Cpu;
    let mask = GridMask::new(Some(PaddingMask::from_lengths(&device, &[2], 3)?), None);
    let grid = Tensor::ones((1, 2, 4, 2), DType::F32, &device)?;
    assert!(mask.apply(&grid).is_err());
    Ok(())
}

#[test]
fn empty_grid_mask_is_identity() -> Result<(), GridError> {
    let grid = Tensor::randn(0f32, 1.0, (2, 2, 2, 3), &Device::Cpu)?;
    let out = GridMask::none().apply(&grid)?;
    let diff = out.sub(&grid)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
    assert_eq!(diff, 0.0);
    Ok(())
}
