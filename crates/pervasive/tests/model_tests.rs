use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Tensor};
use convolution::{GridError, GridMask, PaddingMask};
use layers::Mode;
use pervasive::{GridModel, ModelConfig, NetworkKind};

const VOCAB: usize = 6;

fn build_config(network: NetworkKind) -> ModelConfig {
    let mut config = ModelConfig::new(VOCAB);
    config.encoder_embed_dim = 4;
    config.decoder_embed_dim = 4;
    config.network = network;
    config.num_layers = 1;
    config.kernel_size = 3;
    config.divide_channels = 1;
    config.ffn_dim = 16;
    config.growth_rate = 4;
    config.bn_size = 2;
    config.num_control_layers = 1;
    config
}

fn inputs(src_len: usize, tgt_len: usize) -> Result<(Tensor, Tensor)> {
    let source = Tensor::randn(0f32, 1.0, (1, src_len, 4), &Device::Cpu)?;
    let target = Tensor::randn(0f32, 1.0, (1, tgt_len, 4), &Device::Cpu)?;
    Ok((source, target))
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

#[test]
fn training_pass_scores_every_cell() -> Result<()> {
    let model = GridModel::new(&build_config(NetworkKind::Residual), &Device::Cpu, DType::F32, None)?;
    let (source, target) = inputs(3, 2)?;
    let ids = Tensor::new(&[[1u32, 2]], &Device::Cpu)?;

    let output = model.forward_train(&source, &target, &GridMask::none(), &ids, Mode::Eval)?;

    assert_eq!(output.log_probs.dims(), &[1, 2, 3, VOCAB]);
    assert_eq!(output.controls.dims(), &[1, 2, 3, 2]);
    assert_eq!(output.scores.dims(), &[1, 2, 3]);
    assert_eq!(output.gamma.dims(), &[1, 2]);
    let sums = output.log_probs.exp()?.sum(3)?.flatten_all()?.to_vec1::<f32>()?;
    assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));

    // Column j predicts exactly what a model that only read j + 1 tokens would.
    for j in 0..3 {
        let prefix = model.forward(&source.narrow(1, 0, j + 1)?, &target, &GridMask::none(), Mode::Eval)?;
        let column = output.log_probs.i((.., .., j))?;
        assert!(max_abs_diff(&prefix, &column)? < 1e-5, "column {j}");
    }

    let picked = output.log_probs.i((0, 1, 2, 2))?.to_scalar::<f32>()?;
    let score = output.scores.i((0, 1, 2))?.to_scalar::<f32>()?;
    assert!((picked - score).abs() < 1e-6);
    Ok(())
}

#[test]
fn later_target_rows_do_not_change_earlier_predictions() -> Result<()> {
    let model = GridModel::new(&build_config(NetworkKind::Residual), &Device::Cpu, DType::F32, None)?;
    let (source, target) = inputs(3, 3)?;
    let changed = Tensor::cat(
        &[&target.narrow(1, 0, 2)?, &Tensor::ones((1, 1, 4), DType::F32, &Device::Cpu)?],
        1,
    )?;

    let a = model.forward(&source, &target, &GridMask::none(), Mode::Eval)?;
    let b = model.forward(&source, &changed, &GridMask::none(), Mode::Eval)?;

    assert!(max_abs_diff(&a.narrow(1, 0, 2)?, &b.narrow(1, 0, 2)?)? < 1e-6);
    assert!(max_abs_diff(&a.narrow(1, 2, 1)?, &b.narrow(1, 2, 1)?)? > 0.0);
    Ok(())
}

#[test]
fn incremental_steps_reproduce_full_decoding() -> Result<()> {
    for network in [NetworkKind::Residual, NetworkKind::Dense] {
        let mut config = build_config(network);
        config.num_layers = 2;
        let model = GridModel::new(&config, &Device::Cpu, DType::F32, None)?;
        let (source, target) = inputs(4, 3)?;
        let full = model.forward(&source, &target, &GridMask::none(), Mode::Eval)?;

        let mut session = model.begin_session();
        for i in 0..3 {
            let row = target.narrow(1, i, 1)?;
            let step = model.step(&mut session, &source, &row, None, Mode::Eval)?;
            assert_eq!(step.dims(), &[1, 1, VOCAB]);
            let expected = full.narrow(1, i, 1)?;
            assert!(max_abs_diff(&step, &expected)? < 1e-5, "{network:?} step {i}");
        }
        assert_eq!(session.steps(), 3);
    }
    Ok(())
}

#[test]
fn reading_more_source_replays_the_target_history() -> Result<()> {
    let model = GridModel::new(&build_config(NetworkKind::Residual), &Device::Cpu, DType::F32, None)?;
    let (source, target) = inputs(4, 3)?;
    let mut session = model.begin_session();

    model.step(&mut session, &source.narrow(1, 0, 1)?, &target.narrow(1, 0, 1)?, None, Mode::Eval)?;
    model.step(&mut session, &source.narrow(1, 0, 2)?, &target.narrow(1, 1, 1)?, None, Mode::Eval)?;
    let last = model.step(&mut session, &source, &target.narrow(1, 2, 1)?, None, Mode::Eval)?;

    let full = model.forward(&source, &target, &GridMask::none(), Mode::Eval)?;
    assert!(max_abs_diff(&last, &full.narrow(1, 2, 1)?)? < 1e-5);
    assert_eq!(session.source_len(), Some(4));
    Ok(())
}

#[test]
fn padded_source_positions_are_ignored() -> Result<()> {
    let model = GridModel::new(&build_config(NetworkKind::Residual), &Device::Cpu, DType::F32, None)?;
    let (source, target) = inputs(3, 2)?;
    let padding = PaddingMask::from_lengths(&Device::Cpu, &[2], 3)?;
    let mask = GridMask::new(Some(padding), None);

    let padded = model.forward(&source, &target, &mask, Mode::Eval)?;
    let truncated = model.forward(&source.narrow(1, 0, 2)?, &target, &GridMask::none(), Mode::Eval)?;
    assert!(max_abs_diff(&padded, &truncated)? < 1e-5);

    let ids = Tensor::new(&[[0u32, 3]], &Device::Cpu)?;
    let output = model.forward_train(&source, &target, &mask, &ids, Mode::Eval)?;
    let scores = output.scores.squeeze(0)?.to_vec2::<f32>()?;
    assert!(scores.iter().all(|row| row[2] == -1000.0 && row[0] > -1000.0));
    let writes = output.write_labels.squeeze(0)?.to_vec2::<f32>()?;
    assert!(writes.iter().all(|row| row[2] == 0.0));
    Ok(())
}

#[test]
fn padded_source_content_never_reaches_real_cells() -> Result<()> {
    for network in [NetworkKind::Residual, NetworkKind::Dense] {
        let mut config = build_config(network);
        config.double_masked = false;
        config.num_layers = 2;
        let model = GridModel::new(&config, &Device::Cpu, DType::F32, None)?;
        let (source, target) = inputs(3, 2)?;
        let live = source.narrow(1, 0, 2)?;
        let loud = Tensor::cat(&[&live, &Tensor::full(50f32, (1, 1, 4), &Device::Cpu)?], 1)?;
        let quiet = Tensor::cat(&[&live, &Tensor::zeros((1, 1, 4), DType::F32, &Device::Cpu)?], 1)?;
        let mask = GridMask::new(Some(PaddingMask::from_lengths(&Device::Cpu, &[2], 3)?), None);

        let a = model.forward(&loud, &target, &mask, Mode::Eval)?;
        let b = model.forward(&quiet, &target, &mask, Mode::Eval)?;
        assert!(max_abs_diff(&a, &b)? < 1e-5, "{network:?} forward");

        let ids = Tensor::new(&[[2u32, 5]], &Device::Cpu)?;
        let a = model.forward_train(&loud, &target, &mask, &ids, Mode::Eval)?;
        let b = model.forward_train(&quiet, &target, &mask, &ids, Mode::Eval)?;
        let live_a = a.log_probs.narrow(2, 0, 2)?;
        let live_b = b.log_probs.narrow(2, 0, 2)?;
        assert!(max_abs_diff(&live_a, &live_b)? < 1e-5, "{network:?} per-cell scores");
    }
    Ok(())
}

#[test]
fn oracle_labels_form_a_monotonic_staircase() -> Result<()> {
    let model = GridModel::new(&build_config(NetworkKind::Residual), &Device::Cpu, DType::F32, None)?;
    let (source, target) = inputs(5, 4)?;
    let ids = Tensor::new(&[[1u32, 4, 0, 5]], &Device::Cpu)?;

    let output = model.forward_train(&source, &target, &GridMask::none(), &ids, Mode::Eval)?;
    let reads = output.read_labels.squeeze(0)?.to_vec2::<f32>()?;
    let writes = output.write_labels.squeeze(0)?.to_vec2::<f32>()?;

    let mut previous = 0;
    for (read, write) in reads.iter().zip(writes.iter()) {
        let boundary = write.iter().position(|&w| w == 1.0).expect("one write per row");
        assert_eq!(write.iter().filter(|&&w| w == 1.0).count(), 1);
        assert!(read[..boundary].iter().all(|&r| r == 1.0));
        assert!(read[boundary..].iter().all(|&r| r == 0.0));
        assert!(boundary >= previous);
        previous = boundary;
    }
    let gamma = output.gamma.flatten_all()?.to_vec1::<f32>()?;
    assert!(gamma.iter().all(|&g| g >= 0.0));
    Ok(())
}

#[test]
fn failed_steps_leave_the_session_untouched() -> Result<()> {
    let mut config = build_config(NetworkKind::Dense);
    config.num_layers = 2;
    let model = GridModel::new(&config, &Device::Cpu, DType::F32, None)?;
    let (source, target) = inputs(3, 3)?;
    let full = model.forward(&source, &target, &GridMask::none(), Mode::Eval)?;

    let mut session = model.begin_session();
    model.step(&mut session, &source, &target.narrow(1, 0, 1)?, None, Mode::Eval)?;
    let cached_rows = session.cache().steps();

    // The mask width only gets checked once every layer has consumed the row.
    let wrong = PaddingMask::from_lengths(&Device::Cpu, &[2], 2)?;
    let err = model
        .step(&mut session, &source, &target.narrow(1, 1, 1)?, Some(&wrong), Mode::Eval)
        .unwrap_err();
    assert!(matches!(err, GridError::InvalidShape { .. }));
    assert_eq!(session.steps(), 1);
    assert_eq!(session.cache().steps(), cached_rows);

    for i in 1..3 {
        let step = model.step(&mut session, &source, &target.narrow(1, i, 1)?, None, Mode::Eval)?;
        assert!(max_abs_diff(&step, &full.narrow(1, i, 1)?)? < 1e-5, "step {i}");
    }
    Ok(())
}

#[test]
fn sessions_reject_misuse() -> Result<()> {
    let config = build_config(NetworkKind::Residual);
    let model = GridModel::new(&config, &Device::Cpu, DType::F32, None)?;
    let other = GridModel::new(&config, &Device::Cpu, DType::F32, None)?;
    let (source, target) = inputs(3, 2)?;
    let row = target.narrow(1, 0, 1)?;

    let mut session = model.begin_session();
    let err = model.step(&mut session, &source, &row, None, Mode::Train).unwrap_err();
    assert!(matches!(err, GridError::ModeMismatch(_)));

    let mut foreign = other.begin_session();
    let err = model.step(&mut foreign, &source, &row, None, Mode::Eval).unwrap_err();
    assert!(matches!(err, GridError::CacheMismatch(_)));

    model.step(&mut session, &source, &row, None, Mode::Eval)?;
    let err = model
        .step(&mut session, &source.narrow(1, 0, 2)?, &target.narrow(1, 1, 1)?, None, Mode::Eval)
        .unwrap_err();
    assert!(matches!(err, GridError::CacheMismatch(_)));

    let ids = Tensor::new(&[[1u32, VOCAB as u32]], &Device::Cpu)?;
    assert!(model
        .forward_train(&source, &target, &GridMask::none(), &ids, Mode::Eval)
        .is_err());
    Ok(())
}
