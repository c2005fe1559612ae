//! Streaming engine behaviour across whole epochs.

mod common;

use common::{missing, synthetic_descriptors, write_split_set, SlowReader, SyntheticReader};
use pair_dataset::{
    Batch, DeriveConfig, EpochState, FnTransform, ImageTensor, PairDeriver, PairPipeline,
    PartialBatchPolicy, PipelineConfig, PipelineError, SampleDescriptor, Side, SkipPolicy,
    TransformChain, TransformStep,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn synthetic_pipeline(count: usize, cfg: PipelineConfig) -> anyhow::Result<PairPipeline> {
    let deriver = PairDeriver::with_reader(
        Arc::new(SyntheticReader {
            width: 8,
            height: 4,
        }),
        DeriveConfig::default(),
    );
    Ok(PairPipeline::from_parts(
        synthetic_descriptors(count),
        cfg,
        deriver,
        TransformChain::new(),
    )?)
}

fn collect_epoch(pipeline: &mut PairPipeline) -> anyhow::Result<Vec<Batch>> {
    let mut out = Vec::new();
    for batch in pipeline.epoch_iter() {
        out.push(batch?);
    }
    Ok(out)
}

#[test]
fn twelve_images_yield_three_full_batches() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let descriptors = write_split_set(tmp.path(), 12, 64, 64)?;
    let cfg = PipelineConfig::builder()
        .batch_size(4)
        .shuffle_window_size(4)
        .prefetch_depth(2)
        .parallelism(2)
        .derive(DeriveConfig {
            output_size: Some((64, 64)),
            ..DeriveConfig::default()
        })
        .build()?;
    let mut pipeline = PairPipeline::new(descriptors, cfg)?;
    assert_eq!(pipeline.state(), EpochState::NotStarted);

    let batches = collect_epoch(&mut pipeline)?;
    assert_eq!(batches.len(), 3);
    for batch in &batches {
        assert_eq!(batch.shape, [4, 64, 64, 3]);
        assert_eq!(batch.inputs.len(), 4 * 64 * 64 * 3);
        assert_eq!(batch.targets.len(), batch.inputs.len());
        assert!(batch
            .inputs
            .iter()
            .chain(batch.targets.iter())
            .all(|v| (0.0..=1.0).contains(v)));
    }
    let stats = pipeline.stats();
    assert_eq!(stats.samples_seen, 12);
    assert_eq!(stats.samples_skipped, 0);
    assert_eq!(stats.batches_delivered, 3);
    assert_eq!(stats.epoch, 1);
    assert_eq!(pipeline.state(), EpochState::Exhausted);
    // Exhausted pulls return the end marker again, never block.
    assert!(pipeline.next_batch()?.is_none());
    Ok(())
}

#[test]
fn unshuffled_delivery_follows_manifest_order() -> anyhow::Result<()> {
    let cfg = PipelineConfig::builder()
        .batch_size(1)
        .shuffle_window_size(1)
        .prefetch_depth(2)
        .parallelism(4)
        .build()?;
    let mut pipeline = synthetic_pipeline(24, cfg)?;
    let expected: Vec<String> = synthetic_descriptors(24)
        .iter()
        .map(|d| d.identity())
        .collect();
    let delivered: Vec<String> = collect_epoch(&mut pipeline)?
        .into_iter()
        .flat_map(|b| b.identities)
        .collect();
    assert_eq!(delivered, expected);
    Ok(())
}

#[test]
fn reruns_are_bit_identical() -> anyhow::Result<()> {
    for window in [1, 6] {
        let cfg = PipelineConfig::builder()
            .batch_size(if window == 1 { 1 } else { 3 })
            .shuffle_window_size(window)
            .parallelism(3)
            .seed(11)
            .build()?;
        let first = collect_epoch(&mut synthetic_pipeline(18, cfg.clone())?)?;
        let second = collect_epoch(&mut synthetic_pipeline(18, cfg)?)?;
        assert_eq!(first, second, "window {window}");
    }
    Ok(())
}

#[test]
fn shuffled_epoch_is_a_permutation() -> anyhow::Result<()> {
    let cfg = PipelineConfig::builder()
        .batch_size(2)
        .shuffle_window_size(8)
        .parallelism(2)
        .seed(5)
        .build()?;
    let mut pipeline = synthetic_pipeline(32, cfg)?;
    let mut delivered: Vec<String> = collect_epoch(&mut pipeline)?
        .into_iter()
        .flat_map(|b| b.identities)
        .collect();
    let mut expected: Vec<String> = synthetic_descriptors(32)
        .iter()
        .map(|d| d.identity())
        .collect();
    assert_ne!(delivered, expected);
    delivered.sort();
    expected.sort();
    assert_eq!(delivered, expected);
    Ok(())
}

#[test]
fn skip_ratio_above_threshold_is_fatal() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut descriptors = write_split_set(tmp.path(), 6, 8, 8)?;
    descriptors.extend(missing(tmp.path(), 4));
    let cfg = PipelineConfig::builder()
        .batch_size(2)
        .shuffle_window_size(2)
        .parallelism(2)
        .skip_ratio_threshold(0.2)
        .build()?;
    let mut pipeline = PairPipeline::new(descriptors, cfg)?;
    let results: Vec<_> = pipeline.epoch_iter().collect();
    let last = results.last().expect("at least one result");
    match last {
        Err(PipelineError::SkipRatioExceeded {
            skipped,
            total,
            threshold,
            ..
        }) => {
            assert_eq!(*total, 10);
            assert!(*skipped >= 3);
            assert_eq!(*threshold, 0.2);
        }
        other => panic!("expected skip ratio failure, got {other:?}"),
    }
    assert_eq!(pipeline.state(), EpochState::Exhausted);
    Ok(())
}

#[test]
fn skips_below_threshold_are_counted() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut descriptors = write_split_set(tmp.path(), 9, 8, 8)?;
    descriptors.extend(missing(tmp.path(), 1));
    let cfg = PipelineConfig::builder()
        .batch_size(3)
        .shuffle_window_size(3)
        .parallelism(2)
        .skip_ratio_threshold(0.2)
        .build()?;
    let mut pipeline = PairPipeline::new(descriptors, cfg)?;
    let batches = collect_epoch(&mut pipeline)?;
    assert_eq!(batches.len(), 3);
    let stats = pipeline.stats();
    assert_eq!(stats.samples_skipped, 1);
    assert_eq!(stats.samples_seen, 9);
    Ok(())
}

#[test]
fn abort_policy_stops_on_first_failure() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut descriptors = write_split_set(tmp.path(), 3, 8, 8)?;
    descriptors.extend(missing(tmp.path(), 1));
    let cfg = PipelineConfig::builder()
        .batch_size(1)
        .shuffle_window_size(1)
        .parallelism(1)
        .skip_policy(SkipPolicy::Abort)
        .build()?;
    let mut pipeline = PairPipeline::new(descriptors, cfg)?;
    let results: Vec<_> = pipeline.epoch_iter().collect();
    assert_eq!(results.len(), 4);
    assert!(results[..3].iter().all(|r| r.is_ok()));
    match &results[3] {
        Err(PipelineError::SampleAborted { sample, source }) => {
            assert!(sample.contains("missing_000"));
            assert_eq!(source.kind(), "unreadable");
        }
        other => panic!("expected abort, got {other:?}"),
    }
    Ok(())
}

#[test]
fn mixed_sizes_without_resize_are_fatal() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut descriptors = write_split_set(tmp.path(), 2, 8, 8)?;
    descriptors.push(pair_dataset::SampleDescriptor::split(common::write_rgb(
        tmp.path(),
        "wide.png",
        16,
        8,
        1,
    )?));
    let cfg = PipelineConfig::builder()
        .batch_size(1)
        .shuffle_window_size(1)
        .parallelism(1)
        .build()?;
    let mut pipeline = PairPipeline::new(descriptors, cfg)?;
    let results: Vec<_> = pipeline.epoch_iter().collect();
    assert!(matches!(
        results.last(),
        Some(Err(PipelineError::InconsistentShape { .. }))
    ));
    Ok(())
}

#[test]
fn partial_batch_policy_is_honoured() -> anyhow::Result<()> {
    let base = PipelineConfig::builder()
        .batch_size(4)
        .shuffle_window_size(4)
        .parallelism(2);
    let mut keep = synthetic_pipeline(10, base.clone().build()?)?;
    let kept = collect_epoch(&mut keep)?;
    assert_eq!(
        kept.iter().map(Batch::len).collect::<Vec<_>>(),
        vec![4, 4, 2]
    );

    let mut trimmed =
        synthetic_pipeline(10, base.partial_batch(PartialBatchPolicy::Drop).build()?)?;
    let dropped = collect_epoch(&mut trimmed)?;
    assert_eq!(dropped.len(), 2);
    assert_eq!(trimmed.stats().samples_seen, 8);
    Ok(())
}

#[test]
fn reset_epoch_starts_a_fresh_epoch() -> anyhow::Result<()> {
    let cfg = PipelineConfig::builder()
        .batch_size(2)
        .shuffle_window_size(2)
        .parallelism(2)
        .build()?;
    let mut pipeline = synthetic_pipeline(8, cfg)?;
    let first = pipeline.next_batch()?.expect("first batch");
    assert_eq!(first.len(), 2);
    assert!(matches!(
        pipeline.state(),
        EpochState::Running | EpochState::Draining
    ));

    pipeline.reset_epoch();
    assert_eq!(pipeline.state(), EpochState::NotStarted);

    let batches = collect_epoch(&mut pipeline)?;
    assert_eq!(batches.len(), 4);
    let stats = pipeline.stats();
    assert_eq!(stats.epoch, 2);
    assert_eq!(stats.samples_seen, 8);
    Ok(())
}

#[test]
fn empty_manifest_ends_immediately() -> anyhow::Result<()> {
    let mut pipeline = synthetic_pipeline(0, PipelineConfig::default())?;
    assert!(pipeline.next_batch()?.is_none());
    assert_eq!(pipeline.state(), EpochState::Exhausted);
    Ok(())
}

#[test]
fn dropping_mid_epoch_does_not_hang() -> anyhow::Result<()> {
    let cfg = PipelineConfig::builder()
        .batch_size(2)
        .shuffle_window_size(4)
        .prefetch_depth(1)
        .parallelism(4)
        .teardown_timeout(Duration::from_secs(2))
        .build()?;
    let mut pipeline = synthetic_pipeline(500, cfg)?;
    assert!(pipeline.next_batch()?.is_some());
    let started = Instant::now();
    drop(pipeline);
    assert!(started.elapsed() < Duration::from_secs(3));
    Ok(())
}

#[test]
fn sample_timeout_turns_stalls_into_skips() -> anyhow::Result<()> {
    let cfg = PipelineConfig::builder()
        .batch_size(1)
        .shuffle_window_size(1)
        .parallelism(2)
        .skip_ratio_threshold(1.0)
        .sample_timeout(Some(Duration::from_millis(50)))
        .build()?;
    let deriver = PairDeriver::with_reader(
        Arc::new(SlowReader {
            delay: Duration::from_secs(2),
        }),
        DeriveConfig::default(),
    );
    let mut pipeline = PairPipeline::from_parts(
        synthetic_descriptors(2),
        cfg,
        deriver,
        TransformChain::new(),
    )?;
    let started = Instant::now();
    let batches = collect_epoch(&mut pipeline)?;
    assert!(batches.is_empty());
    assert_eq!(pipeline.stats().samples_skipped, 2);
    assert!(started.elapsed() < Duration::from_secs(2));
    Ok(())
}

#[test]
fn values_leaving_the_declared_range_are_skipped() -> anyhow::Result<()> {
    // Red channel carries the tag; tag 200 pushes one sample past 0.5.
    let mut descriptors = synthetic_descriptors(9);
    descriptors.push(SampleDescriptor::split("/synthetic/sample_0200.png"));
    let amplify = FnTransform::new("amplify", |img: &ImageTensor| {
        Ok(img.map(|v| if v > 0.5 { f32::NAN } else { v }))
    });
    let cfg = PipelineConfig::builder()
        .batch_size(3)
        .shuffle_window_size(3)
        .parallelism(2)
        .skip_ratio_threshold(0.2)
        .build()?;
    let deriver = PairDeriver::with_reader(
        Arc::new(SyntheticReader {
            width: 8,
            height: 4,
        }),
        DeriveConfig::default(),
    );
    let chain = TransformChain::new().then(Arc::new(amplify), Side::Both);
    let mut pipeline = PairPipeline::from_parts(descriptors, cfg, deriver, chain)?;

    let batches = collect_epoch(&mut pipeline)?;
    assert_eq!(batches.len(), 3);
    assert!(batches
        .iter()
        .flat_map(|b| b.inputs.iter().chain(b.targets.iter()))
        .all(|v| v.is_finite() && (0.0..=1.0).contains(v)));
    assert!(batches
        .iter()
        .flat_map(|b| b.identities.iter())
        .all(|id| !id.contains("0200")));
    let stats = pipeline.stats();
    assert_eq!(stats.samples_seen, 9);
    assert_eq!(stats.samples_skipped, 1);
    Ok(())
}

#[test]
fn widened_value_range_admits_rescaled_pairs() -> anyhow::Result<()> {
    let cfg = PipelineConfig::builder()
        .batch_size(2)
        .shuffle_window_size(2)
        .parallelism(1)
        .value_range(-1.0, 1.0)
        .transform(TransformStep::new("normalize").param("low", -1.0))
        .build()?;
    let tmp = tempfile::tempdir()?;
    let descriptors = write_split_set(tmp.path(), 4, 8, 4)?;
    let mut pipeline = PairPipeline::new(descriptors, cfg)?;
    let batches = collect_epoch(&mut pipeline)?;
    assert_eq!(batches.len(), 2);
    assert!(batches[0].inputs.iter().any(|v| *v < 0.0));
    assert_eq!(pipeline.stats().samples_skipped, 0);
    Ok(())
}
