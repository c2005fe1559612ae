//! Streaming engine: parallel derivation, windowed shuffle, batching and
//! prefetch, driven one epoch at a time by the consumer's pulls.
//!
//! Thread layout per epoch:
//! - `parallelism` workers claim descriptor indices, derive and transform the
//!   pair, and send `(index, outcome)` to the assembler. A worker must hold a
//!   credit before claiming; the assembler returns one credit per sequenced
//!   sample, which bounds how far workers can run ahead.
//! - one assembler re-sequences outcomes by index, applies the skip policy,
//!   feeds the shuffle window and the batch assembler, and pushes finished
//!   batches into the prefetch queue (`bounded(prefetch_depth)`).
//!
//! Teardown is cooperative: a cancel flag plus dropped channel ends. Threads
//! still alive after `teardown_timeout` are detached.

use crate::batch::BatchAssembler;
use crate::config::{PartialBatchPolicy, PipelineConfig, SkipPolicy};
use crate::derive::PairDeriver;
use crate::guard::{panic_message, Guard};
use crate::shuffle::ShuffleWindow;
use crate::transform::{check_value_range, TransformChain, TransformRegistry};
use crate::types::{
    Batch, EpochState, ImagePair, PipelineError, PipelineResult, PipelineStats, SampleError,
};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use data_contracts::SampleDescriptor;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type SampleOutcome = Result<ImagePair, SampleError>;

enum Delivery {
    Batch(Batch),
    Fatal(PipelineError),
    EndOfEpoch,
}

/// Derive + transform + range check for one descriptor. Shared by every worker.
struct SampleProcessor {
    deriver: PairDeriver,
    chain: TransformChain,
    value_range: (f32, f32),
}

impl SampleProcessor {
    fn process(&self, descriptor: &SampleDescriptor) -> SampleOutcome {
        let identity = descriptor.identity();
        let pair = self.deriver.derive(descriptor)?;
        let pair = self.chain.apply(pair, &identity)?;
        check_value_range(&pair, self.value_range, &identity)?;
        Ok(pair)
    }
}

struct EpochRun {
    rx: Receiver<Delivery>,
    cancel: Arc<AtomicBool>,
    state: Arc<Mutex<EpochState>>,
    skipped: Arc<AtomicUsize>,
    handles: Vec<JoinHandle<()>>,
}

pub struct PairPipeline {
    descriptors: Arc<[SampleDescriptor]>,
    config: PipelineConfig,
    processor: Arc<SampleProcessor>,
    epoch: u64,
    idle_state: EpochState,
    run: Option<EpochRun>,
    stats: PipelineStats,
    wait_total: Duration,
    epoch_started: Instant,
    last_logged_batches: usize,
    trace: TraceSink,
}

impl PairPipeline {
    /// Pipeline over `descriptors` with the built-in transform registry and
    /// the filesystem reader.
    pub fn new(descriptors: Vec<SampleDescriptor>, config: PipelineConfig) -> PipelineResult<Self> {
        Self::with_registry(descriptors, config, &TransformRegistry::with_builtins())
    }

    /// Resolve `config.transforms` against a caller-supplied registry.
    pub fn with_registry(
        descriptors: Vec<SampleDescriptor>,
        config: PipelineConfig,
        registry: &TransformRegistry,
    ) -> PipelineResult<Self> {
        config.validate()?;
        let chain = registry.build(&config.transforms)?;
        let deriver = PairDeriver::new(config.derive);
        Self::from_parts(descriptors, config, deriver, chain)
    }

    /// Explicit deriver and chain. `config.derive` and `config.transforms`
    /// are ignored; `config.sample_timeout_secs` still wraps the reader.
    pub fn from_parts(
        descriptors: Vec<SampleDescriptor>,
        config: PipelineConfig,
        deriver: PairDeriver,
        chain: TransformChain,
    ) -> PipelineResult<Self> {
        config.validate()?;
        let deriver = match config.sample_timeout() {
            Some(timeout) => deriver.guarded(timeout),
            None => deriver,
        };
        tracing::debug!(
            samples = descriptors.len(),
            chain = %chain.describe(),
            batch_size = config.batch_size,
            window = config.shuffle_window_size,
            parallelism = config.parallelism,
            "pipeline configured"
        );
        let trace = TraceSink::new(config.trace_path.clone());
        let value_range = config.value_range;
        Ok(Self {
            descriptors: descriptors.into(),
            config,
            processor: Arc::new(SampleProcessor {
                deriver,
                chain,
                value_range,
            }),
            epoch: 0,
            idle_state: EpochState::NotStarted,
            run: None,
            stats: PipelineStats::default(),
            wait_total: Duration::ZERO,
            epoch_started: Instant::now(),
            last_logged_batches: 0,
            trace,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Epochs started so far.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn state(&self) -> EpochState {
        match &self.run {
            Some(run) => *run.state.lock().unwrap_or_else(PoisonError::into_inner),
            None => self.idle_state,
        }
    }

    /// Counters for the current (or last finished) epoch.
    pub fn stats(&self) -> PipelineStats {
        let mut stats = self.stats.clone();
        if let Some(run) = &self.run {
            stats.samples_skipped = run.skipped.load(Ordering::SeqCst);
        }
        stats
    }

    /// Next batch of the current epoch. `Ok(None)` marks the end of the
    /// epoch and is returned for every pull until [`reset_epoch`].
    ///
    /// [`reset_epoch`]: PairPipeline::reset_epoch
    pub fn next_batch(&mut self) -> PipelineResult<Option<Batch>> {
        if self.run.is_none() {
            if self.idle_state == EpochState::Exhausted {
                return Ok(None);
            }
            self.start_epoch()?;
        }
        let waited = Instant::now();
        let delivery = match &self.run {
            Some(run) => run.rx.recv(),
            None => return Ok(None),
        };
        match delivery {
            Ok(Delivery::Batch(batch)) => {
                self.record_batch(&batch, waited.elapsed());
                Ok(Some(batch))
            }
            Ok(Delivery::EndOfEpoch) => {
                self.finish_epoch();
                Ok(None)
            }
            Ok(Delivery::Fatal(err)) => {
                self.finish_epoch();
                Err(err)
            }
            Err(_) => {
                self.finish_epoch();
                Err(PipelineError::Disconnected)
            }
        }
    }

    /// Stop the current epoch (if any) and return to `NotStarted`. The next
    /// pull starts a new epoch with a fresh shuffle seed and zeroed stats.
    pub fn reset_epoch(&mut self) {
        self.teardown();
        self.idle_state = EpochState::NotStarted;
    }

    /// Iterate the batches of the current epoch.
    pub fn epoch_iter(&mut self) -> EpochIter<'_> {
        EpochIter {
            pipeline: self,
            done: false,
        }
    }

    fn start_epoch(&mut self) -> PipelineResult<()> {
        self.epoch += 1;
        self.stats = PipelineStats {
            epoch: self.epoch,
            ..PipelineStats::default()
        };
        self.wait_total = Duration::ZERO;
        self.last_logged_batches = 0;
        self.epoch_started = Instant::now();

        let total = self.descriptors.len();
        let cfg = &self.config;
        let credit_count = cfg.shuffle_window_size + cfg.parallelism;
        let (credit_tx, credit_rx) = bounded::<()>(credit_count);
        for _ in 0..credit_count {
            let _ = credit_tx.try_send(());
        }
        let (outcome_tx, outcome_rx) = unbounded::<(usize, SampleOutcome)>();
        let (batch_tx, batch_rx) = bounded::<Delivery>(cfg.prefetch_depth);

        let mut run = EpochRun {
            rx: batch_rx,
            cancel: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(EpochState::Running)),
            skipped: Arc::new(AtomicUsize::new(0)),
            handles: Vec::with_capacity(cfg.parallelism + 1),
        };
        let cursor = Arc::new(AtomicUsize::new(0));
        let workers = cfg.parallelism.min(total.max(1));

        let assembler = Assembler {
            descriptors: Arc::clone(&self.descriptors),
            outcomes: outcome_rx,
            credits: credit_tx,
            out: batch_tx,
            cancel: Arc::clone(&run.cancel),
            skipped: Arc::clone(&run.skipped),
            batch_size: cfg.batch_size,
            window: cfg.shuffle_window_size,
            seed: cfg.seed,
            epoch: self.epoch,
            partial_batch: cfg.partial_batch,
            skip_policy: cfg.skip_policy,
            threshold: cfg.skip_ratio_threshold,
        };

        let mut spawned = Ok(());
        for i in 0..workers {
            let worker = Worker {
                descriptors: Arc::clone(&self.descriptors),
                processor: Arc::clone(&self.processor),
                cursor: Arc::clone(&cursor),
                credits: credit_rx.clone(),
                outcomes: outcome_tx.clone(),
                cancel: Arc::clone(&run.cancel),
                state: Arc::clone(&run.state),
            };
            match thread::Builder::new()
                .name(format!("pair-worker-{i}"))
                .spawn(move || worker.run())
            {
                Ok(handle) => run.handles.push(handle),
                Err(e) => {
                    spawned = Err(e);
                    break;
                }
            }
        }
        drop(outcome_tx);
        drop(credit_rx);
        if spawned.is_ok() {
            match thread::Builder::new()
                .name("pair-assembler".to_string())
                .spawn(move || assembler.run())
            {
                Ok(handle) => run.handles.push(handle),
                Err(e) => spawned = Err(e),
            }
        }

        self.run = Some(run);
        if let Err(e) = spawned {
            self.teardown();
            self.idle_state = EpochState::Exhausted;
            return Err(PipelineError::Spawn(e));
        }
        tracing::info!(
            epoch = self.epoch,
            samples = total,
            workers,
            "epoch started"
        );
        Ok(())
    }

    fn record_batch(&mut self, batch: &Batch, waited: Duration) {
        self.stats.samples_seen += batch.len();
        self.stats.batches_delivered += 1;
        self.wait_total += waited;
        let delivered = u32::try_from(self.stats.batches_delivered).unwrap_or(u32::MAX);
        self.stats.mean_batch_latency = self.wait_total / delivered.max(1);
        tracing::debug!(
            epoch = self.epoch,
            batch = self.stats.batches_delivered,
            samples = batch.len(),
            wait_ms = waited.as_secs_f64() * 1000.0,
            "batch delivered"
        );
        let skipped = self
            .run
            .as_ref()
            .map(|run| run.skipped.load(Ordering::SeqCst))
            .unwrap_or(self.stats.samples_skipped);
        self.trace.record(serde_json::json!({
            "epoch": self.epoch,
            "batch": self.stats.batches_delivered,
            "samples": batch.len(),
            "shape": batch.shape,
            "skipped_total": skipped,
            "wait_ms": waited.as_secs_f64() * 1000.0,
            "timestamp_ms": self.epoch_started.elapsed().as_millis() as u64
        }));
        self.maybe_log_progress(skipped);
    }

    fn maybe_log_progress(&mut self, skipped: usize) {
        let Some(every) = self.config.log_every_batches else {
            return;
        };
        if self.stats.batches_delivered - self.last_logged_batches < every.max(1) {
            return;
        }
        self.last_logged_batches = self.stats.batches_delivered;
        let secs = self.epoch_started.elapsed().as_secs_f64().max(0.001);
        tracing::info!(
            epoch = self.epoch,
            batches = self.stats.batches_delivered,
            samples = self.stats.samples_seen,
            skipped,
            samples_per_s = self.stats.samples_seen as f64 / secs,
            mean_wait_ms = self.stats.mean_batch_latency.as_secs_f64() * 1000.0,
            "pipeline progress"
        );
    }

    fn finish_epoch(&mut self) {
        self.teardown();
        self.idle_state = EpochState::Exhausted;
        tracing::info!(
            epoch = self.epoch,
            batches = self.stats.batches_delivered,
            samples = self.stats.samples_seen,
            skipped = self.stats.samples_skipped,
            elapsed_s = self.epoch_started.elapsed().as_secs_f64(),
            "epoch finished"
        );
    }

    fn teardown(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };
        run.cancel.store(true, Ordering::SeqCst);
        self.stats.samples_skipped = run.skipped.load(Ordering::SeqCst);
        let EpochRun { rx, handles, .. } = run;
        drop(rx);
        let threads = handles.len();
        let joined = Guard::new(self.config.teardown_timeout()).run(move || {
            for handle in handles {
                let _ = handle.join();
            }
        });
        match joined {
            Ok(()) => tracing::debug!(epoch = self.epoch, threads, "epoch threads joined"),
            Err(e) => tracing::warn!(
                epoch = self.epoch,
                threads,
                error = %e,
                "epoch threads still running after teardown timeout; detaching"
            ),
        }
    }
}

impl Drop for PairPipeline {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Batches of one epoch; ends after the end-of-epoch marker or an error.
pub struct EpochIter<'a> {
    pipeline: &'a mut PairPipeline,
    done: bool,
}

impl Iterator for EpochIter<'_> {
    type Item = PipelineResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.pipeline.next_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

struct Worker {
    descriptors: Arc<[SampleDescriptor]>,
    processor: Arc<SampleProcessor>,
    cursor: Arc<AtomicUsize>,
    credits: Receiver<()>,
    outcomes: Sender<(usize, SampleOutcome)>,
    cancel: Arc<AtomicBool>,
    state: Arc<Mutex<EpochState>>,
}

impl Worker {
    fn run(self) {
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                break;
            }
            if self.credits.recv().is_err() {
                break;
            }
            let index = self.cursor.fetch_add(1, Ordering::SeqCst);
            let Some(descriptor) = self.descriptors.get(index) else {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if *state == EpochState::Running {
                    *state = EpochState::Draining;
                }
                break;
            };
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.processor.process(descriptor)))
                .unwrap_or_else(|payload| {
                    Err(SampleError::Panicked {
                        sample: descriptor.identity(),
                        msg: panic_message(&*payload),
                    })
                });
            if self.outcomes.send((index, outcome)).is_err() {
                break;
            }
        }
    }
}

enum Stop {
    Fatal(PipelineError),
    /// Consumer went away or the epoch was cancelled.
    Hangup,
}

struct Assembler {
    descriptors: Arc<[SampleDescriptor]>,
    outcomes: Receiver<(usize, SampleOutcome)>,
    credits: Sender<()>,
    out: Sender<Delivery>,
    cancel: Arc<AtomicBool>,
    skipped: Arc<AtomicUsize>,
    batch_size: usize,
    window: usize,
    seed: u64,
    epoch: u64,
    partial_batch: PartialBatchPolicy,
    skip_policy: SkipPolicy,
    threshold: f64,
}

impl Assembler {
    fn run(self) {
        match self.drive() {
            Ok(()) => {
                let _ = self.out.send(Delivery::EndOfEpoch);
            }
            Err(Stop::Fatal(err)) => {
                self.cancel.store(true, Ordering::SeqCst);
                tracing::error!(epoch = self.epoch, error = %err, "epoch aborted");
                let _ = self.out.send(Delivery::Fatal(err));
            }
            Err(Stop::Hangup) => {
                tracing::debug!(epoch = self.epoch, "assembler stopped early");
            }
        }
    }

    fn drive(&self) -> Result<(), Stop> {
        let total = self.descriptors.len();
        let mut reorder: BTreeMap<usize, SampleOutcome> = BTreeMap::new();
        let mut next = 0usize;
        let mut skipped = 0usize;
        let mut window = ShuffleWindow::for_epoch(self.window, self.seed, self.epoch);
        let mut batches = BatchAssembler::new(self.batch_size);

        while next < total {
            let (index, outcome) = match self.outcomes.recv() {
                Ok(item) => item,
                Err(_) if self.cancel.load(Ordering::SeqCst) => return Err(Stop::Hangup),
                Err(_) => return Err(Stop::Fatal(PipelineError::Disconnected)),
            };
            if self.cancel.load(Ordering::SeqCst) {
                return Err(Stop::Hangup);
            }
            reorder.insert(index, outcome);
            while let Some(outcome) = reorder.remove(&next) {
                let descriptor = &self.descriptors[next];
                next += 1;
                let _ = self.credits.try_send(());
                match outcome {
                    Ok(pair) => {
                        if let Some((identity, pair)) = window.push((descriptor.identity(), pair)) {
                            self.stack(&mut batches, identity, pair)?;
                        }
                    }
                    Err(err) => self.on_sample_error(descriptor, err, &mut skipped, total)?,
                }
            }
        }

        for (identity, pair) in window.drain() {
            self.stack(&mut batches, identity, pair)?;
        }
        if let Some(batch) = batches.finish(self.partial_batch) {
            self.deliver(batch)?;
        }
        Ok(())
    }

    fn on_sample_error(
        &self,
        descriptor: &SampleDescriptor,
        err: SampleError,
        skipped: &mut usize,
        total: usize,
    ) -> Result<(), Stop> {
        let sample = descriptor.identity();
        match self.skip_policy {
            SkipPolicy::Abort => Err(Stop::Fatal(PipelineError::SampleAborted {
                sample,
                source: err,
            })),
            SkipPolicy::Skip => {
                *skipped += 1;
                self.skipped.store(*skipped, Ordering::SeqCst);
                tracing::warn!(
                    epoch = self.epoch,
                    sample = %sample,
                    kind = err.kind(),
                    error = %err,
                    "skipping sample"
                );
                // The count only grows, so the final ratio already exceeds the bound.
                let ratio = *skipped as f64 / total as f64;
                if ratio > self.threshold {
                    return Err(Stop::Fatal(PipelineError::SkipRatioExceeded {
                        skipped: *skipped,
                        total,
                        ratio,
                        threshold: self.threshold,
                    }));
                }
                Ok(())
            }
        }
    }

    fn stack(
        &self,
        batches: &mut BatchAssembler,
        identity: String,
        pair: ImagePair,
    ) -> Result<(), Stop> {
        match batches.push(identity, pair) {
            Ok(Some(batch)) => self.deliver(batch),
            Ok(None) => Ok(()),
            Err(e) => Err(Stop::Fatal(e)),
        }
    }

    fn deliver(&self, batch: Batch) -> Result<(), Stop> {
        self.out
            .send(Delivery::Batch(batch))
            .map_err(|_| Stop::Hangup)
    }
}

/// Append-only JSONL batch trace. Disables itself after the first I/O error.
struct TraceSink {
    path: Option<PathBuf>,
    file: Option<File>,
}

impl TraceSink {
    fn new(path: Option<PathBuf>) -> Self {
        Self { path, file: None }
    }

    fn record(&mut self, record: serde_json::Value) {
        let Some(path) = &self.path else {
            return;
        };
        if self.file.is_none() {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => self.file = Some(f),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot open trace file");
                    self.path = None;
                    return;
                }
            }
        }
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(e) = writeln!(file, "{record}") {
            tracing::warn!(error = %e, "failed to write trace record");
            self.path = None;
            self.file = None;
        }
    }
}
