//! Bounded worker-pool map used by the streaming engine's offline
//! counterparts (batch conversion tools) and anything else that needs an
//! order-preserving parallel map.

use crate::guard::panic_message;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

/// A closure panicked while processing one item.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("worker fault on item {index}: {message}")]
pub struct WorkerFault {
    pub index: usize,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ItemError<E> {
    #[error("{0}")]
    Failed(E),
    #[error(transparent)]
    Fault(WorkerFault),
}

/// Apply `f` to every item on `worker_count` threads; results come back in
/// input order. A panic in `f` becomes that item's [`WorkerFault`].
pub fn map_parallel<T, R, F>(items: Vec<T>, worker_count: usize, f: F) -> Vec<Result<R, WorkerFault>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Send + Sync,
{
    run_tagged(items, worker_count, &f, None)
}

/// Like [`map_parallel`] for fallible closures.
pub fn try_map_parallel<T, R, E, F>(
    items: Vec<T>,
    worker_count: usize,
    f: F,
) -> Vec<Result<R, ItemError<E>>>
where
    T: Send,
    R: Send,
    E: Send,
    F: Fn(T) -> Result<R, E> + Send + Sync,
{
    run_tagged(items, worker_count, &f, None)
        .into_iter()
        .map(|res| match res {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(ItemError::Failed(e)),
            Err(fault) => Err(ItemError::Fault(fault)),
        })
        .collect()
}

/// [`map_parallel`] with a progress bar ticked per finished item.
pub fn map_parallel_with_progress<T, R, F>(
    label: &str,
    items: Vec<T>,
    worker_count: usize,
    f: F,
) -> Vec<Result<R, WorkerFault>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Send + Sync,
{
    let bar = progress_bar(label, items.len() as u64);
    let out = run_tagged(items, worker_count, &f, Some(&bar));
    bar.finish_and_clear();
    out
}

pub fn progress_bar(label: &str, len: u64) -> ProgressBar {
    let bar = ProgressBar::new(len);
    let style = ProgressStyle::with_template(
        "{prefix} [{elapsed_precise}] {wide_bar} {pos}/{len} ({eta})",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar.set_prefix(label.to_string());
    bar
}

fn run_tagged<T, R, F>(
    items: Vec<T>,
    worker_count: usize,
    f: &F,
    progress: Option<&ProgressBar>,
) -> Vec<Result<R, WorkerFault>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Send + Sync,
{
    let run = move || {
        let mut tagged: Vec<(usize, Result<R, WorkerFault>)> = items
            .into_par_iter()
            .enumerate()
            .map(|(index, item)| {
                let out = panic::catch_unwind(AssertUnwindSafe(|| f(item))).map_err(|payload| {
                    WorkerFault {
                        index,
                        message: panic_message(&*payload),
                    }
                });
                if let Some(bar) = progress {
                    bar.inc(1);
                }
                (index, out)
            })
            .collect();
        tagged.sort_by_key(|(index, _)| *index);
        tagged.into_iter().map(|(_, out)| out).collect::<Vec<_>>()
    };

    match rayon::ThreadPoolBuilder::new()
        .num_threads(worker_count.max(1))
        .thread_name(|i| format!("pair-map-{i}"))
        .build()
    {
        Ok(pool) => pool.install(run),
        Err(e) => {
            tracing::warn!(error = %e, "could not build worker pool; running on the caller's pool");
            run()
        }
    }
}
