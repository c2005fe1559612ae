//! Wall-clock guarded execution.
//!
//! The guarded closure runs on its own thread. On timeout the caller gets
//! [`GuardError::TimedOut`] immediately and the thread is abandoned: it may
//! still be running, it simply no longer blocks anyone.

use crate::types::GuardError;
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

pub fn run_with_timeout<T, F>(f: F, timeout: Duration) -> Result<T, GuardError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = bounded(1);
    thread::Builder::new()
        .name("pair-guard".to_string())
        .spawn(move || {
            let out = panic::catch_unwind(AssertUnwindSafe(f));
            let _ = tx.send(out);
        })
        .map_err(|e| GuardError::Spawn(e.to_string()))?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(payload)) => Err(GuardError::Panicked(panic_message(&*payload))),
        Err(RecvTimeoutError::Timeout) => Err(GuardError::TimedOut(timeout)),
        Err(RecvTimeoutError::Disconnected) => Err(GuardError::Panicked(
            "guarded thread exited without a result".to_string(),
        )),
    }
}

/// A timeout bound applied at call sites; `None` runs the closure inline.
#[derive(Debug, Clone, Copy, Default)]
pub struct Guard {
    timeout: Option<Duration>,
}

impl Guard {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    pub fn unbounded() -> Self {
        Self { timeout: None }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn run<T, F>(&self, f: F) -> Result<T, GuardError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        match self.timeout {
            Some(limit) => run_with_timeout(f, limit),
            None => panic::catch_unwind(AssertUnwindSafe(f))
                .map_err(|payload| GuardError::Panicked(panic_message(&*payload))),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn fast_call_returns_value() {
        let out = run_with_timeout(|| 21 * 2, Duration::from_secs(1)).unwrap();
        assert_eq!(out, 42);
    }

    #[test]
    fn slow_call_times_out_without_blocking() {
        let started = Instant::now();
        let err = run_with_timeout(
            || thread::sleep(Duration::from_secs(2)),
            Duration::from_millis(50),
        )
        .unwrap_err();
        assert!(matches!(err, GuardError::TimedOut(d) if d == Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn panic_is_reported() {
        let err = run_with_timeout(|| -> u8 { panic!("boom") }, Duration::from_secs(1)).unwrap_err();
        match err {
            GuardError::Panicked(msg) => assert!(msg.contains("boom")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unbounded_guard_runs_inline() {
        let guard = Guard::unbounded();
        assert_eq!(guard.run(|| "ok").unwrap(), "ok");
        assert!(guard.timeout().is_none());
    }
}
