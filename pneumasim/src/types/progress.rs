//! Progress reporting for long-running pneumatic operations.
//!
//! Operations accept an optional `&dyn ProgressSink`. A sink that fails
//! (for example because its receiver went away) never aborts the operation;
//! the failure is logged and the operation carries on.

use crate::tracing::prelude::*;
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Completion percentage of an operation, always within 0..=100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Progress {
    pub percent: u8,
}

impl Progress {
    pub const DONE: Progress = Progress { percent: 100 };

    /// Create a progress value, clamping anything above 100.
    pub fn new(percent: u32) -> Self {
        Self {
            percent: percent.min(100) as u8,
        }
    }

    /// Progress as the fraction `done / total`, clamped to 100.
    pub fn from_fraction(done: f64, total: f64) -> Self {
        if total <= 0.0 || done.is_nan() {
            return Self::DONE;
        }
        Self::new((done.max(0.0) / total * 100.0) as u32)
    }
}

/// The receiving side of a sink is gone.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("progress receiver closed")]
pub struct SinkClosed;

/// Receives progress updates.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: Progress) -> Result<(), SinkClosed>;
}

impl ProgressSink for watch::Sender<Progress> {
    fn report(&self, progress: Progress) -> Result<(), SinkClosed> {
        self.send(progress).map_err(|_| SinkClosed)
    }
}

impl ProgressSink for mpsc::UnboundedSender<Progress> {
    fn report(&self, progress: Progress) -> Result<(), SinkClosed> {
        self.send(progress).map_err(|_| SinkClosed)
    }
}

/// Adapts a closure into a sink.
pub struct FnSink<F>(pub F);

impl<F> ProgressSink for FnSink<F>
where
    F: Fn(Progress) + Send + Sync,
{
    fn report(&self, progress: Progress) -> Result<(), SinkClosed> {
        (self.0)(progress);
        Ok(())
    }
}

/// Forward `progress` to an optional sink, swallowing failures.
pub(crate) fn report(sink: Option<&dyn ProgressSink>, progress: Progress) {
    if let Some(sink) = sink {
        if let Err(e) = sink.report(progress) {
            debug!(percent = progress.percent, error = %e, "Progress update dropped");
        }
    }
}

/// Maps 0..=100 of a sub-step into a slice of the parent's range.
pub(crate) struct Scaled<'a> {
    inner: Option<&'a dyn ProgressSink>,
    from: u8,
    to: u8,
}

impl<'a> Scaled<'a> {
    pub(crate) fn new(inner: Option<&'a dyn ProgressSink>, from: u8, to: u8) -> Self {
        Self { inner, from, to }
    }
}

impl ProgressSink for Scaled<'_> {
    fn report(&self, progress: Progress) -> Result<(), SinkClosed> {
        let span = u32::from(self.to.saturating_sub(self.from));
        let scaled = u32::from(self.from) + span * u32::from(progress.percent) / 100;
        match self.inner {
            Some(inner) => inner.report(Progress::new(scaled)),
            None => Ok(()),
        }
    }
}

/// Drops updates that would move progress backwards.
pub(crate) struct Monotonic<'a> {
    inner: Option<&'a dyn ProgressSink>,
    high: AtomicU8,
}

impl<'a> Monotonic<'a> {
    pub(crate) fn new(inner: Option<&'a dyn ProgressSink>) -> Self {
        Self {
            inner,
            high: AtomicU8::new(0),
        }
    }
}

impl ProgressSink for Monotonic<'_> {
    fn report(&self, progress: Progress) -> Result<(), SinkClosed> {
        let high = self.high.fetch_max(progress.percent, Ordering::Relaxed);
        if progress.percent < high {
            return Ok(());
        }
        match self.inner {
            Some(inner) => inner.report(progress),
            None => Ok(()),
        }
    }
}
