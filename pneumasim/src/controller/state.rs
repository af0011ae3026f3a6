//! Controller state machine.
//!
//! ```text
//! Disconnected --open--> Connecting --handshake ok--> Ready
//! Ready --begin--> Busy(kind) --done/timeout/abort--> Ready
//! Ready|Busy --link lost/disconnect--> Disconnected
//! ```
//!
//! All transitions happen under one lock owned by the controller. Entering
//! `Busy` hands out an [`OperationGuard`]; dropping the guard is the only
//! way back to `Ready` apart from an explicit abort, and whichever happens
//! first wins, so the busy flag is cleared exactly once.

use super::OperationError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Kind of operation occupying a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum OperationKind {
    ApplyPressure,
    ApplyToMultiple,
    Evacuate,
    EvacuateMultiple,
    QueryPressure,
    PrepareForMapping,
    LivenessProbe,
}

/// Externally visible device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Disconnected,
    Connecting,
    Ready,
    Busy(OperationKind),
}

impl DeviceState {
    /// Ready or Busy.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Ready | Self::Busy(_))
    }
}

/// In-flight operation bookkeeping.
#[derive(Debug)]
pub(crate) struct OperationRecord {
    pub(crate) id: u64,
    pub(crate) kind: OperationKind,
    /// Channel(s) addressed, for logging
    pub(crate) target: String,
    /// Requested value (millibar or milliseconds), if any
    pub(crate) value: Option<i64>,
    pub(crate) started: Instant,
    /// Deadline of the phase currently running
    pub(crate) deadline: Option<Instant>,
    pub(crate) progress: u8,
    pub(crate) cancel: CancellationToken,
}

#[derive(Debug)]
pub(crate) enum Phase {
    Disconnected,
    Connecting,
    Ready,
    Busy(OperationRecord),
}

/// Everything the controller's state lock protects.
#[derive(Debug)]
pub(crate) struct ControllerState {
    pub(crate) phase: Phase,
    pub(crate) device_id: Option<String>,
    pub(crate) firmware_version: Option<String>,
    pub(crate) firmware_outdated: bool,
    pub(crate) mapping_prepared: bool,
}

impl ControllerState {
    pub(crate) fn connecting() -> Self {
        Self {
            phase: Phase::Connecting,
            device_id: None,
            firmware_version: None,
            firmware_outdated: false,
            mapping_prepared: false,
        }
    }

    pub(crate) fn device_state(&self) -> DeviceState {
        match &self.phase {
            Phase::Disconnected => DeviceState::Disconnected,
            Phase::Connecting => DeviceState::Connecting,
            Phase::Ready => DeviceState::Ready,
            Phase::Busy(record) => DeviceState::Busy(record.kind),
        }
    }

    /// Leave `Busy` if operation `id` still owns the controller.
    ///
    /// Returns whether this call performed the transition.
    pub(crate) fn release(&mut self, id: u64) -> bool {
        match &self.phase {
            Phase::Busy(record) if record.id == id => {
                self.phase = Phase::Ready;
                true
            }
            _ => false,
        }
    }
}

/// State lock plus operation id allocation.
#[derive(Debug)]
pub(crate) struct StateCell {
    inner: Mutex<ControllerState>,
    next_id: AtomicU64,
}

impl StateCell {
    pub(crate) fn new(state: ControllerState) -> Self {
        Self {
            inner: Mutex::new(state),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, ControllerState> {
        self.inner.lock()
    }

    /// Claim the controller for one operation.
    ///
    /// Fails with `DeviceBusy` while another operation is in flight and with
    /// `DeviceNotConnected` unless the controller is `Ready`.
    pub(crate) fn begin(
        &self,
        kind: OperationKind,
        target: String,
        value: Option<i64>,
    ) -> Result<OperationGuard<'_>, OperationError> {
        let mut state = self.inner.lock();
        match state.phase {
            Phase::Ready => {}
            Phase::Busy(_) => return Err(OperationError::DeviceBusy),
            Phase::Disconnected | Phase::Connecting => {
                return Err(OperationError::DeviceNotConnected)
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let started = Instant::now();
        state.phase = Phase::Busy(OperationRecord {
            id,
            kind,
            target,
            value,
            started,
            deadline: None,
            progress: 0,
            cancel: cancel.clone(),
        });

        Ok(OperationGuard {
            cell: self,
            id,
            kind,
            started,
            cancel,
        })
    }
}

/// Exclusive claim on a controller for the duration of one operation.
pub(crate) struct OperationGuard<'a> {
    cell: &'a StateCell,
    id: u64,
    kind: OperationKind,
    started: Instant,
    cancel: CancellationToken,
}

impl OperationGuard<'_> {
    pub(crate) fn kind(&self) -> OperationKind {
        self.kind
    }

    pub(crate) fn started(&self) -> Instant {
        self.started
    }

    /// Fix the deadline of the phase about to run, measured from now.
    pub(crate) fn arm_deadline(&self, budget: Duration) -> Instant {
        let deadline = Instant::now() + budget;
        if let Phase::Busy(record) = &mut self.cell.lock().phase {
            if record.id == self.id {
                record.deadline = Some(deadline);
            }
        }
        deadline
    }

    pub(crate) fn record_progress(&self, percent: u8) {
        if let Phase::Busy(record) = &mut self.cell.lock().phase {
            if record.id == self.id {
                record.progress = percent;
            }
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.cell.lock().release(self.id);
    }
}
