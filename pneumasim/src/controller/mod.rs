//! Driving one physical simulator.
//!
//! A [`Controller`] owns the link to one device and serializes every
//! operation on it: a second call while one is in flight fails with
//! [`OperationError::DeviceBusy`] instead of queueing. Operations start a
//! device command and then poll it at a fixed interval until the device
//! reports completion, the link drops, or the operation's deadline passes.
//! An expired deadline always cancels the device command before returning,
//! because a command left running desynchronizes later operations from the
//! hardware.

pub mod calibration;
mod demo;
mod error;
mod state;

pub use calibration::MappingProfile;
pub use demo::DemoSimulator;
pub use error::{ConnectError, OperationError};
pub use state::{DeviceState, OperationKind};

use crate::config::{CalibrationConfig, Config, TimingConfig};
use crate::simulator::{OperationInfo, PressureOutcome, SetupKind, Simulator};
use crate::tracing::prelude::*;
use crate::transport::{ErrorCode, Link, LinkError, LinkSettings, PollState, Transport};
use crate::types::{
    self, ChannelSet, ChannelTarget, Monotonic, Progress, ProgressSink, Scaled,
};
use async_trait::async_trait;
use calibration::*;
use state::{ControllerState, OperationGuard, Phase, StateCell};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};

/// Upper bound on queued device errors drained after a failed poll.
const MAX_DRAINED_ERRORS: usize = 32;

/// Which command family a poll loop is waiting on.
#[derive(Debug, Clone, Copy)]
enum Command {
    SetPressure,
    InflateEvacuate,
    Measure,
}

/// Why a poll loop stopped before the command completed.
enum Interrupted {
    /// The deadline passed; the device command is still running.
    Expired,
    Failed(OperationError),
}

/// What a pressure command addresses.
#[derive(Debug, Clone, Copy)]
enum Valves<'a> {
    One(ChannelTarget),
    Set(&'a ChannelSet),
}

impl Valves<'_> {
    fn is_all(&self) -> bool {
        matches!(self, Valves::One(ChannelTarget::All))
    }
}

impl std::fmt::Display for Valves<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Valves::One(target) => write!(f, "{}", target),
            Valves::Set(set) => write!(f, "{}", set),
        }
    }
}

fn attached(link: &mut Option<Box<dyn Link>>) -> Result<&mut Box<dyn Link>, LinkError> {
    link.as_mut().ok_or(LinkError::NotConnected)
}

pub(crate) fn validate_pressure(target_mb: i32) -> Result<u8, OperationError> {
    if PRESSURE_RANGE_MB.contains(&target_mb) {
        Ok(target_mb as u8)
    } else {
        Err(OperationError::InvalidPressure(target_mb))
    }
}

/// Check single-valve evacuation arguments. Returns the base pressure to
/// prime with, or None when all valves are evacuated.
pub(crate) fn validate_evacuation(
    target: ChannelTarget,
    duration_ms: u32,
    base_pressure_mb: i32,
) -> Result<Option<u8>, OperationError> {
    let range = if target.is_all() {
        EVACUATION_ALL_MS_RANGE
    } else {
        EVACUATION_MS_RANGE
    };
    if !range.contains(&duration_ms) {
        return Err(OperationError::InvalidEvacuationTime(format!("{} ms", duration_ms)));
    }
    if target.is_all() {
        return Ok(None);
    }
    if !EVACUATION_BASE_RANGE_MB.contains(&base_pressure_mb) {
        return Err(OperationError::InvalidEvacuationBaseValue(base_pressure_mb));
    }
    Ok(Some(base_pressure_mb as u8))
}

/// Total time for a batched evacuation of `channels`.
pub(crate) fn batch_evacuation_time(
    channels: &ChannelSet,
    per_channel_seconds: f64,
) -> Result<Duration, OperationError> {
    if !BATCH_EVACUATION_SECONDS.contains(&per_channel_seconds) {
        return Err(OperationError::InvalidEvacuationTime(format!(
            "{} s",
            per_channel_seconds
        )));
    }
    let ms = per_channel_seconds.abs() * 1000.0 * channels.len() as f64 * BATCH_EVACUATION_FACTOR;
    Ok(Duration::from_millis(ms.round() as u64))
}

/// A connected simulator.
pub struct Controller {
    port: String,
    setup_kind: SetupKind,
    debug: bool,
    timing: TimingConfig,
    link: Mutex<Option<Box<dyn Link>>>,
    state: StateCell,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("port", &self.port)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Open `port` and perform one connection handshake.
    ///
    /// Never retries; retry policy belongs to the caller. Any failure closes
    /// the link before returning.
    pub async fn connect(
        transport: &dyn Transport,
        port: &str,
        setup_kind: SetupKind,
        debug: bool,
        config: &Config,
    ) -> Result<Self, ConnectError> {
        debug!(port = %port, "Opening simulator link");
        let wait = config.timing.open_timeout;
        let link = match time::timeout(wait, transport.open(port, &LinkSettings::default())).await {
            Err(_) => return Err(ConnectError::OpenTimeout(wait)),
            Ok(opened) => opened.map_err(ConnectError::Open)?,
        };

        let controller = Self {
            port: port.to_string(),
            setup_kind,
            debug,
            timing: config.timing.clone(),
            link: Mutex::new(Some(link)),
            state: StateCell::new(ControllerState::connecting()),
        };

        match controller.handshake(&config.calibration).await {
            Ok(()) => Ok(controller),
            Err(e) => {
                debug!(port = %port, error = %e, "Handshake failed");
                controller.close_link().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self, calibration: &CalibrationConfig) -> Result<(), ConnectError> {
        let wait = self.timing.identity_timeout;
        let serial = {
            let mut link = self.link.lock().await;
            let link = attached(&mut link).map_err(|_| ConnectError::NotConnected)?;
            match time::timeout(wait, link.query_serial_number(wait)).await {
                Err(_) => return Err(ConnectError::IdentityTimeout(wait)),
                Ok(Err(LinkError::NotConnected)) => return Err(ConnectError::NotConnected),
                Ok(Err(e)) => return Err(ConnectError::Identity(e)),
                Ok(Ok(serial)) => serial.trim().to_string(),
            }
        };
        if serial.is_empty() {
            return Err(ConnectError::NoIdentity);
        }

        self.calibrate(calibration)
            .await
            .map_err(ConnectError::Calibration)?;

        let firmware = {
            let mut link = self.link.lock().await;
            match attached(&mut link) {
                Ok(link) => link.firmware_version().await,
                Err(e) => Err(e),
            }
        };
        let (firmware, outdated) = match firmware {
            Ok(version) => {
                let version = version.trim().to_string();
                let outdated = version != calibration.expected_firmware;
                (Some(version), outdated)
            }
            Err(e) => {
                warn!(port = %self.port, error = %e, "Could not read firmware version");
                (None, true)
            }
        };
        if outdated {
            warn!(
                port = %self.port,
                serial = %serial,
                firmware = ?firmware,
                expected = %calibration.expected_firmware,
                "Outdated firmware; multi-valve pumping may be unreliable"
            );
        }

        info!(
            port = %self.port,
            serial = %serial,
            firmware = ?firmware,
            "Simulator connected."
        );

        let mut state = self.state.lock();
        state.device_id = Some(serial);
        state.firmware_version = firmware;
        state.firmware_outdated = outdated;
        state.phase = Phase::Ready;
        Ok(())
    }

    /// Bring stored maxima and regulation parameters to known values.
    async fn calibrate(&self, calibration: &CalibrationConfig) -> Result<(), LinkError> {
        let mut link = self.link.lock().await;
        let link = attached(&mut link)?;

        let maxima = link.pressure_maxima().await?;
        if maxima != calibration.pressure_maxima {
            debug!(
                port = %self.port,
                stored = ?maxima,
                target = ?calibration.pressure_maxima,
                "Correcting pressure maxima"
            );
            link.set_pressure_maxima(&calibration.pressure_maxima).await?;
        }
        link.set_regulation(&calibration.regulation()).await
    }

    pub fn port_name(&self) -> &str {
        &self.port
    }

    pub fn setup_kind(&self) -> SetupKind {
        self.setup_kind
    }

    pub fn state(&self) -> DeviceState {
        self.state.lock().device_state()
    }

    pub fn firmware_version(&self) -> Option<String> {
        self.state.lock().firmware_version.clone()
    }

    /// Take the link out and close it.
    async fn close_link(&self) {
        let link = self.link.lock().await.take();
        if let Some(mut link) = link {
            link.close().await;
        }
    }

    /// The transport reported the device gone.
    async fn handle_link_loss(&self) {
        let was_connected = {
            let mut state = self.state.lock();
            let was = state.device_state().is_connected();
            if let Phase::Busy(record) = &state.phase {
                record.cancel.cancel();
            }
            state.phase = Phase::Disconnected;
            was
        };
        if was_connected {
            warn!(port = %self.port, "Simulator link lost");
        }
        self.close_link().await;
    }

    /// Translate a transport failure seen mid-operation.
    async fn classify(&self, e: LinkError) -> OperationError {
        match e {
            LinkError::NotConnected => {
                self.handle_link_loss().await;
                OperationError::DeviceNotConnected
            }
            other => {
                let codes = self.drain_device_errors().await;
                if codes.is_empty() {
                    OperationError::Unhandled(other)
                } else {
                    warn!(
                        port = %self.port,
                        error = %other,
                        codes = ?codes,
                        "Device reported errors"
                    );
                    OperationError::DeviceFault { codes }
                }
            }
        }
    }

    async fn drain_device_errors(&self) -> Vec<ErrorCode> {
        let mut link = self.link.lock().await;
        let Ok(link) = attached(&mut link) else {
            return Vec::new();
        };
        let mut codes = Vec::new();
        while codes.len() < MAX_DRAINED_ERRORS {
            match link.pop_next_error().await {
                Some(code) => codes.push(code),
                None => break,
            }
        }
        codes
    }

    /// Error for an operation whose token was cancelled: an abort, or a
    /// disconnect that happened underneath it.
    fn cancelled_error(&self) -> OperationError {
        if self.state().is_connected() {
            OperationError::Aborted
        } else {
            OperationError::DeviceNotConnected
        }
    }

    /// Cancel the device command after a deadline expired.
    async fn cancel_expired(&self, op: &OperationGuard<'_>) -> OperationError {
        let after = op.started().elapsed();
        warn!(
            port = %self.port,
            operation = %op.kind(),
            elapsed_ms = after.as_millis() as u64,
            "Operation deadline expired, cancelling device command"
        );
        let result = {
            let mut link = self.link.lock().await;
            match attached(&mut link) {
                Ok(link) => link.cancel_active_command().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = result {
            debug!(port = %self.port, error = %e, "Cancel after timeout failed");
        }
        OperationError::OperationTimeout {
            kind: op.kind(),
            after,
        }
    }

    async fn poll_once(&self, command: Command) -> Result<PollState, LinkError> {
        let mut link = self.link.lock().await;
        let link = attached(&mut link)?;
        match command {
            Command::SetPressure => link.poll_set_pressure().await,
            Command::Measure => link.poll_measure_pressure().await,
            Command::InflateEvacuate => link
                .poll_inflate_evacuate()
                .await
                .map(|done| PollState { done, current_mb: 0 }),
        }
    }

    /// Poll `command` until it completes, fails, is aborted, or `deadline`
    /// passes.
    ///
    /// Never talks to the device about an expired deadline; callers issue
    /// the cancel. `progress` maps each poll result to a percentage,
    /// reported every `progress_every` polls.
    async fn poll_loop(
        &self,
        op: &OperationGuard<'_>,
        command: Command,
        deadline: Instant,
        sink: Option<&dyn ProgressSink>,
        mut progress: impl FnMut(&PollState) -> Progress + Send,
    ) -> Result<PollState, Interrupted> {
        let every = self.timing.progress_every.max(1);
        let mut polls: u32 = 0;

        loop {
            if op.is_cancelled() {
                return Err(Interrupted::Failed(self.cancelled_error()));
            }
            if Instant::now() >= deadline {
                return Err(Interrupted::Expired);
            }

            let poll = match self.poll_once(command).await {
                Ok(poll) => poll,
                Err(e) => return Err(Interrupted::Failed(self.classify(e).await)),
            };
            // An abort may have landed while the poll waited for the link.
            if op.is_cancelled() {
                return Err(Interrupted::Failed(self.cancelled_error()));
            }
            polls += 1;
            if self.debug {
                debug!(
                    port = %self.port,
                    ?command,
                    polls,
                    current_mb = poll.current_mb,
                    done = poll.done,
                    "Poll"
                );
            } else {
                trace!(
                    port = %self.port,
                    ?command,
                    polls,
                    current_mb = poll.current_mb,
                    done = poll.done,
                    "Poll"
                );
            }

            if poll.done {
                op.record_progress(100);
                types::report(sink, Progress::DONE);
                return Ok(poll);
            }
            if polls % every == 0 {
                let p = progress(&poll);
                op.record_progress(p.percent);
                types::report(sink, p);
            }

            let wake = (Instant::now() + self.timing.poll_interval).min(deadline);
            tokio::select! {
                _ = time::sleep_until(wake) => {}
                _ = op.cancelled() => return Err(Interrupted::Failed(self.cancelled_error())),
            }
        }
    }

    /// [`Controller::poll_loop`], cancelling the device command once if the
    /// deadline passes.
    async fn poll_until_done(
        &self,
        op: &OperationGuard<'_>,
        command: Command,
        deadline: Instant,
        sink: Option<&dyn ProgressSink>,
        progress: impl FnMut(&PollState) -> Progress + Send,
    ) -> Result<PollState, OperationError> {
        match self.poll_loop(op, command, deadline, sink, progress).await {
            Ok(poll) => Ok(poll),
            Err(Interrupted::Failed(e)) => Err(e),
            Err(Interrupted::Expired) => Err(self.cancel_expired(op).await),
        }
    }

    /// Drive `valves` to `target_mb` under the current operation.
    async fn pressurize(
        &self,
        op: &OperationGuard<'_>,
        valves: Valves<'_>,
        target_mb: u8,
        sink: Option<&dyn ProgressSink>,
    ) -> Result<PressureOutcome, OperationError> {
        let budget = if valves.is_all() {
            self.timing.apply_timeout * self.timing.all_channels_factor
        } else {
            self.timing.apply_timeout
        };
        let deadline = op.arm_deadline(budget);

        let started = {
            let mut link = self.link.lock().await;
            if op.is_cancelled() {
                return Err(self.cancelled_error());
            }
            match attached(&mut link) {
                Ok(link) => match valves {
                    Valves::One(target) => link.start_set_pressure(target, target_mb).await,
                    Valves::Set(set) => link.start_set_pressure_multi(set, target_mb).await,
                },
                Err(e) => Err(e),
            }
        };
        if let Err(e) = started {
            return Err(self.classify(e).await);
        }
        debug!(port = %self.port, valves = %valves, target_mb, "Pressurizing");

        let target = f64::from(target_mb);
        let mut baseline: Option<f64> = None;
        let poll = self
            .poll_until_done(op, Command::SetPressure, deadline, sink, |poll| {
                let current = f64::from(poll.current_mb);
                let start = *baseline.get_or_insert(current);
                let span = (target - start).abs();
                // Cap below 100 until the device says it is done.
                let fraction = Progress::from_fraction((current - start).abs(), span);
                Progress::new(fraction.percent.min(99).into())
            })
            .await?;

        let outcome = PressureOutcome::new(i32::from(target_mb), poll.current_mb);
        if let Some(deviation) = outcome.deviation_mb() {
            warn!(
                port = %self.port,
                valves = %valves,
                target_mb,
                realized_mb = poll.current_mb,
                deviation,
                "Realized pressure outside tolerance"
            );
        }
        Ok(outcome)
    }

    /// Evacuate for `duration` under the current operation.
    async fn evacuate(
        &self,
        op: &OperationGuard<'_>,
        valves: Valves<'_>,
        duration: Duration,
        sink: Option<&dyn ProgressSink>,
    ) -> Result<(), OperationError> {
        let deadline = op.arm_deadline(duration + self.timing.evacuate_margin);

        let started = {
            let mut link = self.link.lock().await;
            if op.is_cancelled() {
                return Err(self.cancelled_error());
            }
            match attached(&mut link) {
                Ok(link) => match valves {
                    Valves::One(target) => {
                        link.start_inflate_evacuate(target, EVACUATION_SPEED, duration, false)
                            .await
                    }
                    Valves::Set(set) => {
                        link.start_inflate_evacuate_multi(set, EVACUATION_SPEED, duration, false)
                            .await
                    }
                },
                Err(e) => Err(e),
            }
        };
        if let Err(e) = started {
            return Err(self.classify(e).await);
        }
        debug!(
            port = %self.port,
            valves = %valves,
            duration_ms = duration.as_millis() as u64,
            "Evacuating"
        );

        let phase_start = Instant::now();
        let total = duration.as_secs_f64();
        let polling = self.poll_loop(op, Command::InflateEvacuate, deadline, sink, |_| {
            Progress::from_fraction(phase_start.elapsed().as_secs_f64(), total)
        });

        // The device's own completion report is not trusted to bound the
        // operation, so a hung poll is cut off at the deadline too. Either
        // way the cancel is issued here, outside the raced future.
        match time::timeout_at(deadline, polling).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(Interrupted::Failed(e))) => Err(e),
            Ok(Err(Interrupted::Expired)) | Err(_) => Err(self.cancel_expired(op).await),
        }
    }
}

#[async_trait]
impl Simulator for Controller {
    fn port_name(&self) -> &str {
        &self.port
    }

    fn device_id(&self) -> Option<String> {
        let state = self.state.lock();
        if state.device_state().is_connected() {
            state.device_id.clone()
        } else {
            None
        }
    }

    fn state(&self) -> DeviceState {
        Controller::state(self)
    }

    fn firmware_outdated(&self) -> bool {
        self.state.lock().firmware_outdated
    }

    fn current_operation(&self) -> Option<OperationInfo> {
        match &self.state.lock().phase {
            Phase::Busy(record) => Some(OperationInfo {
                kind: record.kind,
                target: record.target.clone(),
                value: record.value,
                elapsed: record.started.elapsed(),
                remaining: record
                    .deadline
                    .map(|d| d.saturating_duration_since(Instant::now())),
                progress: Progress::new(record.progress.into()),
            }),
            _ => None,
        }
    }

    async fn apply_pressure(
        &self,
        channel: u8,
        target_mb: i32,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<PressureOutcome, OperationError> {
        let mb = validate_pressure(target_mb)?;
        let target = ChannelTarget::from_raw(channel)?;
        let op = self.state.begin(
            OperationKind::ApplyPressure,
            target.to_string(),
            Some(target_mb.into()),
        )?;
        self.pressurize(&op, Valves::One(target), mb, progress).await
    }

    async fn apply_pressure_to_valves(
        &self,
        channels: &[u8],
        target_mb: i32,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<PressureOutcome, OperationError> {
        let mb = validate_pressure(target_mb)?;
        let set = ChannelSet::new(channels)?;
        let op = self.state.begin(
            OperationKind::ApplyToMultiple,
            set.to_string(),
            Some(target_mb.into()),
        )?;
        self.pressurize(&op, Valves::Set(&set), mb, progress).await
    }

    async fn evacuate_valve_by_time(
        &self,
        channel: u8,
        duration_ms: u32,
        base_pressure_mb: i32,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<(), OperationError> {
        let target = ChannelTarget::from_raw(channel)?;
        let base = validate_evacuation(target, duration_ms, base_pressure_mb)?;
        let op = self.state.begin(
            OperationKind::Evacuate,
            target.to_string(),
            Some(duration_ms.into()),
        )?;

        // Equalize to a common positive baseline first so evacuated
        // pressures are comparable across valves.
        if let Some(base) = base {
            self.pressurize(&op, Valves::One(target), base, None)
                .await
                .map_err(|e| OperationError::Priming(Box::new(e)))?;
        }

        let duration = Duration::from_millis(duration_ms.into());
        self.evacuate(&op, Valves::One(target), duration, progress).await
    }

    async fn evacuate_valves_by_time(
        &self,
        channels: &[u8],
        per_channel_seconds: f64,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<(), OperationError> {
        let set = ChannelSet::new(channels)?;
        let duration = batch_evacuation_time(&set, per_channel_seconds)?;
        if duration < MIN_BATCH_EVACUATION {
            debug!(port = %self.port, valves = %set, "Evacuation too short, skipping");
            return Ok(());
        }
        let op = self.state.begin(
            OperationKind::EvacuateMultiple,
            set.to_string(),
            Some(duration.as_millis() as i64),
        )?;
        self.evacuate(&op, Valves::Set(&set), duration, progress).await
    }

    async fn current_pressure(&self, channel: u8) -> Result<i32, OperationError> {
        let ChannelTarget::Single(channel) = ChannelTarget::from_raw(channel)? else {
            return Err(crate::types::ChannelError::OutOfRange(channel).into());
        };
        let op = self
            .state
            .begin(OperationKind::QueryPressure, channel.to_string(), None)?;
        let deadline = op.arm_deadline(self.timing.measure_timeout);

        let started = {
            let mut link = self.link.lock().await;
            if op.is_cancelled() {
                return Err(self.cancelled_error());
            }
            match attached(&mut link) {
                Ok(link) => link.start_measure_pressure(channel).await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = started {
            return Err(self.classify(e).await);
        }

        let poll = self
            .poll_until_done(&op, Command::Measure, deadline, None, |_| Progress::default())
            .await?;
        Ok(poll.current_mb)
    }

    async fn prepare_for_pressure_mapping(
        &self,
        profile: MappingProfile,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<(), OperationError> {
        let op = self
            .state
            .begin(OperationKind::PrepareForMapping, profile.to_string(), None)?;
        self.state.lock().mapping_prepared = false;
        info!(port = %self.port, profile = %profile, "Preparing for pressure mapping");

        let pump_mb = profile.calibration_pressure_mb();
        // A repeated pump restarts its sub-range; never let the sink see
        // progress go backwards.
        let steady = Monotonic::new(progress);
        let pumping = Scaled::new(Some(&steady), 0, 50);
        let pump_start = Instant::now();
        self.pressurize(&op, Valves::One(ChannelTarget::All), pump_mb, Some(&pumping))
            .await?;

        let pump_time = pump_start.elapsed();
        if pump_time < MIN_CALIBRATION_PUMP_TIME {
            info!(
                port = %self.port,
                pump_ms = pump_time.as_millis() as u64,
                "Calibration pump finished suspiciously fast, pumping again"
            );
            self.pressurize(&op, Valves::One(ChannelTarget::All), pump_mb, Some(&pumping))
                .await?;
        }

        let evacuating = Scaled::new(Some(&steady), 50, 100);
        self.evacuate(
            &op,
            Valves::One(ChannelTarget::All),
            profile.evacuation_time(),
            Some(&evacuating),
        )
        .await?;

        self.state.lock().mapping_prepared = true;
        info!(port = %self.port, "Ready for pressure mapping");
        Ok(())
    }

    fn take_mapping_prepared(&self) -> bool {
        std::mem::take(&mut self.state.lock().mapping_prepared)
    }

    async fn abort_current_operation(&self) -> Result<(), OperationError> {
        let operation = {
            let state = self.state.lock();
            match &state.phase {
                Phase::Busy(record) => Some((record.id, record.kind, record.cancel.clone())),
                _ => None,
            }
        };
        let Some((id, kind, cancel)) = operation else {
            return Ok(());
        };

        info!(port = %self.port, operation = %kind, "Aborting operation");
        cancel.cancel();
        let result = {
            let mut link = self.link.lock().await;
            match attached(&mut link) {
                Ok(link) => link.cancel_active_command().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = result {
            warn!(port = %self.port, error = %e, "Device cancel failed during abort");
        }
        self.state.lock().release(id);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), OperationError> {
        let was_connected = {
            let mut state = self.state.lock();
            let was = state.device_state().is_connected();
            if let Phase::Busy(record) = &state.phase {
                record.cancel.cancel();
            }
            state.phase = Phase::Disconnected;
            was
        };
        self.close_link().await;
        if was_connected {
            info!(port = %self.port, "Simulator disconnected");
        }
        Ok(())
    }

    async fn probe_liveness(&self, timeout: Duration) -> bool {
        let op = match self
            .state
            .begin(OperationKind::LivenessProbe, String::new(), None)
        {
            Ok(op) => op,
            // Busy devices are talking to us; assume alive.
            Err(OperationError::DeviceBusy) => return true,
            Err(_) => return false,
        };

        let reply = {
            let mut link = self.link.lock().await;
            match attached(&mut link) {
                Ok(link) => time::timeout(timeout, link.query_serial_number(timeout))
                    .await
                    .unwrap_or(Err(LinkError::Timeout)),
                Err(e) => Err(e),
            }
        };
        drop(op);

        match reply {
            Ok(serial) if !serial.trim().is_empty() => self.state().is_connected(),
            Ok(_) => false,
            Err(LinkError::NotConnected) => {
                self.handle_link_loss().await;
                false
            }
            Err(e) => {
                debug!(port = %self.port, error = %e, "Liveness probe failed");
                false
            }
        }
    }
}
