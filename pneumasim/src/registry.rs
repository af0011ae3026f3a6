//! Discovery and bookkeeping of connected simulators.
//!
//! The [`Registry`] owns the live set: at most one controller per port, each
//! one connected. A discovery pass probes candidate ports concurrently under
//! one deadline, merges what answered, and drops controllers whose device has
//! gone away. Only one pass runs at a time; a second caller gets `None`
//! immediately instead of waiting.
//!
//! Connection attempts run as tracked tasks. An attempt that finishes after
//! the pass gave up can no longer hand its controller over, so it
//! disconnects it itself.

use crate::config::Config;
use crate::controller::DemoSimulator;
use crate::simulator::{self, ControllerHandle, SetupKind};
use crate::tracing::prelude::*;
use crate::transport::ports::{normalize_port_name, select_candidates};
use crate::transport::{PortEnumerator, Transport};
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::{hash_map::Entry, HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{self, Instant};
use tokio_util::task::TaskTracker;

/// Ports to try before enumerating, remembered from an earlier session.
///
/// Written as one port name or several separated by `|`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuickConnectSpec {
    ports: Vec<String>,
}

impl QuickConnectSpec {
    pub fn ports(&self) -> &[String] {
        &self.ports
    }

    /// Ports to use for `setup_kind`. Single-device setups only use the
    /// first one.
    fn ports_for(&self, setup_kind: SetupKind) -> &[String] {
        match setup_kind {
            SetupKind::OneDevice => &self.ports[..self.ports.len().min(1)],
            SetupKind::MultipleDevices => &self.ports,
        }
    }
}

impl FromStr for QuickConnectSpec {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ports: Vec<String> = Vec::new();
        for name in s.split('|').map(str::trim).filter(|name| !name.is_empty()) {
            let port = normalize_port_name(name).ok_or_else(|| {
                crate::error::Error::Config(format!("invalid quick-connect port {:?}", name))
            })?;
            if !ports.contains(&port) {
                ports.push(port);
            }
        }
        if ports.is_empty() {
            return Err(crate::error::Error::Config(
                "empty quick-connect hint".to_string(),
            ));
        }
        Ok(Self { ports })
    }
}

/// Marks a discovery pass as running until dropped.
struct DiscoveryPass<'a>(&'a AtomicBool);

impl<'a> DiscoveryPass<'a> {
    fn begin(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DiscoveryPass<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The set of connected simulators.
pub struct Registry {
    transport: Arc<dyn Transport>,
    ports: Arc<dyn PortEnumerator>,
    config: Config,
    live: RwLock<HashMap<String, ControllerHandle>>,
    discovering: AtomicBool,
    tracker: TaskTracker,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ports: Vec<String> = self.live.read().keys().cloned().collect();
        ports.sort();
        f.debug_struct("Registry")
            .field("live", &ports)
            .field("discovering", &self.discovering.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new(
        transport: Arc<dyn Transport>,
        ports: Arc<dyn PortEnumerator>,
        config: Config,
    ) -> Self {
        Self {
            transport,
            ports,
            config,
            live: RwLock::new(HashMap::new()),
            discovering: AtomicBool::new(false),
            tracker: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Find simulators and return every connected one.
    ///
    /// Quick-connect ports are tried first; enumeration is skipped when
    /// they already yield `required_count` devices, otherwise discovery
    /// falls through to a full scan. Per-port failures are logged and
    /// skipped. Returns `None` without waiting when another pass is
    /// running.
    pub async fn discover(
        &self,
        required_count: usize,
        quick_connect: Option<&QuickConnectSpec>,
        setup_kind: SetupKind,
        debug: bool,
    ) -> Option<Vec<ControllerHandle>> {
        let Some(_pass) = DiscoveryPass::begin(&self.discovering) else {
            debug!("Discovery already running");
            return None;
        };

        if self.config.demo {
            return Some(self.discover_demo(required_count));
        }

        self.prune_lost().await;
        let deadline = Instant::now() + self.config.discovery.timeout;

        if let Some(spec) = quick_connect {
            let ports = self.not_live(spec.ports_for(setup_kind).iter().cloned());
            debug!(ports = ?ports, "Trying quick-connect ports");
            self.connect_ports(ports, setup_kind, debug, deadline).await;
            let found = self.live.read().len();
            if found >= required_count {
                return Some(self.connected_devices());
            }
            debug!(found, required_count, "Quick connect incomplete, enumerating ports");
        }

        let listed = match self.ports.ports() {
            Ok(listed) => listed,
            Err(e) => {
                warn!(error = %e, "Port enumeration failed");
                Vec::new()
            }
        };
        let live: HashSet<String> = self.live.read().keys().cloned().collect();
        let candidates = select_candidates(&listed, &live);
        debug!(candidates = ?candidates, "Probing candidate ports");
        self.connect_ports(candidates, setup_kind, debug, deadline)
            .await;

        let visible: HashSet<String> = listed
            .iter()
            .filter_map(|port| normalize_port_name(&port.name))
            .collect();
        self.probe_missing(&visible).await;
        self.prune_lost().await;

        let devices = self.connected_devices();
        if devices.len() < required_count {
            info!(
                found = devices.len(),
                required_count, "Fewer simulators than required"
            );
        }
        Some(devices)
    }

    /// Connected simulators, ordered by port.
    pub fn connected_devices(&self) -> Vec<ControllerHandle> {
        let mut devices: Vec<ControllerHandle> = self
            .live
            .read()
            .values()
            .filter(|handle| handle.is_connected())
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.port_name().cmp(b.port_name()));
        devices
    }

    /// Disconnect every simulator and forget them.
    pub async fn disconnect_all(&self) {
        let handles: Vec<ControllerHandle> = std::mem::take(&mut *self.live.write())
            .into_values()
            .collect();
        join_all(handles.iter().map(|handle| async move {
            if let Err(e) = handle.disconnect().await {
                warn!(port = %handle.port_name(), error = %e, "Disconnect failed");
            }
        }))
        .await;
    }

    /// Disconnect everything and wait for abandoned connection attempts to
    /// clean up after themselves.
    pub async fn shutdown(&self) {
        self.disconnect_all().await;
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
        debug!("Registry shut down");
    }

    fn discover_demo(&self, required_count: usize) -> Vec<ControllerHandle> {
        {
            let mut live = self.live.write();
            live.retain(|_, handle| handle.is_connected());
            for n in 1..=required_count {
                let port = format!("DEMO{}", n);
                live.entry(port)
                    .or_insert_with_key(|port| Arc::new(DemoSimulator::new(port)));
            }
        }
        info!(count = required_count, "Demo simulators ready");
        self.connected_devices()
    }

    fn not_live(&self, ports: impl Iterator<Item = String>) -> Vec<String> {
        let live = self.live.read();
        ports.filter(|port| !live.contains_key(port)).collect()
    }

    /// Attempt a connection on each port concurrently and adopt every
    /// controller handed over before `deadline`.
    async fn connect_ports(
        &self,
        ports: Vec<String>,
        setup_kind: SetupKind,
        debug: bool,
        deadline: Instant,
    ) {
        if ports.is_empty() {
            return;
        }

        let (tx, mut rx) = mpsc::channel::<ControllerHandle>(ports.len());
        let permits = Arc::new(Semaphore::new(
            self.config.discovery.max_parallel_probes.max(1),
        ));

        for port in ports {
            let tx = tx.clone();
            let permits = permits.clone();
            let transport = self.transport.clone();
            let config = self.config.clone();
            self.tracker.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                if tx.is_closed() {
                    return;
                }
                let attempt = simulator::connect(
                    transport.as_ref(),
                    &port,
                    setup_kind,
                    false,
                    debug,
                    &config,
                );
                match attempt.await {
                    Ok(handle) => {
                        if let Err(mpsc::error::SendError(handle)) = tx.send(handle).await {
                            debug!(port = %port, "Discovery gave up on port, closing connection");
                            if let Err(e) = handle.disconnect().await {
                                debug!(port = %port, error = %e, "Late disconnect failed");
                            }
                        }
                    }
                    Err(e) => {
                        debug!(port = %port, error = %e, "No simulator on port");
                    }
                }
            });
        }
        drop(tx);

        loop {
            match time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(handle)) => self.adopt(handle).await,
                Ok(None) => break,
                Err(_) => {
                    warn!("Discovery deadline passed, abandoning outstanding ports");
                    break;
                }
            }
        }

        // Anything already queued made it in time.
        rx.close();
        while let Ok(handle) = rx.try_recv() {
            self.adopt(handle).await;
        }
    }

    async fn adopt(&self, handle: ControllerHandle) {
        let duplicate = {
            let mut live = self.live.write();
            match live.entry(handle.port_name().to_string()) {
                Entry::Vacant(slot) => {
                    info!(
                        port = %handle.port_name(),
                        serial = ?handle.device_id(),
                        "Simulator added"
                    );
                    slot.insert(handle);
                    None
                }
                Entry::Occupied(_) => Some(handle),
            }
        };
        if let Some(handle) = duplicate {
            debug!(port = %handle.port_name(), "Port already live, closing duplicate");
            let _ = handle.disconnect().await;
        }
    }

    /// Probe live simulators whose port vanished from the listing and drop
    /// the ones that no longer answer.
    async fn probe_missing(&self, visible: &HashSet<String>) {
        let missing: Vec<ControllerHandle> = self
            .live
            .read()
            .values()
            .filter(|handle| !visible.contains(handle.port_name()))
            .cloned()
            .collect();
        if missing.is_empty() {
            return;
        }

        let timeout = self.config.discovery.liveness_timeout;
        let results = join_all(missing.into_iter().map(|handle| async move {
            let alive = time::timeout(timeout, handle.probe_liveness(timeout))
                .await
                .unwrap_or(false);
            (handle, alive)
        }))
        .await;

        for (handle, alive) in results {
            if !alive {
                info!(port = %handle.port_name(), "Simulator no longer answers");
                self.remove(&handle).await;
            }
        }
    }

    /// Drop controllers whose link was lost.
    async fn prune_lost(&self) {
        let lost: Vec<ControllerHandle> = {
            let mut live = self.live.write();
            let ports: Vec<String> = live
                .iter()
                .filter(|(_, handle)| !handle.is_connected())
                .map(|(port, _)| port.clone())
                .collect();
            ports.iter().filter_map(|port| live.remove(port)).collect()
        };
        for handle in lost {
            info!(port = %handle.port_name(), "Removing disconnected simulator");
            let _ = handle.disconnect().await;
        }
    }

    async fn remove(&self, handle: &ControllerHandle) {
        let removed = {
            let mut live = self.live.write();
            let port = handle.port_name();
            if live.get(port).is_some_and(|current| Arc::ptr_eq(current, handle)) {
                live.remove(port)
            } else {
                None
            }
        };
        if let Some(handle) = removed {
            let _ = handle.disconnect().await;
        }
    }
}
