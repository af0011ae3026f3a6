//! List serial ports that may carry a simulator.
//!
//! With `PNEUMASIM_DEMO=1` a demo discovery is run instead, followed by a
//! short operation sequence on each demo device.

use anyhow::{Context, Result};
use pneumasim::controller::MappingProfile;
use pneumasim::tracing::{self, prelude::*};
use pneumasim::transport::ports::select_candidates;
use pneumasim::transport::{NoDriver, PortEnumerator, SystemPorts};
use pneumasim::types::{FnSink, Progress};
use pneumasim::{Config, ControllerHandle, Registry, SetupKind};
use std::collections::HashSet;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_journald_or_stdout();

    let config = Config::from_env().context("reading PNEUMASIM_* environment")?;

    if !config.demo {
        let ports = SystemPorts.ports().context("enumerating serial ports")?;
        for port in &ports {
            debug!(name = %port.name, kind = ?port.kind, description = ?port.description, "Port");
        }
        let candidates = select_candidates(&ports, &HashSet::new());
        if candidates.is_empty() {
            info!("No candidate simulator ports.");
        }
        for name in candidates {
            println!("{}", name);
        }
        return Ok(());
    }

    let registry = Registry::new(Arc::new(NoDriver), Arc::new(SystemPorts), config);
    let devices = registry
        .discover(2, None, SetupKind::MultipleDevices, true)
        .await
        .context("discovery already running")?;

    for device in &devices {
        exercise(device).await?;
    }

    registry.shutdown().await;
    info!("Exiting.");
    Ok(())
}

async fn exercise(device: &ControllerHandle) -> Result<()> {
    let port = device.port_name().to_string();
    let sink = FnSink(move |p: Progress| debug!(port = %port, percent = p.percent, "Progress"));

    let outcome = device.apply_pressure(1, 120, Some(&sink)).await?;
    info!(
        port = %device.port_name(),
        target_mb = outcome.target_mb,
        realized_mb = outcome.realized_mb,
        "Pressurized"
    );

    device.evacuate_valves_by_time(&[1, 2, 3], -1.5, Some(&sink)).await?;
    device
        .prepare_for_pressure_mapping(MappingProfile::Standard, Some(&sink))
        .await?;

    let mb = device.current_pressure(1).await?;
    println!(
        "{} {} {} mb",
        device.port_name(),
        device.device_id().unwrap_or_default(),
        mb
    );
    Ok(())
}
