//! Serial port enumeration and candidate filtering.
//!
//! Simulators show up as USB CDC or Bluetooth SPP virtual COM ports next to
//! whatever else is plugged into the machine. Enumeration results are
//! filtered down to ports with USB or Bluetooth markers, and port names are
//! normalized because some platforms hand back malformed names (trailing
//! NULs, device-namespace prefixes, friendly names with the COM number in
//! parentheses).

use super::LinkError;
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;
use tokio_serial::SerialPortType;

static STRICT_COM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^COM[1-9][0-9]*$").expect("valid regex"));

static EMBEDDED_COM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)COM0*([1-9][0-9]{0,2})").expect("valid regex"));

const BLUETOOTH_MARKERS: &[&str] = &["bluetooth", "bthenum", "rfcomm"];
const USB_MARKERS: &[&str] = &["usb"];

/// Bus a port is attached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Usb,
    Bluetooth,
    Pci,
    Unknown,
}

/// One enumerated serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    /// Name as reported by the platform, possibly malformed.
    pub name: String,
    pub kind: PortKind,
    /// Vendor/class text (manufacturer, product, friendly name).
    pub description: Option<String>,
}

impl PortDescriptor {
    pub fn new(name: impl Into<String>, kind: PortKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Whether this port carries a USB or Bluetooth marker.
    pub fn is_candidate(&self) -> bool {
        if matches!(self.kind, PortKind::Usb | PortKind::Bluetooth) {
            return true;
        }
        let haystack = format!(
            "{} {}",
            self.name,
            self.description.as_deref().unwrap_or_default()
        )
        .to_lowercase();
        USB_MARKERS
            .iter()
            .chain(BLUETOOTH_MARKERS)
            .any(|marker| haystack.contains(marker))
    }
}

/// Source of serial port listings.
pub trait PortEnumerator: Send + Sync {
    fn ports(&self) -> Result<Vec<PortDescriptor>, LinkError>;
}

/// Enumerates the ports of the running system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl PortEnumerator for SystemPorts {
    fn ports(&self) -> Result<Vec<PortDescriptor>, LinkError> {
        let ports = tokio_serial::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|info| match info.port_type {
                SerialPortType::UsbPort(usb) => {
                    let text: Vec<String> = [usb.manufacturer, usb.product]
                        .into_iter()
                        .flatten()
                        .collect();
                    let descriptor = PortDescriptor::new(info.port_name, PortKind::Usb);
                    if text.is_empty() {
                        descriptor
                    } else {
                        descriptor.with_description(text.join(" "))
                    }
                }
                SerialPortType::BluetoothPort => {
                    PortDescriptor::new(info.port_name, PortKind::Bluetooth)
                }
                SerialPortType::PciPort => PortDescriptor::new(info.port_name, PortKind::Pci),
                SerialPortType::Unknown => PortDescriptor::new(info.port_name, PortKind::Unknown),
            })
            .collect())
    }
}

/// Normalize a platform port name.
///
/// Strict `COM<n>` names pass through. Anything else containing a COM number
/// (`\\.\COM12`, `COM3\0`, `Serial (COM04)`) is corrected to `COM<n>`. Unix
/// device paths are kept as-is. Everything else is dropped.
pub fn normalize_port_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if STRICT_COM.is_match(trimmed) {
        return Some(trimmed.to_string());
    }
    if trimmed.starts_with("/dev/") {
        return Some(trimmed.to_string());
    }
    EMBEDDED_COM
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .map(|digits| format!("COM{}", digits.as_str()))
}

/// Pick the ports worth probing: USB/Bluetooth candidates with a usable
/// name that are not already bound to a live controller.
///
/// The result is deduplicated and sorted.
pub fn select_candidates(ports: &[PortDescriptor], live: &HashSet<String>) -> Vec<String> {
    ports
        .iter()
        .filter(|port| port.is_candidate())
        .filter_map(|port| normalize_port_name(&port.name))
        .filter(|name| !live.contains(name))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
