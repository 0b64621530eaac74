//! Transport module - Report sinks
//!
//! This module provides:
//! - The [`Transport`] trait the session loop drives
//! - Backends: uinput, Bluetooth classic HID, uhid, USB gadget, dry-run
//! - A factory selecting the backend from configuration

mod dry_run;
mod gadget;
mod traits;

#[cfg(target_os = "linux")]
mod bluetooth;
#[cfg(target_os = "linux")]
mod bluez;
#[cfg(target_os = "linux")]
mod l2cap;
#[cfg(target_os = "linux")]
mod uhid;
#[cfg(target_os = "linux")]
mod uinput;

#[cfg(test)]
pub mod mock;

pub use dry_run::DryRunTransport;
pub use gadget::GadgetTransport;
pub use traits::*;

#[cfg(target_os = "linux")]
pub use bluetooth::BluetoothTransport;
#[cfg(target_os = "linux")]
pub use uhid::UhidTransport;
#[cfg(target_os = "linux")]
pub use uinput::UinputTransport;

use std::path::Path;

use crate::config::{BackendKind, Config};

/// Build the configured backend
pub fn create_transport(config: &Config) -> TransportResult<Box<dyn Transport>> {
    let layout = config.hid.layout;

    let transport: Box<dyn Transport> = match config.transport.backend {
        BackendKind::DryRun => Box::new(DryRunTransport::new(config.dry_run.record_path.clone())),
        BackendKind::Gadget => Box::new(GadgetTransport::new(&config.gadget, layout)),
        #[cfg(target_os = "linux")]
        BackendKind::Uinput => Box::new(UinputTransport::new(&config.hid)),
        #[cfg(target_os = "linux")]
        BackendKind::Bluetooth => Box::new(BluetoothTransport::new(config.bluetooth.clone(), &config.hid)),
        #[cfg(target_os = "linux")]
        BackendKind::Uhid => Box::new(UhidTransport::new(&config.hid)),
        #[cfg(not(target_os = "linux"))]
        BackendKind::Uinput | BackendKind::Bluetooth | BackendKind::Uhid => {
            return Err(TransportError::NotSupported)
        }
    };

    if !transport.supports_layout(layout) {
        return Err(TransportError::UnsupportedLayout {
            backend: transport.name(),
            layout,
        });
    }

    Ok(transport)
}

/// Whether a backend can plausibly open on this machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Ready(String),
    Missing(String),
}

impl Availability {
    pub fn is_ready(&self) -> bool {
        matches!(self, Availability::Ready(_))
    }
}

fn path_availability(path: &Path) -> Availability {
    if path.exists() {
        Availability::Ready(path.display().to_string())
    } else {
        Availability::Missing(format!("{} not found", path.display()))
    }
}

/// Check the device nodes or kernel support a backend needs
pub fn availability(kind: BackendKind, config: &Config) -> Availability {
    match kind {
        BackendKind::DryRun => Availability::Ready("always available".into()),
        BackendKind::Gadget => {
            let keyboard = path_availability(&config.gadget.keyboard_device);
            if !keyboard.is_ready() || config.hid.layout.is_multiplexed() {
                keyboard
            } else {
                path_availability(&config.gadget.mouse_device)
            }
        }
        #[cfg(target_os = "linux")]
        BackendKind::Uinput => path_availability(Path::new(uinput::UINPUT_PATH)),
        #[cfg(target_os = "linux")]
        BackendKind::Uhid => path_availability(Path::new(uhid::UHID_PATH)),
        #[cfg(target_os = "linux")]
        BackendKind::Bluetooth => {
            if l2cap::bluetooth_available() {
                Availability::Ready("AF_BLUETOOTH sockets supported".into())
            } else {
                Availability::Missing("kernel has no Bluetooth socket support".into())
            }
        }
        #[cfg(not(target_os = "linux"))]
        BackendKind::Uinput | BackendKind::Uhid | BackendKind::Bluetooth => {
            Availability::Missing("Linux only".into())
        }
    }
}
