//! Transport trait definitions
//!
//! Defines the common interface every report sink must provide.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::hid::{CodecError, DescriptorLayout, ReportFrame};
use crate::session::LifecycleSender;

/// Errors that can occur in a transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("{backend} backend does not support the {layout} layout")]
    UnsupportedLayout {
        backend: &'static str,
        layout: DescriptorLayout,
    },

    #[error("Not connected")]
    NotConnected,

    #[error("Peer disconnected: {0}")]
    Disconnected(String),

    #[error("Advertising failed: {0}")]
    Advertise(String),

    #[error("Profile registration failed: {0}")]
    Profile(String),

    #[cfg(not(target_os = "linux"))]
    #[error("Not supported on this platform")]
    NotSupported,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Map an I/O error on an open device to a permission or link error
    pub fn from_io(context: &str, err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::PermissionDenied => Self::PermissionDenied(format!("{}: {}", context, err)),
            ErrorKind::NotFound => Self::DeviceNotFound(context.to_string()),
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::NotConnected => {
                Self::Disconnected(format!("{}: {}", context, err))
            }
            _ => Self::Io(err),
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Whoever is receiving our reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: String,
}

impl PeerInfo {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// A sink for encoded HID report frames
///
/// The session loop is the only caller; methods are never invoked
/// concurrently.
#[async_trait]
pub trait Transport: Send {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    fn supports_layout(&self, _layout: DescriptorLayout) -> bool {
        true
    }

    /// Acquire the device or sockets; failure is fatal at start-up
    async fn open(&mut self) -> TransportResult<()>;

    /// Make the device visible to hosts
    async fn advertise(&mut self) -> TransportResult<()> {
        Ok(())
    }

    /// Wait for a host
    ///
    /// Must be cancel-safe: the session drops this future whenever a command
    /// arrives while advertising.
    async fn accept(&mut self, events: LifecycleSender) -> TransportResult<PeerInfo>;

    /// Deliver one frame to the connected host
    async fn send(&mut self, frame: &ReportFrame) -> TransportResult<()>;

    /// Drop the current host, keep the device
    async fn close(&mut self) -> TransportResult<()>;

    /// Release everything
    async fn shutdown(&mut self) -> TransportResult<()>;
}
