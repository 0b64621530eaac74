//! USB HID gadget transport
//!
//! Writes raw reports to the gadget character devices created by the
//! kernel's f_hid function (`/dev/hidgN`). With the separate layout the
//! keyboard and mouse are two functions; with the combo layout a single
//! function carries both behind report IDs.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::traits::{PeerInfo, Transport, TransportError, TransportResult};
use crate::config::GadgetConfig;
use crate::hid::{DescriptorLayout, ReportFrame, ReportKind};
use crate::session::LifecycleSender;

pub struct GadgetTransport {
    layout: DescriptorLayout,
    keyboard_path: PathBuf,
    mouse_path: PathBuf,
    keyboard: Option<File>,
    mouse: Option<File>,
}

impl GadgetTransport {
    pub fn new(config: &GadgetConfig, layout: DescriptorLayout) -> Self {
        Self {
            layout,
            keyboard_path: config.keyboard_device.clone(),
            mouse_path: config.mouse_device.clone(),
            keyboard: None,
            mouse: None,
        }
    }

    fn paths(&self) -> Vec<&Path> {
        match self.layout {
            DescriptorLayout::Combo => vec![&self.keyboard_path],
            DescriptorLayout::Separate => vec![&self.keyboard_path, &self.mouse_path],
        }
    }

    async fn open_device(path: &Path) -> TransportResult<File> {
        OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|e| TransportError::from_io(&path.display().to_string(), e))
    }
}

#[async_trait]
impl Transport for GadgetTransport {
    fn name(&self) -> &'static str {
        "gadget"
    }

    async fn open(&mut self) -> TransportResult<()> {
        for path in self.paths() {
            if !path.exists() {
                return Err(TransportError::DeviceNotFound(path.display().to_string()));
            }
        }
        Ok(())
    }

    /// The USB host enumerates the gadget on its own; a writable endpoint
    /// means it is there.
    async fn accept(&mut self, _events: LifecycleSender) -> TransportResult<PeerInfo> {
        self.keyboard = Some(Self::open_device(&self.keyboard_path).await?);
        if self.layout == DescriptorLayout::Separate {
            self.mouse = Some(Self::open_device(&self.mouse_path).await?);
        }

        info!("Gadget endpoints open: {:?}", self.paths());
        Ok(PeerInfo::new(format!("usb:{}", self.keyboard_path.display())))
    }

    async fn send(&mut self, frame: &ReportFrame) -> TransportResult<()> {
        let (file, path) = match (self.layout, frame.kind) {
            (DescriptorLayout::Separate, ReportKind::Mouse) => (self.mouse.as_mut(), &self.mouse_path),
            _ => (self.keyboard.as_mut(), &self.keyboard_path),
        };
        let file = file.ok_or(TransportError::NotConnected)?;

        debug!("{} <- {}", path.display(), frame);
        file.write_all(frame.as_bytes())
            .await
            .map_err(|e| TransportError::from_io(&path.display().to_string(), e))?;
        file.flush()
            .await
            .map_err(|e| TransportError::from_io(&path.display().to_string(), e))?;
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.keyboard = None;
        self.mouse = None;
        Ok(())
    }

    async fn shutdown(&mut self) -> TransportResult<()> {
        self.close().await
    }
}
