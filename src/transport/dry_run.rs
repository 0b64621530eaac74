//! Dry-run transport: logs frames and optionally records them as JSON lines

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::traits::{PeerInfo, Transport, TransportError, TransportResult};
use crate::hid::{descriptor, ReportFrame, ReportKind};
use crate::session::LifecycleSender;

/// One recorded frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub kind: ReportKind,
    pub report_id: Option<u8>,
    /// Wire bytes as hex
    pub bytes: String,
}

pub struct DryRunTransport {
    record_path: Option<PathBuf>,
    recorder: Option<File>,
    seq: u64,
    connected: bool,
}

impl DryRunTransport {
    pub fn new(record_path: Option<PathBuf>) -> Self {
        Self {
            record_path,
            recorder: None,
            seq: 0,
            connected: false,
        }
    }

    /// Frames sent so far
    pub fn frames_sent(&self) -> u64 {
        self.seq
    }
}

#[async_trait]
impl Transport for DryRunTransport {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    async fn open(&mut self) -> TransportResult<()> {
        if let Some(path) = &self.record_path {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(|e| TransportError::from_io(&path.display().to_string(), e))?;
            info!("Recording frames to {}", path.display());
            self.recorder = Some(file);
        }
        Ok(())
    }

    async fn accept(&mut self, _events: LifecycleSender) -> TransportResult<PeerInfo> {
        self.connected = true;
        Ok(PeerInfo::new("dry-run"))
    }

    async fn send(&mut self, frame: &ReportFrame) -> TransportResult<()> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        self.seq += 1;
        info!("frame #{} {}", self.seq, frame);

        if let Some(file) = self.recorder.as_mut() {
            let record = FrameRecord {
                seq: self.seq,
                timestamp_ms: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or_default(),
                kind: frame.kind,
                report_id: frame.report_id,
                bytes: descriptor::to_hex(frame.as_bytes()),
            };
            let mut line = serde_json::to_string(&record)
                .map_err(|e| TransportError::Io(e.into()))?;
            line.push('\n');
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
        }

        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.connected = false;
        Ok(())
    }

    async fn shutdown(&mut self) -> TransportResult<()> {
        self.connected = false;
        if let Some(mut file) = self.recorder.take() {
            file.flush().await?;
        }
        info!("Dry run finished after {} frames", self.frames_sent());
        Ok(())
    }
}
