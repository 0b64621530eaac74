//! Kernel HID relay transport (`/dev/uhid`)
//!
//! Creates a HID device inside the local kernel. When the BlueZ HoG profile
//! or a BLE GATT relay exports it, the host sees a BLE keyboard and mouse.
//!
//! While a peer is attached, a reader drains kernel events from the device,
//! answers GET_REPORT/SET_REPORT requests and turns UHID_STOP/UHID_CLOSE into
//! link loss.

use async_trait::async_trait;
use nix::errno::Errno;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::unix::AsyncFd;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::l2cap;
use super::traits::{PeerInfo, Transport, TransportError, TransportResult};
use crate::config::HidConfig;
use crate::hid::{descriptor, DescriptorLayout, ReportFrame};
use crate::session::{LifecycleEvent, LifecycleSender};

pub const UHID_PATH: &str = "/dev/uhid";

const UHID_DESTROY: u32 = 1;
const UHID_START: u32 = 2;
const UHID_STOP: u32 = 3;
const UHID_OPEN: u32 = 4;
const UHID_CLOSE: u32 = 5;
const UHID_OUTPUT: u32 = 6;
const UHID_GET_REPORT: u32 = 9;
const UHID_GET_REPORT_REPLY: u32 = 10;
const UHID_CREATE2: u32 = 11;
const UHID_INPUT2: u32 = 12;
const UHID_SET_REPORT: u32 = 13;
const UHID_SET_REPORT_REPLY: u32 = 14;

const UHID_DATA_MAX: usize = 4096;
const NAME_LEN: usize = 128;
const PHYS_LEN: usize = 64;
const UNIQ_LEN: usize = 64;

/// `sizeof(struct uhid_create2_req)`
const CREATE2_REQ_LEN: usize = NAME_LEN + PHYS_LEN + UNIQ_LEN + 2 + 2 + 4 * 4 + UHID_DATA_MAX;
/// `sizeof(struct uhid_event)`: type plus the largest union member
pub const UHID_EVENT_LEN: usize = 4 + CREATE2_REQ_LEN;

const BUS_BLUETOOTH: u16 = 0x05;

/// Identity written into UHID_CREATE2
#[derive(Debug, Clone)]
pub struct UhidIdentity {
    pub name: String,
    pub vendor: u32,
    pub product: u32,
    pub version: u32,
}

fn put_str(event: &mut [u8], offset: usize, len: usize, s: &str) {
    // Keep the trailing NUL
    let bytes = s.as_bytes();
    let n = bytes.len().min(len - 1);
    event[offset..offset + n].copy_from_slice(&bytes[..n]);
}

fn put_u16(event: &mut [u8], offset: usize, value: u16) {
    event[offset..offset + 2].copy_from_slice(&value.to_ne_bytes());
}

fn put_u32(event: &mut [u8], offset: usize, value: u32) {
    event[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}

/// Build a UHID_CREATE2 event
pub fn create2_event(identity: &UhidIdentity, report_descriptor: &[u8]) -> TransportResult<Vec<u8>> {
    if report_descriptor.len() > UHID_DATA_MAX {
        return Err(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "report descriptor too large for uhid",
        )));
    }

    let mut event = vec![0u8; UHID_EVENT_LEN];
    put_u32(&mut event, 0, UHID_CREATE2);

    let base = 4;
    put_str(&mut event, base, NAME_LEN, &identity.name);
    put_str(&mut event, base + NAME_LEN, PHYS_LEN, "hidbridge");

    let fields = base + NAME_LEN + PHYS_LEN + UNIQ_LEN;
    put_u16(&mut event, fields, report_descriptor.len() as u16);
    put_u16(&mut event, fields + 2, BUS_BLUETOOTH);
    put_u32(&mut event, fields + 4, identity.vendor);
    put_u32(&mut event, fields + 8, identity.product);
    put_u32(&mut event, fields + 12, identity.version);
    put_u32(&mut event, fields + 16, 0);

    let data = fields + 20;
    event[data..data + report_descriptor.len()].copy_from_slice(report_descriptor);
    Ok(event)
}

/// Build a UHID_INPUT2 event carrying one report
pub fn input2_event(report: &[u8]) -> Vec<u8> {
    let len = report.len().min(UHID_DATA_MAX);
    let mut event = vec![0u8; UHID_EVENT_LEN];
    put_u32(&mut event, 0, UHID_INPUT2);
    put_u16(&mut event, 4, len as u16);
    event[6..6 + len].copy_from_slice(&report[..len]);
    event
}

pub fn destroy_event() -> Vec<u8> {
    let mut event = vec![0u8; UHID_EVENT_LEN];
    put_u32(&mut event, 0, UHID_DESTROY);
    event
}

/// Answer to a GET_REPORT or SET_REPORT request, `err` is an errno value
fn reply_event(kind: u32, id: u32, err: u16) -> Vec<u8> {
    let mut event = vec![0u8; UHID_EVENT_LEN];
    put_u32(&mut event, 0, kind);
    put_u32(&mut event, 4, id);
    put_u16(&mut event, 8, err);
    event
}

fn get_u32(event: &[u8], offset: usize) -> Option<u32> {
    let bytes = event.get(offset..offset + 4)?;
    Some(u32::from_ne_bytes(bytes.try_into().ok()?))
}

/// What to do with one event read from the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UhidAction {
    Ignore,
    Reply(Vec<u8>),
    PeerLost(&'static str),
}

/// Decide how to handle a kernel event
///
/// GET_REPORT is refused with EIO: the device has no feature reports and
/// input reports are only ever pushed. SET_REPORT (LED state) is accepted
/// and dropped.
pub fn uhid_action(event: &[u8]) -> UhidAction {
    let Some(kind) = get_u32(event, 0) else {
        return UhidAction::Ignore;
    };

    match kind {
        UHID_START | UHID_OPEN | UHID_OUTPUT => UhidAction::Ignore,
        UHID_STOP => UhidAction::PeerLost("uhid device stopped"),
        UHID_CLOSE => UhidAction::PeerLost("uhid device closed by host"),
        UHID_GET_REPORT | UHID_SET_REPORT => {
            let Some(id) = get_u32(event, 4) else {
                return UhidAction::Ignore;
            };
            if kind == UHID_GET_REPORT {
                UhidAction::Reply(reply_event(UHID_GET_REPORT_REPLY, id, Errno::EIO as u16))
            } else {
                UhidAction::Reply(reply_event(UHID_SET_REPORT_REPLY, id, 0))
            }
        }
        _ => UhidAction::Ignore,
    }
}

async fn read_event(fd: &AsyncFd<OwnedFd>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut guard = fd.readable().await?;
        match guard.try_io(|inner| nix::unistd::read(inner.as_raw_fd(), buf).map_err(io::Error::from)) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

/// Drain kernel events until the device goes away or the host lets go
async fn watch_events(fd: AsyncFd<OwnedFd>, events: LifecycleSender) {
    let mut buf = vec![0u8; UHID_EVENT_LEN];

    loop {
        let n = match read_event(&fd, &mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("Reading uhid events failed: {}", e);
                break;
            }
        };

        match uhid_action(&buf[..n]) {
            UhidAction::Ignore => debug!("uhid -> event {:?}", get_u32(&buf, 0)),
            UhidAction::Reply(reply) => {
                if let Err(e) = nix::unistd::write(fd.get_ref().as_raw_fd(), &reply) {
                    warn!("uhid reply failed: {}", e);
                }
            }
            UhidAction::PeerLost(reason) => {
                info!("{}", reason);
                events
                    .send(LifecycleEvent::PeerLost {
                        reason: reason.to_string(),
                    })
                    .await;
                break;
            }
        }
    }
}

pub struct UhidTransport {
    path: PathBuf,
    identity: UhidIdentity,
    layout: DescriptorLayout,
    device: Option<File>,
    connected: bool,
    watcher: Option<JoinHandle<()>>,
}

impl UhidTransport {
    pub fn new(hid: &HidConfig) -> Self {
        Self::with_path(hid, Path::new(UHID_PATH))
    }

    pub fn with_path(hid: &HidConfig, path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            identity: UhidIdentity {
                name: hid.device_name.clone(),
                vendor: u32::from(hid.vendor_id),
                product: u32::from(hid.product_id),
                version: u32::from(hid.version),
            },
            layout: hid.layout,
            device: None,
            connected: false,
            watcher: None,
        }
    }

    fn stop_watcher(&mut self) {
        if let Some(task) = self.watcher.take() {
            task.abort();
        }
    }

    /// Second descriptor on the device, registered with the reactor
    async fn event_reader(&self) -> io::Result<AsyncFd<OwnedFd>> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let reader = device.try_clone().await?.into_std().await;
        l2cap::register(OwnedFd::from(reader))
    }

    async fn write_event(&mut self, event: &[u8]) -> TransportResult<()> {
        let path = self.path.display().to_string();
        let device = self.device.as_mut().ok_or(TransportError::NotConnected)?;
        device
            .write_all(event)
            .await
            .map_err(|e| TransportError::from_io(&path, e))?;
        device
            .flush()
            .await
            .map_err(|e| TransportError::from_io(&path, e))
    }

    async fn create(&mut self) -> TransportResult<()> {
        if self.device.is_some() {
            return Ok(());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
            .await
            .map_err(|e| TransportError::from_io(&self.path.display().to_string(), e))?;
        self.device = Some(file);

        let event = create2_event(&self.identity, descriptor::COMBO)?;
        self.write_event(&event).await?;
        info!("Created uhid device '{}'", self.identity.name);
        Ok(())
    }
}

#[async_trait]
impl Transport for UhidTransport {
    fn name(&self) -> &'static str {
        "uhid"
    }

    fn supports_layout(&self, layout: DescriptorLayout) -> bool {
        layout == DescriptorLayout::Combo
    }

    async fn open(&mut self) -> TransportResult<()> {
        if !self.supports_layout(self.layout) {
            return Err(TransportError::UnsupportedLayout {
                backend: "uhid",
                layout: self.layout,
            });
        }
        self.create().await
    }

    async fn accept(&mut self, events: LifecycleSender) -> TransportResult<PeerInfo> {
        self.create().await?;

        self.stop_watcher();
        match self.event_reader().await {
            Ok(fd) => self.watcher = Some(tokio::spawn(watch_events(fd, events))),
            Err(e) => warn!("Cannot watch {} for events: {}", self.path.display(), e),
        }

        self.connected = true;
        Ok(PeerInfo::new(format!("uhid:{}", self.identity.name)))
    }

    async fn send(&mut self, frame: &ReportFrame) -> TransportResult<()> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        debug!("uhid <- {}", frame);
        self.write_event(&input2_event(frame.as_bytes())).await
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.stop_watcher();
        self.connected = false;
        Ok(())
    }

    async fn shutdown(&mut self) -> TransportResult<()> {
        self.close().await?;
        if self.device.is_some() {
            self.write_event(&destroy_event()).await?;
            self.device = None;
            info!("Destroyed uhid device '{}'", self.identity.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hid::{MouseButtons, MouseReport, Report, ReportCodec};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn identity() -> UhidIdentity {
        UhidIdentity {
            name: "Pi5-Keyboard".into(),
            vendor: 0x1D6B,
            product: 0x0104,
            version: 0x0100,
        }
    }

    #[test]
    fn test_event_size() {
        assert_eq!(UHID_EVENT_LEN, 4376);
    }

    #[test]
    fn test_create2_layout() {
        let event = create2_event(&identity(), descriptor::COMBO).unwrap();
        assert_eq!(event.len(), UHID_EVENT_LEN);
        assert_eq!(u32::from_ne_bytes(event[0..4].try_into().unwrap()), 11);
        assert_eq!(&event[4..16], b"Pi5-Keyboard");
        assert_eq!(event[16], 0);
        assert_eq!(&event[132..141], b"hidbridge");

        let rd_size = u16::from_ne_bytes(event[260..262].try_into().unwrap());
        assert_eq!(usize::from(rd_size), descriptor::COMBO.len());
        assert_eq!(u16::from_ne_bytes(event[262..264].try_into().unwrap()), BUS_BLUETOOTH);
        assert_eq!(u32::from_ne_bytes(event[264..268].try_into().unwrap()), 0x1D6B);
        assert_eq!(u32::from_ne_bytes(event[268..272].try_into().unwrap()), 0x0104);
        assert_eq!(&event[280..280 + descriptor::COMBO.len()], descriptor::COMBO);
    }

    #[test]
    fn test_long_name_is_truncated() {
        let mut id = identity();
        id.name = "x".repeat(300);
        let event = create2_event(&id, descriptor::COMBO).unwrap();
        assert_eq!(event[4 + 127], 0);
        assert_eq!(event[4 + 126], b'x');
    }

    #[test]
    fn test_input2_layout() {
        let event = input2_event(&[0x02, 0x01, 0x05, 0xFB, 0x00]);
        assert_eq!(u32::from_ne_bytes(event[0..4].try_into().unwrap()), 12);
        assert_eq!(u16::from_ne_bytes(event[4..6].try_into().unwrap()), 5);
        assert_eq!(&event[6..11], &[0x02, 0x01, 0x05, 0xFB, 0x00]);
    }

    #[tokio::test]
    async fn test_writes_events_to_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uhid");
        std::fs::write(&path, b"").unwrap();

        let mut transport = UhidTransport::with_path(&HidConfig::default(), &path);
        transport.open().await.unwrap();
        let (tx, _rx) = mpsc::channel(1);
        transport
            .accept(LifecycleSender::new(Uuid::new_v4(), tx))
            .await
            .unwrap();
        let frame = ReportCodec::new(DescriptorLayout::Combo)
            .encode(&Report::Mouse(MouseReport::new(MouseButtons::empty(), 1, 1, 0)));
        transport.send(&frame).await.unwrap();
        transport.shutdown().await.unwrap();

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written.len(), 3 * UHID_EVENT_LEN);
        let types: Vec<u32> = written
            .chunks(UHID_EVENT_LEN)
            .map(|e| u32::from_ne_bytes(e[0..4].try_into().unwrap()))
            .collect();
        assert_eq!(types, vec![UHID_CREATE2, UHID_INPUT2, UHID_DESTROY]);
    }

    fn kernel_event(kind: u32, id: u32) -> Vec<u8> {
        let mut event = vec![0u8; UHID_EVENT_LEN];
        put_u32(&mut event, 0, kind);
        put_u32(&mut event, 4, id);
        event
    }

    #[test]
    fn test_uhid_actions() {
        assert_eq!(uhid_action(&kernel_event(UHID_START, 0)), UhidAction::Ignore);
        assert_eq!(uhid_action(&kernel_event(UHID_OPEN, 0)), UhidAction::Ignore);
        assert_eq!(uhid_action(&kernel_event(UHID_OUTPUT, 0)), UhidAction::Ignore);
        assert!(matches!(
            uhid_action(&kernel_event(UHID_CLOSE, 0)),
            UhidAction::PeerLost(_)
        ));
        assert!(matches!(
            uhid_action(&kernel_event(UHID_STOP, 0)),
            UhidAction::PeerLost(_)
        ));
        assert_eq!(uhid_action(&[0x05]), UhidAction::Ignore);

        let UhidAction::Reply(reply) = uhid_action(&kernel_event(UHID_GET_REPORT, 7)) else {
            panic!("expected a reply");
        };
        assert_eq!(get_u32(&reply, 0), Some(UHID_GET_REPORT_REPLY));
        assert_eq!(get_u32(&reply, 4), Some(7));
        assert_eq!(u16::from_ne_bytes([reply[8], reply[9]]), libc::EIO as u16);

        let UhidAction::Reply(reply) = uhid_action(&kernel_event(UHID_SET_REPORT, 9)) else {
            panic!("expected a reply");
        };
        assert_eq!(get_u32(&reply, 0), Some(UHID_SET_REPORT_REPLY));
        assert_eq!(get_u32(&reply, 4), Some(9));
        assert_eq!(&reply[8..10], &[0, 0]);
    }

    #[tokio::test]
    async fn test_watcher_answers_requests_and_reports_close() {
        let (kernel, device) = std::os::unix::net::UnixDatagram::pair().unwrap();
        device.set_nonblocking(true).unwrap();
        let fd = l2cap::register(OwnedFd::from(device)).unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let task = tokio::spawn(watch_events(fd, LifecycleSender::new(Uuid::new_v4(), tx)));

        kernel.send(&kernel_event(UHID_GET_REPORT, 3)).unwrap();
        let kernel = tokio::task::spawn_blocking(move || {
            let mut reply = vec![0u8; UHID_EVENT_LEN];
            let n = kernel.recv(&mut reply).unwrap();
            assert_eq!(n, UHID_EVENT_LEN);
            assert_eq!(get_u32(&reply, 0), Some(UHID_GET_REPORT_REPLY));
            assert_eq!(get_u32(&reply, 4), Some(3));
            kernel
        })
        .await
        .unwrap();

        kernel.send(&kernel_event(UHID_CLOSE, 0)).unwrap();
        match rx.recv().await {
            Some(crate::session::SessionMessage::Lifecycle(ev)) => {
                assert!(matches!(ev.event, LifecycleEvent::PeerLost { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_separate_layout_rejected() {
        let hid = HidConfig {
            layout: DescriptorLayout::Separate,
            ..HidConfig::default()
        };
        let mut transport = UhidTransport::new(&hid);
        assert!(matches!(
            transport.open().await,
            Err(TransportError::UnsupportedLayout { backend: "uhid", .. })
        ));
    }
}
