//! Bluetooth classic HID transport
//!
//! The device side of the HID profile: two L2CAP listeners (control on PSM
//! 17, interrupt on PSM 19). Input reports go out on the interrupt channel
//! prefixed with a DATA|Input header. A background task serves the control
//! channel and reports link loss to the session.
//!
//! `open` registers the SDP service record with BlueZ; BlueZ's view of the
//! peer's `Connected` property is a second source of link loss.

use async_trait::async_trait;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::bluez::ProfileRegistration;
use super::l2cap::{BdAddr, L2capListener, L2capStream};
use super::traits::{PeerInfo, Transport, TransportError, TransportResult};
use crate::config::{BluetoothConfig, HidConfig};
use crate::hid::{descriptor, DescriptorLayout, ReportFrame};
use crate::session::{LifecycleEvent, LifecycleSender};

/// DATA transaction carrying an input report
pub const DATA_INPUT: u8 = 0xA1;

const TRANS_HANDSHAKE: u8 = 0x0;
const TRANS_HID_CONTROL: u8 = 0x1;
const TRANS_GET_REPORT: u8 = 0x4;
const TRANS_SET_REPORT: u8 = 0x5;
const TRANS_GET_PROTOCOL: u8 = 0x6;
const TRANS_SET_PROTOCOL: u8 = 0x7;
const TRANS_GET_IDLE: u8 = 0x8;
const TRANS_SET_IDLE: u8 = 0x9;
const TRANS_DATA: u8 = 0xA;

const HANDSHAKE_SUCCESSFUL: u8 = 0x0;
const HANDSHAKE_ERR_UNSUPPORTED_REQUEST: u8 = 0x3;

const CONTROL_VIRTUAL_CABLE_UNPLUG: u8 = 0x5;

/// What to do with one control-channel message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Reply(u8),
    Unplug,
    Ignore,
}

/// Decide how to answer a control-channel transaction
pub fn control_action(message: &[u8]) -> ControlAction {
    let Some(&header) = message.first() else {
        return ControlAction::Ignore;
    };
    let (transaction, param) = (header >> 4, header & 0x0F);

    match transaction {
        TRANS_SET_REPORT | TRANS_SET_PROTOCOL | TRANS_SET_IDLE => {
            ControlAction::Reply(handshake(HANDSHAKE_SUCCESSFUL))
        }
        TRANS_GET_REPORT | TRANS_GET_PROTOCOL | TRANS_GET_IDLE => {
            ControlAction::Reply(handshake(HANDSHAKE_ERR_UNSUPPORTED_REQUEST))
        }
        TRANS_HID_CONTROL if param == CONTROL_VIRTUAL_CABLE_UNPLUG => ControlAction::Unplug,
        TRANS_HID_CONTROL | TRANS_HANDSHAKE | TRANS_DATA => ControlAction::Ignore,
        _ => ControlAction::Reply(handshake(HANDSHAKE_ERR_UNSUPPORTED_REQUEST)),
    }
}

fn handshake(result: u8) -> u8 {
    (TRANS_HANDSHAKE << 4) | result
}

/// Prefix a frame for the interrupt channel
pub fn interrupt_packet(frame: &ReportFrame) -> Vec<u8> {
    let mut packet = Vec::with_capacity(frame.len() + 1);
    packet.push(DATA_INPUT);
    packet.extend_from_slice(frame.as_bytes());
    packet
}

struct Listeners {
    control: L2capListener,
    interrupt: L2capListener,
}

pub struct BluetoothTransport {
    config: BluetoothConfig,
    device_name: String,
    layout: DescriptorLayout,
    listeners: Option<Listeners>,
    /// Control channel accepted before a cancelled `accept`
    pending_control: Option<(L2capStream, BdAddr)>,
    interrupt: Option<L2capStream>,
    monitor: Option<JoinHandle<()>>,
    profile: Option<ProfileRegistration>,
    link_watch: Option<JoinHandle<()>>,
}

impl BluetoothTransport {
    pub fn new(config: BluetoothConfig, hid: &HidConfig) -> Self {
        Self {
            config,
            device_name: hid.device_name.clone(),
            layout: hid.layout,
            listeners: None,
            pending_control: None,
            interrupt: None,
            monitor: None,
            profile: None,
            link_watch: None,
        }
    }

    async fn register_profile(&mut self) -> TransportResult<()> {
        if !self.config.register_profile || self.profile.is_some() {
            return Ok(());
        }

        let record = descriptor::sdp_record(&self.device_name, descriptor::COMBO, descriptor::SUBCLASS_COMBO);
        let registration = ProfileRegistration::register(&record, &self.config)
            .await
            .map_err(|e| TransportError::Profile(e.to_string()))?;
        self.profile = Some(registration);
        Ok(())
    }

    fn bind(&mut self) -> TransportResult<()> {
        if self.listeners.is_some() {
            return Ok(());
        }

        let control = L2capListener::bind(self.config.control_psm)
            .map_err(|e| TransportError::from_io(&format!("L2CAP PSM {}", self.config.control_psm), e))?;
        let interrupt = L2capListener::bind(self.config.interrupt_psm)
            .map_err(|e| TransportError::from_io(&format!("L2CAP PSM {}", self.config.interrupt_psm), e))?;

        info!(
            "Listening on L2CAP PSM {} (control) and {} (interrupt)",
            control.psm(),
            interrupt.psm()
        );
        self.listeners = Some(Listeners { control, interrupt });
        Ok(())
    }

    fn stop_monitor(&mut self) {
        for task in [self.monitor.take(), self.link_watch.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

/// Serve the control channel until the link goes away
async fn monitor_control(control: L2capStream, peer: BdAddr, events: LifecycleSender) {
    let mut buf = [0u8; 64];

    let event = loop {
        match control.recv(&mut buf).await {
            Ok(0) => {
                break LifecycleEvent::PeerLost {
                    reason: "control channel closed".into(),
                }
            }
            Ok(n) => match control_action(&buf[..n]) {
                ControlAction::Reply(byte) => {
                    debug!("Control {:02x?} -> {:02x}", &buf[..n], byte);
                    if let Err(e) = control.send(&[byte]).await {
                        break LifecycleEvent::PeerLost {
                            reason: format!("control reply failed: {}", e),
                        };
                    }
                }
                ControlAction::Unplug => break LifecycleEvent::Unplugged,
                ControlAction::Ignore => debug!("Ignoring control message {:02x?}", &buf[..n]),
            },
            Err(e) => {
                break LifecycleEvent::PeerLost {
                    reason: format!("control channel error: {}", e),
                }
            }
        }
    };

    info!("Host {}: {}", peer, event);
    events.send(event).await;
}

#[async_trait]
impl Transport for BluetoothTransport {
    fn name(&self) -> &'static str {
        "bluetooth"
    }

    fn supports_layout(&self, layout: DescriptorLayout) -> bool {
        layout == DescriptorLayout::Combo
    }

    async fn open(&mut self) -> TransportResult<()> {
        if !self.supports_layout(self.layout) {
            return Err(TransportError::UnsupportedLayout {
                backend: "bluetooth",
                layout: self.layout,
            });
        }
        self.bind()?;
        self.register_profile().await
    }

    async fn advertise(&mut self) -> TransportResult<()> {
        self.bind()?;

        let Some((program, args)) = self.config.advertise_command.split_first() else {
            return Ok(());
        };

        let status = Command::new(program)
            .args(args)
            .status()
            .await
            .map_err(|e| TransportError::Advertise(format!("{}: {}", program, e)))?;

        if status.success() {
            info!("Discoverable ({})", self.config.advertise_command.join(" "));
            Ok(())
        } else {
            Err(TransportError::Advertise(format!(
                "'{}' exited with {}",
                self.config.advertise_command.join(" "),
                status
            )))
        }
    }

    async fn accept(&mut self, events: LifecycleSender) -> TransportResult<PeerInfo> {
        self.bind()?;
        let Some(listeners) = self.listeners.as_ref() else {
            return Err(TransportError::NotConnected);
        };

        if self.pending_control.is_none() {
            let (control, peer) = listeners.control.accept().await?;
            info!("Control channel from {}", peer);
            self.pending_control = Some((control, peer));
        }

        let (interrupt, interrupt_peer) = listeners.interrupt.accept().await?;
        let Some((control, peer)) = self.pending_control.take() else {
            return Err(TransportError::NotConnected);
        };
        if interrupt_peer != peer {
            warn!(
                "Interrupt channel from {} does not match control peer {}",
                interrupt_peer, peer
            );
        }

        // One host at a time: stop listening until this one is gone
        self.listeners = None;

        self.stop_monitor();
        if let Some(profile) = self.profile.as_ref() {
            self.link_watch = Some(profile.watch_link(&self.config.adapter, peer, events.clone()));
        }
        self.monitor = Some(tokio::spawn(monitor_control(control, peer, events)));
        self.interrupt = Some(interrupt);

        Ok(PeerInfo::new(peer.to_string()))
    }

    async fn send(&mut self, frame: &ReportFrame) -> TransportResult<()> {
        let interrupt = self.interrupt.as_ref().ok_or(TransportError::NotConnected)?;
        interrupt
            .send(&interrupt_packet(frame))
            .await
            .map_err(|e| TransportError::from_io("interrupt channel", e))
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.stop_monitor();
        self.interrupt = None;
        self.pending_control = None;
        Ok(())
    }

    async fn shutdown(&mut self) -> TransportResult<()> {
        self.close().await?;
        self.listeners = None;
        if let Some(profile) = self.profile.take() {
            if let Err(e) = profile.unregister().await {
                warn!("Failed to unregister HID profile: {}", e);
            }
        }
        Ok(())
    }
}
