//! Local virtual-device transport using uinput
//!
//! Requirements:
//! - User must be in the 'input' group or run as root
//! - /dev/uinput must be accessible (`modprobe uinput`)
//!
//! Frames are decoded back into reports and diffed against the previous
//! state, so the kernel sees ordinary key and relative-motion events.

use async_trait::async_trait;
use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AttributeSet, BusType, EventType, InputEvent, InputId, Key, RelativeAxisType};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

use super::traits::{PeerInfo, Transport, TransportError, TransportResult};
use crate::config::HidConfig;
use crate::hid::{
    keycodes, KeyboardReport, MouseButtons, MouseReport, Report, ReportCodec, ReportFrame,
};
use crate::session::LifecycleSender;

pub const UINPUT_PATH: &str = "/dev/uinput";

const BTN_LEFT: u16 = 0x110;
const BTN_RIGHT: u16 = 0x111;
const BTN_MIDDLE: u16 = 0x112;

/// USB HID usage to Linux input keycode
static HID_TO_LINUX: &[(u8, u16)] = &[
    (0x04, 30),  // A
    (0x05, 48),  // B
    (0x06, 46),  // C
    (0x07, 32),  // D
    (0x08, 18),  // E
    (0x09, 33),  // F
    (0x0A, 34),  // G
    (0x0B, 35),  // H
    (0x0C, 23),  // I
    (0x0D, 36),  // J
    (0x0E, 37),  // K
    (0x0F, 38),  // L
    (0x10, 50),  // M
    (0x11, 49),  // N
    (0x12, 24),  // O
    (0x13, 25),  // P
    (0x14, 16),  // Q
    (0x15, 19),  // R
    (0x16, 31),  // S
    (0x17, 20),  // T
    (0x18, 22),  // U
    (0x19, 47),  // V
    (0x1A, 17),  // W
    (0x1B, 45),  // X
    (0x1C, 21),  // Y
    (0x1D, 44),  // Z
    (0x1E, 2),   // 1
    (0x1F, 3),   // 2
    (0x20, 4),   // 3
    (0x21, 5),   // 4
    (0x22, 6),   // 5
    (0x23, 7),   // 6
    (0x24, 8),   // 7
    (0x25, 9),   // 8
    (0x26, 10),  // 9
    (0x27, 11),  // 0
    (0x28, 28),  // Enter
    (0x29, 1),   // Escape
    (0x2A, 14),  // Backspace
    (0x2B, 15),  // Tab
    (0x2C, 57),  // Space
    (0x2D, 12),  // Minus
    (0x2E, 13),  // Equal
    (0x2F, 26),  // Left Bracket
    (0x30, 27),  // Right Bracket
    (0x31, 43),  // Backslash
    (0x33, 39),  // Semicolon
    (0x34, 40),  // Quote
    (0x35, 41),  // Grave
    (0x36, 51),  // Comma
    (0x37, 52),  // Period
    (0x38, 53),  // Slash
    (0x39, 58),  // Caps Lock
    (0x3A, 59),  // F1
    (0x3B, 60),  // F2
    (0x3C, 61),  // F3
    (0x3D, 62),  // F4
    (0x3E, 63),  // F5
    (0x3F, 64),  // F6
    (0x40, 65),  // F7
    (0x41, 66),  // F8
    (0x42, 67),  // F9
    (0x43, 68),  // F10
    (0x44, 87),  // F11
    (0x45, 88),  // F12
    (0x49, 110), // Insert
    (0x4A, 102), // Home
    (0x4B, 104), // Page Up
    (0x4C, 111), // Delete
    (0x4D, 107), // End
    (0x4E, 109), // Page Down
    (0x4F, 106), // Right Arrow
    (0x50, 105), // Left Arrow
    (0x51, 108), // Down Arrow
    (0x52, 103), // Up Arrow
    (0xE0, 29),  // Left Ctrl
    (0xE1, 42),  // Left Shift
    (0xE2, 56),  // Left Alt
    (0xE3, 125), // Left Meta
    (0xE4, 97),  // Right Ctrl
    (0xE5, 54),  // Right Shift
    (0xE6, 100), // Right Alt
    (0xE7, 126), // Right Meta
];

fn hid_to_linux_keycode(hid: u8) -> Option<u16> {
    HID_TO_LINUX
        .iter()
        .find(|(h, _)| *h == hid)
        .map(|(_, linux)| *linux)
}

/// Event to write, before conversion to an evdev event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEvent {
    Key { code: u16, pressed: bool },
    Rel { axis: u16, delta: i32 },
}

/// Last state written to the device
#[derive(Debug, Default)]
pub struct DeviceState {
    keys: BTreeSet<u16>,
    buttons: MouseButtons,
}

impl DeviceState {
    /// Events that move the device from the current state to `report`
    pub fn apply(&mut self, report: &Report) -> Vec<RawEvent> {
        let mut events = Vec::new();

        match report {
            Report::Keyboard(kb) => {
                let modifier_codes = kb
                    .modifiers
                    .iter()
                    .map(|m| keycodes::KEY_LEFT_CTRL + m.bits().trailing_zeros() as u8);
                let next: BTreeSet<u16> = modifier_codes
                    .chain(kb.pressed_keys())
                    .filter_map(|hid| {
                        let code = hid_to_linux_keycode(hid);
                        if code.is_none() {
                            debug!("No Linux keycode for HID usage {:#04x}", hid);
                        }
                        code
                    })
                    .collect();

                for code in self.keys.difference(&next) {
                    events.push(RawEvent::Key { code: *code, pressed: false });
                }
                for code in next.difference(&self.keys) {
                    events.push(RawEvent::Key { code: *code, pressed: true });
                }
                self.keys = next;
            }
            Report::Mouse(mouse) => {
                for (axis, delta) in [
                    (RelativeAxisType::REL_X.0, mouse.dx),
                    (RelativeAxisType::REL_Y.0, mouse.dy),
                    (RelativeAxisType::REL_WHEEL.0, mouse.wheel),
                ] {
                    if delta != 0 {
                        events.push(RawEvent::Rel { axis, delta: i32::from(delta) });
                    }
                }

                for (mask, code) in [
                    (MouseButtons::LEFT, BTN_LEFT),
                    (MouseButtons::RIGHT, BTN_RIGHT),
                    (MouseButtons::MIDDLE, BTN_MIDDLE),
                ] {
                    let was = self.buttons.contains(mask);
                    let is = mouse.buttons.contains(mask);
                    if was != is {
                        events.push(RawEvent::Key { code, pressed: is });
                    }
                }
                self.buttons = mouse.buttons;
            }
        }

        events
    }

    /// Events that lift every held key and mouse button
    pub fn release_all(&mut self) -> Vec<RawEvent> {
        let mut events = self.apply(&Report::Keyboard(KeyboardReport::released()));
        events.extend(self.apply(&Report::Mouse(MouseReport::released())));
        events
    }
}

impl From<RawEvent> for InputEvent {
    fn from(event: RawEvent) -> Self {
        match event {
            RawEvent::Key { code, pressed } => InputEvent::new(EventType::KEY, code, i32::from(pressed)),
            RawEvent::Rel { axis, delta } => InputEvent::new(EventType::RELATIVE, axis, delta),
        }
    }
}

pub struct UinputTransport {
    hid: HidConfig,
    codec: ReportCodec,
    device: Option<VirtualDevice>,
    state: DeviceState,
    connected: bool,
}

impl UinputTransport {
    pub fn new(hid: &HidConfig) -> Self {
        Self {
            hid: hid.clone(),
            codec: ReportCodec::new(hid.layout),
            device: None,
            state: DeviceState::default(),
            connected: false,
        }
    }

    pub fn is_available() -> bool {
        Path::new(UINPUT_PATH).exists()
    }

    fn build_device(&self) -> std::io::Result<VirtualDevice> {
        let mut keys = AttributeSet::<Key>::new();
        for (_, code) in HID_TO_LINUX {
            keys.insert(Key::new(*code));
        }
        for code in [BTN_LEFT, BTN_RIGHT, BTN_MIDDLE] {
            keys.insert(Key::new(code));
        }

        let mut axes = AttributeSet::<RelativeAxisType>::new();
        axes.insert(RelativeAxisType::REL_X);
        axes.insert(RelativeAxisType::REL_Y);
        axes.insert(RelativeAxisType::REL_WHEEL);

        VirtualDeviceBuilder::new()?
            .name(&self.hid.device_name)
            .input_id(InputId::new(
                BusType::BUS_USB,
                self.hid.vendor_id,
                self.hid.product_id,
                self.hid.version,
            ))
            .with_keys(&keys)?
            .with_relative_axes(&axes)?
            .build()
    }

    fn emit(&mut self, events: Vec<RawEvent>) -> TransportResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let device = self.device.as_mut().ok_or(TransportError::NotConnected)?;

        let mut batch: Vec<InputEvent> = events.into_iter().map(InputEvent::from).collect();
        batch.push(InputEvent::new(EventType::SYNCHRONIZATION, 0, 0));
        device
            .emit(&batch)
            .map_err(|e| TransportError::from_io(UINPUT_PATH, e))
    }
}

#[async_trait]
impl Transport for UinputTransport {
    fn name(&self) -> &'static str {
        "uinput"
    }

    async fn open(&mut self) -> TransportResult<()> {
        if !Self::is_available() {
            return Err(TransportError::DeviceNotFound(UINPUT_PATH.to_string()));
        }
        let device = self
            .build_device()
            .map_err(|e| TransportError::from_io(UINPUT_PATH, e))?;
        info!("Created virtual device '{}'", self.hid.device_name);
        self.device = Some(device);
        Ok(())
    }

    async fn accept(&mut self, _events: LifecycleSender) -> TransportResult<PeerInfo> {
        if self.device.is_none() {
            self.open().await?;
        }
        self.connected = true;
        Ok(PeerInfo::new("local uinput"))
    }

    async fn send(&mut self, frame: &ReportFrame) -> TransportResult<()> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let report = self.codec.decode_frame(frame)?;
        let events = self.state.apply(&report);
        self.emit(events)
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.connected = false;
        Ok(())
    }

    async fn shutdown(&mut self) -> TransportResult<()> {
        // Never leave keys or buttons down in the local session
        let released = self.state.release_all();
        if self.device.is_some() {
            self.emit(released)?;
        }
        self.state = DeviceState::default();
        self.connected = false;
        self.device = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hid::Modifiers;

    #[test]
    fn test_key_table_covers_keycodes() {
        for c in (0x20u8..=0x7E).map(char::from) {
            let stroke = crate::hid::KeyMap::char_stroke(c).unwrap();
            assert!(hid_to_linux_keycode(stroke.keycode).is_some(), "{:?}", c);
        }
        for name in crate::hid::KeyMap::names() {
            let stroke = crate::hid::KeyMap::named(name).unwrap();
            assert!(hid_to_linux_keycode(stroke.keycode).is_some(), "{}", name);
        }
    }

    #[test]
    fn test_keyboard_diff() {
        let mut state = DeviceState::default();

        let events = state.apply(&Report::Keyboard(KeyboardReport::modifiers(Modifiers::LEFT_SHIFT)));
        assert_eq!(events, vec![RawEvent::Key { code: 42, pressed: true }]);

        let events = state.apply(&Report::Keyboard(KeyboardReport::key(
            Modifiers::LEFT_SHIFT,
            keycodes::KEY_H,
        )));
        assert_eq!(events, vec![RawEvent::Key { code: 35, pressed: true }]);

        let events = state.apply(&Report::Keyboard(KeyboardReport::released()));
        assert_eq!(
            events,
            vec![
                RawEvent::Key { code: 35, pressed: false },
                RawEvent::Key { code: 42, pressed: false },
            ]
        );
        assert!(state.apply(&Report::Keyboard(KeyboardReport::released())).is_empty());
    }

    #[test]
    fn test_mouse_diff() {
        let mut state = DeviceState::default();

        let events = state.apply(&Report::Mouse(MouseReport::new(MouseButtons::LEFT, 5, -3, 0)));
        assert_eq!(
            events,
            vec![
                RawEvent::Rel { axis: RelativeAxisType::REL_X.0, delta: 5 },
                RawEvent::Rel { axis: RelativeAxisType::REL_Y.0, delta: -3 },
                RawEvent::Key { code: BTN_LEFT, pressed: true },
            ]
        );

        let events = state.apply(&Report::Mouse(MouseReport::new(MouseButtons::LEFT, 0, 0, 1)));
        assert_eq!(
            events,
            vec![RawEvent::Rel { axis: RelativeAxisType::REL_WHEEL.0, delta: 1 }]
        );

        let events = state.apply(&Report::Mouse(MouseReport::released()));
        assert_eq!(events, vec![RawEvent::Key { code: BTN_LEFT, pressed: false }]);
    }

    #[test]
    fn test_release_all_lifts_keys_and_buttons() {
        let mut state = DeviceState::default();
        state.apply(&Report::Keyboard(KeyboardReport::key(
            Modifiers::LEFT_CTRL,
            keycodes::KEY_A,
        )));
        state.apply(&Report::Mouse(MouseReport::buttons(
            MouseButtons::LEFT | MouseButtons::MIDDLE,
        )));

        let events = state.release_all();
        assert_eq!(
            events,
            vec![
                RawEvent::Key { code: 29, pressed: false },
                RawEvent::Key { code: 30, pressed: false },
                RawEvent::Key { code: BTN_LEFT, pressed: false },
                RawEvent::Key { code: BTN_MIDDLE, pressed: false },
            ]
        );
        assert!(state.release_all().is_empty());
    }
}
