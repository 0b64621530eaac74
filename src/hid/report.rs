//! Report codec for keyboard and mouse input reports
//!
//! Keyboard payload (8 bytes): `[modifiers, reserved, k1, k2, k3, k4, k5, k6]`
//! Mouse payload (4 bytes): `[buttons, dx, dy, wheel]`
//!
//! With [`DescriptorLayout::Combo`] every frame is prefixed with its report ID.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::descriptor::{self, KEYBOARD_REPORT_ID, MOUSE_REPORT_ID};

/// Keyboard input payload length
pub const KEYBOARD_PAYLOAD_LEN: usize = 8;
/// Mouse input payload length
pub const MOUSE_PAYLOAD_LEN: usize = 4;
/// Number of simultaneous non-modifier keys in a boot keyboard report
pub const KEY_SLOTS: usize = 6;
/// Largest magnitude a relative axis byte can carry
pub const AXIS_LIMIT: i32 = 127;
/// Largest displacement one relative move may ask for, 64 full-axis reports
pub const MOVE_LIMIT: i32 = AXIS_LIMIT * 64;

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Frame length {actual} does not match {kind} report length {expected}")]
    Length {
        kind: ReportKind,
        expected: usize,
        actual: usize,
    },

    #[error("Unknown report ID {0:#04x}")]
    UnknownReportId(u8),

    #[error("Empty frame")]
    Empty,
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Which collection a report belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Keyboard,
    Mouse,
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportKind::Keyboard => write!(f, "keyboard"),
            ReportKind::Mouse => write!(f, "mouse"),
        }
    }
}

bitflags! {
    /// Keyboard modifier bits in HID order
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Modifiers: u8 {
        const LEFT_CTRL = 0b0000_0001;
        const LEFT_SHIFT = 0b0000_0010;
        const LEFT_ALT = 0b0000_0100;
        const LEFT_GUI = 0b0000_1000;
        const RIGHT_CTRL = 0b0001_0000;
        const RIGHT_SHIFT = 0b0010_0000;
        const RIGHT_ALT = 0b0100_0000;
        const RIGHT_GUI = 0b1000_0000;
    }
}

impl Default for Modifiers {
    fn default() -> Self {
        Self::empty()
    }
}

impl Modifiers {
    /// Parse a modifier name as used in configuration
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ctrl" | "control" | "left_ctrl" => Some(Self::LEFT_CTRL),
            "shift" | "left_shift" => Some(Self::LEFT_SHIFT),
            "alt" | "option" | "opt" | "left_alt" => Some(Self::LEFT_ALT),
            "gui" | "cmd" | "command" | "meta" | "super" | "left_gui" => Some(Self::LEFT_GUI),
            "right_ctrl" => Some(Self::RIGHT_CTRL),
            "right_shift" => Some(Self::RIGHT_SHIFT),
            "right_alt" | "altgr" => Some(Self::RIGHT_ALT),
            "right_gui" => Some(Self::RIGHT_GUI),
            _ => None,
        }
    }
}

bitflags! {
    /// Mouse button bits; the upper 5 bits are padding
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MouseButtons: u8 {
        const LEFT = 0b0000_0001;
        const RIGHT = 0b0000_0010;
        const MIDDLE = 0b0000_0100;
    }
}

impl Default for MouseButtons {
    fn default() -> Self {
        Self::empty()
    }
}

/// Clamp a displacement into the signed byte range of a relative axis
pub fn clamp_axis(value: i32) -> i8 {
    value.clamp(-AXIS_LIMIT, AXIS_LIMIT) as i8
}

/// State of the keyboard collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyboardReport {
    pub modifiers: Modifiers,
    pub keys: [u8; KEY_SLOTS],
}

impl KeyboardReport {
    /// All keys up
    pub fn released() -> Self {
        Self::default()
    }

    /// Modifiers only, no key slot in use
    pub fn modifiers(modifiers: Modifiers) -> Self {
        Self {
            modifiers,
            keys: [0; KEY_SLOTS],
        }
    }

    /// One key held together with `modifiers`
    pub fn key(modifiers: Modifiers, keycode: u8) -> Self {
        let mut keys = [0; KEY_SLOTS];
        keys[0] = keycode;
        Self { modifiers, keys }
    }

    /// Non-zero key slots
    pub fn pressed_keys(&self) -> impl Iterator<Item = u8> + '_ {
        self.keys.iter().copied().filter(|k| *k != 0)
    }
}

/// State of the mouse collection for one report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MouseReport {
    pub buttons: MouseButtons,
    pub dx: i8,
    pub dy: i8,
    pub wheel: i8,
}

impl MouseReport {
    /// Build a report, clamping each axis to [-127, 127]
    pub fn new(buttons: MouseButtons, dx: i32, dy: i32, wheel: i32) -> Self {
        Self {
            buttons,
            dx: clamp_axis(dx),
            dy: clamp_axis(dy),
            wheel: clamp_axis(wheel),
        }
    }

    pub fn buttons(buttons: MouseButtons) -> Self {
        Self {
            buttons,
            ..Default::default()
        }
    }

    pub fn released() -> Self {
        Self::default()
    }
}

/// A typed input report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Report {
    Keyboard(KeyboardReport),
    Mouse(MouseReport),
}

impl Report {
    pub fn kind(&self) -> ReportKind {
        match self {
            Report::Keyboard(_) => ReportKind::Keyboard,
            Report::Mouse(_) => ReportKind::Mouse,
        }
    }
}

/// An encoded report, ready for a transport
///
/// `kind` is routing metadata only; it never appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportFrame {
    pub kind: ReportKind,
    pub report_id: Option<u8>,
    bytes: Bytes,
}

impl ReportFrame {
    /// Wire bytes, including the report ID prefix if any
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Display for ReportFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.kind, descriptor::to_hex(&self.bytes))
    }
}

/// Encode a keyboard report holding a single key
pub fn encode_keyboard_report(modifiers: u8, keycode: u8, report_id: Option<u8>) -> Bytes {
    let mut buf = BytesMut::with_capacity(KEYBOARD_PAYLOAD_LEN + 1);
    put_keyboard(
        &mut buf,
        &KeyboardReport::key(Modifiers::from_bits_retain(modifiers), keycode),
        report_id,
    );
    buf.freeze()
}

/// Encode a mouse report, clamping the axes
pub fn encode_mouse_report(buttons: u8, dx: i32, dy: i32, wheel: i32, report_id: Option<u8>) -> Bytes {
    let mut buf = BytesMut::with_capacity(MOUSE_PAYLOAD_LEN + 1);
    put_mouse(
        &mut buf,
        &MouseReport::new(MouseButtons::from_bits_truncate(buttons), dx, dy, wheel),
        report_id,
    );
    buf.freeze()
}

fn put_keyboard(buf: &mut BytesMut, report: &KeyboardReport, report_id: Option<u8>) {
    if let Some(id) = report_id {
        buf.put_u8(id);
    }
    buf.put_u8(report.modifiers.bits());
    buf.put_u8(0);
    buf.put_slice(&report.keys);
}

fn put_mouse(buf: &mut BytesMut, report: &MouseReport, report_id: Option<u8>) {
    if let Some(id) = report_id {
        buf.put_u8(id);
    }
    buf.put_u8(report.buttons.bits());
    buf.put_i8(report.dx);
    buf.put_i8(report.dy);
    buf.put_i8(report.wheel);
}

/// Which descriptor variant is active
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorLayout {
    /// One collection per descriptor, no report IDs
    Separate,
    /// Keyboard and mouse multiplexed with report IDs 1 and 2
    #[default]
    Combo,
}

impl DescriptorLayout {
    pub fn report_id(&self, kind: ReportKind) -> Option<u8> {
        match (self, kind) {
            (DescriptorLayout::Separate, _) => None,
            (DescriptorLayout::Combo, ReportKind::Keyboard) => Some(KEYBOARD_REPORT_ID),
            (DescriptorLayout::Combo, ReportKind::Mouse) => Some(MOUSE_REPORT_ID),
        }
    }

    /// Descriptor defining the layout of `kind` frames
    pub fn descriptor(&self, kind: ReportKind) -> &'static [u8] {
        match (self, kind) {
            (DescriptorLayout::Separate, ReportKind::Keyboard) => descriptor::KEYBOARD,
            (DescriptorLayout::Separate, ReportKind::Mouse) => descriptor::MOUSE,
            (DescriptorLayout::Combo, _) => descriptor::COMBO,
        }
    }

    /// Wire length of a `kind` frame
    pub fn frame_len(&self, kind: ReportKind) -> usize {
        let payload = match kind {
            ReportKind::Keyboard => KEYBOARD_PAYLOAD_LEN,
            ReportKind::Mouse => MOUSE_PAYLOAD_LEN,
        };
        payload + usize::from(self.report_id(kind).is_some())
    }

    pub fn is_multiplexed(&self) -> bool {
        matches!(self, DescriptorLayout::Combo)
    }
}

impl fmt::Display for DescriptorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorLayout::Separate => write!(f, "separate"),
            DescriptorLayout::Combo => write!(f, "combo"),
        }
    }
}

/// Encodes and decodes reports for one descriptor layout
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportCodec {
    layout: DescriptorLayout,
}

impl ReportCodec {
    pub fn new(layout: DescriptorLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> DescriptorLayout {
        self.layout
    }

    pub fn encode(&self, report: &Report) -> ReportFrame {
        let kind = report.kind();
        let report_id = self.layout.report_id(kind);
        let mut buf = BytesMut::with_capacity(self.layout.frame_len(kind));

        match report {
            Report::Keyboard(r) => put_keyboard(&mut buf, r, report_id),
            Report::Mouse(r) => put_mouse(&mut buf, r, report_id),
        }

        ReportFrame {
            kind,
            report_id,
            bytes: buf.freeze(),
        }
    }

    /// Decode wire bytes received on a `channel`
    ///
    /// In the combo layout the report ID decides the kind and `channel` is
    /// ignored; in the separate layout each collection has its own channel.
    pub fn decode(&self, channel: ReportKind, wire: &[u8]) -> CodecResult<Report> {
        if wire.is_empty() {
            return Err(CodecError::Empty);
        }

        let mut buf = wire;
        let kind = match self.layout {
            DescriptorLayout::Separate => channel,
            DescriptorLayout::Combo => match buf.get_u8() {
                KEYBOARD_REPORT_ID => ReportKind::Keyboard,
                MOUSE_REPORT_ID => ReportKind::Mouse,
                other => return Err(CodecError::UnknownReportId(other)),
            },
        };

        let expected = self.layout.frame_len(kind);
        if wire.len() != expected {
            return Err(CodecError::Length {
                kind,
                expected,
                actual: wire.len(),
            });
        }

        Ok(match kind {
            ReportKind::Keyboard => {
                let modifiers = Modifiers::from_bits_retain(buf.get_u8());
                let _reserved = buf.get_u8();
                let mut keys = [0u8; KEY_SLOTS];
                buf.copy_to_slice(&mut keys);
                Report::Keyboard(KeyboardReport { modifiers, keys })
            }
            ReportKind::Mouse => Report::Mouse(MouseReport {
                buttons: MouseButtons::from_bits_truncate(buf.get_u8()),
                dx: buf.get_i8(),
                dy: buf.get_i8(),
                wheel: buf.get_i8(),
            }),
        })
    }

    /// Decode a frame produced by this codec
    pub fn decode_frame(&self, frame: &ReportFrame) -> CodecResult<Report> {
        self.decode(frame.kind, frame.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hid::keycodes;

    #[test]
    fn test_keyboard_report_layout() {
        let bytes = encode_keyboard_report(0x02, keycodes::KEY_H, None);
        assert_eq!(&bytes[..], &[0x02, 0x00, 0x0B, 0, 0, 0, 0, 0]);

        let bytes = encode_keyboard_report(0x00, keycodes::KEY_A, Some(KEYBOARD_REPORT_ID));
        assert_eq!(&bytes[..], &[0x01, 0x00, 0x00, 0x04, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_mouse_report_twos_complement() {
        let bytes = encode_mouse_report(0x01, -1, 100, -127, None);
        assert_eq!(&bytes[..], &[0x01, 0xFF, 0x64, 0x81]);

        let bytes = encode_mouse_report(0x04, 0, 0, 1, Some(MOUSE_REPORT_ID));
        assert_eq!(&bytes[..], &[0x02, 0x04, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_mouse_axes_are_clamped() {
        let bytes = encode_mouse_report(0, 300, -300, -128, None);
        assert_eq!(&bytes[..], &[0x00, 0x7F, 0x81, 0x81]);
    }

    #[test]
    fn test_mouse_padding_bits_dropped() {
        let bytes = encode_mouse_report(0xFF, 0, 0, 0, None);
        assert_eq!(bytes[0], 0x07);
    }

    #[test]
    fn test_roundtrip_both_layouts() {
        let reports = [
            Report::Keyboard(KeyboardReport::key(
                Modifiers::LEFT_CTRL.union(Modifiers::LEFT_ALT),
                keycodes::KEY_RIGHT_ARROW,
            )),
            Report::Keyboard(KeyboardReport::released()),
            Report::Mouse(MouseReport::new(MouseButtons::RIGHT, -42, 17, -3)),
            Report::Mouse(MouseReport::released()),
        ];

        for layout in [DescriptorLayout::Separate, DescriptorLayout::Combo] {
            let codec = ReportCodec::new(layout);
            for report in &reports {
                let frame = codec.encode(report);
                assert_eq!(frame.len(), layout.frame_len(report.kind()));
                assert_eq!(codec.decode_frame(&frame).unwrap(), *report);
            }
        }
    }

    #[test]
    fn test_frame_lengths_match_descriptors() {
        for layout in [DescriptorLayout::Separate, DescriptorLayout::Combo] {
            for kind in [ReportKind::Keyboard, ReportKind::Mouse] {
                let bits = descriptor::input_report_bits(layout.descriptor(kind));
                let payload_bits = bits[&layout.report_id(kind)];
                let id_len = usize::from(layout.report_id(kind).is_some());
                assert_eq!(payload_bits / 8 + id_len, layout.frame_len(kind));
            }
        }
    }

    #[test]
    fn test_combo_decode_uses_report_id() {
        let codec = ReportCodec::new(DescriptorLayout::Combo);
        let report = codec
            .decode(ReportKind::Keyboard, &[0x02, 0x01, 0x05, 0xFB, 0x00])
            .unwrap();
        assert_eq!(
            report,
            Report::Mouse(MouseReport::new(MouseButtons::LEFT, 5, -5, 0))
        );
    }

    #[test]
    fn test_decode_errors() {
        let codec = ReportCodec::new(DescriptorLayout::Combo);
        assert_eq!(
            codec.decode(ReportKind::Mouse, &[0x07, 0, 0, 0, 0]),
            Err(CodecError::UnknownReportId(0x07))
        );
        assert_eq!(codec.decode(ReportKind::Mouse, &[]), Err(CodecError::Empty));

        let codec = ReportCodec::new(DescriptorLayout::Separate);
        assert!(matches!(
            codec.decode(ReportKind::Keyboard, &[0, 0, 0, 0]),
            Err(CodecError::Length { expected: 8, actual: 4, .. })
        ));
    }

    #[test]
    fn test_modifier_iteration_order() {
        let mods = Modifiers::LEFT_GUI
            .union(Modifiers::LEFT_CTRL)
            .union(Modifiers::LEFT_ALT);
        let order: Vec<u8> = mods.iter().map(|m| m.bits()).collect();
        assert_eq!(order, vec![0x01, 0x04, 0x08]);
    }

    #[test]
    fn test_button_bits_truncate_padding() {
        let buttons = MouseButtons::from_bits_truncate(0b1111_1001);
        assert_eq!(buttons, MouseButtons::LEFT);
        assert_eq!(MouseButtons::default(), MouseButtons::empty());

        let mut held = MouseButtons::LEFT | MouseButtons::MIDDLE;
        held.remove(MouseButtons::LEFT);
        assert_eq!(held.bits(), 0x04);

        let every = Modifiers::from_bits_retain(0xFF);
        assert_eq!(every.iter().count(), 8);
        assert_eq!(every.iter().last(), Some(Modifiers::RIGHT_GUI));
    }

    #[test]
    fn test_modifier_names() {
        assert_eq!(Modifiers::from_name("Ctrl"), Some(Modifiers::LEFT_CTRL));
        assert_eq!(Modifiers::from_name("option"), Some(Modifiers::LEFT_ALT));
        assert_eq!(Modifiers::from_name("cmd"), Some(Modifiers::LEFT_GUI));
        assert_eq!(Modifiers::from_name("hyper"), None);
    }
}
