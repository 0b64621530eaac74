//! HID report descriptors
//!
//! The byte arrays here and the layouts in [`super::report`] are versioned
//! together: a change to one must be mirrored in the other. The tests at the
//! bottom walk each descriptor and check the input report sizes against the
//! codec.

use std::collections::BTreeMap;
use std::fmt::Write;

/// Report ID of the keyboard collection in [`COMBO`]
pub const KEYBOARD_REPORT_ID: u8 = 0x01;
/// Report ID of the mouse collection in [`COMBO`]
pub const MOUSE_REPORT_ID: u8 = 0x02;

/// Boot keyboard, no report ID
///
/// Input (8 bytes): modifier bits, reserved, 6 key slots.
/// Output (1 byte): 5 LED bits + 3 padding.
pub const KEYBOARD: &[u8] = &[
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x06, // Usage (Keyboard)
    0xA1, 0x01, // Collection (Application)
    0x05, 0x07, //   Usage Page (Key Codes)
    0x19, 0xE0, //   Usage Minimum (224)
    0x29, 0xE7, //   Usage Maximum (231)
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x01, //   Logical Maximum (1)
    0x75, 0x01, //   Report Size (1)
    0x95, 0x08, //   Report Count (8)
    0x81, 0x02, //   Input (Data, Variable, Absolute) - modifier byte
    0x95, 0x01, //   Report Count (1)
    0x75, 0x08, //   Report Size (8)
    0x81, 0x01, //   Input (Constant) - reserved byte
    0x95, 0x05, //   Report Count (5)
    0x75, 0x01, //   Report Size (1)
    0x05, 0x08, //   Usage Page (LEDs)
    0x19, 0x01, //   Usage Minimum (1)
    0x29, 0x05, //   Usage Maximum (5)
    0x91, 0x02, //   Output (Data, Variable, Absolute) - LEDs
    0x95, 0x01, //   Report Count (1)
    0x75, 0x03, //   Report Size (3)
    0x91, 0x01, //   Output (Constant) - LED padding
    0x95, 0x06, //   Report Count (6)
    0x75, 0x08, //   Report Size (8)
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x65, //   Logical Maximum (101)
    0x05, 0x07, //   Usage Page (Key Codes)
    0x19, 0x00, //   Usage Minimum (0)
    0x29, 0x65, //   Usage Maximum (101)
    0x81, 0x00, //   Input (Data, Array) - key slots
    0xC0, // End Collection
];

/// 3-button relative mouse with wheel, no report ID
///
/// Input (4 bytes): buttons (3 bits + 5 padding), X, Y, wheel (signed).
pub const MOUSE: &[u8] = &[
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x02, // Usage (Mouse)
    0xA1, 0x01, // Collection (Application)
    0x09, 0x01, //   Usage (Pointer)
    0xA1, 0x00, //   Collection (Physical)
    0x05, 0x09, //     Usage Page (Button)
    0x19, 0x01, //     Usage Minimum (1)
    0x29, 0x03, //     Usage Maximum (3)
    0x15, 0x00, //     Logical Minimum (0)
    0x25, 0x01, //     Logical Maximum (1)
    0x95, 0x03, //     Report Count (3)
    0x75, 0x01, //     Report Size (1)
    0x81, 0x02, //     Input (Data, Variable, Absolute) - buttons
    0x95, 0x01, //     Report Count (1)
    0x75, 0x05, //     Report Size (5)
    0x81, 0x01, //     Input (Constant) - padding
    0x05, 0x01, //     Usage Page (Generic Desktop)
    0x09, 0x30, //     Usage (X)
    0x09, 0x31, //     Usage (Y)
    0x09, 0x38, //     Usage (Wheel)
    0x15, 0x81, //     Logical Minimum (-127)
    0x25, 0x7F, //     Logical Maximum (127)
    0x75, 0x08, //     Report Size (8)
    0x95, 0x03, //     Report Count (3)
    0x81, 0x06, //     Input (Data, Variable, Relative) - X, Y, wheel
    0xC0, //   End Collection
    0xC0, // End Collection
];

/// Keyboard (Report ID 1) and mouse (Report ID 2) in one descriptor
pub const COMBO: &[u8] = &[
    // Keyboard
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x06, // Usage (Keyboard)
    0xA1, 0x01, // Collection (Application)
    0x85, 0x01, //   Report ID (1)
    0x05, 0x07, //   Usage Page (Key Codes)
    0x19, 0xE0, //   Usage Minimum (224)
    0x29, 0xE7, //   Usage Maximum (231)
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x01, //   Logical Maximum (1)
    0x75, 0x01, //   Report Size (1)
    0x95, 0x08, //   Report Count (8)
    0x81, 0x02, //   Input (Data, Variable, Absolute) - modifier byte
    0x95, 0x01, //   Report Count (1)
    0x75, 0x08, //   Report Size (8)
    0x81, 0x01, //   Input (Constant) - reserved byte
    0x95, 0x05, //   Report Count (5)
    0x75, 0x01, //   Report Size (1)
    0x05, 0x08, //   Usage Page (LEDs)
    0x19, 0x01, //   Usage Minimum (1)
    0x29, 0x05, //   Usage Maximum (5)
    0x91, 0x02, //   Output (Data, Variable, Absolute) - LEDs
    0x95, 0x01, //   Report Count (1)
    0x75, 0x03, //   Report Size (3)
    0x91, 0x01, //   Output (Constant) - LED padding
    0x95, 0x06, //   Report Count (6)
    0x75, 0x08, //   Report Size (8)
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x65, //   Logical Maximum (101)
    0x05, 0x07, //   Usage Page (Key Codes)
    0x19, 0x00, //   Usage Minimum (0)
    0x29, 0x65, //   Usage Maximum (101)
    0x81, 0x00, //   Input (Data, Array) - key slots
    0xC0, // End Collection
    // Mouse
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x02, // Usage (Mouse)
    0xA1, 0x01, // Collection (Application)
    0x85, 0x02, //   Report ID (2)
    0x09, 0x01, //   Usage (Pointer)
    0xA1, 0x00, //   Collection (Physical)
    0x05, 0x09, //     Usage Page (Button)
    0x19, 0x01, //     Usage Minimum (1)
    0x29, 0x03, //     Usage Maximum (3)
    0x15, 0x00, //     Logical Minimum (0)
    0x25, 0x01, //     Logical Maximum (1)
    0x95, 0x03, //     Report Count (3)
    0x75, 0x01, //     Report Size (1)
    0x81, 0x02, //     Input (Data, Variable, Absolute) - buttons
    0x95, 0x01, //     Report Count (1)
    0x75, 0x05, //     Report Size (5)
    0x81, 0x01, //     Input (Constant) - padding
    0x05, 0x01, //     Usage Page (Generic Desktop)
    0x09, 0x30, //     Usage (X)
    0x09, 0x31, //     Usage (Y)
    0x09, 0x38, //     Usage (Wheel)
    0x15, 0x81, //     Logical Minimum (-127)
    0x25, 0x7F, //     Logical Maximum (127)
    0x75, 0x08, //     Report Size (8)
    0x95, 0x03, //     Report Count (3)
    0x81, 0x06, //     Input (Data, Variable, Relative) - X, Y, wheel
    0xC0, //   End Collection
    0xC0, // End Collection
];

/// SDP HID device subclass for a combo keyboard/pointing device
pub const SUBCLASS_COMBO: u8 = 0xC0;

/// Sum the Input item sizes of a descriptor, in bits, per report ID
///
/// Only the items that affect input report layout are interpreted: Report
/// Size, Report Count, Report ID and Input. Long items are skipped.
pub fn input_report_bits(descriptor: &[u8]) -> BTreeMap<Option<u8>, usize> {
    let mut totals = BTreeMap::new();
    let mut report_size = 0usize;
    let mut report_count = 0usize;
    let mut report_id = None;
    let mut i = 0;

    while i < descriptor.len() {
        let prefix = descriptor[i];

        if prefix == 0xFE {
            // Long item: [0xFE, size, tag, data...]
            let size = descriptor.get(i + 1).copied().unwrap_or(0) as usize;
            i += 3 + size;
            continue;
        }

        let size = match prefix & 0x03 {
            3 => 4,
            n => n as usize,
        };
        let data = descriptor
            .get(i + 1..i + 1 + size)
            .unwrap_or(&[])
            .iter()
            .rev()
            .fold(0u32, |acc, b| (acc << 8) | *b as u32) as usize;

        match prefix & 0xFC {
            0x74 => report_size = data,
            0x94 => report_count = data,
            0x84 => report_id = Some(data as u8),
            0x80 => *totals.entry(report_id).or_insert(0) += report_size * report_count,
            _ => {}
        }

        i += 1 + size;
    }

    totals
}

/// Render bytes as lowercase hex without separators
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}

/// Build the Bluetooth HID SDP service record for a descriptor
///
/// The XML form is what BlueZ's profile manager accepts as `ServiceRecord`.
/// PSMs 0x11 (control) and 0x13 (interrupt) are fixed by the HID profile.
pub fn sdp_record(device_name: &str, descriptor: &[u8], subclass: u8) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" ?>
<record>
  <attribute id="0x0001">
    <sequence>
      <uuid value="0x1124" />
    </sequence>
  </attribute>
  <attribute id="0x0004">
    <sequence>
      <sequence>
        <uuid value="0x0100" />
        <uint16 value="0x0011" />
      </sequence>
      <sequence>
        <uuid value="0x0011" />
      </sequence>
    </sequence>
  </attribute>
  <attribute id="0x0005">
    <sequence>
      <uuid value="0x1002" />
    </sequence>
  </attribute>
  <attribute id="0x000d">
    <sequence>
      <sequence>
        <sequence>
          <uuid value="0x0100" />
          <uint16 value="0x0013" />
        </sequence>
        <sequence>
          <uuid value="0x0011" />
        </sequence>
      </sequence>
    </sequence>
  </attribute>
  <attribute id="0x0100">
    <text value="{name}" />
  </attribute>
  <attribute id="0x0200">
    <uint16 value="0x0111" />
  </attribute>
  <attribute id="0x0201">
    <uint16 value="0x0100" />
  </attribute>
  <attribute id="0x0202">
    <uint8 value="0x{subclass:02x}" />
  </attribute>
  <attribute id="0x0203">
    <uint8 value="0x00" />
  </attribute>
  <attribute id="0x0204">
    <boolean value="true" />
  </attribute>
  <attribute id="0x0205">
    <boolean value="true" />
  </attribute>
  <attribute id="0x0206">
    <sequence>
      <sequence>
        <uint8 value="0x22" />
        <text encoding="hex" value="{descriptor}" />
      </sequence>
    </sequence>
  </attribute>
  <attribute id="0x0207">
    <sequence>
      <sequence>
        <uint16 value="0x0409" />
        <uint16 value="0x0100" />
      </sequence>
    </sequence>
  </attribute>
  <attribute id="0x020b">
    <uint16 value="0x0100" />
  </attribute>
  <attribute id="0x020e">
    <boolean value="true" />
  </attribute>
</record>
"#,
        name = xml_escape(device_name),
        subclass = subclass,
        descriptor = to_hex(descriptor),
    )
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyboard_input_is_eight_bytes() {
        let bits = input_report_bits(KEYBOARD);
        assert_eq!(bits.len(), 1);
        assert_eq!(bits[&None], 64);
    }

    #[test]
    fn test_mouse_input_is_four_bytes() {
        let bits = input_report_bits(MOUSE);
        assert_eq!(bits[&None], 32);
    }

    #[test]
    fn test_combo_report_ids() {
        let bits = input_report_bits(COMBO);
        assert_eq!(bits.len(), 2);
        assert_eq!(bits[&Some(KEYBOARD_REPORT_ID)], 64);
        assert_eq!(bits[&Some(MOUSE_REPORT_ID)], 32);
    }

    #[test]
    fn test_descriptors_balance_collections() {
        for descriptor in [KEYBOARD, MOUSE, COMBO] {
            let opens = descriptor.windows(2).filter(|w| w[0] == 0xA1).count();
            let closes = descriptor.iter().filter(|b| **b == 0xC0).count();
            assert_eq!(opens, closes);
        }
    }

    #[test]
    fn test_sdp_record_embeds_descriptor() {
        let record = sdp_record("Pi <5>", COMBO, SUBCLASS_COMBO);
        assert!(record.contains(&to_hex(COMBO)));
        assert!(record.contains("Pi &lt;5&gt;"));
        assert!(record.contains(r#"<uint8 value="0xc0" />"#));
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0x05, 0xA1, 0xff]), "05a1ff");
    }
}
