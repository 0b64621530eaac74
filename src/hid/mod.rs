//! HID module - Report descriptors, report codec and key tables
//!
//! Everything in here is pure: no I/O, no timing. The transports consume
//! [`ReportFrame`]s produced by the [`ReportCodec`].

pub mod descriptor;
pub mod keycodes;
pub mod keymap;
mod report;

pub use keymap::{ComboKey, KeyMap, KeyStroke};
pub use report::*;
