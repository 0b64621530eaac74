//! Configuration module
//!
//! Handles loading, validating and saving hidbridge configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::hid::{DescriptorLayout, Modifiers};

/// Default command listener port
pub const DEFAULT_PORT: u16 = 5555;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    /// Command listener settings
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Device identity and report layout
    #[serde(default)]
    pub hid: HidConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub bluetooth: BluetoothConfig,

    #[serde(default)]
    pub gadget: GadgetConfig,

    #[serde(default)]
    pub dry_run: DryRunConfig,

    #[serde(default)]
    pub session: SessionConfig,

    /// Gesture timing and scaling
    #[serde(default)]
    pub timing: TimingConfig,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

/// Command listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Longer lines are dropped as malformed
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_line_length() -> usize {
    4096
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            max_line_length: default_max_line_length(),
        }
    }
}

/// HID identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HidConfig {
    #[serde(default)]
    pub layout: DescriptorLayout,
    /// Name advertised to the host
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_vendor_id")]
    pub vendor_id: u16,
    #[serde(default = "default_product_id")]
    pub product_id: u16,
    #[serde(default = "default_version")]
    pub version: u16,
    /// Modifiers added to plain characters and raw keycodes in KEY_COMBO
    #[serde(default = "default_combo_modifiers")]
    pub combo_modifiers: Vec<String>,
}

fn default_device_name() -> String {
    "Pi5-Keyboard".to_string()
}

fn default_vendor_id() -> u16 {
    0x1D6B
}

fn default_product_id() -> u16 {
    0x0104
}

fn default_version() -> u16 {
    0x0100
}

fn default_combo_modifiers() -> Vec<String> {
    vec!["ctrl".to_string(), "alt".to_string()]
}

impl Default for HidConfig {
    fn default() -> Self {
        Self {
            layout: DescriptorLayout::default(),
            device_name: default_device_name(),
            vendor_id: default_vendor_id(),
            product_id: default_product_id(),
            version: default_version(),
            combo_modifiers: default_combo_modifiers(),
        }
    }
}

impl HidConfig {
    /// Combined modifier bits of `combo_modifiers`
    pub fn combo_modifier_bits(&self) -> ConfigResult<Modifiers> {
        let mut bits = Modifiers::empty();
        for name in &self.combo_modifiers {
            let modifier = Modifiers::from_name(name)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown modifier '{}'", name)))?;
            bits.insert(modifier);
        }
        Ok(bits)
    }
}

/// Transport backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Uinput,
    Bluetooth,
    Uhid,
    Gadget,
    #[default]
    DryRun,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::Uinput,
        BackendKind::Bluetooth,
        BackendKind::Uhid,
        BackendKind::Gadget,
        BackendKind::DryRun,
    ];

    /// Backends with a single report channel need report IDs
    pub fn requires_combo(&self) -> bool {
        matches!(self, BackendKind::Bluetooth | BackendKind::Uhid)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Uinput => "uinput",
            BackendKind::Bluetooth => "bluetooth",
            BackendKind::Uhid => "uhid",
            BackendKind::Gadget => "gadget",
            BackendKind::DryRun => "dry-run",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendKind::ALL
            .into_iter()
            .find(|b| b.to_string() == s.to_ascii_lowercase())
            .ok_or_else(|| ConfigError::Invalid(format!("unknown backend '{}'", s)))
    }
}

/// Transport configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub backend: BackendKind,
}

/// Bluetooth classic HID configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BluetoothConfig {
    #[serde(default = "default_control_psm")]
    pub control_psm: u16,
    #[serde(default = "default_interrupt_psm")]
    pub interrupt_psm: u16,
    /// Command run to make the adapter discoverable (empty = skip)
    #[serde(default = "default_advertise_command")]
    pub advertise_command: Vec<String>,
    /// Register the HID service record with BlueZ over D-Bus
    #[serde(default = "default_true")]
    pub register_profile: bool,
    #[serde(default = "default_adapter")]
    pub adapter: String,
    #[serde(default = "default_true")]
    pub require_authentication: bool,
    #[serde(default)]
    pub require_authorization: bool,
}

fn default_control_psm() -> u16 {
    17
}

fn default_interrupt_psm() -> u16 {
    19
}

fn default_true() -> bool {
    true
}

fn default_adapter() -> String {
    "hci0".to_string()
}

fn default_advertise_command() -> Vec<String> {
    ["bluetoothctl", "discoverable", "on"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            control_psm: default_control_psm(),
            interrupt_psm: default_interrupt_psm(),
            advertise_command: default_advertise_command(),
            register_profile: true,
            adapter: default_adapter(),
            require_authentication: true,
            require_authorization: false,
        }
    }
}

/// USB HID gadget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GadgetConfig {
    #[serde(default = "default_keyboard_device")]
    pub keyboard_device: PathBuf,
    /// Unused with the combo layout
    #[serde(default = "default_mouse_device")]
    pub mouse_device: PathBuf,
}

fn default_keyboard_device() -> PathBuf {
    PathBuf::from("/dev/hidg0")
}

fn default_mouse_device() -> PathBuf {
    PathBuf::from("/dev/hidg1")
}

impl Default for GadgetConfig {
    fn default() -> Self {
        Self {
            keyboard_device: default_keyboard_device(),
            mouse_device: default_mouse_device(),
        }
    }
}

/// Dry-run recorder configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DryRunConfig {
    /// Append every frame as a JSON line
    pub record_path: Option<PathBuf>,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Pause between a disconnect and re-advertising
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
}

fn default_reconnect_delay() -> u64 {
    1000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay(),
        }
    }
}

/// Gesture timing and scaling
///
/// Defaults are the `ios` preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Counts per unit of normalised TAP offset
    ///
    /// Taps move relative to wherever the pointer is, so a series of taps
    /// drifts from the intended absolute positions.
    pub tap_scale: f64,
    pub tap_settle_ms: u64,
    pub double_tap_gap_ms: u64,
    pub swipe_steps: u32,
    /// Counts per unit of SWIPE displacement, per step
    pub swipe_scale: f64,
    pub swipe_step_delay_ms: u64,
    /// Hold the left button across swipe steps
    pub swipe_drag: bool,
    pub type_char_delay_ms: u64,
    pub type_key_hold_ms: u64,
    pub combo_modifier_delay_ms: u64,
    pub combo_hold_ms: u64,
    pub click_hold_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self::ios()
    }
}

impl TimingConfig {
    pub const PRESETS: [&'static str; 3] = ["ios", "gadget", "fast"];

    /// Bluetooth HID to an iOS host
    pub fn ios() -> Self {
        Self {
            tap_scale: 200.0,
            tap_settle_ms: 50,
            double_tap_gap_ms: 100,
            swipe_steps: 15,
            swipe_scale: 10.0,
            swipe_step_delay_ms: 20,
            swipe_drag: false,
            type_char_delay_ms: 30,
            type_key_hold_ms: 0,
            combo_modifier_delay_ms: 10,
            combo_hold_ms: 100,
            click_hold_ms: 50,
        }
    }

    /// USB gadget endpoints, which need an explicit key hold
    pub fn gadget() -> Self {
        Self {
            type_key_hold_ms: 40,
            type_char_delay_ms: 20,
            ..Self::ios()
        }
    }

    /// No delays at all
    pub fn fast() -> Self {
        Self {
            tap_settle_ms: 0,
            double_tap_gap_ms: 0,
            swipe_step_delay_ms: 0,
            type_char_delay_ms: 0,
            type_key_hold_ms: 0,
            combo_modifier_delay_ms: 0,
            combo_hold_ms: 0,
            click_hold_ms: 0,
            ..Self::ios()
        }
    }

    pub fn preset(name: &str) -> ConfigResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ios" => Ok(Self::ios()),
            "gadget" => Ok(Self::gadget()),
            "fast" => Ok(Self::fast()),
            other => Err(ConfigError::Invalid(format!(
                "unknown timing profile '{}' (expected one of {})",
                other,
                Self::PRESETS.join(", ")
            ))),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("hidbridge/config.toml")),
            Some(PathBuf::from("./hidbridge.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject settings that cannot work together
    pub fn validate(&self) -> ConfigResult<()> {
        self.hid.combo_modifier_bits()?;

        if self.timing.swipe_steps == 0 {
            return Err(ConfigError::Invalid("timing.swipe_steps must be > 0".into()));
        }
        if !self.timing.tap_scale.is_finite() || !self.timing.swipe_scale.is_finite() {
            return Err(ConfigError::Invalid("timing scales must be finite".into()));
        }
        if self.listener.max_line_length == 0 {
            return Err(ConfigError::Invalid(
                "listener.max_line_length must be > 0".into(),
            ));
        }
        if self.transport.backend.requires_combo() && self.hid.layout != DescriptorLayout::Combo {
            return Err(ConfigError::Invalid(format!(
                "backend '{}' requires the combo layout",
                self.transport.backend
            )));
        }
        if self.transport.backend == BackendKind::Bluetooth
            && self.bluetooth.control_psm == self.bluetooth.interrupt_psm
        {
            return Err(ConfigError::Invalid(
                "bluetooth control and interrupt PSMs must differ".into(),
            ));
        }

        Ok(())
    }

    /// Listener socket address as a string
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.listener.bind_address, self.listener.port)
    }
}

/// Sample configuration with every section filled in
pub fn sample_config() -> Config {
    Config {
        transport: TransportConfig {
            backend: BackendKind::Bluetooth,
        },
        dry_run: DryRunConfig {
            record_path: Some(PathBuf::from("/tmp/hidbridge-frames.jsonl")),
        },
        ..Default::default()
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    Ok(toml::to_string_pretty(&sample_config())?)
}
