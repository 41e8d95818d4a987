use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "bp_monitor".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Which Bluetooth backend to use. Resolved once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPreference {
    /// WinRT where it is available, btleplug everywhere else
    #[default]
    Auto,
    Btleplug,
    WinRt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    #[serde(default)]
    pub transport: TransportPreference,

    // BLE Settings
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_measurement_uuid")]
    pub ble_measurement_char_uuid: String,
    #[serde(default = "default_control_uuid")]
    pub ble_control_char_uuid: String,
    #[serde(default = "default_name_prefixes")]
    pub device_name_prefixes: Vec<String>,

    // Vendor command payloads for the control characteristic
    #[serde(default = "default_start_command")]
    pub start_command: Vec<u8>,
    #[serde(default = "default_cancel_command")]
    pub cancel_command: Vec<u8>,

    // Timeouts (seconds)
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_measurement_timeout_secs")]
    pub measurement_timeout_secs: u64,

    /// Where the reading history lives; platform data dir when unset
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            transport: TransportPreference::default(),

            ble_service_uuid: default_service_uuid(),
            ble_measurement_char_uuid: default_measurement_uuid(),
            ble_control_char_uuid: default_control_uuid(),
            device_name_prefixes: default_name_prefixes(),

            start_command: default_start_command(),
            cancel_command: default_cancel_command(),

            scan_timeout_secs: default_scan_timeout_secs(),
            connection_timeout_secs: default_connection_timeout_secs(),
            measurement_timeout_secs: default_measurement_timeout_secs(),

            data_dir: None,
        }
    }
}

impl Settings {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn measurement_timeout(&self) -> Duration {
        Duration::from_secs(self.measurement_timeout_secs)
    }

    /// Directory holding the reading history
    pub fn resolve_data_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let mut path = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
        path.push("BpMonitor");
        Ok(path)
    }
}

fn default_service_uuid() -> String {
    "00001810-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_measurement_uuid() -> String {
    "00002a35-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_control_uuid() -> String {
    "583cb5b3-875d-40ed-9098-c39eb0c1983d".to_string()
}
fn default_name_prefixes() -> Vec<String> {
    vec!["Qardio".to_string(), "QardioArm".to_string()]
}
fn default_start_command() -> Vec<u8> {
    vec![0xF1, 0x01]
}
fn default_cancel_command() -> Vec<u8> {
    vec![0xF1, 0x02]
}
fn default_scan_timeout_secs() -> u64 {
    10
}
fn default_connection_timeout_secs() -> u64 {
    30
}
fn default_measurement_timeout_secs() -> u64 {
    120
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults if it is missing or invalid
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BpMonitor");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }
}
