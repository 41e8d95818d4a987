use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Clinical category of a completed reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BpStatus {
    Normal,
    Elevated,
    High,
    #[serde(rename = "hypertensive")]
    HypertensiveCrisis,
}

impl BpStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Elevated => "Elevated",
            Self::High => "High",
            Self::HypertensiveCrisis => "Hypertensive crisis",
        }
    }
}

/// A completed blood-pressure measurement.
///
/// Values are whole mmHg / bpm. `heart_rate` is 0 when the cuff did not
/// report a pulse. Only `synced` changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub systolic: u16,
    pub diastolic: u16,
    pub mean_arterial_pressure: u16,
    pub heart_rate: u16,
    pub timestamp: DateTime<Utc>,
    pub status: BpStatus,
    #[serde(default)]
    pub synced: bool,
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} mmHg (MAP {}), pulse {} bpm - {}",
            self.systolic,
            self.diastolic,
            self.mean_arterial_pressure,
            self.heart_rate,
            self.status.label()
        )
    }
}

/// Error shown to the user alongside the device state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    TransportUnavailable,
    ConnectionCancelled,
    AuthenticationRequired,
    DeviceNotFound,
    PermissionDenied,
    ConnectionTimedOut,
    MeasurementTimedOut,
    DeviceDisconnected,
    /// START or CANCEL could not be written in either write mode
    CommandFailed(String),
    /// Anything the transport could not categorize, with its raw message
    Transport(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportUnavailable => {
                write!(f, "Bluetooth is not available on this host.")
            }
            Self::ConnectionCancelled => write!(f, "Connection cancelled by user"),
            Self::AuthenticationRequired => write!(
                f,
                "Authentication failed. Please pair the device in your Bluetooth settings first, then try again."
            ),
            Self::DeviceNotFound => write!(
                f,
                "Device not found. Make sure the cuff is turned on and nearby."
            ),
            Self::PermissionDenied => write!(
                f,
                "Bluetooth permission denied. Please allow Bluetooth access."
            ),
            Self::ConnectionTimedOut => write!(f, "Connection timed out. Please try again."),
            Self::MeasurementTimedOut => write!(f, "Measurement timed out. Please try again."),
            Self::DeviceDisconnected => write!(f, "Device disconnected"),
            Self::CommandFailed(message) => write!(f, "Failed to send command: {}", message),
            Self::Transport(message) => write!(f, "{}", message),
        }
    }
}

/// Observable projection of the controller state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceState {
    pub connected: bool,
    pub connecting: bool,
    pub scanning: bool,
    pub measuring: bool,
    pub device_name: Option<String>,
    pub error: Option<DeviceError>,
}

/// Commands accepted by a running controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerCommand {
    Connect,
    Disconnect,
    StartMeasurement,
    StopMeasurement,
    ClearError,
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_reading_serializes_with_camel_case_fields() {
        let reading = Reading {
            systolic: 121,
            diastolic: 79,
            mean_arterial_pressure: 93,
            heart_rate: 64,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap(),
            status: BpStatus::Elevated,
            synced: false,
        };

        let json = serde_json::to_value(&reading).unwrap();
        assert_eq!(json["meanArterialPressure"], 93);
        assert_eq!(json["heartRate"], 64);
        assert_eq!(json["status"], "elevated");
        assert_eq!(json["timestamp"], "2024-03-01T08:30:00Z");

        let back: Reading = serde_json::from_value(json).unwrap();
        assert_eq!(back, reading);
    }

    #[test]
    fn test_crisis_status_uses_stored_name() {
        let json = serde_json::to_string(&BpStatus::HypertensiveCrisis).unwrap();
        assert_eq!(json, "\"hypertensive\"");
    }

    #[test]
    fn test_missing_synced_flag_defaults_to_false() {
        let json = r#"{"systolic":118,"diastolic":76,"meanArterialPressure":90,
            "heartRate":0,"timestamp":"2024-01-02T03:04:05Z","status":"normal"}"#;
        let reading: Reading = serde_json::from_str(json).unwrap();
        assert!(!reading.synced);
        assert_eq!(reading.status, BpStatus::Normal);
    }
}
