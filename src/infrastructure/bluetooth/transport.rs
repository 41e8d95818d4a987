//! Transport Adapter Module
//!
//! The capability set the controller needs from a Bluetooth stack, and the
//! types that cross that seam. Backends push link events into the session
//! queue they are handed instead of calling back into the controller.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use super::btleplug_backend::BtleplugTransport;
use crate::domain::models::DeviceError;
use crate::domain::settings::{Settings, TransportPreference};

/// Identifies a discovered peripheral for the backend that found it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceRef {
    /// Backend-specific identifier (platform peripheral id or hex address)
    pub id: String,
    pub name: Option<String>,
}

/// A scan result
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub device: DeviceRef,
    pub services: Vec<Uuid>,
    pub rssi: Option<i16>,
}

/// What to look for while scanning. A device matches if it advertises the
/// service or its name starts with one of the prefixes.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanFilter {
    pub service: Uuid,
    pub name_prefixes: Vec<String>,
}

impl ScanFilter {
    pub fn matches(&self, found: &DiscoveredDevice) -> bool {
        if found.services.contains(&self.service) {
            return true;
        }
        found.device.name.as_deref().is_some_and(|name| {
            self.name_prefixes
                .iter()
                .any(|prefix| name.starts_with(prefix.as_str()))
        })
    }
}

/// Events a backend delivers for an open session, in radio order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    FrameReceived(Vec<u8>),
    DeviceDisconnected,
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("operation cancelled by user")]
    Cancelled,
    #[error("authentication required, pair the device first")]
    AuthenticationRequired,
    #[error("device not found")]
    NotFound,
    #[error("bluetooth permission denied")]
    PermissionDenied,
    #[error("bluetooth transport unavailable")]
    Unavailable,
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Categorize a platform failure that only comes with a free-text description
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("cancel") {
            Self::Cancelled
        } else if lower.contains("auth") {
            Self::AuthenticationRequired
        } else if lower.contains("not found") || lower.contains("no device") {
            Self::NotFound
        } else if lower.contains("denied") || lower.contains("permission") {
            Self::PermissionDenied
        } else {
            Self::Other(message.to_string())
        }
    }
}

impl From<TransportError> for DeviceError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Cancelled => DeviceError::ConnectionCancelled,
            TransportError::AuthenticationRequired => DeviceError::AuthenticationRequired,
            TransportError::NotFound => DeviceError::DeviceNotFound,
            TransportError::PermissionDenied => DeviceError::PermissionDenied,
            TransportError::Unavailable => DeviceError::TransportUnavailable,
            TransportError::Other(message) => DeviceError::Transport(message),
        }
    }
}

/// A Bluetooth LE central as seen by the controller
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    async fn is_available(&self) -> bool;

    /// Start discovery. Only devices matching `filter` are forwarded, and
    /// they keep arriving until [`stop_scan`](Self::stop_scan).
    async fn scan(
        &self,
        filter: &ScanFilter,
    ) -> Result<mpsc::UnboundedReceiver<DiscoveredDevice>, TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Attach to the device. An unexpected link loss is reported as
    /// [`TransportEvent::DeviceDisconnected`] on `events`.
    async fn connect(&self, device: &DeviceRef, events: EventSender)
        -> Result<(), TransportError>;

    /// Enable notifications; each value arrives as [`TransportEvent::FrameReceived`]
    async fn subscribe(
        &self,
        device: &DeviceRef,
        characteristic: Uuid,
        events: EventSender,
    ) -> Result<(), TransportError>;

    async fn unsubscribe(&self, device: &DeviceRef, characteristic: Uuid)
        -> Result<(), TransportError>;

    async fn write_command(
        &self,
        device: &DeviceRef,
        characteristic: Uuid,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError>;

    /// Tear the link down. Must not emit `DeviceDisconnected` afterwards.
    async fn disconnect(&self, device: &DeviceRef) -> Result<(), TransportError>;
}

/// Write with response first; if that fails try once without response
pub async fn write_with_fallback(
    transport: &dyn TransportAdapter,
    device: &DeviceRef,
    characteristic: Uuid,
    payload: &[u8],
) -> Result<WriteMode, TransportError> {
    match transport
        .write_command(device, characteristic, payload, WriteMode::WithResponse)
        .await
    {
        Ok(()) => Ok(WriteMode::WithResponse),
        Err(e) => {
            warn!("Write with response failed: {}. Retrying without response", e);
            transport
                .write_command(device, characteristic, payload, WriteMode::WithoutResponse)
                .await
                .map(|()| WriteMode::WithoutResponse)
        }
    }
}

/// Pick the backend once, at startup
pub async fn select_transport(settings: &Settings) -> anyhow::Result<Box<dyn TransportAdapter>> {
    let transport: Box<dyn TransportAdapter> = match settings.transport {
        TransportPreference::Btleplug => Box::new(BtleplugTransport::new().await?),
        TransportPreference::WinRt => winrt_transport()?,
        TransportPreference::Auto => {
            let native = winrt_transport().ok();
            let native_ready = match &native {
                Some(winrt) => winrt.is_available().await,
                None => false,
            };
            match native {
                Some(winrt) if native_ready => winrt,
                _ => Box::new(BtleplugTransport::new().await?),
            }
        }
    };
    info!("Using {} Bluetooth transport", transport.name());
    Ok(transport)
}

#[cfg(windows)]
fn winrt_transport() -> anyhow::Result<Box<dyn TransportAdapter>> {
    Ok(Box::new(super::winrt_backend::WinRtTransport::new()))
}

#[cfg(not(windows))]
fn winrt_transport() -> anyhow::Result<Box<dyn TransportAdapter>> {
    anyhow::bail!("The WinRT Bluetooth transport is only available on Windows")
}
