//! BLE Connection Module
//!
//! Attaches to a discovered cuff, subscribes to measurements and owns the
//! resulting session handle.

use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::protocol::{
    self, CommandSet, BLOOD_PRESSURE_MEASUREMENT_UUID, BLOOD_PRESSURE_SERVICE_UUID,
    VENDOR_CONTROL_UUID,
};
use crate::infrastructure::bluetooth::transport::{
    DeviceRef, EventSender, ScanFilter, TransportAdapter, TransportError, TransportEvent,
};
use anyhow::Result;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Service UUID to look for
    pub service_uuid: Uuid,
    /// Measurement characteristic UUID
    pub measurement_char_uuid: Uuid,
    /// Vendor control characteristic UUID
    pub control_char_uuid: Uuid,
    /// Advertised name prefixes accepted in place of the service UUID
    pub name_prefixes: Vec<String>,
    pub commands: CommandSet,
    pub scan_timeout: Duration,
    pub connection_timeout: Duration,
    pub measurement_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            service_uuid: BLOOD_PRESSURE_SERVICE_UUID,
            measurement_char_uuid: BLOOD_PRESSURE_MEASUREMENT_UUID,
            control_char_uuid: VENDOR_CONTROL_UUID,
            name_prefixes: settings.device_name_prefixes.clone(),
            commands: CommandSet {
                start: settings.start_command.clone(),
                cancel: settings.cancel_command.clone(),
            },
            scan_timeout: settings.scan_timeout(),
            connection_timeout: settings.connection_timeout(),
            measurement_timeout: settings.measurement_timeout(),
        }
    }
}

impl ConnectionConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self {
            service_uuid: protocol::parse_uuid(&settings.ble_service_uuid)?,
            measurement_char_uuid: protocol::parse_uuid(&settings.ble_measurement_char_uuid)?,
            control_char_uuid: protocol::parse_uuid(&settings.ble_control_char_uuid)?,
            name_prefixes: settings.device_name_prefixes.clone(),
            commands: CommandSet {
                start: settings.start_command.clone(),
                cancel: settings.cancel_command.clone(),
            },
            scan_timeout: settings.scan_timeout(),
            connection_timeout: settings.connection_timeout(),
            measurement_timeout: settings.measurement_timeout(),
        })
    }

    pub fn scan_filter(&self) -> ScanFilter {
        ScanFilter {
            service: self.service_uuid,
            name_prefixes: self.name_prefixes.clone(),
        }
    }
}

/// The one open link to a cuff.
///
/// Holds the session's event queue; dropping the session drops the queue,
/// so nothing from an old link can reach a later one.
pub struct ConnectionSession {
    device: DeviceRef,
    subscriptions: Vec<Uuid>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    // keeps the queue open while backends come and go
    _sender: EventSender,
}

impl ConnectionSession {
    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    pub fn subscriptions(&self) -> &[Uuid] {
        &self.subscriptions
    }

    /// Next event, in arrival order
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }
}

/// BLE Connection handler
pub struct BleConnection<'a> {
    transport: &'a dyn TransportAdapter,
    config: &'a ConnectionConfig,
}

impl<'a> BleConnection<'a> {
    /// Create a new connection handler
    pub fn new(transport: &'a dyn TransportAdapter, config: &'a ConnectionConfig) -> Self {
        Self { transport, config }
    }

    /// Connect to `device` and enable measurement notifications
    pub async fn attach(&self, device: DeviceRef) -> Result<ConnectionSession, TransportError> {
        info!(
            "Connecting to {} ({})",
            device.name.as_deref().unwrap_or("Unknown"),
            device.id
        );
        let (sender, events) = mpsc::unbounded_channel();

        // Step 1: GATT connect
        self.transport.connect(&device, sender.clone()).await?;
        info!("GATT connected");

        // Step 2: Subscribe to measurement notifications
        let characteristic = self.config.measurement_char_uuid;
        if let Err(e) = self
            .transport
            .subscribe(&device, characteristic, sender.clone())
            .await
        {
            warn!("Could not enable notifications: {}", e);
            if let Err(e) = self.transport.disconnect(&device).await {
                warn!("Disconnect after failed subscribe also failed: {}", e);
            }
            return Err(e);
        }
        info!("Measurement notifications enabled");

        Ok(ConnectionSession {
            device,
            subscriptions: vec![characteristic],
            events,
            _sender: sender,
        })
    }

    /// Unsubscribe everything and drop the link. Failures are logged, not returned.
    pub async fn release(&self, session: ConnectionSession) {
        for characteristic in session.subscriptions() {
            if let Err(e) = self
                .transport
                .unsubscribe(session.device(), *characteristic)
                .await
            {
                warn!("Error stopping notifications: {}", e);
            }
        }
        if let Err(e) = self.transport.disconnect(session.device()).await {
            warn!("Error disconnecting: {}", e);
        }
        info!("Disconnected from {}", session.device().id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::fake::FakeTransport;

    fn device() -> DeviceRef {
        DeviceRef {
            id: "fake-0".into(),
            name: Some("QardioArm".into()),
        }
    }

    #[test]
    fn test_config_from_default_settings() {
        let config = ConnectionConfig::from_settings(&Settings::default()).unwrap();
        assert_eq!(config.service_uuid, BLOOD_PRESSURE_SERVICE_UUID);
        assert_eq!(config.measurement_char_uuid, BLOOD_PRESSURE_MEASUREMENT_UUID);
        assert_eq!(config.control_char_uuid, VENDOR_CONTROL_UUID);
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_rejects_bad_uuid() {
        let settings = Settings {
            ble_control_char_uuid: "xyz".into(),
            ..Default::default()
        };
        assert!(ConnectionConfig::from_settings(&settings).is_err());
    }

    #[tokio::test]
    async fn test_attach_then_release() {
        let fake = FakeTransport::new();
        let config = ConnectionConfig::default();
        let connection = BleConnection::new(&fake, &config);

        let mut session = connection.attach(device()).await.unwrap();
        assert_eq!(session.subscriptions(), &[BLOOD_PRESSURE_MEASUREMENT_UUID]);

        assert!(fake.push_frame(&[0x00]));
        assert_eq!(
            session.next_event().await,
            Some(TransportEvent::FrameReceived(vec![0x00]))
        );

        connection.release(session).await;
        assert_eq!(
            fake.calls(),
            vec![
                "connect:fake-0".to_string(),
                format!("subscribe:{}", BLOOD_PRESSURE_MEASUREMENT_UUID),
                format!("unsubscribe:{}", BLOOD_PRESSURE_MEASUREMENT_UUID),
                "disconnect:fake-0".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_subscribe_disconnects() {
        let fake = FakeTransport::new();
        fake.fail_subscribe(TransportError::AuthenticationRequired);
        let config = ConnectionConfig::default();

        let result = BleConnection::new(&fake, &config).attach(device()).await;
        assert!(matches!(result, Err(TransportError::AuthenticationRequired)));
        assert_eq!(fake.count_calls("disconnect"), 1);
    }
}
