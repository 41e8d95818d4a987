//! Cross-platform transport on top of btleplug.
//!
//! Every link gets a disconnect watcher on the adapter event stream and one
//! forwarding task per subscribed characteristic. All of them push into the
//! session queue handed over by the controller and are aborted when the
//! link is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::transport::{
    DeviceRef, DiscoveredDevice, EventSender, ScanFilter, TransportAdapter, TransportError,
    TransportEvent, WriteMode,
};

#[derive(Default)]
struct LinkTasks {
    watcher: Option<JoinHandle<()>>,
    notifications: HashMap<Uuid, JoinHandle<()>>,
}

impl LinkTasks {
    fn abort_all(self) {
        if let Some(watcher) = self.watcher {
            watcher.abort();
        }
        for (_, task) in self.notifications {
            task.abort();
        }
    }
}

pub struct BtleplugTransport {
    adapter: Adapter,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
    links: Mutex<HashMap<String, LinkTasks>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugTransport {
    /// Bind to the first adapter the platform reports
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(map_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(map_error)?
            .into_iter()
            .next()
            .ok_or(TransportError::Unavailable)?;
        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }
        Ok(Self {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            links: Mutex::new(HashMap::new()),
            scan_task: Mutex::new(None),
        })
    }

    fn peripheral(&self, device: &DeviceRef) -> Result<Peripheral, TransportError> {
        self.peripherals
            .lock()
            .map_err(|_| poisoned())?
            .get(&device.id)
            .cloned()
            .ok_or(TransportError::NotFound)
    }

    fn with_link<R>(&self, device: &DeviceRef, f: impl FnOnce(&mut LinkTasks) -> R) -> Option<R> {
        let mut links = self.links.lock().ok()?;
        Some(f(links.entry(device.id.clone()).or_default()))
    }

    fn take_link(&self, device: &DeviceRef) -> Option<LinkTasks> {
        self.links.lock().ok()?.remove(&device.id)
    }
}

fn poisoned() -> TransportError {
    TransportError::Other("transport state lock poisoned".to_string())
}

/// Map btleplug failures onto the categories the controller reports
fn map_error(error: btleplug::Error) -> TransportError {
    match error {
        btleplug::Error::PermissionDenied => TransportError::PermissionDenied,
        btleplug::Error::DeviceNotFound => TransportError::NotFound,
        other => TransportError::from_message(&other.to_string()),
    }
}

fn find_characteristic(
    peripheral: &Peripheral,
    uuid: Uuid,
) -> Result<Characteristic, TransportError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| TransportError::Other(format!("characteristic {} not found", uuid)))
}

async fn describe(peripheral: &Peripheral) -> Option<DiscoveredDevice> {
    let properties = match peripheral.properties().await {
        Ok(Some(properties)) => properties,
        Ok(None) => return None,
        Err(e) => {
            trace!("No properties for {}: {}", peripheral.id(), e);
            return None;
        }
    };
    Some(DiscoveredDevice {
        device: DeviceRef {
            id: peripheral.id().to_string(),
            name: properties.local_name,
        },
        services: properties.services,
        rssi: properties.rssi,
    })
}

#[async_trait]
impl TransportAdapter for BtleplugTransport {
    fn name(&self) -> &'static str {
        "btleplug"
    }

    async fn is_available(&self) -> bool {
        self.adapter.adapter_info().await.is_ok()
    }

    async fn scan(
        &self,
        filter: &ScanFilter,
    ) -> Result<mpsc::UnboundedReceiver<DiscoveredDevice>, TransportError> {
        let mut events = self.adapter.events().await.map_err(map_error)?;
        // name-only advertisers would be missed by a platform service filter,
        // so matching happens on each result below
        self.adapter
            .start_scan(btleplug::api::ScanFilter::default())
            .await
            .map_err(map_error)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();
        let filter = filter.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Some(found) = describe(&peripheral).await else {
                    continue;
                };
                trace!("Discovered {:?} ({})", found.device.name, found.device.id);
                if let Ok(mut known) = peripherals.lock() {
                    known.insert(found.device.id.clone(), peripheral);
                }
                if !filter.matches(&found) {
                    continue;
                }
                if tx.send(found).is_err() {
                    break;
                }
            }
        });

        if let Ok(mut slot) = self.scan_task.lock() {
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        if let Some(task) = self.scan_task.lock().ok().and_then(|mut slot| slot.take()) {
            task.abort();
        }
        self.adapter.stop_scan().await.map_err(map_error)
    }

    async fn connect(
        &self,
        device: &DeviceRef,
        events: EventSender,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device)?;
        if !peripheral.is_connected().await.map_err(map_error)? {
            peripheral.connect().await.map_err(map_error)?;
        }
        peripheral.discover_services().await.map_err(map_error)?;
        debug!(
            "{} characteristics discovered on {}",
            peripheral.characteristics().len(),
            device.id
        );

        let mut central_events = self.adapter.events().await.map_err(map_error)?;
        let peripheral_id = peripheral.id();
        let watcher = tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        info!("Link to {:?} dropped", id);
                        let _ = events.send(TransportEvent::DeviceDisconnected);
                        break;
                    }
                }
            }
        });
        self.with_link(device, |link| {
            if let Some(previous) = link.watcher.replace(watcher) {
                previous.abort();
            }
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        device: &DeviceRef,
        characteristic: Uuid,
        events: EventSender,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device)?;
        let target = find_characteristic(&peripheral, characteristic)?;
        let mut notifications = peripheral.notifications().await.map_err(map_error)?;
        peripheral.subscribe(&target).await.map_err(map_error)?;

        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != characteristic {
                    continue;
                }
                if events
                    .send(TransportEvent::FrameReceived(notification.value))
                    .is_err()
                {
                    break;
                }
            }
            debug!("Notification stream for {} closed", characteristic);
        });
        self.with_link(device, |link| {
            if let Some(previous) = link.notifications.insert(characteristic, task) {
                previous.abort();
            }
        });
        Ok(())
    }

    async fn unsubscribe(
        &self,
        device: &DeviceRef,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        if let Some(Some(task)) =
            self.with_link(device, |link| link.notifications.remove(&characteristic))
        {
            task.abort();
        }
        let peripheral = self.peripheral(device)?;
        let target = find_characteristic(&peripheral, characteristic)?;
        peripheral.unsubscribe(&target).await.map_err(map_error)
    }

    async fn write_command(
        &self,
        device: &DeviceRef,
        characteristic: Uuid,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device)?;
        let target = find_characteristic(&peripheral, characteristic)?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        peripheral
            .write(&target, payload, write_type)
            .await
            .map_err(map_error)
    }

    async fn disconnect(&self, device: &DeviceRef) -> Result<(), TransportError> {
        // stop the watcher first so a requested disconnect is never reported
        if let Some(link) = self.take_link(device) {
            link.abort_all();
        }
        let peripheral = self.peripheral(device)?;
        match peripheral.is_connected().await {
            Ok(true) => peripheral.disconnect().await.map_err(map_error),
            Ok(false) => Ok(()),
            Err(e) => {
                warn!("Could not query link state of {}: {}", device.id, e);
                peripheral.disconnect().await.map_err(map_error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            map_error(btleplug::Error::PermissionDenied),
            TransportError::PermissionDenied
        );
        assert_eq!(
            map_error(btleplug::Error::DeviceNotFound),
            TransportError::NotFound
        );
        assert_eq!(
            map_error(btleplug::Error::RuntimeError("Operation was cancelled".into())),
            TransportError::Cancelled
        );
        assert!(matches!(
            map_error(btleplug::Error::NotConnected),
            TransportError::Other(_)
        ));
    }
}
