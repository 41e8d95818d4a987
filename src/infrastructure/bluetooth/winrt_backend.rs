//! Native Windows transport over the WinRT Bluetooth LE APIs.
//!
//! Devices are addressed by their 48-bit Bluetooth address, rendered as hex
//! in [`DeviceRef::id`]. WinRT invokes event handlers on its own thread
//! pool; handlers only push into the session queue.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCharacteristicProperties,
    GattClientCharacteristicConfigurationDescriptorValue, GattCommunicationStatus, GattSession,
    GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{BluetoothAdapter, BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

use super::transport::{
    DeviceRef, DiscoveredDevice, EventSender, ScanFilter, TransportAdapter, TransportError,
    TransportEvent, WriteMode,
};

/// HRESULT_FROM_WIN32(ERROR_CANCELLED), raised when the pairing prompt is dismissed
const HRESULT_CANCELLED: u32 = 0x8007_04C7;
const HRESULT_ACCESS_DENIED: u32 = 0x8007_0005;

struct Link {
    device: BluetoothLEDevice,
    session: Option<GattSession>,
    characteristics: HashMap<Uuid, GattCharacteristic>,
    registrations: Registrations,
}

/// Event registration tokens held for a link, revoked on teardown
#[derive(Debug, Default)]
struct Registrations {
    status: Option<i64>,
    values: HashMap<Uuid, i64>,
}

impl Registrations {
    /// Returns the token this one replaces, which the caller must revoke
    fn track_value(&mut self, characteristic: Uuid, token: i64) -> Option<i64> {
        self.values.insert(characteristic, token)
    }

    fn take_value(&mut self, characteristic: Uuid) -> Option<i64> {
        self.values.remove(&characteristic)
    }

    fn drain_values(&mut self) -> Vec<(Uuid, i64)> {
        self.values.drain().collect()
    }
}

#[derive(Default)]
pub struct WinRtTransport {
    watcher: Mutex<Option<BluetoothLEAdvertisementWatcher>>,
    links: Mutex<HashMap<String, Link>>,
}

impl WinRtTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn characteristic(
        &self,
        device: &DeviceRef,
        uuid: Uuid,
    ) -> Result<GattCharacteristic, TransportError> {
        let links = self.links.lock().map_err(|_| poisoned())?;
        let link = links.get(&device.id).ok_or(TransportError::NotFound)?;
        link.characteristics
            .get(&uuid)
            .cloned()
            .ok_or_else(|| TransportError::Other(format!("characteristic {} not found", uuid)))
    }
}

fn poisoned() -> TransportError {
    TransportError::Other("transport state lock poisoned".to_string())
}

fn map_error(error: windows::core::Error) -> TransportError {
    match error.code().0 as u32 {
        HRESULT_CANCELLED => TransportError::Cancelled,
        HRESULT_ACCESS_DENIED => TransportError::PermissionDenied,
        _ => TransportError::from_message(&error.message()),
    }
}

fn check_status(status: GattCommunicationStatus, what: &str) -> Result<(), TransportError> {
    if status == GattCommunicationStatus::Success {
        Ok(())
    } else if status == GattCommunicationStatus::AccessDenied {
        Err(TransportError::PermissionDenied)
    } else {
        Err(TransportError::Other(format!("{} failed: {:?}", what, status)))
    }
}

fn from_guid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

fn format_address(address: u64) -> String {
    format!("{:012X}", address)
}

fn parse_address(id: &str) -> Result<u64, TransportError> {
    u64::from_str_radix(id, 16)
        .map_err(|_| TransportError::Other(format!("invalid Bluetooth address {:?}", id)))
}

fn read_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

fn advertisement_to_device(
    args: &BluetoothLEAdvertisementReceivedEventArgs,
) -> windows::core::Result<DiscoveredDevice> {
    let advertisement = args.Advertisement()?;
    let name = advertisement.LocalName()?.to_string();
    let service_uuids = advertisement.ServiceUuids()?;
    let mut services = Vec::with_capacity(service_uuids.Size()? as usize);
    for i in 0..service_uuids.Size()? {
        services.push(from_guid(service_uuids.GetAt(i)?));
    }
    Ok(DiscoveredDevice {
        device: DeviceRef {
            id: format_address(args.BluetoothAddress()?),
            name: (!name.is_empty()).then_some(name),
        },
        services,
        rssi: args.RawSignalStrengthInDBm().ok(),
    })
}

#[async_trait]
impl TransportAdapter for WinRtTransport {
    fn name(&self) -> &'static str {
        "winrt"
    }

    async fn is_available(&self) -> bool {
        let adapter = match BluetoothAdapter::GetDefaultAsync() {
            Ok(operation) => operation.await,
            Err(e) => Err(e),
        };
        match adapter {
            Ok(adapter) => adapter.IsLowEnergySupported().unwrap_or(false),
            Err(e) => {
                debug!("No default Bluetooth adapter: {}", e.message());
                false
            }
        }
    }

    async fn scan(
        &self,
        filter: &ScanFilter,
    ) -> Result<mpsc::UnboundedReceiver<DiscoveredDevice>, TransportError> {
        self.stop_scan().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let filter = filter.clone();
        let watcher = BluetoothLEAdvertisementWatcher::new().map_err(map_error)?;
        watcher
            .SetScanningMode(BluetoothLEScanningMode::Active)
            .map_err(map_error)?;

        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let found = advertisement_to_device(args)?;
                    if filter.matches(&found) {
                        let _ = tx.send(found);
                    }
                }
                Ok(())
            },
        );
        watcher.Received(&handler).map_err(map_error)?;
        watcher.Start().map_err(map_error)?;
        info!("Advertisement watcher started");

        *self.watcher.lock().map_err(|_| poisoned())? = Some(watcher);
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        let watcher = self.watcher.lock().map_err(|_| poisoned())?.take();
        if let Some(watcher) = watcher {
            watcher.Stop().map_err(map_error)?;
            debug!("Advertisement watcher stopped");
        }
        Ok(())
    }

    async fn connect(
        &self,
        device: &DeviceRef,
        events: EventSender,
    ) -> Result<(), TransportError> {
        let address = parse_address(&device.id)?;
        let le_device = BluetoothLEDevice::FromBluetoothAddressAsync(address)
            .map_err(map_error)?
            .await
            .map_err(map_error)?;

        // keep the link up between our own GATT calls
        let session = match GattSession::FromDeviceIdAsync(
            &le_device.BluetoothDeviceId().map_err(map_error)?,
        ) {
            Ok(operation) => match operation.await {
                Ok(session) => session.SetMaintainConnection(true).ok().map(|_| session),
                Err(e) => {
                    warn!("GattSession unavailable: {}", e.message());
                    None
                }
            },
            Err(e) => {
                warn!("GattSession unavailable: {}", e.message());
                None
            }
        };

        let services = le_device
            .GetGattServicesAsync()
            .map_err(map_error)?
            .await
            .map_err(map_error)?;
        check_status(services.Status().map_err(map_error)?, "service discovery")?;

        let mut characteristics = HashMap::new();
        let services = services.Services().map_err(map_error)?;
        for i in 0..services.Size().map_err(map_error)? {
            let service = services.GetAt(i).map_err(map_error)?;
            let result = service
                .GetCharacteristicsAsync()
                .map_err(map_error)?
                .await
                .map_err(map_error)?;
            if result.Status().map_err(map_error)? != GattCommunicationStatus::Success {
                debug!("Skipping service {} with unreadable characteristics", i);
                continue;
            }
            let found = result.Characteristics().map_err(map_error)?;
            for j in 0..found.Size().map_err(map_error)? {
                let characteristic = found.GetAt(j).map_err(map_error)?;
                let uuid = from_guid(characteristic.Uuid().map_err(map_error)?);
                characteristics.insert(uuid, characteristic);
            }
        }
        info!(
            "Connected to {:#X}, {} characteristics",
            address,
            characteristics.len()
        );

        let status_handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        let _ = events.send(TransportEvent::DeviceDisconnected);
                    }
                }
                Ok(())
            });
        let status_token = le_device
            .ConnectionStatusChanged(&status_handler)
            .map_err(map_error)?;

        self.links.lock().map_err(|_| poisoned())?.insert(
            device.id.clone(),
            Link {
                device: le_device,
                session,
                characteristics,
                registrations: Registrations {
                    status: Some(status_token),
                    ..Default::default()
                },
            },
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        device: &DeviceRef,
        characteristic: Uuid,
        events: EventSender,
    ) -> Result<(), TransportError> {
        let target = self.characteristic(device, characteristic)?;

        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let bytes = read_buffer(&args.CharacteristicValue()?)?;
                    let _ = events.send(TransportEvent::FrameReceived(bytes));
                }
                Ok(())
            },
        );
        let token = target.ValueChanged(&handler).map_err(map_error)?;
        let replaced = match self.links.lock().map_err(|_| poisoned())?.get_mut(&device.id) {
            Some(link) => link.registrations.track_value(characteristic, token),
            // link torn down meanwhile
            None => Some(token),
        };
        if let Some(stale) = replaced {
            let _ = target.RemoveValueChanged(stale);
        }

        // measurement characteristics usually indicate rather than notify
        let properties = target.CharacteristicProperties().map_err(map_error)?;
        let mode = if properties.0 & GattCharacteristicProperties::Indicate.0 != 0 {
            GattClientCharacteristicConfigurationDescriptorValue::Indicate
        } else {
            GattClientCharacteristicConfigurationDescriptorValue::Notify
        };
        let status = target
            .WriteClientCharacteristicConfigurationDescriptorAsync(mode)
            .map_err(map_error)?
            .await
            .map_err(map_error)?;
        check_status(status, "enabling notifications")
    }

    async fn unsubscribe(
        &self,
        device: &DeviceRef,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        let target = self.characteristic(device, characteristic)?;
        let token = self
            .links
            .lock()
            .map_err(|_| poisoned())?
            .get_mut(&device.id)
            .and_then(|link| link.registrations.take_value(characteristic));
        if let Some(token) = token {
            target.RemoveValueChanged(token).map_err(map_error)?;
        }
        let status = target
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::None,
            )
            .map_err(map_error)?
            .await
            .map_err(map_error)?;
        check_status(status, "disabling notifications")
    }

    async fn write_command(
        &self,
        device: &DeviceRef,
        characteristic: Uuid,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let target = self.characteristic(device, characteristic)?;
        let writer = DataWriter::new().map_err(map_error)?;
        writer.WriteBytes(payload).map_err(map_error)?;
        let buffer = writer.DetachBuffer().map_err(map_error)?;
        let option = match mode {
            WriteMode::WithResponse => GattWriteOption::WriteWithResponse,
            WriteMode::WithoutResponse => GattWriteOption::WriteWithoutResponse,
        };
        let status = target
            .WriteValueWithOptionAsync(&buffer, option)
            .map_err(map_error)?
            .await
            .map_err(map_error)?;
        check_status(status, "write")
    }

    async fn disconnect(&self, device: &DeviceRef) -> Result<(), TransportError> {
        let link = self.links.lock().map_err(|_| poisoned())?.remove(&device.id);
        let Some(mut link) = link else {
            return Ok(());
        };
        for (uuid, token) in link.registrations.drain_values() {
            if let Some(characteristic) = link.characteristics.get(&uuid) {
                let _ = characteristic.RemoveValueChanged(token);
            }
        }
        if let Some(token) = link.registrations.status.take() {
            let _ = link.device.RemoveConnectionStatusChanged(token);
        }
        if let Some(session) = link.session {
            let _ = session.Close();
        }
        link.device.Close().map_err(map_error)?;
        info!("Closed link to {}", device.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::BLOOD_PRESSURE_SERVICE_UUID;

    #[test]
    fn test_address_round_trip() {
        let id = format_address(0x00A0_50C2_1F3E);
        assert_eq!(id, "00A050C21F3E");
        assert_eq!(parse_address(&id).unwrap(), 0x00A0_50C2_1F3E);
        assert!(parse_address("not-hex").is_err());
    }

    #[test]
    fn test_registrations_hand_back_tokens_to_revoke() {
        let mut registrations = Registrations {
            status: Some(7),
            ..Default::default()
        };
        assert_eq!(registrations.track_value(BLOOD_PRESSURE_SERVICE_UUID, 11), None);
        // a second subscribe replaces the handler and surfaces the old token
        assert_eq!(
            registrations.track_value(BLOOD_PRESSURE_SERVICE_UUID, 12),
            Some(11)
        );
        assert_eq!(registrations.take_value(BLOOD_PRESSURE_SERVICE_UUID), Some(12));
        assert_eq!(registrations.take_value(BLOOD_PRESSURE_SERVICE_UUID), None);

        registrations.track_value(Uuid::from_u128(1), 20);
        registrations.track_value(Uuid::from_u128(2), 21);
        let mut drained = registrations.drain_values();
        drained.sort();
        assert_eq!(
            drained,
            vec![(Uuid::from_u128(1), 20), (Uuid::from_u128(2), 21)]
        );
        assert!(registrations.values.is_empty());
        assert_eq!(registrations.status.take(), Some(7));
    }

    #[test]
    fn test_guid_conversion() {
        let guid = GUID::from_u128(BLOOD_PRESSURE_SERVICE_UUID.as_u128());
        assert_eq!(guid.data1, 0x0000_1810);
        assert_eq!(from_guid(guid), BLOOD_PRESSURE_SERVICE_UUID);
    }
}
