//! Scripted in-process transport for tests

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::transport::{
    DeviceRef, DiscoveredDevice, EventSender, ScanFilter, TransportAdapter, TransportError,
    TransportEvent, WriteMode,
};

#[derive(Debug, Clone)]
pub enum ConnectBehavior {
    Succeed,
    Fail(TransportError),
    /// Never completes, like a peripheral that stops answering mid-handshake
    Hang,
}

struct FakeState {
    available: bool,
    discoveries: Vec<DiscoveredDevice>,
    connect: ConnectBehavior,
    subscribe_error: Option<TransportError>,
    failing_modes: Vec<WriteMode>,
    writes: Vec<(Vec<u8>, WriteMode)>,
    calls: Vec<String>,
    session_events: Option<EventSender>,
    // kept so an empty scan stays open until stop_scan
    scan_tx: Option<mpsc::UnboundedSender<DiscoveredDevice>>,
}

#[derive(Clone)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                available: true,
                discoveries: Vec::new(),
                connect: ConnectBehavior::Succeed,
                subscribe_error: None,
                failing_modes: Vec::new(),
                writes: Vec::new(),
                calls: Vec::new(),
                session_events: None,
                scan_tx: None,
            })),
        }
    }

    /// A transport with one advertising cuff
    pub fn with_cuff(name: &str) -> Self {
        let fake = Self::new();
        fake.add_device(name, vec![super::protocol::BLOOD_PRESSURE_SERVICE_UUID]);
        fake
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_device(&self, name: &str, services: Vec<Uuid>) {
        let id = format!("fake-{}", self.lock().discoveries.len());
        self.lock().discoveries.push(DiscoveredDevice {
            device: DeviceRef {
                id,
                name: Some(name.to_string()),
            },
            services,
            rssi: Some(-60),
        });
    }

    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    pub fn set_connect(&self, behavior: ConnectBehavior) {
        self.lock().connect = behavior;
    }

    pub fn fail_subscribe(&self, error: TransportError) {
        self.lock().subscribe_error = Some(error);
    }

    pub fn fail_writes(&self, mode: WriteMode) {
        self.lock().failing_modes.push(mode);
    }

    pub fn writes(&self) -> Vec<(Vec<u8>, WriteMode)> {
        self.lock().writes.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Deliver a notification on the open session
    pub fn push_frame(&self, bytes: &[u8]) -> bool {
        self.send(TransportEvent::FrameReceived(bytes.to_vec()))
    }

    /// Simulate the cuff dropping the link
    pub fn drop_link(&self) -> bool {
        self.send(TransportEvent::DeviceDisconnected)
    }

    fn send(&self, event: TransportEvent) -> bool {
        match &self.lock().session_events {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    fn record(&self, call: String) {
        self.lock().calls.push(call);
    }
}

#[async_trait]
impl TransportAdapter for FakeTransport {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn is_available(&self) -> bool {
        self.lock().available
    }

    async fn scan(
        &self,
        filter: &ScanFilter,
    ) -> Result<mpsc::UnboundedReceiver<DiscoveredDevice>, TransportError> {
        self.record("scan".to_string());
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        for found in state.discoveries.iter().filter(|found| filter.matches(found)) {
            let _ = tx.send(found.clone());
        }
        state.scan_tx = Some(tx);
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.record("stop_scan".to_string());
        self.lock().scan_tx = None;
        Ok(())
    }

    async fn connect(
        &self,
        device: &DeviceRef,
        events: EventSender,
    ) -> Result<(), TransportError> {
        self.record(format!("connect:{}", device.id));
        let behavior = self.lock().connect.clone();
        match behavior {
            ConnectBehavior::Succeed => {
                self.lock().session_events = Some(events);
                Ok(())
            }
            ConnectBehavior::Fail(error) => Err(error),
            ConnectBehavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    async fn subscribe(
        &self,
        _device: &DeviceRef,
        characteristic: Uuid,
        _events: EventSender,
    ) -> Result<(), TransportError> {
        self.record(format!("subscribe:{}", characteristic));
        match self.lock().subscribe_error.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn unsubscribe(
        &self,
        _device: &DeviceRef,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        self.record(format!("unsubscribe:{}", characteristic));
        Ok(())
    }

    async fn write_command(
        &self,
        _device: &DeviceRef,
        _characteristic: Uuid,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.writes.push((payload.to_vec(), mode));
        if state.failing_modes.contains(&mode) {
            return Err(TransportError::Other(format!("{:?} write rejected", mode)));
        }
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceRef) -> Result<(), TransportError> {
        self.record(format!("disconnect:{}", device.id));
        self.lock().session_events = None;
        Ok(())
    }
}
