//! Connection Controller
//!
//! Drives the transport through scan, attach, measurement and teardown,
//! feeds every notification to the protocol decoder and hands completed
//! readings to the store and the sync sink.
//!
//! ```text
//!   Idle ──connect──▶ Scanning ──found──▶ Connecting ──attached──▶ Connected
//!    ▲                   │                    │                     │  ▲
//!    │◀── not found ─────┘◀── timeout/error ──┘      startMeasurement│  │terminal frame
//!    │                                                               ▼  │stop / timeout
//!    │◀──────────── disconnect / link lost ───────────────────── Measuring
//! ```
//!
//! The controller is single-owner: every operation takes `&mut self`, and
//! [`ConnectionController::spawn`] moves it into one task that serializes
//! commands, session events and the measurement timer.

use crate::domain::history::ReadingStore;
use crate::domain::models::{ControllerCommand, DeviceError, DeviceState, Reading};
use crate::infrastructure::bluetooth::connection::{
    BleConnection, ConnectionConfig, ConnectionSession,
};
use crate::infrastructure::bluetooth::protocol::{self, CuffCommand, RawFrame};
use crate::infrastructure::bluetooth::scanner::BleScanner;
use crate::infrastructure::bluetooth::transport::{
    write_with_fallback, TransportAdapter, TransportError, TransportEvent,
};
use crate::infrastructure::sync::ReadingSink;
use chrono::Utc;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, error, info, trace, warn};

/// Name shown when the cuff does not advertise one
pub const DEFAULT_DEVICE_NAME: &str = "QardioArm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Measuring,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("not connected to a device")]
    NotConnected,
    #[error("command write failed: {0}")]
    Command(#[from] TransportError),
    #[error("controller task has stopped")]
    Stopped,
}

pub struct ConnectionController {
    transport: Box<dyn TransportAdapter>,
    config: ConnectionConfig,
    store: Arc<Mutex<ReadingStore>>,
    sink: Arc<dyn ReadingSink>,

    phase: Phase,
    device_name: Option<String>,
    error: Option<DeviceError>,
    session: Option<ConnectionSession>,
    measurement_timer: Option<Pin<Box<Sleep>>>,

    state_tx: watch::Sender<DeviceState>,
    reading_tx: watch::Sender<Option<Reading>>,
    progress_tx: watch::Sender<u16>,
}

impl ConnectionController {
    pub fn new(
        transport: Box<dyn TransportAdapter>,
        config: ConnectionConfig,
        store: Arc<Mutex<ReadingStore>>,
        sink: Arc<dyn ReadingSink>,
    ) -> Self {
        let (state_tx, _) = watch::channel(DeviceState::default());
        let (reading_tx, _) = watch::channel(None);
        let (progress_tx, _) = watch::channel(0);
        Self {
            transport,
            config,
            store,
            sink,
            phase: Phase::Idle,
            device_name: None,
            error: None,
            session: None,
            measurement_timer: None,
            state_tx,
            reading_tx,
            progress_tx,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> DeviceState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DeviceState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_reading(&self) -> watch::Receiver<Option<Reading>> {
        self.reading_tx.subscribe()
    }

    /// Live cuff pressure in mmHg, 0 when no measurement is running
    pub fn subscribe_progress(&self) -> watch::Receiver<u16> {
        self.progress_tx.subscribe()
    }

    pub fn is_measurement_timer_armed(&self) -> bool {
        self.measurement_timer.is_some()
    }

    /// Scan for the first cuff and attach to it
    pub async fn connect(&mut self) {
        self.connect_until(None).await;
    }

    /// Connect, giving up early if `interrupt` delivers `Disconnect` or
    /// `Shutdown`. Returns the command that cut the attempt short.
    async fn connect_until(
        &mut self,
        mut interrupt: Option<&mut mpsc::UnboundedReceiver<ControllerCommand>>,
    ) -> Option<ControllerCommand> {
        if self.phase != Phase::Idle {
            warn!("Connect requested while {:?}, ignoring", self.phase);
            return None;
        }

        if !self.transport.is_available().await {
            error!("{} Bluetooth transport is not available", self.transport.name());
            self.error = Some(DeviceError::TransportUnavailable);
            self.publish();
            return None;
        }

        self.error = None;
        self.phase = Phase::Scanning;
        self.publish();

        let scanner = BleScanner::new(self.config.scan_filter(), self.config.scan_timeout);
        let scanned = tokio::select! {
            scanned = scanner.find_first(self.transport.as_ref()) => Ok(scanned),
            command = next_abort(interrupt.as_deref_mut()) => Err(command),
        };
        let found = match scanned {
            Ok(Ok(Some(found))) => found,
            Ok(Ok(None)) => {
                self.fail_connect(DeviceError::DeviceNotFound);
                return None;
            }
            Ok(Err(e)) => {
                error!("Scan failed: {}", e);
                self.fail_connect(e.into());
                return None;
            }
            Err(command) => {
                info!("Scan abandoned on {:?}", command);
                if let Err(e) = self.transport.stop_scan().await {
                    warn!("Failed to stop scan cleanly: {}", e);
                }
                self.reset_idle();
                return Some(command);
            }
        };

        let device = found.device;
        self.device_name = Some(
            device
                .name
                .clone()
                .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string()),
        );
        self.phase = Phase::Connecting;
        self.publish();

        let connection = BleConnection::new(self.transport.as_ref(), &self.config);
        let attach = tokio::time::timeout(
            self.config.connection_timeout,
            connection.attach(device.clone()),
        );
        let attached = tokio::select! {
            attached = attach => Ok(attached),
            command = next_abort(interrupt.as_deref_mut()) => Err(command),
        };

        match attached {
            Ok(Ok(Ok(session))) => {
                info!("Connected to {}", self.device_name.as_deref().unwrap_or("device"));
                self.session = Some(session);
                self.phase = Phase::Connected;
                self.publish();
            }
            Ok(Ok(Err(e))) => {
                error!("Failed to connect: {}", e);
                if let Err(e) = self.transport.disconnect(&device).await {
                    debug!("Disconnect after failed connect: {}", e);
                }
                self.fail_connect(e.into());
            }
            Ok(Err(_)) => {
                warn!(
                    "Connection timed out after {:?}",
                    self.config.connection_timeout
                );
                if let Err(e) = self.transport.disconnect(&device).await {
                    warn!("Disconnect after timeout failed: {}", e);
                }
                self.fail_connect(DeviceError::ConnectionTimedOut);
            }
            Err(command) => {
                info!("Connection to {} abandoned on {:?}", device.id, command);
                if let Err(e) = self.transport.disconnect(&device).await {
                    debug!("Disconnect after abandoned connect: {}", e);
                }
                self.reset_idle();
                return Some(command);
            }
        }
        None
    }

    fn fail_connect(&mut self, error: DeviceError) {
        self.phase = Phase::Idle;
        self.error = Some(error);
        self.publish();
    }

    fn reset_idle(&mut self) {
        self.phase = Phase::Idle;
        self.device_name = None;
        self.error = None;
        self.reading_tx.send_replace(None);
        self.progress_tx.send_replace(0);
        self.publish();
    }

    /// Send START and wait for the cuff to report
    pub async fn start_measurement(&mut self) -> Result<(), ControllerError> {
        match self.phase {
            Phase::Measuring => {
                debug!("Measurement already running");
                return Ok(());
            }
            Phase::Connected => {}
            _ => return Err(ControllerError::NotConnected),
        }
        let Some(session) = &self.session else {
            return Err(ControllerError::NotConnected);
        };

        let payload = self.config.commands.encode(CuffCommand::Start);
        let written = write_with_fallback(
            self.transport.as_ref(),
            session.device(),
            self.config.control_char_uuid,
            &payload,
        )
        .await;
        match written {
            Ok(mode) => info!("Measurement started ({:?})", mode),
            Err(e) => {
                error!("Failed to start measurement: {}", e);
                self.error = Some(DeviceError::CommandFailed(e.to_string()));
                self.publish();
                return Err(e.into());
            }
        }

        self.phase = Phase::Measuring;
        self.error = None;
        self.measurement_timer = Some(Box::pin(tokio::time::sleep(
            self.config.measurement_timeout,
        )));
        self.reading_tx.send_replace(None);
        self.progress_tx.send_replace(0);
        self.publish();
        Ok(())
    }

    /// Cancel a running measurement. Does nothing unless measuring.
    pub async fn stop_measurement(&mut self) {
        if self.phase != Phase::Measuring {
            debug!("Stop requested while {:?}, nothing to do", self.phase);
            return;
        }
        self.measurement_timer = None;

        if let Some(session) = &self.session {
            let payload = self.config.commands.encode(CuffCommand::Cancel);
            if let Err(e) = write_with_fallback(
                self.transport.as_ref(),
                session.device(),
                self.config.control_char_uuid,
                &payload,
            )
            .await
            {
                warn!("Cancel command not delivered: {}", e);
                self.error = Some(DeviceError::CommandFailed(e.to_string()));
            }
        }

        info!("Measurement stopped");
        self.phase = Phase::Connected;
        self.progress_tx.send_replace(0);
        self.publish();
    }

    /// Drop everything and return to Idle
    pub async fn disconnect(&mut self) {
        self.measurement_timer = None;
        if let Some(session) = self.session.take() {
            BleConnection::new(self.transport.as_ref(), &self.config)
                .release(session)
                .await;
        }
        self.reset_idle();
    }

    pub fn clear_error(&mut self) {
        if self.error.take().is_some() {
            self.publish();
        }
    }

    pub async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::FrameReceived(bytes) => self.handle_frame(&bytes).await,
            TransportEvent::DeviceDisconnected => self.handle_link_lost().await,
        }
    }

    async fn handle_frame(&mut self, bytes: &[u8]) {
        let Some(frame) = protocol::decode(bytes) else {
            debug!("Dropping undecodable frame ({} bytes)", bytes.len());
            return;
        };

        match frame {
            RawFrame::Intermediate { cuff_pressure } => {
                if self.phase == Phase::Measuring {
                    trace!("Cuff pressure {} mmHg", cuff_pressure);
                    self.progress_tx.send_replace(cuff_pressure);
                } else {
                    debug!("Ignoring cuff pressure while {:?}", self.phase);
                }
            }
            RawFrame::Terminal(measurement) => {
                if !matches!(self.phase, Phase::Connected | Phase::Measuring) {
                    debug!("Ignoring measurement while {:?}", self.phase);
                    return;
                }
                if let Some(device_time) = measurement.device_time {
                    debug!("Cuff clock reports {}", device_time);
                }
                let reading = measurement.into_reading(Utc::now());
                info!("Measurement complete: {}", reading);

                self.persist(&reading);
                self.measurement_timer = None;
                self.progress_tx.send_replace(0);
                self.reading_tx.send_replace(Some(reading.clone()));
                self.phase = Phase::Connected;
                self.publish();

                self.sink.on_reading_complete(&reading).await;
            }
        }
    }

    fn persist(&self, reading: &Reading) {
        match self.store.lock() {
            Ok(mut store) => {
                if let Err(e) = store.append(reading.clone()) {
                    error!("Failed to save reading: {}", e);
                }
            }
            Err(_) => error!("Reading store lock poisoned, reading not saved"),
        }
    }

    async fn handle_link_lost(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        warn!("Device {} disconnected", session.device().id);
        // let the backend drop its bookkeeping for the dead link
        if let Err(e) = self.transport.disconnect(session.device()).await {
            debug!("Cleanup after link loss failed: {}", e);
        }

        self.measurement_timer = None;
        self.phase = Phase::Idle;
        self.error = Some(DeviceError::DeviceDisconnected);
        self.progress_tx.send_replace(0);
        self.publish();
    }

    fn on_measurement_timeout(&mut self) {
        self.measurement_timer = None;
        if self.phase != Phase::Measuring {
            return;
        }
        warn!(
            "No reading within {:?}, giving up",
            self.config.measurement_timeout
        );
        self.phase = Phase::Connected;
        self.error = Some(DeviceError::MeasurementTimedOut);
        self.progress_tx.send_replace(0);
        self.publish();
    }

    /// Handle the next session event or timer expiry.
    ///
    /// Returns `false` straight away when neither a session nor a timer is
    /// active, since nothing could ever arrive.
    pub async fn process_next(&mut self) -> bool {
        if self.session.is_none() && self.measurement_timer.is_none() {
            return false;
        }
        tokio::select! {
            Some(event) = next_session_event(&mut self.session) => self.handle_event(event).await,
            () = measurement_deadline(&mut self.measurement_timer) => self.on_measurement_timeout(),
        }
        true
    }

    async fn execute(&mut self, command: ControllerCommand) {
        debug!("Executing {:?}", command);
        match command {
            ControllerCommand::Connect => self.connect().await,
            ControllerCommand::Disconnect => self.disconnect().await,
            ControllerCommand::StartMeasurement => {
                if let Err(e) = self.start_measurement().await {
                    warn!("Start measurement rejected: {}", e);
                }
            }
            ControllerCommand::StopMeasurement => self.stop_measurement().await,
            ControllerCommand::ClearError => self.clear_error(),
            ControllerCommand::Shutdown => {}
        }
    }

    /// Serve commands until shutdown, then disconnect
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ControllerCommand>) {
        info!("Connection controller started ({})", self.transport.name());
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ControllerCommand::Shutdown) | None => break,
                    // scan and attach stay cancellable from the same queue
                    Some(ControllerCommand::Connect) => {
                        let interrupted = self.connect_until(Some(&mut commands)).await;
                        if interrupted == Some(ControllerCommand::Shutdown) {
                            break;
                        }
                    }
                    Some(command) => self.execute(command).await,
                },
                Some(event) = next_session_event(&mut self.session) => self.handle_event(event).await,
                () = measurement_deadline(&mut self.measurement_timer) => self.on_measurement_timeout(),
            }
        }
        self.disconnect().await;
        info!("Connection controller stopped");
    }

    /// Move the controller into its own task
    pub fn spawn(self) -> ControllerHandle {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let state = self.subscribe_state();
        let reading = self.subscribe_reading();
        let progress = self.subscribe_progress();
        let task = tokio::spawn(self.run(command_rx));
        ControllerHandle {
            commands,
            state,
            reading,
            progress,
            task,
        }
    }

    fn publish(&self) {
        let next = DeviceState {
            connected: matches!(self.phase, Phase::Connected | Phase::Measuring),
            connecting: self.phase == Phase::Connecting,
            scanning: self.phase == Phase::Scanning,
            measuring: self.phase == Phase::Measuring,
            device_name: self.device_name.clone(),
            error: self.error.clone(),
        };
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn next_session_event(session: &mut Option<ConnectionSession>) -> Option<TransportEvent> {
    match session {
        Some(session) => session.next_event().await,
        None => std::future::pending().await,
    }
}

/// Wait for a command that abandons a connect attempt. Anything else that
/// arrives meanwhile is dropped, since none of it applies before Connected.
async fn next_abort(
    commands: Option<&mut mpsc::UnboundedReceiver<ControllerCommand>>,
) -> ControllerCommand {
    let Some(commands) = commands else {
        return std::future::pending().await;
    };
    loop {
        match commands.recv().await {
            Some(command @ (ControllerCommand::Disconnect | ControllerCommand::Shutdown)) => {
                return command
            }
            Some(other) => debug!("Ignoring {:?} while connecting", other),
            None => return ControllerCommand::Shutdown,
        }
    }
}

async fn measurement_deadline(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Front-end side of a spawned controller
pub struct ControllerHandle {
    commands: mpsc::UnboundedSender<ControllerCommand>,
    state: watch::Receiver<DeviceState>,
    reading: watch::Receiver<Option<Reading>>,
    progress: watch::Receiver<u16>,
    task: JoinHandle<()>,
}

impl ControllerHandle {
    pub fn send(&self, command: ControllerCommand) -> Result<(), ControllerError> {
        self.commands
            .send(command)
            .map_err(|_| ControllerError::Stopped)
    }

    pub fn connect(&self) -> Result<(), ControllerError> {
        self.send(ControllerCommand::Connect)
    }

    pub fn disconnect(&self) -> Result<(), ControllerError> {
        self.send(ControllerCommand::Disconnect)
    }

    pub fn start_measurement(&self) -> Result<(), ControllerError> {
        self.send(ControllerCommand::StartMeasurement)
    }

    pub fn stop_measurement(&self) -> Result<(), ControllerError> {
        self.send(ControllerCommand::StopMeasurement)
    }

    pub fn clear_error(&self) -> Result<(), ControllerError> {
        self.send(ControllerCommand::ClearError)
    }

    pub fn state(&self) -> watch::Receiver<DeviceState> {
        self.state.clone()
    }

    pub fn current_reading(&self) -> watch::Receiver<Option<Reading>> {
        self.reading.clone()
    }

    pub fn progress(&self) -> watch::Receiver<u16> {
        self.progress.clone()
    }

    /// Disconnect and wait for the controller task to finish
    pub async fn shutdown(self) {
        let _ = self.commands.send(ControllerCommand::Shutdown);
        if let Err(e) = self.task.await {
            error!("Controller task ended abnormally: {}", e);
        }
    }
}
