use anyhow::Context;
use bp_monitor::domain::history::ReadingStore;
use bp_monitor::domain::settings::SettingsService;
use bp_monitor::infrastructure::bluetooth::connection::ConnectionConfig;
use bp_monitor::infrastructure::bluetooth::transport::select_transport;
use bp_monitor::infrastructure::bluetooth::ConnectionController;
use bp_monitor::infrastructure::logging;
use bp_monitor::infrastructure::storage::JsonFileStore;
use bp_monitor::infrastructure::sync::LogSink;
use bp_monitor::presentation::console;
use std::sync::{Arc, Mutex};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();

    let _logging_guard = logging::init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    tracing::info!(
        "Starting blood pressure monitor (settings at {})",
        settings_service.path().display()
    );

    let data_dir = settings.resolve_data_dir()?;
    let backend = JsonFileStore::new(&data_dir)
        .with_context(|| format!("Failed to open history in {}", data_dir.display()))?;
    let store = Arc::new(Mutex::new(ReadingStore::open(Box::new(backend))));

    let config = ConnectionConfig::from_settings(&settings)?;
    let transport = select_transport(&settings).await?;
    let controller =
        ConnectionController::new(transport, config, store.clone(), Arc::new(LogSink));

    console::run(controller.spawn(), store).await
}
