//! Outbound hook for the health-data sync collaborator.
//!
//! The controller awaits [`ReadingSink::on_reading_complete`] once per
//! completed reading and does not look at the outcome. A sink that manages
//! to sync flips the stored flag through `ReadingStore::mark_synced`.

use async_trait::async_trait;
use tracing::info;

use crate::domain::models::Reading;

#[async_trait]
pub trait ReadingSink: Send + Sync {
    async fn on_reading_complete(&self, reading: &Reading);
}

/// Drops every reading
pub struct NoopSink;

#[async_trait]
impl ReadingSink for NoopSink {
    async fn on_reading_complete(&self, _reading: &Reading) {}
}

/// Writes every reading to the log
pub struct LogSink;

#[async_trait]
impl ReadingSink for LogSink {
    async fn on_reading_complete(&self, reading: &Reading) {
        info!(
            systolic = reading.systolic,
            diastolic = reading.diastolic,
            heart_rate = reading.heart_rate,
            status = reading.status.label(),
            "reading complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::BpStatus;
    use chrono::Utc;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sinks_accept_readings_as_trait_objects() {
        let reading = Reading {
            systolic: 141,
            diastolic: 92,
            mean_arterial_pressure: 108,
            heart_rate: 77,
            timestamp: Utc::now(),
            status: BpStatus::High,
            synced: false,
        };
        let sinks: Vec<Arc<dyn ReadingSink>> = vec![Arc::new(NoopSink), Arc::new(LogSink)];
        for sink in sinks {
            sink.on_reading_complete(&reading).await;
        }
    }
}
