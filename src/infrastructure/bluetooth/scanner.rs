//! BLE Scanner Module
//!
//! Finds the first blood-pressure cuff in range. The scan is always stopped
//! before returning, whether a device was found, the timeout elapsed, or
//! the backend gave up.

use crate::infrastructure::bluetooth::transport::{
    DiscoveredDevice, ScanFilter, TransportAdapter, TransportError,
};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct BleScanner {
    filter: ScanFilter,
    timeout: Duration,
}

impl BleScanner {
    pub fn new(filter: ScanFilter, timeout: Duration) -> Self {
        Self { filter, timeout }
    }

    /// Scan until the first matching device or the timeout.
    ///
    /// `Ok(None)` means nothing matched in time.
    pub async fn find_first(
        &self,
        transport: &dyn TransportAdapter,
    ) -> Result<Option<DiscoveredDevice>, TransportError> {
        info!(
            "Starting BLE scan for service {} or names {:?}",
            self.filter.service, self.filter.name_prefixes
        );
        let mut results = transport.scan(&self.filter).await?;
        let deadline = Instant::now() + self.timeout;

        let found = loop {
            match tokio::time::timeout_at(deadline, results.recv()).await {
                Ok(Some(candidate)) if self.filter.matches(&candidate) => break Some(candidate),
                Ok(Some(other)) => {
                    debug!("Ignoring non-matching device {:?}", other.device.name);
                }
                Ok(None) => {
                    debug!("Scan ended by backend");
                    break None;
                }
                Err(_) => {
                    info!("Scan timed out after {:?}", self.timeout);
                    break None;
                }
            }
        };

        if let Err(e) = transport.stop_scan().await {
            warn!("Failed to stop scan cleanly: {}", e);
        }

        if let Some(device) = &found {
            info!(
                "Found device {} ({})",
                device.device.name.as_deref().unwrap_or("Unknown"),
                device.device.id
            );
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::fake::FakeTransport;
    use crate::infrastructure::bluetooth::protocol::BLOOD_PRESSURE_SERVICE_UUID;

    fn scanner() -> BleScanner {
        BleScanner::new(
            ScanFilter {
                service: BLOOD_PRESSURE_SERVICE_UUID,
                name_prefixes: vec!["Qardio".to_string()],
            },
            Duration::from_secs(10),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_match_wins_and_scan_stops() {
        let fake = FakeTransport::new();
        fake.add_device("Speaker", vec![]);
        fake.add_device("QardioArm", vec![]);
        fake.add_device("Other cuff", vec![BLOOD_PRESSURE_SERVICE_UUID]);

        let found = scanner().find_first(&fake).await.unwrap().unwrap();
        assert_eq!(found.device.name.as_deref(), Some("QardioArm"));
        assert_eq!(fake.calls(), vec!["scan", "stop_scan"]);
    }

    #[tokio::test]
    async fn test_backend_forwards_only_matching_devices() {
        let fake = FakeTransport::new();
        fake.add_device("Speaker", vec![]);
        fake.add_device("Other cuff", vec![BLOOD_PRESSURE_SERVICE_UUID]);
        fake.add_device("QardioArm", vec![]);

        let mut results = fake.scan(&scanner().filter).await.unwrap();
        let mut names = Vec::new();
        while let Ok(found) = results.try_recv() {
            names.push(found.device.name.unwrap());
        }
        assert_eq!(names, vec!["Other cuff", "QardioArm"]);
        fake.stop_scan().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_still_stops_scan() {
        let fake = FakeTransport::new();
        fake.add_device("Speaker", vec![]);

        let started = Instant::now();
        let found = scanner().find_first(&fake).await.unwrap();
        assert!(found.is_none());
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(fake.count_calls("stop_scan"), 1);
    }
}
