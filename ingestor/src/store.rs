//! Storage seams used by the pipeline. `db` and `cache` hold the
//! PostgreSQL and Redis implementations.

use crate::errors::{Error, Result};
use crate::model::{Device, ErrorRecord, Measurement};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;

/// Durable store. The source of truth for devices, measurements and the
/// error audit trail.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_device_by_identifier(&self, identifier: &str) -> Result<Option<Device>>;

    /// Fails with [`Error::DeviceNotFound`] when no row was updated.
    async fn update_device_connection(&self, device_id: i64, at: DateTime<Utc>) -> Result<()>;

    /// Returns the generated measurement id. Fails with
    /// [`Error::DeviceNotFound`] when `device_id` has no row.
    async fn insert_measurement(&self, measurement: &Measurement) -> Result<i64>;

    /// Returns the generated error record id.
    async fn insert_error(&self, record: &ErrorRecord) -> Result<i64>;

    async fn ping(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Fast-path copy of device state.
///
/// Entries expire after a TTL that every write refreshes. Nothing
/// invalidates an entry when the row changes through another writer, so a
/// cached device may lag storage by up to one TTL. Do not rely on
/// read-after-write consistency between the two stores.
#[async_trait]
pub trait Cache: Send + Sync {
    /// `Ok(None)` is a plain miss.
    async fn get_device(&self, identifier: &str) -> Result<Option<Device>>;

    async fn set_device(&self, device: &Device) -> Result<()>;

    async fn delete_device(&self, identifier: &str) -> Result<()>;

    /// Overwrites only position and last contact, refreshing the TTL. Does
    /// nothing when the device is not cached.
    async fn update_device_location(
        &self,
        identifier: &str,
        latitude: f64,
        longitude: f64,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn ping(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Runs `fut` under `limit`, mapping expiry to [`Error::Timeout`].
pub async fn with_deadline<T, F>(limit: Duration, op: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(op)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_deadline_passes_through() {
        let value = with_deadline(Duration::from_secs(1), "noop", async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_expires() {
        let result: Result<()> = with_deadline(Duration::from_millis(50), "slow op", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(Error::Timeout("slow op"))));
    }
}
