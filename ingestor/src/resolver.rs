use crate::errors::Result;
use crate::metrics::CACHE_LOOKUPS_TOTAL;
use crate::model::Device;
use crate::store::{with_deadline, Cache, Repository};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Cache-aside device lookup.
///
/// Cache faults never fail a lookup: a cache error reads as a miss and a
/// failed write-back is only logged. Storage errors are returned.
#[derive(Clone)]
pub struct DeviceResolver {
    repo: Arc<dyn Repository>,
    cache: Arc<dyn Cache>,
    io_timeout: Duration,
}

impl DeviceResolver {
    pub fn new(repo: Arc<dyn Repository>, cache: Arc<dyn Cache>, io_timeout: Duration) -> Self {
        Self {
            repo,
            cache,
            io_timeout,
        }
    }

    /// `Ok(None)` means storage has no such identifier.
    pub async fn resolve(&self, identifier: &str) -> Result<Option<Device>> {
        match with_deadline(
            self.io_timeout,
            "cache read",
            self.cache.get_device(identifier),
        )
        .await
        {
            Ok(Some(device)) => {
                CACHE_LOOKUPS_TOTAL.with_label_values(&["hit"]).inc();
                debug!("Device {} served from cache", identifier);
                return Ok(Some(device));
            }
            Ok(None) => {
                CACHE_LOOKUPS_TOTAL.with_label_values(&["miss"]).inc();
            }
            Err(e) => {
                CACHE_LOOKUPS_TOTAL.with_label_values(&["error"]).inc();
                warn!("Cache read failed for device {}: {}", identifier, e);
            }
        }

        debug!("Device {} not cached, querying storage", identifier);
        let device = with_deadline(
            self.io_timeout,
            "device lookup",
            self.repo.get_device_by_identifier(identifier),
        )
        .await?;

        let Some(device) = device else {
            return Ok(None);
        };

        match with_deadline(self.io_timeout, "cache write", self.cache.set_device(&device)).await {
            Ok(()) => debug!("Device {} cached", identifier),
            Err(e) => warn!("Failed to cache device {}: {}", identifier, e),
        }

        Ok(Some(device))
    }
}
