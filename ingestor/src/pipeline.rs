use crate::audit::AuditLog;
use crate::errors;
use crate::geo::haversine_m;
use crate::metrics::{
    DB_FAILURES_TOTAL, DEVICE_NOT_FOUND_TOTAL, INGEST_LATENCY_SECONDS, INVALID_REPORTS_TOTAL,
    MEASUREMENTS_TOTAL, POLICY_VIOLATIONS_TOTAL,
};
use crate::model::{ErrorRecord, FieldViolation, Measurement, TelemetryReport};
use crate::resolver::DeviceResolver;
use crate::staleness::check_offline;
use crate::store::{with_deadline, Cache, Repository};
use crate::validate::{describe, validate};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// What a caller learns about a report that did not go through.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("validation failed: {}", describe(.0))]
    Validation(Vec<FieldViolation>),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("internal error: {0}")]
    Internal(#[from] errors::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ingested {
    pub measurement_id: i64,
    pub device_id: i64,
    pub distance: Option<f64>,
    /// Number of audited policy violations; the report was stored anyway.
    pub violations: usize,
}

/// Runs one report from validation to cache refresh.
///
/// Only the measurement insert is mandatory. Error records, the device
/// connection update, the cache refresh and the per-device audit line are
/// attempted once, and their failures are logged and swallowed.
pub struct Pipeline {
    repo: Arc<dyn Repository>,
    cache: Arc<dyn Cache>,
    resolver: DeviceResolver,
    audit: Arc<AuditLog>,
    io_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        repo: Arc<dyn Repository>,
        cache: Arc<dyn Cache>,
        audit: Arc<AuditLog>,
        io_timeout: Duration,
    ) -> Self {
        let resolver = DeviceResolver::new(repo.clone(), cache.clone(), io_timeout);
        Self {
            repo,
            cache,
            resolver,
            audit,
            io_timeout,
        }
    }

    pub async fn ingest(&self, report: &TelemetryReport) -> Result<Ingested, IngestError> {
        let start = Instant::now();
        let result = self.run(report).await;
        INGEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
        result
    }

    async fn run(&self, report: &TelemetryReport) -> Result<Ingested, IngestError> {
        let identifier = report.identifier.as_str();

        if let Err(violations) = validate(report) {
            INVALID_REPORTS_TOTAL.inc();
            warn!("Rejected report: {}", describe(&violations));
            self.record_error(ErrorRecord {
                id: None,
                device_id: None,
                identifier: Some(identifier.to_string()).filter(|s| !s.is_empty()),
                recorded_at: Utc::now(),
                description: describe(&violations),
            })
            .await;
            return Err(IngestError::Validation(violations));
        }

        let device = match self.resolver.resolve(identifier).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                DEVICE_NOT_FOUND_TOTAL.inc();
                warn!("Device not found: {}", identifier);
                self.record_error(ErrorRecord {
                    id: None,
                    device_id: None,
                    identifier: Some(identifier.to_string()),
                    recorded_at: Utc::now(),
                    description: format!("identifier not registered: {}", identifier),
                })
                .await;
                return Err(IngestError::DeviceNotFound(identifier.to_string()));
            }
            Err(e) => {
                DB_FAILURES_TOTAL.inc();
                error!("Device lookup failed for {}: {}", identifier, e);
                return Err(IngestError::Internal(e));
            }
        };

        let now = Utc::now();

        let mut violations: Vec<String> = check_offline(&device, now).into_iter().collect();
        violations.extend(missing_coordinates(report));
        if !violations.is_empty() {
            POLICY_VIOLATIONS_TOTAL.inc();
            self.record_error(ErrorRecord {
                id: None,
                device_id: Some(device.id),
                identifier: Some(identifier.to_string()),
                recorded_at: now,
                description: violations.join("; "),
            })
            .await;
        }

        let distance = device
            .position()
            .zip(report.position())
            .map(|((lat1, lon1), (lat2, lon2))| haversine_m(lat1, lon1, lat2, lon2));

        let measurement = Measurement {
            id: None,
            device_id: device.id,
            recorded_at: now,
            latitude: report.latitude,
            longitude: report.longitude,
            distance,
            sensor_1: report.sensor_1,
            sensor_2: report.sensor_2,
            sensor_3: report.sensor_3,
            sensor_4: report.sensor_4,
            sensor_5: report.sensor_5,
        };

        let measurement_id = with_deadline(
            self.io_timeout,
            "measurement insert",
            self.repo.insert_measurement(&measurement),
        )
        .await;

        let measurement_id = match measurement_id {
            Ok(id) => id,
            Err(errors::Error::DeviceNotFound(_)) => {
                // Resolved from a cache entry that outlived its row.
                DEVICE_NOT_FOUND_TOTAL.inc();
                self.evict(identifier).await;
                self.record_error(ErrorRecord {
                    id: None,
                    device_id: None,
                    identifier: Some(identifier.to_string()),
                    recorded_at: now,
                    description: format!("identifier not registered: {}", identifier),
                })
                .await;
                return Err(IngestError::DeviceNotFound(identifier.to_string()));
            }
            Err(e) => {
                DB_FAILURES_TOTAL.inc();
                error!("Failed to store measurement for {}: {}", identifier, e);
                return Err(IngestError::Internal(e));
            }
        };
        MEASUREMENTS_TOTAL.inc();

        self.touch_device(identifier, device.id, now).await;

        if let Some((lat, lon)) = report.position() {
            if let Err(e) = with_deadline(
                self.io_timeout,
                "cache location update",
                self.cache.update_device_location(identifier, lat, lon, now),
            )
            .await
            {
                warn!("Failed to refresh cached location for {}: {}", identifier, e);
            }
        }

        if let Err(e) = self.audit.log_device_report(report) {
            warn!("Failed to write device log for {}: {}", identifier, e);
        }

        info!("Telemetry processed for device {}", identifier);
        Ok(Ingested {
            measurement_id,
            device_id: device.id,
            distance,
            violations: violations.len(),
        })
    }

    async fn touch_device(&self, identifier: &str, device_id: i64, now: DateTime<Utc>) {
        match with_deadline(
            self.io_timeout,
            "connection update",
            self.repo.update_device_connection(device_id, now),
        )
        .await
        {
            Ok(()) => {}
            Err(errors::Error::DeviceNotFound(_)) => self.evict(identifier).await,
            Err(e) => warn!("Failed to update last contact for {}: {}", identifier, e),
        }
    }

    /// Drops the cached copy of a device whose row is gone, so the next
    /// report resolves against storage.
    async fn evict(&self, identifier: &str) {
        warn!("Device {} disappeared from storage, evicting cache entry", identifier);
        if let Err(e) = with_deadline(
            self.io_timeout,
            "cache delete",
            self.cache.delete_device(identifier),
        )
        .await
        {
            warn!("Failed to evict cached device {}: {}", identifier, e);
        }
    }

    async fn record_error(&self, record: ErrorRecord) {
        match with_deadline(self.io_timeout, "error insert", self.repo.insert_error(&record)).await
        {
            Ok(id) => debug!("Recorded error {}: {}", id, record.description),
            Err(e) => error!("Failed to record error ({}): {}", record.description, e),
        }
    }
}

fn missing_coordinates(report: &TelemetryReport) -> Vec<String> {
    let mut missing = Vec::new();
    if report.latitude.is_none() {
        missing.push("missing data: latitude".to_string());
    }
    if report.longitude.is_none() {
        missing.push("missing data: longitude".to_string());
    }
    missing
}
