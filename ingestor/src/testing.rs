//! In-memory `Repository` and `Cache` doubles with call counters and
//! failure switches.

use crate::errors::{Error, Result};
use crate::model::{Device, ErrorRecord, Measurement};
use crate::store::{Cache, Repository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

fn injected(op: &str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("injected {} failure", op),
    ))
}

pub fn device(id: i64, identifier: &str, last_contact: DateTime<Utc>) -> Device {
    Device {
        id,
        identifier: identifier.to_string(),
        name: format!("device {}", id),
        last_contact,
        max_offline: "01:00:00".to_string(),
        latitude: None,
        longitude: None,
    }
}

#[derive(Default)]
pub struct MemoryRepository {
    pub devices: Mutex<HashMap<String, Device>>,
    pub measurements: Mutex<Vec<Measurement>>,
    pub errors: Mutex<Vec<ErrorRecord>>,
    pub device_lookups: AtomicUsize,
    pub connection_updates: AtomicUsize,
    pub fail_lookups: AtomicBool,
    pub fail_measurements: AtomicBool,
    pub fail_connection_updates: AtomicBool,
    /// Deletes the device row right after its measurement is stored.
    pub remove_after_insert: AtomicBool,
}

impl MemoryRepository {
    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let repo = Self::default();
        repo.devices.lock().unwrap().extend(
            devices
                .into_iter()
                .map(|d| (d.identifier.clone(), d)),
        );
        repo
    }

    pub fn measurements(&self) -> Vec<Measurement> {
        self.measurements.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.lock().unwrap().clone()
    }

    pub fn lookups(&self) -> usize {
        self.device_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get_device_by_identifier(&self, identifier: &str) -> Result<Option<Device>> {
        self.device_lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(injected("lookup"));
        }
        Ok(self.devices.lock().unwrap().get(identifier).cloned())
    }

    async fn update_device_connection(&self, device_id: i64, at: DateTime<Utc>) -> Result<()> {
        self.connection_updates.fetch_add(1, Ordering::SeqCst);
        if self.fail_connection_updates.load(Ordering::SeqCst) {
            return Err(injected("connection update"));
        }
        let mut devices = self.devices.lock().unwrap();
        match devices.values_mut().find(|d| d.id == device_id) {
            Some(device) => {
                device.last_contact = at;
                Ok(())
            }
            None => Err(Error::DeviceNotFound(device_id)),
        }
    }

    async fn insert_measurement(&self, measurement: &Measurement) -> Result<i64> {
        if self.fail_measurements.load(Ordering::SeqCst) {
            return Err(injected("measurement insert"));
        }
        let mut devices = self.devices.lock().unwrap();
        if !devices.values().any(|d| d.id == measurement.device_id) {
            return Err(Error::DeviceNotFound(measurement.device_id));
        }
        if self.remove_after_insert.load(Ordering::SeqCst) {
            devices.retain(|_, d| d.id != measurement.device_id);
        }

        let mut measurements = self.measurements.lock().unwrap();
        let id = measurements.len() as i64 + 1;
        measurements.push(Measurement {
            id: Some(id),
            ..measurement.clone()
        });
        Ok(id)
    }

    async fn insert_error(&self, record: &ErrorRecord) -> Result<i64> {
        let mut errors = self.errors.lock().unwrap();
        let id = errors.len() as i64 + 1;
        errors.push(ErrorRecord {
            id: Some(id),
            ..record.clone()
        });
        Ok(id)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCache {
    pub entries: Mutex<HashMap<String, Device>>,
    pub reads: AtomicUsize,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
    pub unavailable: AtomicBool,
}

impl MemoryCache {
    pub fn entry(&self, identifier: &str) -> Option<Device> {
        self.entries.lock().unwrap().get(identifier).cloned()
    }

    pub fn insert(&self, device: Device) {
        self.entries
            .lock()
            .unwrap()
            .insert(device.identifier.clone(), device);
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get_device(&self, identifier: &str) -> Result<Option<Device>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(injected("cache read"));
        }
        Ok(self.entry(identifier))
    }

    async fn set_device(&self, device: &Device) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(injected("cache write"));
        }
        self.insert(device.clone());
        Ok(())
    }

    async fn delete_device(&self, identifier: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(identifier);
        Ok(())
    }

    async fn update_device_location(
        &self,
        identifier: &str,
        latitude: f64,
        longitude: f64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(injected("cache write"));
        }
        if let Some(device) = self.entries.lock().unwrap().get_mut(identifier) {
            device.latitude = Some(latitude);
            device.longitude = Some(longitude);
            device.last_contact = at;
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(injected("cache ping"));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
