//! Append-only audit files: one for rejected requests, one per device for
//! accepted reports. Application logging goes through `tracing` instead.

use crate::config::AuditConfig;
use crate::errors::Result;
use crate::model::{FieldViolation, TelemetryReport};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A request rejected before reaching device resolution.
#[derive(Debug)]
pub struct InvalidRequest<'a> {
    pub at: DateTime<Utc>,
    /// Source address for HTTP, topic for MQTT.
    pub client: &'a str,
    pub identifier: Option<&'a str>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub violations: &'a [FieldViolation],
}

pub struct AuditLog {
    invalid: Mutex<File>,
    device_dir: PathBuf,
    device_files: Mutex<HashMap<String, File>>,
}

impl AuditLog {
    pub fn open(config: &AuditConfig) -> Result<Self> {
        create_dir_all(&config.log_dir)?;
        create_dir_all(&config.device_log_dir)?;
        let invalid = open_append(&config.log_dir.join(&config.invalid_log_file))?;

        Ok(Self {
            invalid: Mutex::new(invalid),
            device_dir: config.device_log_dir.clone(),
            device_files: Mutex::new(HashMap::new()),
        })
    }

    pub fn log_invalid_request(&self, request: &InvalidRequest<'_>) -> Result<()> {
        let line = format_invalid_request(request);
        let mut file = self.invalid.lock().map_err(|_| poisoned())?;
        write_line(&mut file, Utc::now(), &line)?;
        Ok(())
    }

    /// Appends the report to `<device_log_dir>/<identifier>.log`, opening
    /// the file on first use.
    pub fn log_device_report(&self, report: &TelemetryReport) -> Result<()> {
        let line = format_device_report(report);
        let mut files = self.device_files.lock().map_err(|_| poisoned())?;

        let file = match files.entry(report.identifier.clone()) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let path = self
                    .device_dir
                    .join(format!("{}.log", encode_file_stem(&report.identifier)));
                entry.insert(open_append(&path)?)
            }
        };

        write_line(file, Utc::now(), &line)?;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn write_line(file: &mut File, at: DateTime<Utc>, line: &str) -> io::Result<()> {
    writeln!(file, "{} {}", at.format("%Y/%m/%d %H:%M:%S"), line)
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "audit log lock poisoned")
}

/// Maps an identifier onto a file name, percent-encoding every byte
/// outside `[A-Za-z0-9_-]`. Distinct identifiers never share a file.
pub fn encode_file_stem(identifier: &str) -> String {
    if identifier.is_empty() {
        // No encoding yields a bare `%`.
        return "%".to_string();
    }

    let mut stem = String::with_capacity(identifier.len());
    for byte in identifier.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("%{:02X}", byte));
        }
    }
    stem
}

fn coordinate(value: Option<f64>) -> String {
    value.map_or_else(|| "MISSING".to_string(), |v| format!("{:.6}", v))
}

pub fn format_invalid_request(request: &InvalidRequest<'_>) -> String {
    let mut line = format!(
        "Client: {}, Timestamp: {}, Identifier: {}, Latitude: {}, Longitude: {}",
        request.client,
        request.at.to_rfc3339_opts(SecondsFormat::Secs, true),
        request.identifier.filter(|s| !s.is_empty()).unwrap_or("MISSING"),
        coordinate(request.latitude),
        coordinate(request.longitude),
    );

    if !request.violations.is_empty() {
        line.push_str(&format!(
            ", Errors: [{}]",
            crate::validate::describe(request.violations)
        ));
    }

    line
}

pub fn format_device_report(report: &TelemetryReport) -> String {
    let mut line = format!(
        "Identifier: {}, Latitude: {}, Longitude: {}",
        report.identifier,
        report.latitude.map_or_else(|| "null".to_string(), |v| format!("{:.6}", v)),
        report.longitude.map_or_else(|| "null".to_string(), |v| format!("{:.6}", v)),
    );

    for (slot, value) in report.sensors() {
        if let Some(v) = value {
            line.push_str(&format!(", Sensor_{}: {:.6}", slot, v));
        }
    }

    line
}
