use crate::model::Device;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid HH:MM:SS duration: {0:?}")]
pub struct InvalidDuration(String);

/// Parses an `HH:MM:SS` offline allowance. Hours may exceed 23; minutes and
/// seconds are taken as given, so `00:90:00` is ninety minutes.
pub fn parse_max_offline(value: &str) -> Result<Duration, InvalidDuration> {
    let invalid = || InvalidDuration(value.to_string());

    let parts: Vec<&str> = value.trim().split(':').collect();
    if parts.len() != 3 {
        return Err(invalid());
    }

    let mut total: i64 = 0;
    for (part, unit) in parts.iter().zip([3600_i64, 60, 1]) {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let n: i64 = part.parse().map_err(|_| invalid())?;
        total = n
            .checked_mul(unit)
            .and_then(|s| total.checked_add(s))
            .ok_or_else(invalid)?;
    }

    Duration::try_seconds(total).ok_or_else(invalid)
}

fn format_hms(elapsed: Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Returns a violation when `device` has been silent longer than its
/// allowance. An unparseable allowance disables the check for that device.
pub fn check_offline(device: &Device, now: DateTime<Utc>) -> Option<String> {
    let max_offline = match parse_max_offline(&device.max_offline) {
        Ok(d) => d,
        Err(e) => {
            warn!(
                "Skipping offline check for device {}: {}",
                device.identifier, e
            );
            return None;
        }
    };

    let elapsed = now.signed_duration_since(device.last_contact);
    if elapsed <= max_offline {
        return None;
    }

    let violation = format!(
        "offline limit exceeded: last contact {}, max allowed {}, elapsed {}",
        device
            .last_contact
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        device.max_offline,
        format_hms(elapsed),
    );
    warn!("Device {}: {}", device.identifier, violation);
    Some(violation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn device(last_contact: DateTime<Utc>, max_offline: &str) -> Device {
        Device {
            id: 7,
            identifier: "DEV1".to_string(),
            name: "Truck 7".to_string(),
            last_contact,
            max_offline: max_offline.to_string(),
            latitude: None,
            longitude: None,
        }
    }

    #[test]
    fn test_parse_max_offline() {
        assert_eq!(parse_max_offline("01:00:00"), Ok(Duration::hours(1)));
        assert_eq!(
            parse_max_offline("36:30:15"),
            Ok(Duration::seconds(36 * 3600 + 30 * 60 + 15))
        );
        assert_eq!(parse_max_offline("00:90:00"), Ok(Duration::minutes(90)));
    }

    #[test]
    fn test_parse_max_offline_rejects_garbage() {
        for bad in ["", "1:00", "01:00:00:00", "aa:bb:cc", "-1:00:00", "01::00"] {
            assert!(parse_max_offline(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_within_allowance() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let d = device(t, "01:00:00");

        assert_eq!(check_offline(&d, t + Duration::minutes(59)), None);
        assert_eq!(check_offline(&d, t + Duration::hours(1)), None);
    }

    #[test]
    fn test_past_allowance() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let d = device(t, "01:00:00");

        let violation = check_offline(&d, t + Duration::minutes(61)).unwrap();
        assert!(violation.contains("2026-03-01T12:00:00Z"), "{}", violation);
        assert!(violation.contains("01:00:00"), "{}", violation);
        assert!(violation.contains("elapsed 01:01:00"), "{}", violation);
    }

    #[test]
    fn test_unparseable_allowance_fails_open() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let d = device(t, "one hour");

        assert_eq!(check_offline(&d, t + Duration::days(30)), None);
    }
}
