use crate::errors::Result;
use crate::model::Device;
use crate::store::Cache;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Touches only an existing entry so a partial hash is never created.
const UPDATE_LOCATION_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
redis.call('HSET', KEYS[1], 'latitude', ARGV[1], 'longitude', ARGV[2], 'last_contact', ARGV[3])
redis.call('EXPIRE', KEYS[1], ARGV[4])
return 1
"#;

/// Device cache stored as one Redis hash per device under `device:<identifier>`.
pub struct RedisCache {
    conn: ConnectionManager,
    ttl: Duration,
    update_location: redis::Script,
}

impl RedisCache {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self> {
        info!("Connecting to Redis...");
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Redis connection established");

        Ok(Self {
            conn,
            ttl,
            update_location: redis::Script::new(UPDATE_LOCATION_SCRIPT),
        })
    }

    fn ttl_secs(&self) -> i64 {
        self.ttl.as_secs().max(1) as i64
    }
}

fn key(identifier: &str) -> String {
    format!("device:{}", identifier)
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn device_fields(device: &Device) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("id", device.id.to_string()),
        ("name", device.name.clone()),
        ("last_contact", timestamp(device.last_contact)),
        ("max_offline", device.max_offline.clone()),
    ];
    if let Some((lat, lon)) = device.position() {
        fields.push(("latitude", lat.to_string()));
        fields.push(("longitude", lon.to_string()));
    }
    fields
}

/// Rebuilds a device from its hash. Entries missing a required field, or
/// holding unparseable values for one, read as a miss.
pub fn device_from_fields(identifier: &str, fields: &HashMap<String, String>) -> Option<Device> {
    let id = fields.get("id")?.parse().ok()?;
    let last_contact = DateTime::parse_from_rfc3339(fields.get("last_contact")?)
        .ok()?
        .with_timezone(&Utc);
    let max_offline = fields.get("max_offline")?.clone();
    let coordinate = |name: &str| fields.get(name).and_then(|v| v.parse::<f64>().ok());

    Some(Device {
        id,
        identifier: identifier.to_string(),
        name: fields.get("name").cloned().unwrap_or_default(),
        last_contact,
        max_offline,
        latitude: coordinate("latitude"),
        longitude: coordinate("longitude"),
    })
}

#[async_trait]
impl Cache for RedisCache {
    async fn get_device(&self, identifier: &str) -> Result<Option<Device>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(key(identifier)).await?;

        if fields.is_empty() {
            return Ok(None);
        }

        let device = device_from_fields(identifier, &fields);
        if device.is_none() {
            warn!("Ignoring incomplete cache entry for device {}", identifier);
        }
        Ok(device)
    }

    async fn set_device(&self, device: &Device) -> Result<()> {
        let key = key(&device.identifier);
        let fields = device_fields(device);
        let mut conn = self.conn.clone();

        // DEL first so a cleared position does not survive from an older entry.
        redis::pipe()
            .atomic()
            .del(&key)
            .ignore()
            .hset_multiple(&key, &fields)
            .ignore()
            .expire(&key, self.ttl_secs())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        debug!("Cached device {}", device.identifier);
        Ok(())
    }

    async fn delete_device(&self, identifier: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key(identifier)).await?;
        Ok(())
    }

    async fn update_device_location(
        &self,
        identifier: &str,
        latitude: f64,
        longitude: f64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .update_location
            .key(key(identifier))
            .arg(latitude.to_string())
            .arg(longitude.to_string())
            .arg(timestamp(at))
            .arg(self.ttl_secs())
            .invoke_async(&mut conn)
            .await?;

        if updated == 0 {
            debug!("Device {} not cached, location update skipped", identifier);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // The connection manager closes its socket when the last clone drops.
        info!("Redis cache released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn device() -> Device {
        Device {
            id: 42,
            identifier: "DEV1".to_string(),
            name: "Pump station".to_string(),
            last_contact: Utc.with_ymd_and_hms(2026, 5, 6, 7, 8, 9).unwrap(),
            max_offline: "02:00:00".to_string(),
            latitude: Some(-33.4489),
            longitude: Some(-70.6693),
        }
    }

    fn as_map(fields: Vec<(&'static str, String)>) -> HashMap<String, String> {
        fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_hash_round_trip() {
        let original = device();
        let restored = device_from_fields("DEV1", &as_map(device_fields(&original)));
        assert_eq!(restored, Some(original));
    }

    #[test]
    fn test_missing_position_is_not_written() {
        let mut d = device();
        d.latitude = None;

        let fields = as_map(device_fields(&d));
        assert!(!fields.contains_key("latitude"));
        assert!(!fields.contains_key("longitude"));

        let restored = device_from_fields("DEV1", &fields).unwrap();
        assert_eq!(restored.position(), None);
    }

    #[test]
    fn test_partial_entry_is_a_miss() {
        let mut fields = as_map(device_fields(&device()));
        fields.remove("id");
        assert_eq!(device_from_fields("DEV1", &fields), None);

        let mut fields = as_map(device_fields(&device()));
        fields.insert("last_contact".to_string(), "yesterday".to_string());
        assert_eq!(device_from_fields("DEV1", &fields), None);
    }
}
