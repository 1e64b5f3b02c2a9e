use crate::errors::{Error, Result};
use crate::model::{Device, ErrorRecord, Measurement};
use crate::store::Repository;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

pub async fn make_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// The device's last known fix is taken from its newest measurement that
/// carries both coordinates.
const SELECT_DEVICE: &str = r#"
    SELECT d.id, d.identifier, d.name, d.last_contact, d.max_offline,
           fix.latitude, fix.longitude
    FROM devices d
    LEFT JOIN LATERAL (
        SELECT m.latitude, m.longitude
        FROM measurements m
        WHERE m.device_id = d.id
          AND m.latitude IS NOT NULL
          AND m.longitude IS NOT NULL
        ORDER BY m.recorded_at DESC, m.id DESC
        LIMIT 1
    ) fix ON TRUE
    WHERE d.identifier = $1
    "#;

#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn get_device_by_identifier(&self, identifier: &str) -> Result<Option<Device>> {
        let device = sqlx::query_as::<_, Device>(SELECT_DEVICE)
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await?;

        Ok(device)
    }

    async fn update_device_connection(&self, device_id: i64, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE devices SET last_contact = $1 WHERE id = $2")
            .bind(at)
            .bind(device_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::DeviceNotFound(device_id));
        }
        Ok(())
    }

    async fn insert_measurement(&self, m: &Measurement) -> Result<i64> {
        let query = r#"
            INSERT INTO measurements
                (device_id, recorded_at, latitude, longitude, distance,
                 sensor_1, sensor_2, sensor_3, sensor_4, sensor_5)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#;

        let id = sqlx::query_scalar::<_, i64>(query)
            .bind(m.device_id)
            .bind(m.recorded_at)
            .bind(m.latitude)
            .bind(m.longitude)
            .bind(m.distance)
            .bind(m.sensor_1)
            .bind(m.sensor_2)
            .bind(m.sensor_3)
            .bind(m.sensor_4)
            .bind(m.sensor_5)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                    Error::DeviceNotFound(m.device_id)
                }
                e => Error::Database(e),
            })?;

        Ok(id)
    }

    async fn insert_error(&self, record: &ErrorRecord) -> Result<i64> {
        let query = r#"
            INSERT INTO device_errors (device_id, identifier, recorded_at, description)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#;

        let id = sqlx::query_scalar::<_, i64>(query)
            .bind(record.device_id)
            .bind(record.identifier.as_deref())
            .bind(record.recorded_at)
            .bind(&record.description)
            .fetch_one(&self.pool)
            .await?;

        Ok(id)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        info!("Database pool closed");
        Ok(())
    }
}
