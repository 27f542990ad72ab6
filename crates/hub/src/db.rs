//! SQLite persistence: the append-only reading log and the settings record.

use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::state::{PumpState, WateringMode};

/// Policy used when no settings row exists yet. Also what gets persisted on
/// first boot.
pub const DEFAULT_HUMIDITY_THRESHOLD: i64 = 30;
pub const DEFAULT_WATERING_MODE: WateringMode = WateringMode::Auto;
pub const DEFAULT_SCHEDULED_INTERVAL: i64 = 12;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// A stored sample. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub id: i64,
    pub soil_humidity: f64,
    pub temperature: f64,
    pub air_humidity: f64,
    pub pump_status: PumpState,
    #[serde(rename = "timestamp", with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
}

/// A sample about to be appended. `captured_at` defaults to the server clock.
#[derive(Debug, Clone)]
pub struct NewReading {
    pub soil_humidity: f64,
    pub temperature: f64,
    pub air_humidity: f64,
    pub pump_status: PumpState,
    pub captured_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub humidity_threshold: i64,
    pub watering_mode: WateringMode,
    #[serde(rename = "scheduled_interval")]
    pub scheduled_interval_hours: i64,
    #[serde(rename = "last_updated", with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Partial settings update. `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct SettingsPatch {
    pub humidity_threshold: Option<i64>,
    pub watering_mode: Option<WateringMode>,
    pub scheduled_interval_hours: Option<i64>,
}

#[derive(FromRow)]
struct ReadingRow {
    id: i64,
    soil_humidity: f64,
    temperature: f64,
    air_humidity: f64,
    pump_status: String,
    captured_at: i64,
}

impl TryFrom<ReadingRow> for Reading {
    type Error = sqlx::Error;

    fn try_from(r: ReadingRow) -> Result<Self, Self::Error> {
        Ok(Reading {
            id: r.id,
            soil_humidity: r.soil_humidity,
            temperature: r.temperature,
            air_humidity: r.air_humidity,
            pump_status: PumpState::from_str(&r.pump_status).map_err(decode_err)?,
            captured_at: from_unix_ms(r.captured_at)?,
        })
    }
}

#[derive(FromRow)]
struct SettingsRow {
    humidity_threshold: i64,
    watering_mode: String,
    scheduled_interval: i64,
    updated_at: i64,
}

impl TryFrom<SettingsRow> for Settings {
    type Error = sqlx::Error;

    fn try_from(r: SettingsRow) -> Result<Self, Self::Error> {
        Ok(Settings {
            humidity_threshold: r.humidity_threshold,
            watering_mode: WateringMode::from_str(&r.watering_mode).map_err(decode_err)?,
            scheduled_interval_hours: r.scheduled_interval,
            updated_at: from_unix_ms(r.updated_at)?,
        })
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/plantcare/plantcare.db"
    /// - "sqlite::memory:" (tests)
    ///
    /// `timeout` bounds both pool acquisition and SQLite lock waits, so a
    /// stuck database fails the call instead of hanging it.
    pub async fn connect(db_url: &str, max_connections: u32, timeout: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(timeout);

        let pool = SqlitePoolOptions::new()
            .min_connections(1) // in-memory dbs vanish when the last connection drops
            .max_connections(max_connections)
            .acquire_timeout(timeout)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(())
    }

    /// Waits for checked-out connections to be returned, then closes the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ----------------------------
    // Readings
    // ----------------------------

    pub async fn insert_reading(&self, r: &NewReading) -> Result<i64> {
        for (name, v) in [
            ("soil", r.soil_humidity),
            ("temp", r.temperature),
            ("hum", r.air_humidity),
        ] {
            if !v.is_finite() {
                return Err(Error::validation(format!("{name} must be a finite number")));
            }
        }

        let captured_at = r.captured_at.unwrap_or_else(OffsetDateTime::now_utc);
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO readings (soil_humidity, temperature, air_humidity, pump_status, captured_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(r.soil_humidity)
        .bind(r.temperature)
        .bind(r.air_humidity)
        .bind(r.pump_status.as_str())
        .bind(to_unix_ms(captured_at))
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// The most recently captured reading, if any.
    pub async fn latest_reading(&self) -> Result<Option<Reading>> {
        let row = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT id, soil_humidity, temperature, air_humidity, pump_status, captured_at
            FROM readings
            ORDER BY captured_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Reading::try_from).transpose()?)
    }

    /// Readings captured in `[now - hours_back, now]`, oldest first.
    pub async fn readings_since(&self, hours_back: f64) -> Result<Vec<Reading>> {
        if !hours_back.is_finite() || hours_back <= 0.0 {
            return Err(Error::validation("hours must be a positive number"));
        }

        let now = OffsetDateTime::now_utc();
        let now_ms = to_unix_ms(now);
        let from_ms = now_ms - (hours_back * 3_600_000.0) as i64;

        let rows = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT id, soil_humidity, temperature, air_humidity, pump_status, captured_at
            FROM readings
            WHERE captured_at >= ? AND captured_at <= ?
            ORDER BY captured_at ASC, id ASC
            "#,
        )
        .bind(from_ms)
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(Reading::try_from)
            .collect::<Result<Vec<_>, _>>()?)
    }

    // ----------------------------
    // Settings
    // ----------------------------

    /// Insert the default settings row if the table is empty. Idempotent.
    pub async fn ensure_default_settings(&self) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (humidity_threshold, watering_mode, scheduled_interval, updated_at)
            SELECT ?, ?, ?, ?
            WHERE NOT EXISTS (SELECT 1 FROM settings)
            "#,
        )
        .bind(DEFAULT_HUMIDITY_THRESHOLD)
        .bind(DEFAULT_WATERING_MODE.as_str())
        .bind(DEFAULT_SCHEDULED_INTERVAL)
        .bind(to_unix_ms(OffsetDateTime::now_utc()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Current settings; seeds and returns the defaults on an empty store.
    pub async fn current_settings(&self) -> Result<Settings> {
        if let Some(s) = self.fetch_latest_settings().await? {
            return Ok(s);
        }
        self.ensure_default_settings().await?;
        self.fetch_latest_settings()
            .await?
            .ok_or_else(|| Error::Persistence(sqlx::Error::RowNotFound))
    }

    /// Merge `patch` into the current record inside one transaction and
    /// return the result. Nothing is applied if any step fails.
    pub async fn update_settings(&self, patch: &SettingsPatch) -> Result<Settings> {
        if let Some(t) = patch.humidity_threshold {
            if !(0..=100).contains(&t) {
                return Err(Error::validation(format!(
                    "humidity_threshold {t} out of range [0, 100]"
                )));
            }
        }
        if let Some(h) = patch.scheduled_interval_hours {
            if h <= 0 {
                return Err(Error::validation(format!(
                    "scheduled_interval must be positive, got {h}"
                )));
            }
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO settings (humidity_threshold, watering_mode, scheduled_interval, updated_at)
            SELECT ?, ?, ?, ?
            WHERE NOT EXISTS (SELECT 1 FROM settings)
            "#,
        )
        .bind(DEFAULT_HUMIDITY_THRESHOLD)
        .bind(DEFAULT_WATERING_MODE.as_str())
        .bind(DEFAULT_SCHEDULED_INTERVAL)
        .bind(to_unix_ms(OffsetDateTime::now_utc()))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE settings SET
              humidity_threshold = COALESCE(?, humidity_threshold),
              watering_mode = COALESCE(?, watering_mode),
              scheduled_interval = COALESCE(?, scheduled_interval),
              updated_at = ?
            WHERE id = (SELECT MAX(id) FROM settings)
            "#,
        )
        .bind(patch.humidity_threshold)
        .bind(patch.watering_mode.map(WateringMode::as_str))
        .bind(patch.scheduled_interval_hours)
        .bind(to_unix_ms(OffsetDateTime::now_utc()))
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, SettingsRow>(
            r#"
            SELECT humidity_threshold, watering_mode, scheduled_interval, updated_at
            FROM settings
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Settings::try_from(row)?)
    }

    async fn fetch_latest_settings(&self) -> Result<Option<Settings>> {
        let row = sqlx::query_as::<_, SettingsRow>(
            r#"
            SELECT humidity_threshold, watering_mode, scheduled_interval, updated_at
            FROM settings
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Settings::try_from).transpose()?)
    }

    #[cfg(test)]
    pub(crate) async fn hold_connection(&self) -> sqlx::pool::PoolConnection<Sqlite> {
        self.pool.acquire().await.unwrap()
    }

    #[cfg(test)]
    async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn to_unix_ms(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_unix_ms(ms: i64) -> Result<OffsetDateTime, sqlx::Error> {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .map_err(|e| decode_err(e.to_string()))
}

fn decode_err(msg: String) -> sqlx::Error {
    sqlx::Error::Decode(msg.into())
}

// ===========================================================================
// Tests
// ===========================================================================
