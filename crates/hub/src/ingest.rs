//! Sensor-node ingestion: validate the payload, append the reading, then
//! record the heartbeat.

use serde::Deserialize;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::db::{Db, NewReading};
use crate::error::{Error, Result};
use crate::state::{EventKind, PumpState, StatusRegister};

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// Body posted by the sensor node. Every field is optional at the serde level
/// so a missing one becomes a validation error rather than a decode failure.
#[derive(Debug, Default, Deserialize)]
pub struct ReadingMsg {
    pub soil: Option<f64>,
    pub temp: Option<f64>,
    pub hum: Option<f64>,
    pub pump: Option<String>,
    /// Device capture time, unix seconds.
    pub ts: Option<i64>,
}

impl ReadingMsg {
    pub fn into_new_reading(self) -> Result<NewReading> {
        let (Some(soil), Some(temp), Some(hum), Some(pump)) =
            (self.soil, self.temp, self.hum, self.pump)
        else {
            return Err(Error::validation("Missing required fields"));
        };

        let pump_status: PumpState = pump.parse().map_err(Error::Validation)?;

        let captured_at = self
            .ts
            .map(OffsetDateTime::from_unix_timestamp)
            .transpose()
            .map_err(|e| Error::validation(format!("invalid ts: {e}")))?;

        Ok(NewReading {
            soil_humidity: soil,
            temperature: temp,
            air_humidity: hum,
            pump_status,
            captured_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

/// Persist one reading and mark the device alive. The status register is only
/// touched after the write succeeds, so a failed ingestion leaves it as it was.
pub async fn ingest(db: &Db, status: &StatusRegister, msg: ReadingMsg) -> Result<i64> {
    let reading = msg.into_new_reading()?;

    let id = match db.insert_reading(&reading).await {
        Ok(id) => id,
        Err(e) => {
            warn!("ingest: insert_reading failed: {e}");
            return Err(e);
        }
    };

    status.mark_heartbeat(reading.pump_status).await;

    debug!(
        id,
        soil = reading.soil_humidity,
        temp = reading.temperature,
        hum = reading.air_humidity,
        pump = %reading.pump_status,
        "reading stored"
    );
    status
        .record(
            EventKind::Reading,
            format!(
                "#{id}: soil={} temp={} hum={} pump={}",
                reading.soil_humidity,
                reading.temperature,
                reading.air_humidity,
                reading.pump_status
            ),
        )
        .await;

    Ok(id)
}

// ===========================================================================
// Tests
// ===========================================================================
