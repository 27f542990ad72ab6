//! Auto-watering decision engine, evaluated once per wall-clock hour.
//!
//! Decisions are not made on every reading, so a noisy sensor cannot flap the
//! pump. A firing decision goes through the command gateway exactly like an
//! operator command.
//!
//! ```text
//! tick ──[mode == manual]──▶ skip
//!   │
//!   └─[auto]──[no reading]──▶ skip
//!               │
//!               ├─[soil <  threshold]──▶ pump ON
//!               └─[soil >= threshold]──▶ satisfied
//! ```
//!
//! `scheduled_interval` in the settings is display-only; the cadence here is
//! always hourly.

use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::command;
use crate::db::Db;
use crate::error::Result;
use crate::state::{StatusRegister, WateringMode};

/// Time between decision ticks.
const TICK_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Upper bound for one tick's store work. Keeps a hung store from eating
/// into the next tick.
const TICK_BUDGET: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Operator has sole control.
    Manual,
    /// Nothing ingested yet.
    NoReading,
    Satisfied { soil: f64, threshold: i64 },
    Watered { soil: f64, threshold: i64 },
}

/// Evaluate the auto-watering policy once and act on it.
pub async fn evaluate(db: &Db, status: &StatusRegister) -> Result<Decision> {
    if status.snapshot().await.current_mode == WateringMode::Manual {
        return Ok(Decision::Manual);
    }

    let settings = db.current_settings().await?;
    let Some(reading) = db.latest_reading().await? else {
        return Ok(Decision::NoReading);
    };

    let soil = reading.soil_humidity;
    let threshold = settings.humidity_threshold;

    // Strictly below: a reading equal to the threshold does not water.
    if soil >= threshold as f64 {
        return Ok(Decision::Satisfied { soil, threshold });
    }

    // The operator may have switched to manual while the store was queried.
    if command::issue_auto_watering(status).await.is_none() {
        return Ok(Decision::Manual);
    }

    Ok(Decision::Watered { soil, threshold })
}

/// One scheduled tick. Errors and timeouts are logged, never propagated, so
/// the loop keeps running.
pub async fn tick(db: &Db, status: &StatusRegister) {
    match tokio::time::timeout(TICK_BUDGET, evaluate(db, status)).await {
        Ok(Ok(Decision::Watered { soil, threshold })) => {
            info!(soil, threshold, "scheduler: soil below threshold, pump on");
        }
        Ok(Ok(Decision::Satisfied { soil, threshold })) => {
            debug!(soil, threshold, "scheduler: soil moist enough");
        }
        Ok(Ok(decision)) => {
            debug!(?decision, "scheduler: skipped");
        }
        Ok(Err(e)) => {
            error!("scheduler: evaluation failed: {e}");
        }
        Err(_) => {
            error!(budget_sec = TICK_BUDGET.as_secs(), "scheduler: evaluation timed out");
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the scheduler loop. Intended to be `tokio::spawn`-ed from main.
pub async fn run(db: Db, status: StatusRegister) {
    let first = Instant::now() + until_next_hour(OffsetDateTime::now_utc());
    let mut ticker = tokio::time::interval_at(first, TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        tick_sec = TICK_INTERVAL.as_secs(),
        first_in_sec = (first - Instant::now()).as_secs(),
        "scheduler started"
    );

    loop {
        ticker.tick().await;
        tick(&db, &status).await;
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Time left until the top of the next hour (never zero).
fn until_next_hour(now: OffsetDateTime) -> Duration {
    let into_hour = u64::from(now.minute()) * 60 + u64::from(now.second());
    let elapsed = Duration::from_secs(into_hour) + Duration::from_nanos(u64::from(now.nanosecond()));
    TICK_INTERVAL.saturating_sub(elapsed).max(Duration::from_millis(1))
}

// ===========================================================================
// Tests
// ===========================================================================
