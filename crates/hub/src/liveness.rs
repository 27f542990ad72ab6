//! Liveness monitor: marks the device offline after prolonged silence.
//!
//! Only ever flips online → offline. Coming back online is driven by the next
//! ingested reading.

use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::state::{StatusRegister, OFFLINE_AFTER};

/// How often the staleness check runs.
const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Run one staleness check against `now`. Returns true if the device just
/// went offline.
pub async fn check(status: &StatusRegister, now: OffsetDateTime) -> bool {
    let went_offline = status.mark_offline_if_stale(now).await;
    if went_offline {
        let last = status.snapshot().await.last_heartbeat;
        warn!(
            silent_sec = (now - last).whole_seconds(),
            "liveness: no reading for {} min, device offline",
            OFFLINE_AFTER.whole_minutes()
        );
    }
    went_offline
}

/// Run the monitor loop. Intended to be `tokio::spawn`-ed from main.
pub async fn run(status: StatusRegister) {
    let mut ticker = tokio::time::interval(CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        check_sec = CHECK_INTERVAL.as_secs(),
        offline_after_sec = OFFLINE_AFTER.whole_seconds(),
        "liveness monitor started"
    );

    loop {
        ticker.tick().await;
        check(&status, OffsetDateTime::now_utc()).await;
    }
}
