use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

/// Silence of at least this long marks the device offline.
pub const OFFLINE_AFTER: Duration = Duration::minutes(5);

// ---------------------------------------------------------------------------
// Shared enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpState {
    On,
    Off,
}

impl PumpState {
    pub fn as_str(self) -> &'static str {
        match self {
            PumpState::On => "on",
            PumpState::Off => "off",
        }
    }
}

impl FromStr for PumpState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Ok(PumpState::On),
            "off" => Ok(PumpState::Off),
            other => Err(format!("unknown pump state '{other}' (use on/off)")),
        }
    }
}

impl fmt::Display for PumpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WateringMode {
    Auto,
    Manual,
}

impl WateringMode {
    pub fn as_str(self) -> &'static str {
        match self {
            WateringMode::Auto => "auto",
            WateringMode::Manual => "manual",
        }
    }
}

impl FromStr for WateringMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(WateringMode::Auto),
            "manual" => Ok(WateringMode::Manual),
            other => Err(format!("unknown watering mode '{other}' (use auto/manual)")),
        }
    }
}

impl fmt::Display for WateringMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Snapshot + events
// ---------------------------------------------------------------------------

/// Live view of the device. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub is_online: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_heartbeat: OffsetDateTime,
    pub pump_status: PumpState,
    pub current_mode: WateringMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Command,
    Liveness,
    System,
}

struct Inner {
    status: SystemStatus,
    events: VecDeque<StatusEvent>,
}

impl Inner {
    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(StatusEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ---------------------------------------------------------------------------
// Status register
// ---------------------------------------------------------------------------

/// Handle to the single device status. Cloning shares the same state.
///
/// Every mutator takes the write lock once and applies its whole transition
/// under it, so readers of [`StatusRegister::snapshot`] never see a
/// half-applied change.
#[derive(Clone)]
pub struct StatusRegister {
    inner: Arc<RwLock<Inner>>,
}

impl StatusRegister {
    /// Optimistic start: online, pump off.
    pub fn new(mode: WateringMode) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                status: SystemStatus {
                    is_online: true,
                    last_heartbeat: OffsetDateTime::now_utc(),
                    pump_status: PumpState::Off,
                    current_mode: mode,
                },
                events: VecDeque::with_capacity(MAX_EVENTS),
            })),
        }
    }

    /// Record that the device reported in, with the pump state it reported.
    pub async fn mark_heartbeat(&self, pump: PumpState) {
        self.mark_heartbeat_at(pump, OffsetDateTime::now_utc()).await;
    }

    pub(crate) async fn mark_heartbeat_at(&self, pump: PumpState, at: OffsetDateTime) {
        let mut inner = self.inner.write().await;
        let was_online = inner.status.is_online;
        inner.status.last_heartbeat = at;
        inner.status.pump_status = pump;
        inner.status.is_online = true;
        if !was_online {
            inner.push_event(EventKind::Liveness, "device back online".to_string());
        }
    }

    /// Apply a pump and/or mode change as one transition.
    pub async fn apply(&self, pump: Option<PumpState>, mode: Option<WateringMode>) {
        let mut inner = self.inner.write().await;
        if let Some(p) = pump {
            inner.status.pump_status = p;
        }
        if let Some(m) = mode {
            inner.status.current_mode = m;
        }
    }

    /// Turn the pump on only if the live mode is auto, checked under the same
    /// write guard. Returns false (and changes nothing) in manual mode.
    pub async fn pump_on_if_auto(&self) -> bool {
        let mut inner = self.inner.write().await;
        if inner.status.current_mode != WateringMode::Auto {
            return false;
        }
        inner.status.pump_status = PumpState::On;
        true
    }

    /// Downgrade to offline when the last heartbeat is at least
    /// [`OFFLINE_AFTER`] old. Returns true only on an online → offline edge.
    pub async fn mark_offline_if_stale(&self, now: OffsetDateTime) -> bool {
        let mut inner = self.inner.write().await;
        if !inner.status.is_online || now - inner.status.last_heartbeat < OFFLINE_AFTER {
            return false;
        }
        inner.status.is_online = false;
        let silent_for = (now - inner.status.last_heartbeat).whole_seconds();
        inner.push_event(
            EventKind::Liveness,
            format!("device offline (silent for {silent_for}s)"),
        );
        true
    }

    pub async fn snapshot(&self) -> SystemStatus {
        self.inner.read().await.status.clone()
    }

    pub async fn record(&self, kind: EventKind, detail: impl Into<String>) {
        self.inner.write().await.push_event(kind, detail.into());
    }

    /// Recent events, newest first.
    pub async fn events(&self) -> Vec<StatusEvent> {
        self.inner.read().await.events.iter().rev().cloned().collect()
    }
}
