//! Command gateway: applies operator and scheduler commands to the status
//! register.
//!
//! The hub has no link to the actuator. A command here records the *intended*
//! pump state; the device reports its real state on its next reading.
//!
//! Mode changes made here are live only. The durable `watering_mode` lives in
//! the settings store and is changed through `PUT /api/settings`; callers that
//! want both must write both.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::error::{Error, Result};
use crate::state::{EventKind, PumpState, StatusRegister, WateringMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Command {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pump: Option<PumpState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<WateringMode>,
}

/// Who issued a command. Only used for logging and the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    Operator,
    Scheduler,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(2);
        if let Some(p) = self.pump {
            parts.push(format!("pump={p}"));
        }
        if let Some(m) = self.mode {
            parts.push(format!("mode={m}"));
        }
        f.write_str(&parts.join(" "))
    }
}

/// Apply `cmd` to the status register and echo back what was applied.
pub async fn issue(status: &StatusRegister, cmd: Command, source: CommandSource) -> Result<Command> {
    if cmd.pump.is_none() && cmd.mode.is_none() {
        return Err(Error::validation("Missing pump or mode command"));
    }

    status.apply(cmd.pump, cmd.mode).await;
    record_applied(status, cmd, source).await;

    Ok(cmd)
}

/// Scheduler path for a watering decision. The mode check and the pump write
/// happen under one lock; returns `None` if the live mode is manual by then.
pub async fn issue_auto_watering(status: &StatusRegister) -> Option<Command> {
    if !status.pump_on_if_auto().await {
        return None;
    }

    let cmd = Command {
        pump: Some(PumpState::On),
        mode: None,
    };
    record_applied(status, cmd, CommandSource::Scheduler).await;
    Some(cmd)
}

async fn record_applied(status: &StatusRegister, cmd: Command, source: CommandSource) {
    info!(?source, pump = ?cmd.pump, mode = ?cmd.mode, "command applied");
    let origin = match source {
        CommandSource::Operator => "operator",
        CommandSource::Scheduler => "scheduler",
    };
    status
        .record(EventKind::Command, format!("{origin}: {cmd}"))
        .await;
}
