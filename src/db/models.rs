//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::monitor::{ConfirmedState, EntityMonitorState, PowerState};

use super::DbError;

fn default_port() -> u16 {
    80
}

fn default_enabled() -> bool {
    true
}

/// An endpoint whose reachability stands in for power at one location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredEndpoint {
    pub entity_id: String,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for MonitoredEndpoint {
    fn default() -> Self {
        Self {
            entity_id: String::new(),
            host: String::new(),
            port: default_port(),
            enabled: true,
        }
    }
}

impl MonitoredEndpoint {
    /// Whether the endpoint should be probed at all.
    pub fn is_probeable(&self) -> bool {
        self.enabled && !self.host.trim().is_empty()
    }
}

/// Raw `monitor_state` row before the text columns are decoded.
#[derive(Debug, Clone)]
pub(crate) struct StateRow {
    pub entity_id: String,
    pub current_state: String,
    pub pending_state: Option<String>,
    pub pending_since: Option<String>,
    pub last_stable_at: Option<String>,
    pub instability_started_at: Option<String>,
    pub switch_count: i64,
    pub last_notified_at: Option<String>,
    pub last_probe_at: Option<String>,
    pub last_probe_ok: Option<bool>,
    pub revision: i64,
}

impl StateRow {
    pub fn decode(self) -> Result<EntityMonitorState, DbError> {
        let current_state = ConfirmedState::parse(&self.current_state)
            .ok_or_else(|| DbError::Decode(format!("bad current_state {:?}", self.current_state)))?;

        let pending_state = match self.pending_state.as_deref() {
            None => None,
            Some(s) => Some(
                PowerState::parse(s)
                    .ok_or_else(|| DbError::Decode(format!("bad pending_state {:?}", s)))?,
            ),
        };

        let switch_count = u32::try_from(self.switch_count)
            .map_err(|_| DbError::Decode(format!("bad switch_count {}", self.switch_count)))?;

        let revision = u64::try_from(self.revision)
            .map_err(|_| DbError::Decode(format!("bad revision {}", self.revision)))?;

        Ok(EntityMonitorState {
            pending_since: decode_time("pending_since", self.pending_since)?,
            last_stable_at: decode_time("last_stable_at", self.last_stable_at)?,
            instability_started_at: decode_time("instability_started_at", self.instability_started_at)?,
            last_notified_at: decode_time("last_notified_at", self.last_notified_at)?,
            last_probe_at: decode_time("last_probe_at", self.last_probe_at)?,
            last_probe_ok: self.last_probe_ok,
            entity_id: self.entity_id,
            current_state,
            pending_state,
            switch_count,
            revision,
        })
    }
}

fn decode_time(column: &str, value: Option<String>) -> Result<Option<DateTime<Utc>>, DbError> {
    match value {
        None => Ok(None),
        Some(s) => super::store::parse_db_time(&s)
            .map(Some)
            .ok_or_else(|| DbError::Decode(format!("bad {} {:?}", column, s))),
    }
}
