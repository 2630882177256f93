//! Per-entity debounce state machine.
//!
//! ```text
//!                 sample s                     differing sample s'
//!  UNKNOWN ─────────────────────► STABLE(s) ─────────────────────► PENDING(s')
//!                                   ▲   ▲                              │  │
//!                                   │   │   sample == s (flap counted) │  │
//!                                   │   └──────────────────────────────┘  │
//!                                   │      held for the debounce window   │
//!                                   └─────────── STABLE(s') ◄─────────────┘
//! ```
//!
//! While pending, the entity is still reported as `STABLE(s)`. Confirmation
//! is evaluated by polling: [`EntityMonitorState::confirm_due`] is called
//! after every processed sample and commits the pending state once it has
//! been held for the debounce window.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Observed power at a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    pub fn from_reachable(reachable: bool) -> Self {
        if reachable {
            PowerState::On
        } else {
            PowerState::Off
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PowerState::On => "on",
            PowerState::Off => "off",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "on" => Some(PowerState::On),
            "off" => Some(PowerState::Off),
            _ => None,
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last confirmed state of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmedState {
    #[default]
    Unknown,
    On,
    Off,
}

impl ConfirmedState {
    pub fn power(self) -> Option<PowerState> {
        match self {
            ConfirmedState::Unknown => None,
            ConfirmedState::On => Some(PowerState::On),
            ConfirmedState::Off => Some(PowerState::Off),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConfirmedState::Unknown => "unknown",
            ConfirmedState::On => "on",
            ConfirmedState::Off => "off",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(ConfirmedState::Unknown),
            other => PowerState::parse(other).map(Self::from),
        }
    }
}

impl From<PowerState> for ConfirmedState {
    fn from(state: PowerState) -> Self {
        match state {
            PowerState::On => ConfirmedState::On,
            PowerState::Off => ConfirmedState::Off,
        }
    }
}

/// Result of one reachability check, consumed immediately.
#[derive(Debug, Clone)]
pub struct ProbeSample {
    pub entity_id: String,
    pub observed_at: DateTime<Utc>,
    /// `None` when the probe could not run (disabled or not configured).
    pub reachable: Option<bool>,
}

/// Durable monitoring state of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMonitorState {
    pub entity_id: String,
    pub current_state: ConfirmedState,
    pub pending_state: Option<PowerState>,
    pub pending_since: Option<DateTime<Utc>>,
    pub last_stable_at: Option<DateTime<Utc>>,
    pub instability_started_at: Option<DateTime<Utc>>,
    pub switch_count: u32,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub last_probe_ok: Option<bool>,
    /// Bumped on every change. The store never replaces a row with an older revision.
    #[serde(default)]
    pub revision: u64,
}

/// What a single sample did to the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First sample of an unknown entity, adopted without notification.
    Adopted(PowerState),
    /// Sample agrees with the confirmed state and nothing was pending.
    Steady,
    /// Sample reverted to the confirmed state; the pending state was dropped.
    FlapCancelled,
    /// Sample matches the pending state; still inside the debounce window.
    Waiting,
    /// Sample opened a new debounce window.
    PendingStarted(PowerState),
}

/// A pending state that survived its debounce window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedTransition {
    pub entity_id: String,
    pub from: PowerState,
    pub to: PowerState,
    pub at: DateTime<Utc>,
    /// `None` when the previous state had never been confirmed by a transition.
    pub duration_in_previous: Option<ChronoDuration>,
    /// Flaps counted during the episode, captured before the reset.
    pub switch_count: u32,
    pub instability_started_at: Option<DateTime<Utc>>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantError {
    #[error("pending state {0} equals the confirmed state")]
    PendingEqualsCurrent(PowerState),
    #[error("pending state set while the confirmed state is unknown")]
    PendingWhileUnknown,
    #[error("pending state and pending_since must be set together")]
    PendingSinceMismatch,
    #[error("switch_count {0} inconsistent with instability_started_at")]
    InstabilityMismatch(u32),
}

impl EntityMonitorState {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            current_state: ConfirmedState::Unknown,
            pending_state: None,
            pending_since: None,
            last_stable_at: None,
            instability_started_at: None,
            switch_count: 0,
            last_notified_at: None,
            last_probe_at: None,
            last_probe_ok: None,
            revision: 0,
        }
    }

    /// Feed one sample into the state machine.
    pub fn observe(&mut self, reachable: bool, now: DateTime<Utc>) -> Observation {
        self.revision += 1;
        self.last_probe_at = Some(now);
        self.last_probe_ok = Some(reachable);

        let sample = PowerState::from_reachable(reachable);

        let Some(current) = self.current_state.power() else {
            self.current_state = sample.into();
            self.pending_state = None;
            self.pending_since = None;
            return Observation::Adopted(sample);
        };

        if sample == current {
            if self.pending_state.take().is_some() {
                self.pending_since = None;
                self.switch_count = self.switch_count.saturating_add(1);
                return Observation::FlapCancelled;
            }
            return Observation::Steady;
        }

        if self.pending_state == Some(sample) {
            return Observation::Waiting;
        }

        self.pending_state = Some(sample);
        self.pending_since = Some(now);
        if self.instability_started_at.is_none() {
            self.instability_started_at = Some(now);
            self.switch_count = 1;
        } else {
            self.switch_count = self.switch_count.saturating_add(1);
        }

        Observation::PendingStarted(sample)
    }

    /// Commit the pending state if it has been held for `debounce`.
    pub fn confirm_due(&mut self, now: DateTime<Utc>, debounce: Duration) -> Option<ConfirmedTransition> {
        let (pending, since) = match (self.pending_state, self.pending_since) {
            (Some(p), Some(s)) => (p, s),
            _ => return None,
        };
        let from = self.current_state.power()?;

        let Ok(window) = ChronoDuration::from_std(debounce) else {
            return None;
        };
        if now - since < window {
            return None;
        }

        let transition = ConfirmedTransition {
            entity_id: self.entity_id.clone(),
            from,
            to: pending,
            at: now,
            duration_in_previous: self.last_stable_at.map(|t| now - t),
            switch_count: self.switch_count,
            instability_started_at: self.instability_started_at,
        };

        self.revision += 1;
        self.current_state = pending.into();
        self.last_stable_at = Some(now);
        self.pending_state = None;
        self.pending_since = None;
        self.instability_started_at = None;
        self.switch_count = 0;

        Some(transition)
    }

    /// Record that a notification went out at `at`.
    pub fn mark_notified(&mut self, at: DateTime<Utc>) {
        self.revision += 1;
        self.last_notified_at = Some(at);
    }

    /// Check the structural invariants of a state record.
    pub fn validate(&self) -> Result<(), InvariantError> {
        if self.pending_state.is_some() != self.pending_since.is_some() {
            return Err(InvariantError::PendingSinceMismatch);
        }
        if let Some(pending) = self.pending_state {
            match self.current_state.power() {
                None => return Err(InvariantError::PendingWhileUnknown),
                Some(current) if current == pending => {
                    return Err(InvariantError::PendingEqualsCurrent(pending))
                }
                Some(_) => {}
            }
        }
        if self.instability_started_at.is_some() != (self.switch_count > 0) {
            return Err(InvariantError::InstabilityMismatch(self.switch_count));
        }
        Ok(())
    }
}

/// Human-readable length of a period.
///
/// Anything shorter than a minute, including negative spans from stale
/// timestamps, reads "less than a minute".
pub fn format_duration(duration: Option<ChronoDuration>) -> String {
    let Some(duration) = duration else {
        return "unknown".to_string();
    };

    let total_minutes = duration.num_minutes();
    if total_minutes < 1 {
        return "less than a minute".to_string();
    }

    let days = total_minutes / (24 * 60);
    let hours = (total_minutes % (24 * 60)) / 60;
    let minutes = total_minutes % 60;

    let mut parts = Vec::with_capacity(3);
    if days > 0 {
        parts.push(format!("{} d", days));
    }
    if hours > 0 {
        parts.push(format!("{} h", hours));
    }
    if minutes > 0 {
        parts.push(format!("{} min", minutes));
    }
    parts.join(" ")
}
