//! Notification gate and delivery channels.
//!
//! A confirmed transition produces at most one message per entity within the
//! cooldown window. Delivery is best effort: failures are logged and never
//! undo the transition that triggered them.

mod webhook;

pub use webhook::*;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::monitor::{format_duration, ConfirmedTransition, PowerState};

/// Notification error types.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),
    #[error("notification rejected with status {0}")]
    Rejected(u16),
}

/// Outbound channel to the subscriber behind an entity.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, entity_id: &str, message: &str) -> Result<(), NotifyError>;
}

/// Notifier that only writes messages to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, entity_id: &str, message: &str) -> Result<(), NotifyError> {
        tracing::info!(entity_id, "notification: {}", message);
        Ok(())
    }
}

/// What happened to a transition's notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Suppressed,
    Failed,
}

/// Whether a notification may go out given the last one sent.
pub fn within_cooldown(last_notified_at: Option<DateTime<Utc>>, now: DateTime<Utc>, cooldown: Duration) -> bool {
    let Some(last) = last_notified_at else {
        return false;
    };
    match ChronoDuration::from_std(cooldown) {
        Ok(cooldown) => now - last < cooldown,
        Err(_) => true,
    }
}

/// Render the subscriber-facing text for a transition.
pub fn render_transition(transition: &ConfirmedTransition) -> String {
    let duration = format_duration(transition.duration_in_previous);
    match transition.to {
        PowerState::Off => format!(
            "Power went off at {}. It had been on for {}.",
            transition.entity_id, duration
        ),
        PowerState::On => format!(
            "Power is back at {}. It had been off for {}.",
            transition.entity_id, duration
        ),
    }
}

/// Apply the cooldown gate and send the transition notification.
///
/// The caller records `now` as the entity's `last_notified_at` only when this
/// returns [`Delivery::Sent`].
pub async fn deliver(
    notifier: &dyn Notifier,
    transition: &ConfirmedTransition,
    last_notified_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown: Duration,
) -> Delivery {
    if within_cooldown(last_notified_at, now, cooldown) {
        tracing::info!(
            entity_id = %transition.entity_id,
            "Suppressing {} notification inside {:?} cooldown",
            transition.to,
            cooldown
        );
        return Delivery::Suppressed;
    }

    let message = render_transition(transition);
    match notifier.send(&transition.entity_id, &message).await {
        Ok(()) => Delivery::Sent,
        Err(e) => {
            tracing::error!(entity_id = %transition.entity_id, "Failed to deliver notification: {}", e);
            Delivery::Failed
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingNotifier;
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::Ordering;

    fn transition(to: PowerState, minutes: Option<i64>) -> ConfirmedTransition {
        ConfirmedTransition {
            entity_id: "home-7".to_string(),
            from: if to == PowerState::On { PowerState::Off } else { PowerState::On },
            to,
            at: Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap(),
            duration_in_previous: minutes.map(ChronoDuration::minutes),
            switch_count: 1,
            instability_started_at: None,
        }
    }

    #[test]
    fn test_cooldown_window() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let cooldown = Duration::from_secs(60);

        assert!(!within_cooldown(None, now, cooldown));
        assert!(within_cooldown(Some(now - ChronoDuration::seconds(10)), now, cooldown));
        assert!(!within_cooldown(Some(now - ChronoDuration::seconds(60)), now, cooldown));
    }

    #[test]
    fn test_render_transition() {
        assert_eq!(
            render_transition(&transition(PowerState::Off, Some(130))),
            "Power went off at home-7. It had been on for 2 h 10 min."
        );
        assert_eq!(
            render_transition(&transition(PowerState::On, None)),
            "Power is back at home-7. It had been off for unknown."
        );
    }

    #[tokio::test]
    async fn test_deliver_suppresses_within_cooldown() {
        let notifier = RecordingNotifier::default();
        let t = transition(PowerState::Off, Some(5));
        let cooldown = Duration::from_secs(60);

        let first = deliver(&notifier, &t, None, t.at, cooldown).await;
        assert_eq!(first, Delivery::Sent);

        let second = deliver(&notifier, &t, Some(t.at), t.at + ChronoDuration::seconds(10), cooldown).await;
        assert_eq!(second, Delivery::Suppressed);
        assert_eq!(notifier.messages().len(), 1);
    }

    #[test]
    fn test_deliver_reports_failure() {
        let notifier = RecordingNotifier::default();
        notifier.fail.store(true, Ordering::SeqCst);

        let t = transition(PowerState::On, Some(5));
        let outcome = tokio_test::block_on(deliver(&notifier, &t, None, t.at, Duration::from_secs(60)));
        assert_eq!(outcome, Delivery::Failed);
        assert!(notifier.messages().is_empty());
    }

    #[test]
    fn test_log_notifier_always_accepts() {
        tokio_test::assert_ok!(tokio_test::block_on(LogNotifier.send("home-7", "Power is back")));
    }
}
