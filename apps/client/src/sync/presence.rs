use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use super::model::{PresenceStatus, UserPresence};

/// Derives the presence status from visibility changes.
///
/// Visible means active. Hidden means idle until `away_after` elapses, then away.
#[derive(Debug)]
pub struct PresenceTracker {
    visible: bool,
    changed_at: Instant,
    away_after: Duration,
}

impl PresenceTracker {
    pub fn new(away_after: Duration) -> Self {
        Self {
            visible: true,
            changed_at: Instant::now(),
            away_after,
        }
    }

    pub fn set_visible(&mut self, visible: bool) {
        if self.visible != visible {
            self.visible = visible;
            self.changed_at = Instant::now();
        }
    }

    pub fn status(&self) -> PresenceStatus {
        if self.visible {
            PresenceStatus::Active
        } else if self.changed_at.elapsed() < self.away_after {
            PresenceStatus::Idle
        } else {
            PresenceStatus::Away
        }
    }

    pub fn snapshot(&self, user_id: &str, device: &str) -> UserPresence {
        UserPresence {
            user_id: user_id.to_string(),
            status: self.status(),
            last_seen: Utc::now(),
            device: device.to_string(),
        }
    }
}

/// Short description of the machine this client runs on.
pub fn device_name() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_hidden_goes_idle_then_away() {
        let mut tracker = PresenceTracker::new(Duration::from_secs(300));
        assert_eq!(tracker.status(), PresenceStatus::Active);

        tracker.set_visible(false);
        assert_eq!(tracker.status(), PresenceStatus::Idle);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(tracker.status(), PresenceStatus::Away);

        tracker.set_visible(true);
        let presence = tracker.snapshot("u-1", "laptop");
        assert_eq!(presence.status, PresenceStatus::Active);
        assert_eq!(presence.device, "laptop");
    }
}
