use std::time::Duration;

use tokio::time::Instant;

/// Forward buffer accounting. Fetched media adds to the level; once playback
/// starts the level drains in real time.
#[derive(Debug, Clone)]
pub struct RollingBuffer {
    capacity: Duration,
    level: Duration,
    draining_since: Option<Instant>,
}

impl RollingBuffer {
    pub fn new(capacity: Duration) -> Self {
        Self {
            capacity,
            level: Duration::ZERO,
            draining_since: None,
        }
    }

    pub fn start_draining(&mut self, now: Instant) {
        if self.draining_since.is_none() {
            self.draining_since = Some(now);
        }
    }

    pub fn push(&mut self, media: Duration, now: Instant) {
        self.settle(now);
        self.level = self.level.saturating_add(media);
    }

    pub fn level(&mut self, now: Instant) -> Duration {
        self.settle(now);
        self.level
    }

    pub fn is_full(&mut self, now: Instant) -> bool {
        self.level(now) >= self.capacity
    }

    /// Time until the level drops below capacity again.
    pub fn wait_for_room(&mut self, now: Instant) -> Duration {
        let level = self.level(now);
        if self.draining_since.is_none() || level < self.capacity {
            return Duration::ZERO;
        }
        (level - self.capacity).saturating_add(Duration::from_millis(1))
    }

    fn settle(&mut self, now: Instant) {
        if let Some(since) = self.draining_since {
            let played = now.saturating_duration_since(since);
            self.level = self.level.saturating_sub(played);
            self.draining_since = Some(now);
        }
    }
}
