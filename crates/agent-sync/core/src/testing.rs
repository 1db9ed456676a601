//! Deterministic collaborators for tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::clock::Clock;

/// Clock that only moves when told to and hands out sequential ids.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    next_id: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            next_id: AtomicU64::new(1),
        }
    }

    /// Starts at 2025-01-01T00:00:00Z.
    #[must_use]
    pub fn epoch() -> Self {
        let start = Utc
            .timestamp_millis_opt(1_735_689_600_000)
            .single()
            .unwrap_or_default();
        Self::new(start)
    }

    pub fn advance_millis(&self, millis: i64) {
        if let Ok(mut now) = self.now.lock() {
            *now += Duration::milliseconds(millis);
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::epoch()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_default()
    }

    fn new_id(&self) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("msg_{id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let clock = ManualClock::epoch();
        let start = clock.now_millis();
        assert_eq!(clock.now_millis(), start);
        clock.advance_millis(75);
        assert_eq!(clock.now_millis(), start + 75);
        assert_eq!(clock.new_id(), "msg_1");
        assert_eq!(clock.new_id(), "msg_2");
    }
}
