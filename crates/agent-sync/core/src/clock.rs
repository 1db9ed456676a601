//! Time and identifier source injected into the engine.

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

/// Supplies timestamps and fresh message ids.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn new_id(&self) -> String;

    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Wall clock with random `msg_<uuid>` ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn new_id(&self) -> String {
        format!("msg_{}", Uuid::new_v4().simple())
    }
}

/// ISO-8601 UTC with millisecond precision, e.g. `2025-01-01T00:00:00.000Z`.
#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
