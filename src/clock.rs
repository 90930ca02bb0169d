//! UTC clock helpers shared by the store and its callers.

use chrono::{DateTime, Duration, Utc};

/// The current moment in UTC.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// The moment `delta` from now.
///
/// Convenient for scheduling, e.g. `due_in(Duration::minutes(5))` as a retry
/// time or an enqueue due time.
pub fn due_in(delta: Duration) -> DateTime<Utc> {
    now() + delta
}
