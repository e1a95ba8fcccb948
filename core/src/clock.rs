//! # Clock
//!
//! Time is an input in this system: quota windows, bulk-delay scheduling,
//! rotation min-age, and session recency all compare against "now". Every
//! component takes a [`Clock`] instead of calling `Utc::now()` directly,
//! so tests can drive the race scenarios (untrust during a bulk delay,
//! rotation before min-age) without sleeping through them.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

/// A time source. Cheap to clone; the manual variant shares its state
/// across clones, so advancing one handle advances them all.
#[derive(Debug, Clone)]
pub enum Clock {
    /// Wall-clock time. Production.
    System,
    /// A hand-cranked clock holding milliseconds since epoch. Tests.
    Manual(Arc<AtomicI64>),
}

impl Clock {
    /// The production clock.
    pub fn system() -> Self {
        Clock::System
    }

    /// A manual clock starting at the given milliseconds since epoch.
    pub fn manual(start_ms: i64) -> Self {
        Clock::Manual(Arc::new(AtomicI64::new(start_ms)))
    }

    /// Current time.
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Manual(ms) => Utc
                .timestamp_millis_opt(ms.load(Ordering::SeqCst))
                .single()
                .expect("manual clock holds a valid timestamp"),
        }
    }

    /// Current time as milliseconds since epoch.
    pub fn now_ms(&self) -> i64 {
        self.now().timestamp_millis()
    }

    /// Advance a manual clock. Panics on the system clock; production
    /// code has no business warping time.
    pub fn advance_ms(&self, delta_ms: i64) {
        match self {
            Clock::System => panic!("cannot advance the system clock"),
            Clock::Manual(ms) => {
                ms.fetch_add(delta_ms, Ordering::SeqCst);
            }
        }
    }

    /// Jump a manual clock to an absolute time.
    pub fn set_ms(&self, now_ms: i64) {
        match self {
            Clock::System => panic!("cannot set the system clock"),
            Clock::Manual(ms) => ms.store(now_ms, Ordering::SeqCst),
        }
    }
}
