//! Transport runtime metrics.
//!
//! Counters for completion/event dispatch, transmit backpressure, and
//! receive replenishment. Registered with the global metriken registry;
//! expose them however the embedding application exposes its metrics.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use metriken::{metric, Counter};

// ── Completion dispatch ──────────────────────────────────────────

#[metric(
    name = "switchline/cq/send_completions",
    description = "Send descriptor completions processed"
)]
pub static CQ_SEND_COMPLETIONS: Counter = Counter::new();

#[metric(
    name = "switchline/cq/recv_completions",
    description = "Receive descriptor completions processed"
)]
pub static CQ_RECV_COMPLETIONS: Counter = Counter::new();

#[metric(
    name = "switchline/cq/bad_queue",
    description = "Completions naming an out-of-range descriptor queue"
)]
pub static CQ_BAD_QUEUE: Counter = Counter::new();

// ── Event dispatch ───────────────────────────────────────────────

#[metric(
    name = "switchline/eq/cmd_events",
    description = "Command completion events processed"
)]
pub static EQ_CMD_EVENTS: Counter = Counter::new();

#[metric(
    name = "switchline/eq/comp_events",
    description = "Completion-activity events processed"
)]
pub static EQ_COMP_EVENTS: Counter = Counter::new();

#[metric(
    name = "switchline/eq/other_events",
    description = "Events of unrecognized type, dropped"
)]
pub static EQ_OTHER_EVENTS: Counter = Counter::new();

// ── Transmit / receive paths ─────────────────────────────────────

#[metric(
    name = "switchline/tx/busy",
    description = "Transmit attempts rejected because the send queue was full"
)]
pub static TX_BUSY: Counter = Counter::new();

#[metric(
    name = "switchline/rx/refill_failed",
    description = "Receive buffer replenishment failures"
)]
pub static RX_REFILL_FAILED: Counter = Counter::new();

#[metric(
    name = "switchline/sdq/counter_mismatch",
    description = "Send completions whose descriptor counter disagreed with the ring"
)]
pub static SDQ_COUNTER_MISMATCH: Counter = Counter::new();

// ── Command channel ──────────────────────────────────────────────

#[metric(
    name = "switchline/cmd/timeouts",
    description = "Commands abandoned after the execution timeout"
)]
pub static CMD_TIMEOUTS: Counter = Counter::new();

/// Rate limiter for log lines emitted from per-completion paths.
///
/// `ready()` returns true at most once per interval, so a persistent
/// fault produces a steady trickle instead of a flood.
pub struct LogInterval {
    every: Duration,
    next: Mutex<Option<Instant>>,
}

impl LogInterval {
    pub const fn new(every: Duration) -> Self {
        Self {
            every,
            next: Mutex::new(None),
        }
    }

    pub fn ready(&self) -> bool {
        let now = Instant::now();
        let mut next = match self.next.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        match *next {
            Some(at) if now < at => false,
            _ => {
                *next = Some(now + self.every);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_interval_throttles() {
        let interval = LogInterval::new(Duration::from_secs(60));
        assert!(interval.ready());
        assert!(!interval.ready());
        assert!(!interval.ready());
    }

    #[test]
    fn log_interval_reopens() {
        let interval = LogInterval::new(Duration::from_millis(1));
        assert!(interval.ready());
        std::thread::sleep(Duration::from_millis(5));
        assert!(interval.ready());
    }
}
