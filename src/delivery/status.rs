//! Read-only view of the engine published to operators.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};

/// Retry and rate-limit state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackoffState {
    /// Dequeuing is paused until this time after a rate-limit response.
    pub paused_until: Option<DateTime<Utc>>,
    /// Pending tasks that already failed at least once and wait on backoff.
    pub retrying: usize,
    /// Earliest scheduled attempt among waiting tasks.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Counters and state published by the delivery engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub running: bool,
    pub pending: usize,
    pub in_flight: usize,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
    pub last_delivery_at: Option<DateTime<Utc>>,
    pub backoff: BackoffState,
}

impl StatusSnapshot {
    /// Human-readable report for the `/status` command.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let state = if self.running { "running" } else { "stopped" };
        let _ = writeln!(out, "Bridge: {}", state);
        let _ = writeln!(
            out,
            "Pending: {} | In flight: {}",
            self.pending, self.in_flight
        );
        let _ = writeln!(
            out,
            "Delivered: {} | Failed: {} | Dropped: {}",
            self.delivered, self.failed, self.dropped
        );
        match self.last_delivery_at {
            Some(at) => {
                let _ = writeln!(out, "Last delivery: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            None => {
                let _ = writeln!(out, "Last delivery: never");
            }
        }
        if let Some(until) = self.backoff.paused_until {
            let _ = writeln!(out, "Rate limited until {}", until.format("%H:%M:%S UTC"));
        }
        if self.backoff.retrying > 0 {
            let _ = write!(out, "Retrying: {}", self.backoff.retrying);
            if let Some(next) = self.backoff.next_attempt_at {
                let _ = write!(out, " (next at {})", next.format("%H:%M:%S UTC"));
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_render_idle() {
        let snapshot = StatusSnapshot {
            running: true,
            ..StatusSnapshot::default()
        };
        let text = snapshot.render();
        assert!(text.starts_with("Bridge: running"));
        assert!(text.contains("Last delivery: never"));
        assert!(!text.contains("Rate limited"));
    }

    #[test]
    fn test_render_backoff() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap();
        let snapshot = StatusSnapshot {
            running: false,
            pending: 3,
            delivered: 10,
            failed: 1,
            last_delivery_at: Some(at),
            backoff: BackoffState {
                paused_until: Some(at),
                retrying: 1,
                next_attempt_at: Some(at),
            },
            ..StatusSnapshot::default()
        };
        let text = snapshot.render();
        assert!(text.contains("Bridge: stopped"));
        assert!(text.contains("Pending: 3"));
        assert!(text.contains("Delivered: 10 | Failed: 1"));
        assert!(text.contains("Last delivery: 2024-03-01 10:30:00 UTC"));
        assert!(text.contains("Rate limited until 10:30:00 UTC"));
        assert!(text.contains("Retrying: 1 (next at 10:30:00 UTC)"));
    }
}
