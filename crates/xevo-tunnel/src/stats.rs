//! Process-wide connection statistics
//!
//! Monotone counters used only for observability: session numbering for log
//! correlation, and open/close totals for tunneled connections.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic session and connection counters
#[derive(Debug, Default)]
pub struct ConnStats {
    sessions: AtomicU64,
    opened: AtomicU64,
    closed: AtomicU64,
}

impl ConnStats {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next session id
    pub fn next_session(&self) -> u64 {
        self.sessions.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record a connection open; returns the connection's ordinal
    pub fn open(&self) -> u64 {
        self.opened.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record a connection close
    pub fn close(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Current totals as `(opened, closed)`
    #[must_use]
    pub fn totals(&self) -> (u64, u64) {
        (
            self.opened.load(Ordering::Relaxed),
            self.closed.load(Ordering::Relaxed),
        )
    }
}

impl fmt::Display for ConnStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (opened, closed) = self.totals();
        write!(f, "[{}/{} open]", opened.saturating_sub(closed), opened)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = ConnStats::new();
        assert_eq!(stats.next_session(), 1);
        assert_eq!(stats.next_session(), 2);

        assert_eq!(stats.open(), 1);
        assert_eq!(stats.open(), 2);
        stats.close();
        assert_eq!(stats.totals(), (2, 1));
        assert_eq!(stats.to_string(), "[1/2 open]");
    }
}
