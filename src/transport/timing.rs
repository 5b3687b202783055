//! Deadlines and polling cadence.
//!
//! Every wait in the driver is a loop of short inbox polls bounded by a
//! [`Deadline`], so a wait with timeout `T` gives up no later than
//! `T + POLL_INTERVAL`.

use std::time::Duration;

use tokio::time::Instant;

/// Timing constants.
pub mod constants {
    use std::time::Duration;

    /// Granularity of every inbox wait.
    pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Pause between failed connection attempts.
    pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

    /// Bounded wait for each engine task on close.
    pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

    /// Bytes requested per transport read.
    pub const READ_CHUNK_SIZE: usize = 64;

    /// Inbox capacity in chunks.
    pub const INBOX_CAPACITY: usize = 1024;

    /// Outbox capacity in payloads.
    pub const OUTBOX_CAPACITY: usize = 256;

    /// Default time allowed to reach the transport.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(600);

    /// Default time allowed for one command's response.
    pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(3600);

    /// Default wait for a READY byte.
    pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(180);

    /// Default spacing between SYNC probes.
    pub const DEFAULT_SYNC_PROBE_INTERVAL: Duration = Duration::from_millis(500);
}

/// A fixed point in time a wait must not outlive.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    /// Start a deadline `limit` from now.
    pub fn after(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    /// Time elapsed since the deadline was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.elapsed())
    }

    /// Check whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.elapsed() >= self.limit
    }

    /// Length of the next poll: one interval, capped by what is left.
    pub fn next_poll(&self) -> Duration {
        self.remaining().min(constants::POLL_INTERVAL)
    }
}

/// Schedule for a byte re-sent periodically while a wait is in progress.
#[derive(Debug, Clone, Copy)]
pub struct Probe {
    /// Byte to send.
    pub byte: u8,
    /// Spacing between sends.
    pub interval: Duration,
}

impl Probe {
    /// Probe `byte` every `interval`.
    pub fn new(byte: u8, interval: Duration) -> Self {
        Self { byte, interval }
    }
}

/// Tracks when a [`Probe`] is next due.
#[derive(Debug)]
pub(crate) struct ProbeClock {
    probe: Probe,
    next: Instant,
}

impl ProbeClock {
    /// The first probe is due immediately.
    pub(crate) fn start(probe: Probe) -> Self {
        Self {
            probe,
            next: Instant::now(),
        }
    }

    /// Return the byte if a probe is due and schedule the next one.
    pub(crate) fn poll_due(&mut self) -> Option<u8> {
        let now = Instant::now();
        if now >= self.next {
            self.next = now + self.probe.interval;
            Some(self.probe.byte)
        } else {
            None
        }
    }

    /// Time until the next probe.
    pub(crate) fn until_next(&self) -> Duration {
        self.next.saturating_duration_since(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry() {
        let deadline = Deadline::after(Duration::from_millis(250));
        assert!(!deadline.is_expired());
        assert_eq!(deadline.next_poll(), constants::POLL_INTERVAL);

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(deadline.next_poll(), Duration::from_millis(50));

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
        assert_eq!(deadline.next_poll(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_clock() {
        let mut clock = ProbeClock::start(Probe::new(0xB0, Duration::from_millis(500)));
        assert_eq!(clock.poll_due(), Some(0xB0));
        assert_eq!(clock.poll_due(), None);
        assert_eq!(clock.until_next(), Duration::from_millis(500));

        tokio::time::advance(Duration::from_millis(499)).await;
        assert_eq!(clock.poll_due(), None);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(clock.poll_due(), Some(0xB0));
    }
}
