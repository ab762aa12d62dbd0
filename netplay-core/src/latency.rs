//! Per-connection round-trip and loss estimation.
//!
//! The server pings every connection on a fixed cadence with a monotonic
//! sequence number; the client echoes `{t, seq}` back unchanged. Gaps in the
//! echoed sequence count as lost pings.
//!
//! ```text
//!   seq:  1   2   3   4   5   6
//!   pong: ✓   ✓   ✗   ✗   ✓         lost += 5 - 2 - 1 = 2
//! ```

use std::collections::VecDeque;
use std::time::Duration;

/// Number of round-trip samples kept per identity.
pub const RTT_WINDOW: usize = 10;

/// Hands out ping sequence numbers, starting at 1.
#[derive(Debug, Default)]
pub struct PingSequencer {
    last: u64,
}

impl PingSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_seq(&mut self) -> u64 {
        self.last += 1;
        self.last
    }
}

/// Rolling latency state for one persistent identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyStats {
    recent: VecDeque<Duration>,
    last_sequence_seen: u64,
    lost_count: u64,
}

impl LatencyStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pong. Out-of-order pongs still contribute a sample but do not
    /// move the sequence cursor.
    pub fn record(&mut self, seq: u64, rtt: Duration) {
        if seq > self.last_sequence_seen {
            if seq > self.last_sequence_seen + 1 {
                self.lost_count += seq - self.last_sequence_seen - 1;
            }
            self.last_sequence_seen = seq;
        }

        if self.recent.len() == RTT_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(rtt);
    }

    /// Samples, oldest first.
    pub fn round_trips(&self) -> impl Iterator<Item = &Duration> {
        self.recent.iter()
    }

    pub fn sample_count(&self) -> usize {
        self.recent.len()
    }

    pub fn last_sequence_seen(&self) -> u64 {
        self.last_sequence_seen
    }

    pub fn lost_count(&self) -> u64 {
        self.lost_count
    }

    /// Mean of the retained samples.
    pub fn average(&self) -> Option<Duration> {
        if self.recent.is_empty() {
            return None;
        }
        let total: Duration = self.recent.iter().sum();
        Some(total / self.recent.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_sequencer_starts_at_one() {
        let mut seq = PingSequencer::new();
        assert_eq!(seq.next_seq(), 1);
        assert_eq!(seq.next_seq(), 2);
    }

    #[test]
    fn test_window_keeps_last_ten() {
        let mut stats = LatencyStats::new();
        for seq in 1..=15 {
            stats.record(seq, ms(seq));
        }
        assert_eq!(stats.sample_count(), RTT_WINDOW);
        assert_eq!(stats.round_trips().next(), Some(&ms(6)));
        assert_eq!(stats.lost_count(), 0);
    }

    #[test]
    fn test_gap_counts_lost() {
        let mut stats = LatencyStats::new();
        stats.record(1, ms(10));
        stats.record(2, ms(10));
        stats.record(5, ms(10));
        assert_eq!(stats.lost_count(), 2);
        assert_eq!(stats.last_sequence_seen(), 5);
    }

    #[test]
    fn test_first_pong_after_missed_pings() {
        let mut stats = LatencyStats::new();
        stats.record(3, ms(10));
        assert_eq!(stats.lost_count(), 2);
    }

    #[test]
    fn test_out_of_order_pong() {
        let mut stats = LatencyStats::new();
        stats.record(4, ms(20));
        stats.record(2, ms(40));
        assert_eq!(stats.last_sequence_seen(), 4);
        assert_eq!(stats.lost_count(), 3);
        assert_eq!(stats.sample_count(), 2);
    }

    #[test]
    fn test_average() {
        let mut stats = LatencyStats::new();
        assert_eq!(stats.average(), None);
        stats.record(1, ms(10));
        stats.record(2, ms(30));
        assert_eq!(stats.average(), Some(ms(20)));
    }
}
