//! Per-connection packet timing and counters.

use chrono::{DateTime, TimeDelta, Utc};

/// Length of the rolling packet-rate window.
const RATE_WINDOW_SECS: i64 = 60;

/// Timing and counters of one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Telemetry {
    /// When the TCP connection was accepted.
    pub connected_at: Option<DateTime<Utc>>,
    /// Arrival of the most recent packet.
    pub packet_at: Option<DateTime<Utc>>,
    /// Arrival of the packet before that.
    pub last_packet_at: Option<DateTime<Utc>>,
    /// Packets received over the connection lifetime.
    pub packet_count: u64,
    /// Packets received in the current one-minute window.
    pub packets_this_minute: u32,
    /// Start of the current one-minute window.
    pub window_started: Option<DateTime<Utc>>,
}

impl Telemetry {
    /// Fresh telemetry for a connection accepted at `now`.
    pub fn connected(now: DateTime<Utc>) -> Self {
        Self {
            connected_at: Some(now),
            ..Self::default()
        }
    }

    /// Record one packet arriving at `now`.
    ///
    /// Returns the number of packets seen in the current window, this one
    /// included.
    pub fn record_packet(&mut self, now: DateTime<Utc>) -> u32 {
        self.last_packet_at = self.packet_at;
        self.packet_at = Some(now);
        self.packet_count += 1;

        let window = TimeDelta::seconds(RATE_WINDOW_SECS);
        match self.window_started {
            Some(start) if now.signed_duration_since(start) < window => {
                self.packets_this_minute = self.packets_this_minute.saturating_add(1);
            }
            _ => {
                self.window_started = Some(now);
                self.packets_this_minute = 1;
            }
        }

        self.packets_this_minute
    }

    /// Time between the last two packets, if two have arrived.
    pub fn packet_gap(&self) -> Option<TimeDelta> {
        Some(self.packet_at?.signed_duration_since(self.last_packet_at?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_connected() {
        let t = Telemetry::connected(at(0));
        assert_eq!(t.connected_at, Some(at(0)));
        assert_eq!(t.packet_count, 0);
        assert!(t.packet_gap().is_none());
    }

    #[test]
    fn test_record_packets_within_window() {
        let mut t = Telemetry::connected(at(0));
        assert_eq!(t.record_packet(at(1)), 1);
        assert_eq!(t.record_packet(at(2)), 2);
        assert_eq!(t.record_packet(at(59)), 3);

        assert_eq!(t.packet_count, 3);
        assert_eq!(t.last_packet_at, Some(at(2)));
        assert_eq!(t.packet_at, Some(at(59)));
        assert_eq!(t.packet_gap(), Some(TimeDelta::seconds(57)));
    }

    #[test]
    fn test_window_rolls_over() {
        let mut t = Telemetry::connected(at(0));
        t.record_packet(at(10));
        t.record_packet(at(20));
        // 60s after the window opened at t=10
        assert_eq!(t.record_packet(at(70)), 1);
        assert_eq!(t.window_started, Some(at(70)));
        assert_eq!(t.packet_count, 3);
    }
}
