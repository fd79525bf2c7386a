use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

const STAT_SUMMARY_INTERVAL: Duration = Duration::from_secs(60);

/// Counters the dispatcher keeps for the lifetime of the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Frames sent to the realtime endpoint.
    pub dispatched: u64,
    /// Responses handed to the renderer.
    pub rendered: u64,
    /// Transport failures and timeouts.
    pub failed: u64,
    /// Responses carrying an `error` from the service.
    pub endpoint_errors: u64,
    /// Timer fires skipped because single-flight had a request outstanding.
    pub dropped: u64,
    /// Responses older than one already rendered for the same mode.
    pub stale: u64,
    /// Responses that arrived after their session ended.
    pub discarded: u64,
    pub captures_saved: u64,
    pub min_round_trip: Option<Duration>,
    pub max_round_trip: Option<Duration>,
}

pub struct DispatchStats {
    snapshot: StatsSnapshot,
    completed_since_log: u64,
    last_log_time: Instant,
}

impl DispatchStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot
    }

    pub fn record_dispatch(&mut self) {
        self.snapshot.dispatched += 1;
    }

    pub fn record_dropped(&mut self) {
        self.snapshot.dropped += 1;
    }

    pub fn record_stale(&mut self) {
        self.snapshot.stale += 1;
    }

    pub fn record_discarded(&mut self) {
        self.snapshot.discarded += 1;
    }

    pub fn record_failure(&mut self) {
        self.snapshot.failed += 1;
    }

    pub fn record_endpoint_error(&mut self) {
        self.snapshot.endpoint_errors += 1;
    }

    pub fn record_capture(&mut self) {
        self.snapshot.captures_saved += 1;
    }

    /// Records a rendered response and logs a summary at most once per minute.
    pub fn record_rendered(&mut self, now: Instant, round_trip: Duration) {
        let stats = &mut self.snapshot;
        stats.rendered += 1;
        stats.min_round_trip = Some(stats.min_round_trip.map_or(round_trip, |m| m.min(round_trip)));
        stats.max_round_trip = Some(stats.max_round_trip.map_or(round_trip, |m| m.max(round_trip)));
        self.completed_since_log += 1;

        let elapsed = now.duration_since(self.last_log_time);
        if elapsed >= STAT_SUMMARY_INTERVAL {
            info!(
                "Stats: Dispatched: {}, Rendered: {}, Frames/Min: {:.1}, Failed: {}, Endpoint errors: {}, Dropped: {}, Stale: {}, Min Round Trip: {:#?}, Max Round Trip: {:#?}",
                stats.dispatched,
                stats.rendered,
                self.completed_since_log as f64 * 60. / elapsed.as_secs_f64(),
                stats.failed,
                stats.endpoint_errors,
                stats.dropped,
                stats.stale,
                stats.min_round_trip.unwrap_or_default(),
                stats.max_round_trip.unwrap_or_default(),
            );
            self.completed_since_log = 0;
            self.last_log_time = now;
        }
    }
}

impl Default for DispatchStats {
    fn default() -> Self {
        Self {
            snapshot: StatsSnapshot::default(),
            completed_since_log: 0,
            last_log_time: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn tracks_round_trip_extremes() {
        let mut stats = DispatchStats::default();
        let now = Instant::now();
        stats.record_rendered(now, Duration::from_millis(120));
        stats.record_rendered(now, Duration::from_millis(40));
        stats.record_rendered(now + STAT_SUMMARY_INTERVAL, Duration::from_millis(300));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.rendered, 3);
        assert_eq!(snapshot.min_round_trip, Some(Duration::from_millis(40)));
        assert_eq!(snapshot.max_round_trip, Some(Duration::from_millis(300)));
        assert_eq!(stats.completed_since_log, 0);
    }
}
