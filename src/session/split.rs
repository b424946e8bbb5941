use chrono::{DateTime, Local};
use serde_derive::{Deserialize, Serialize};
use tracing::warn;

use crate::metrics::{format_minutes, ChannelAverages, MetricPoint};

/// A finished lap. Never changed after it's recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    pub index: u32,
    pub start_ts: DateTime<Local>,
    pub end_ts: DateTime<Local>,
    pub distance_m: u32,
    pub duration_s: u64,
    pub avg_pace: u32,
    pub avg_power: u32,
    pub avg_heart_rate: u32,
    pub avg_stroke_rate: u32,
}

impl Split {
    /// `Split 2: 500 m in 2:05 (2:05/500m)`
    pub fn announcement(&self) -> String {
        format!(
            "Split {}: {} m in {} ({}/500m)",
            self.index,
            self.distance_m,
            format_minutes(self.duration_s.min(u32::MAX as u64) as u32),
            format_minutes(self.avg_pace)
        )
    }
}

/// Where the next split would end, before its averages are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitBounds {
    pub index: u32,
    pub start_ts: DateTime<Local>,
    pub end_ts: DateTime<Local>,
    pub distance_m: u32,
    pub duration_s: u64,
    end_elapsed: u64,
    end_distance: u32,
}

impl SplitBounds {
    pub fn into_split(self, points: &[MetricPoint]) -> Split {
        let averages = ChannelAverages::from_points(points);
        Split {
            index: self.index,
            start_ts: self.start_ts,
            end_ts: self.end_ts,
            distance_m: self.distance_m,
            duration_s: self.duration_s,
            avg_pace: averages.pace,
            avg_power: averages.power,
            avg_heart_rate: averages.heart_rate,
            avg_stroke_rate: averages.stroke_rate,
        }
    }
}

/// Keeps the open boundary of the current split.
#[derive(Debug, Clone)]
pub struct SplitTracker {
    count: u32,
    last_elapsed: u64,
    last_distance: u32,
    open_since: DateTime<Local>,
}

impl SplitTracker {
    pub fn new(now: DateTime<Local>) -> Self {
        Self {
            count: 0,
            last_elapsed: 0,
            last_distance: 0,
            open_since: now,
        }
    }
    /// Moves the open boundary to `now` without recording anything.
    pub fn reopen(&mut self, now: DateTime<Local>) {
        self.open_since = now;
    }
    /// Bounds of the split that would close at `now`.
    ///
    /// `None` if distance went backwards since the last boundary.
    pub fn bounds(&self, elapsed: u64, distance: u32, now: DateTime<Local>) -> Option<SplitBounds> {
        let Some(distance_m) = distance.checked_sub(self.last_distance) else {
            warn!(
                "Negative split distance detected: {} -> {}. Ignoring split.",
                self.last_distance, distance
            );
            return None;
        };
        Some(SplitBounds {
            index: self.count + 1,
            start_ts: self.open_since,
            end_ts: now,
            distance_m,
            duration_s: elapsed.saturating_sub(self.last_elapsed),
            end_elapsed: elapsed,
            end_distance: distance,
        })
    }
    /// Whether anything happened since the last boundary.
    pub fn has_progress(&self, elapsed: u64, distance: u32) -> bool {
        elapsed > self.last_elapsed || distance > self.last_distance
    }
    /// Makes `bounds` the new open boundary.
    pub fn commit(&mut self, bounds: &SplitBounds) {
        self.count = bounds.index;
        self.last_elapsed = bounds.end_elapsed;
        self.last_distance = bounds.end_distance;
        self.open_since = bounds.end_ts;
    }
    pub fn count(&self) -> u32 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn consecutive_splits_are_contiguous() {
        let start = Local::now();
        let mut tracker = SplitTracker::new(start);

        let first = tracker
            .bounds(125, 500, start + TimeDelta::seconds(125))
            .unwrap();
        tracker.commit(&first);
        let second = tracker
            .bounds(250, 1000, start + TimeDelta::seconds(250))
            .unwrap();

        assert_eq!(first.index, 1);
        assert_eq!(second.index, 2);
        assert_eq!(second.start_ts, first.end_ts);
        assert_eq!(second.distance_m, 500);
        assert_eq!(second.duration_s, 125);
    }

    #[test]
    fn backwards_distance_is_rejected() {
        let start = Local::now();
        let mut tracker = SplitTracker::new(start);
        let first = tracker.bounds(60, 300, start).unwrap();
        tracker.commit(&first);

        assert_eq!(tracker.bounds(70, 299, start), None);
        // Nothing was consumed by the rejected split
        assert_eq!(tracker.count(), 1);
        assert_eq!(tracker.bounds(70, 300, start).unwrap().index, 2);
    }

    #[test]
    fn announcement_text() {
        let start = Local::now();
        let split = SplitBounds {
            index: 2,
            start_ts: start,
            end_ts: start,
            distance_m: 500,
            duration_s: 125,
            end_elapsed: 250,
            end_distance: 1000,
        }
        .into_split(&[MetricPoint {
            workout_id: 1,
            timestamp: start,
            power: 179,
            pace: 125,
            stroke_rate: 24,
            distance: 900,
            heart_rate: 0,
        }]);
        assert_eq!(split.announcement(), "Split 2: 500 m in 2:05 (2:05/500m)");
        assert_eq!(split.avg_heart_rate, 0);
    }

    #[test]
    fn progress_check() {
        let tracker = SplitTracker::new(Local::now());
        assert!(!tracker.has_progress(0, 0));
        assert!(tracker.has_progress(1, 0));
        assert!(tracker.has_progress(0, 1));
    }
}
