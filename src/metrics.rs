use chrono::{DateTime, Local};
use serde_derive::{Deserialize, Serialize};

/// One decoded view of the rower (and heart rate) state.
///
/// Produced by folding frames over time, see [`crate::rower::ftms::decode`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Watts, derived from pace
    pub power: u32,
    /// Seconds per 500m, 0 when unknown
    pub pace_sec_per_500m: u32,
    /// Strokes per minute
    pub stroke_rate: u32,
    /// Total meters since the rower started counting
    pub distance_m: u32,
    /// Beats per minute, 0 means no reading
    pub heart_rate: u32,
}

impl MetricsSnapshot {
    /// The fields a rower source owns.
    /// Heart rate is left alone since the HRM stream writes it.
    pub fn apply_rower(&mut self, rower: &MetricsSnapshot) {
        self.power = rower.power;
        self.pace_sec_per_500m = rower.pace_sec_per_500m;
        self.stroke_rate = rower.stroke_rate;
        self.distance_m = rower.distance_m;
    }
    /// Zeroes everything but heart rate, the strap keeps reporting between workouts.
    pub fn reset_keeping_heart_rate(&mut self) {
        *self = MetricsSnapshot {
            heart_rate: self.heart_rate,
            ..Default::default()
        };
    }
}

/// A time-stamped snapshot, persisted once per session tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub workout_id: u64,
    pub timestamp: DateTime<Local>,
    pub power: u32,
    pub pace: u32,
    pub stroke_rate: u32,
    pub distance: u32,
    pub heart_rate: u32,
}

impl MetricPoint {
    pub fn new(workout_id: u64, timestamp: DateTime<Local>, snapshot: &MetricsSnapshot) -> Self {
        Self {
            workout_id,
            timestamp,
            power: snapshot.power,
            pace: snapshot.pace_sec_per_500m,
            stroke_rate: snapshot.stroke_rate,
            distance: snapshot.distance_m,
            heart_rate: snapshot.heart_rate,
        }
    }
}

/// Averages of each channel over a set of points.
///
/// Heart rate ignores zero readings, those are dropouts and not 0 bpm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelAverages {
    pub pace: u32,
    pub power: u32,
    pub heart_rate: u32,
    pub stroke_rate: u32,
}

impl ChannelAverages {
    pub fn from_points(points: &[MetricPoint]) -> Self {
        let mut totals = RunningTotals::default();
        for point in points {
            totals.add(point);
        }
        totals.averages()
    }
}

/// Running sums so whole-workout averages don't need to read every sample back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunningTotals {
    samples: u64,
    pace: u64,
    power: u64,
    stroke_rate: u64,
    heart_rate_samples: u64,
    heart_rate: u64,
}

impl RunningTotals {
    pub fn add(&mut self, point: &MetricPoint) {
        self.samples += 1;
        self.pace += point.pace as u64;
        self.power += point.power as u64;
        self.stroke_rate += point.stroke_rate as u64;
        if point.heart_rate > 0 {
            self.heart_rate_samples += 1;
            self.heart_rate += point.heart_rate as u64;
        }
    }
    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }
    pub fn averages(&self) -> ChannelAverages {
        let mean = |sum: u64, count: u64| {
            if count == 0 {
                0
            } else {
                (sum / count) as u32
            }
        };
        ChannelAverages {
            pace: mean(self.pace, self.samples),
            power: mean(self.power, self.samples),
            heart_rate: mean(self.heart_rate, self.heart_rate_samples),
            stroke_rate: mean(self.stroke_rate, self.samples),
        }
    }
}

/// Formats seconds as `m:ss`, used for paces and durations.
pub fn format_minutes(seconds: u32) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}
