use std::collections::VecDeque;

use crate::metrics::MetricsSnapshot;
use crate::settings::SmoothingSettings;

/// Simple moving average over the last `window` values.
///
/// Until the window fills, the average is taken over the values seen so far.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: usize,
    values: VecDeque<f64>,
    sum: f64,
}

impl MovingAverage {
    pub fn new(window: usize) -> Self {
        // A zero window would divide by zero on the first add
        let window = window.max(1);
        Self {
            window,
            values: VecDeque::with_capacity(window),
            sum: 0.0,
        }
    }
    /// Pushes `value` (evicting the oldest once full) and returns the new average.
    pub fn add(&mut self, value: f64) -> f64 {
        if self.values.len() >= self.window {
            if let Some(oldest) = self.values.pop_front() {
                self.sum -= oldest;
            }
        }
        self.values.push_back(value);
        self.sum += value;
        self.average()
    }
    pub fn average(&self) -> f64 {
        if self.values.is_empty() {
            0.0
        } else {
            self.sum / self.values.len() as f64
        }
    }
    pub fn clear(&mut self) {
        self.values.clear();
        self.sum = 0.0;
    }
    pub fn len(&self) -> usize {
        self.values.len()
    }
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One smoother per displayed channel.
#[derive(Debug, Clone)]
pub struct MetricSmoothers {
    power: MovingAverage,
    pace: MovingAverage,
    stroke_rate: MovingAverage,
    heart_rate: MovingAverage,
}

impl MetricSmoothers {
    pub fn new(settings: &SmoothingSettings) -> Self {
        Self {
            power: MovingAverage::new(settings.window),
            pace: MovingAverage::new(settings.window),
            stroke_rate: MovingAverage::new(settings.window),
            heart_rate: MovingAverage::new(settings.heart_rate_window),
        }
    }
    /// Smooths power, pace and stroke rate. Distance is a counter and passes through.
    pub fn smooth_rower(&mut self, raw: &MetricsSnapshot) -> MetricsSnapshot {
        MetricsSnapshot {
            power: self.power.add(raw.power as f64) as u32,
            pace_sec_per_500m: self.pace.add(raw.pace_sec_per_500m as f64) as u32,
            stroke_rate: self.stroke_rate.add(raw.stroke_rate as f64) as u32,
            distance_m: raw.distance_m,
            heart_rate: raw.heart_rate,
        }
    }
    /// A 0 bpm reading is a dropout. It's shown as 0 and kept out of the window.
    pub fn smooth_heart_rate(&mut self, bpm: u32) -> u32 {
        if bpm == 0 {
            0
        } else {
            self.heart_rate.add(bpm as f64) as u32
        }
    }
    pub fn clear(&mut self) {
        self.power.clear();
        self.pace.clear();
        self.stroke_rate.clear();
        self.heart_rate.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_grow_into_window() {
        let mut smoother = MovingAverage::new(3);
        let averages: Vec<f64> = [10.0, 20.0, 30.0, 40.0]
            .into_iter()
            .map(|v| smoother.add(v))
            .collect();
        assert_eq!(averages, vec![10.0, 15.0, 20.0, 30.0]);
        assert_eq!(smoother.len(), 3);
    }

    #[test]
    fn clear_forgets_old_session() {
        let mut smoother = MovingAverage::new(3);
        smoother.add(500.0);
        smoother.add(500.0);
        smoother.clear();
        assert!(smoother.is_empty());
        assert_eq!(smoother.add(100.0), 100.0);
    }

    #[test]
    fn zero_window_acts_like_one() {
        let mut smoother = MovingAverage::new(0);
        assert_eq!(smoother.add(4.0), 4.0);
        assert_eq!(smoother.add(8.0), 8.0);
    }

    #[test]
    fn heart_rate_dropouts_skip_the_window() {
        let mut smoothers = MetricSmoothers::new(&SmoothingSettings {
            window: 3,
            heart_rate_window: 3,
        });
        assert_eq!(smoothers.smooth_heart_rate(120), 120);
        assert_eq!(smoothers.smooth_heart_rate(0), 0);
        // The dropout didn't drag the average down
        assert_eq!(smoothers.smooth_heart_rate(130), 125);
    }

    #[test]
    fn rower_channels_smoothed_distance_passes_through() {
        let mut smoothers = MetricSmoothers::new(&SmoothingSettings {
            window: 2,
            heart_rate_window: 3,
        });
        let first = MetricsSnapshot {
            power: 100,
            pace_sec_per_500m: 120,
            stroke_rate: 20,
            distance_m: 10,
            heart_rate: 0,
        };
        smoothers.smooth_rower(&first);
        let second = MetricsSnapshot {
            power: 200,
            pace_sec_per_500m: 130,
            stroke_rate: 24,
            distance_m: 25,
            heart_rate: 0,
        };
        let smoothed = smoothers.smooth_rower(&second);
        assert_eq!(smoothed.power, 150);
        assert_eq!(smoothed.pace_sec_per_500m, 125);
        assert_eq!(smoothed.stroke_rate, 22);
        assert_eq!(smoothed.distance_m, 25);
    }
}
