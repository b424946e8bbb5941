use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::info;

use super::ftms::concept2_watts;
use crate::discovery::classifier::DeviceRole;
use crate::metrics::MetricsSnapshot;
use crate::settings::DummySettings;
use crate::source::{MetricsSource, SourceLink};

/// Generated rower data: pace drifting around `pace_secs`, stroke rate around
/// `stroke_rate`, and distance integrated from the pace once a second.
pub struct SimulatedRower {
    settings: DummySettings,
}

impl SimulatedRower {
    pub fn new(settings: DummySettings) -> Self {
        Self { settings }
    }
}

impl MetricsSource for SimulatedRower {
    fn role(&self) -> DeviceRole {
        DeviceRole::Rower
    }
    fn spawn(&self, link: SourceLink) -> JoinHandle<()> {
        tokio::spawn(dummy_thread(link, self.settings.clone()))
    }
}

struct Generator {
    pace_secs: f64,
    stroke_rate: f64,
    seconds: f64,
    distance: f64,
    rng: StdRng,
}

impl Generator {
    fn step(&mut self, dt: f64) -> MetricsSnapshot {
        self.seconds += dt;
        let wave = (self.seconds / 10.0).sin() * 2.0;
        let noise = self.rng.gen_range(-0.5..=0.5);
        let pace = (self.pace_secs + wave + noise).max(1.0);
        let stroke_rate = self.stroke_rate + self.rng.gen_range(-1.0..=1.0);
        self.distance += 500.0 / pace * dt;

        MetricsSnapshot {
            power: concept2_watts(pace as i32),
            pace_sec_per_500m: pace as u32,
            stroke_rate: stroke_rate.max(0.0).round() as u32,
            distance_m: self.distance as u32,
            heart_rate: 0,
        }
    }
}

async fn dummy_thread(link: SourceLink, dummy_settings: DummySettings) {
    let period = Duration::from_secs(1);
    let mut update_interval = time::interval(period);
    let mut generator = Generator {
        pace_secs: dummy_settings.pace_secs,
        stroke_rate: dummy_settings.stroke_rate,
        seconds: 0.0,
        // Pick up where the last run left off
        distance: link.readings.borrow().distance_m as f64,
        rng: StdRng::from_entropy(),
    };
    // First tick is immediate
    update_interval.tick().await;

    loop {
        tokio::select! {
            _ = update_interval.tick() => {
                let snapshot = generator.step(period.as_secs_f64());
                link.readings.send_replace(snapshot);
            }
            _ = link.cancel_token.cancelled() => {
                info!("Shutting down Dummy rower thread!");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::{broadcast, watch};
    use tokio_util::sync::CancellationToken;

    fn generator(pace_secs: f64) -> Generator {
        Generator {
            pace_secs,
            stroke_rate: 22.0,
            seconds: 0.0,
            distance: 0.0,
            rng: StdRng::seed_from_u64(7),
        }
    }

    #[test]
    fn stays_near_target_pace() {
        let mut generator = generator(125.0);
        for _ in 0..120 {
            let snapshot = generator.step(1.0);
            assert!((122..=128).contains(&snapshot.pace_sec_per_500m));
            assert!((21..=23).contains(&snapshot.stroke_rate));
            assert_eq!(snapshot.power, concept2_watts(snapshot.pace_sec_per_500m as i32));
        }
        // 500m per ~125s
        assert!((460..=500).contains(&(generator.distance as u32)));
    }

    #[test]
    fn distance_never_goes_backwards() {
        let mut generator = generator(90.0);
        let mut last = 0;
        for _ in 0..60 {
            let distance = generator.step(1.0).distance_m;
            assert!(distance >= last);
            last = distance;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_from_seeded_distance() {
        let seed = MetricsSnapshot {
            distance_m: 1000,
            ..Default::default()
        };
        let (readings, mut rx) = watch::channel(seed);
        let (events, _) = broadcast::channel(4);
        let cancel_token = CancellationToken::new();
        let settings = DummySettings {
            enabled: true,
            pace_secs: 125.0,
            stroke_rate: 22.0,
            low_bpm: 50,
            high_bpm: 120,
            bpm_speed: 1.5,
        };
        let task = SimulatedRower::new(settings).spawn(SourceLink {
            target: None,
            readings,
            events,
            cancel_token: cancel_token.clone(),
        });

        rx.changed().await.unwrap();
        let first = *rx.borrow_and_update();
        assert!((1003..=1005).contains(&first.distance_m));
        assert!(first.power > 0);

        cancel_token.cancel();
        task.await.unwrap();
    }
}
