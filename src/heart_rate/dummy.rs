use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;
use tracing::info;

use crate::discovery::classifier::DeviceRole;
use crate::settings::DummySettings;
use crate::source::{MetricsSource, SourceLink};

/// Sweeps the heart rate up and down between `low_bpm` and `high_bpm`.
pub struct SimulatedHeartRate {
    settings: DummySettings,
}

impl SimulatedHeartRate {
    pub fn new(settings: DummySettings) -> Self {
        Self { settings }
    }
}

impl MetricsSource for SimulatedHeartRate {
    fn role(&self) -> DeviceRole {
        DeviceRole::HeartRateMonitor
    }
    fn spawn(&self, link: SourceLink) -> JoinHandle<()> {
        tokio::spawn(dummy_thread(link, self.settings.clone()))
    }
}

async fn dummy_thread(link: SourceLink, dummy_settings: DummySettings) {
    let bpm_update_per_sec = Duration::from_secs_f32(1.0 / dummy_settings.bpm_speed.max(0.01));
    let mut bpm_update_interval = time::interval(bpm_update_per_sec);
    let low_bpm = dummy_settings.low_bpm.max(1);
    let high_bpm = dummy_settings.high_bpm.max(low_bpm);

    let mut positive_direction = true;
    let mut bpm = low_bpm.saturating_sub(1);

    loop {
        tokio::select! {
            _ = bpm_update_interval.tick() => {
                if low_bpm == high_bpm {
                    bpm = low_bpm;
                } else if positive_direction {
                    bpm += 1;
                    positive_direction = bpm < high_bpm;
                } else {
                    bpm -= 1;
                    positive_direction = bpm <= low_bpm;
                }
                link.readings.send_modify(|reading| reading.heart_rate = bpm as u32);
            }
            _ = link.cancel_token.cancelled() => {
                info!("Shutting down Dummy HR thread!");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsSnapshot;
    use tokio::sync::{broadcast, watch};
    use tokio_util::sync::CancellationToken;

    fn settings() -> DummySettings {
        DummySettings {
            enabled: true,
            pace_secs: 125.0,
            stroke_rate: 22.0,
            low_bpm: 60,
            high_bpm: 63,
            bpm_speed: 1.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_between_bounds() {
        let (readings, mut rx) = watch::channel(MetricsSnapshot::default());
        let (events, _) = broadcast::channel(4);
        let cancel_token = CancellationToken::new();
        let task = SimulatedHeartRate::new(settings()).spawn(SourceLink {
            target: None,
            readings,
            events,
            cancel_token: cancel_token.clone(),
        });

        let mut seen = Vec::new();
        for _ in 0..8 {
            rx.changed().await.unwrap();
            seen.push(rx.borrow_and_update().heart_rate);
        }
        assert_eq!(seen, vec![60, 61, 62, 63, 62, 61, 60, 61]);

        cancel_token.cancel();
        task.await.unwrap();
    }
}
