use btleplug::api::Peripheral as _;
use btleplug::platform::Peripheral;
use futures::StreamExt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::measurement::parse_hrm;
use crate::broadcast;
use crate::discovery::classifier::DeviceRole;
use crate::errors::AppError;
use crate::scan;
use crate::session::SessionEvent;
use crate::settings::ConnectionSettings;
use crate::source::{LinkEnd, MetricsSource, Reconnector, RetryPolicy, SourceLink};

pub const HEART_RATE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
pub const HEART_RATE_MEASUREMENT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

/// Live heart rate strap over BLE. Keeps retrying until cancelled unless
/// `heart_rate_retry_count` says otherwise.
pub struct BleHeartRateMonitor {
    settings: ConnectionSettings,
}

impl BleHeartRateMonitor {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self { settings }
    }
}

impl MetricsSource for BleHeartRateMonitor {
    fn role(&self) -> DeviceRole {
        DeviceRole::HeartRateMonitor
    }
    fn spawn(&self, link: SourceLink) -> JoinHandle<()> {
        let actor = BleMonitorActor {
            role: self.role(),
            link,
            scan_timeout: self.settings.scan_timeout(),
            connect_timeout: self.settings.connect_timeout(),
            no_packet_timeout: self.settings.no_packet_timeout(),
        };
        let policy = RetryPolicy::new(
            Duration::from_secs(self.settings.heart_rate_retry_delay_secs),
            self.settings.heart_rate_retry_count,
        );
        tokio::spawn(actor.run(policy))
    }
}

struct BleMonitorActor {
    role: DeviceRole,
    link: SourceLink,
    scan_timeout: Duration,
    connect_timeout: Duration,
    no_packet_timeout: Duration,
}

impl BleMonitorActor {
    async fn run(self, policy: RetryPolicy) {
        let mut reconnector = Reconnector::new("Heart rate monitor", policy);
        loop {
            let outcome = self.attempt().await;
            if !reconnector.settle(outcome, &self.link).await {
                break;
            }
        }
        info!("Shutting down HR notification thread!");
    }
    async fn attempt(&self) -> Result<LinkEnd, AppError> {
        let Some(device) = scan::find_peripheral(
            self.link.target.as_deref(),
            HEART_RATE_SERVICE_UUID,
            self.scan_timeout,
            &self.link.cancel_token,
        )
        .await?
        else {
            return Ok(LinkEnd::Cancelled);
        };
        info!("Connecting to Heart Rate Monitor! Address: {}", device.address());
        scan::connect(&device, self.connect_timeout).await?;
        let result = self.notification_loop(&device).await;
        scan::disconnect(&device).await;
        if matches!(result, Ok(LinkEnd::Dropped)) {
            broadcast!(
                self.link.events,
                SessionEvent::DeviceDisconnected(self.role)
            );
        }
        result
    }
    async fn notification_loop(&self, device: &Peripheral) -> Result<LinkEnd, AppError> {
        let characteristic =
            scan::characteristic(device, HEART_RATE_MEASUREMENT_CHARACTERISTIC_UUID)?;
        device.subscribe(&characteristic).await?;
        let mut notification_stream = device.notifications().await?;
        broadcast!(
            self.link.events,
            SessionEvent::DeviceConnected(self.role)
        );

        loop {
            tokio::select! {
                notification = notification_stream.next() => {
                    let Some(data) = notification else {
                        info!("Heart Rate Monitor stream closed!");
                        return Ok(LinkEnd::Dropped);
                    };
                    if data.uuid != HEART_RATE_MEASUREMENT_CHARACTERISTIC_UUID {
                        continue;
                    }
                    match parse_hrm(&data.value) {
                        Some(measurement) => {
                            debug!("HR: {} bpm", measurement.bpm);
                            self.link
                                .readings
                                .send_modify(|reading| reading.heart_rate = measurement.bpm as u32);
                        }
                        None => debug!("Ignoring short HR frame: {:02X?}", data.value),
                    }
                }
                _ = tokio::time::sleep(self.no_packet_timeout) => {
                    error!("No HR data received in {} seconds!", self.no_packet_timeout.as_secs());
                    return Ok(LinkEnd::Dropped);
                }
                _ = self.link.cancel_token.cancelled() => {
                    return Ok(LinkEnd::Cancelled);
                }
            }
        }
    }
}
