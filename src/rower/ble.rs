use btleplug::api::{Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::StreamExt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::ftms::{
    self, CONTROL_POINT_CHARACTERISTIC_UUID, FTMS_SERVICE_UUID, REQUEST_CONTROL,
    ROWER_DATA_CHARACTERISTIC_UUID, START_OR_RESUME,
};
use crate::broadcast;
use crate::discovery::classifier::DeviceRole;
use crate::errors::AppError;
use crate::scan;
use crate::session::SessionEvent;
use crate::settings::ConnectionSettings;
use crate::source::{LinkEnd, MetricsSource, Reconnector, RetryPolicy, SourceLink};

/// Wait before the first connection attempt
const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Live FTMS rower over BLE.
pub struct FtmsRower {
    settings: ConnectionSettings,
}

impl FtmsRower {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self { settings }
    }
}

impl MetricsSource for FtmsRower {
    fn role(&self) -> DeviceRole {
        DeviceRole::Rower
    }
    fn spawn(&self, link: SourceLink) -> JoinHandle<()> {
        let actor = RowerActor {
            role: self.role(),
            link,
            scan_timeout: self.settings.scan_timeout(),
            connect_timeout: self.settings.connect_timeout(),
            no_packet_timeout: self.settings.no_packet_timeout(),
        };
        let policy = RetryPolicy::new(
            Duration::from_millis(self.settings.rower_retry_delay_ms),
            self.settings.rower_retry_count,
        );
        tokio::spawn(actor.run(policy))
    }
}

struct RowerActor {
    role: DeviceRole,
    link: SourceLink,
    scan_timeout: Duration,
    connect_timeout: Duration,
    no_packet_timeout: Duration,
}

impl RowerActor {
    async fn run(self, policy: RetryPolicy) {
        tokio::select! {
            _ = tokio::time::sleep(SETTLE_DELAY) => {}
            _ = self.link.cancel_token.cancelled() => return,
        }
        let mut reconnector = Reconnector::new("Rower", policy);
        loop {
            let outcome = self.attempt().await;
            if !reconnector.settle(outcome, &self.link).await {
                break;
            }
        }
        info!("Shutting down rower notification thread!");
    }
    async fn attempt(&self) -> Result<LinkEnd, AppError> {
        let Some(device) = scan::find_peripheral(
            self.link.target.as_deref(),
            FTMS_SERVICE_UUID,
            self.scan_timeout,
            &self.link.cancel_token,
        )
        .await?
        else {
            return Ok(LinkEnd::Cancelled);
        };
        info!("Connecting to rower! Address: {}", device.address());
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
        // Request control, then start. Rowers stay silent otherwise
        let control_point = scan::characteristic(device, CONTROL_POINT_CHARACTERISTIC_UUID)?;
        for opcode in [REQUEST_CONTROL, START_OR_RESUME] {
            device
                .write(&control_point, &[opcode], WriteType::WithResponse)
                .await?;
        }
        let rower_data = scan::characteristic(device, ROWER_DATA_CHARACTERISTIC_UUID)?;
        device.subscribe(&rower_data).await?;
        let mut notification_stream = device.notifications().await?;
        broadcast!(
            self.link.events,
            SessionEvent::DeviceConnected(self.role)
        );

        // Carry forward from whatever this link last reported, across reconnects too
        let mut snapshot = *self.link.readings.borrow();
        loop {
            tokio::select! {
                notification = notification_stream.next() => {
                    let Some(data) = notification else {
                        info!("Rower stream closed!");
                        return Ok(LinkEnd::Dropped);
                    };
                    if data.uuid != ROWER_DATA_CHARACTERISTIC_UUID {
                        continue;
                    }
                    snapshot = ftms::decode(&data.value, &snapshot);
                    debug!("Rower: {snapshot:?}");
                    self.link.readings.send_replace(snapshot);
                }
                _ = tokio::time::sleep(self.no_packet_timeout) => {
                    error!("No rower data received in {} seconds!", self.no_packet_timeout.as_secs());
                    return Ok(LinkEnd::Dropped);
                }
                _ = self.link.cancel_token.cancelled() => {
                    return Ok(LinkEnd::Cancelled);
                }
            }
        }
    }
}
