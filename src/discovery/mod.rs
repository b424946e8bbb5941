pub mod classifier;

use classifier::{Advertisement, BoundDevices, DeviceList, DiscoveredDevice};
use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::errors::AppError;
use crate::settings::DiscoverySettings;
use crate::source::DeviceError;

/// A running discovery. Stops by itself once the configured timeout passes.
pub struct Discovery {
    devices: watch::Receiver<Vec<DiscoveredDevice>>,
    scanning: watch::Receiver<bool>,
    error: watch::Receiver<Option<DeviceError>>,
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl Discovery {
    /// Starts folding `advertisements` into a ranked device list.
    pub fn start<S>(
        advertisements: S,
        bound: BoundDevices,
        settings: DiscoverySettings,
        parent_token: &CancellationToken,
    ) -> Self
    where
        S: Stream<Item = Result<Advertisement, AppError>> + Send + 'static,
    {
        let list = DeviceList::seeded(&bound);
        let (devices_tx, devices) = watch::channel(list.devices().to_vec());
        let (scanning_tx, scanning) = watch::channel(true);
        let (error_tx, error) = watch::channel(None);
        let cancel_token = parent_token.child_token();

        let actor = DiscoveryActor {
            list,
            bound,
            pending: Vec::new(),
            devices_tx,
            error_tx,
        };
        let token = cancel_token.clone();
        let task = tokio::spawn(async move {
            actor.run(advertisements, settings, token).await;
            scanning_tx.send_replace(false);
        });

        Self {
            devices,
            scanning,
            error,
            cancel_token,
            task,
        }
    }
    pub fn devices(&self) -> watch::Receiver<Vec<DiscoveredDevice>> {
        self.devices.clone()
    }
    pub fn scanning(&self) -> watch::Receiver<bool> {
        self.scanning.clone()
    }
    pub fn error(&self) -> watch::Receiver<Option<DeviceError>> {
        self.error.clone()
    }
    pub fn is_scanning(&self) -> bool {
        *self.scanning.borrow()
    }
    /// Cancels the scan and waits for the task to wind down.
    pub async fn stop(self) -> Vec<DiscoveredDevice> {
        self.cancel_token.cancel();
        if let Err(e) = self.task.await {
            error!("Discovery task failed: {e}");
        }
        let devices = self.devices.borrow().clone();
        devices
    }
}

struct DiscoveryActor {
    list: DeviceList,
    bound: BoundDevices,
    // Latest advertisement per address since the last sample
    pending: Vec<Advertisement>,
    devices_tx: watch::Sender<Vec<DiscoveredDevice>>,
    error_tx: watch::Sender<Option<DeviceError>>,
}

impl DiscoveryActor {
    async fn run<S>(
        mut self,
        advertisements: S,
        settings: DiscoverySettings,
        cancel_token: CancellationToken,
    ) where
        S: Stream<Item = Result<Advertisement, AppError>> + Send,
    {
        tokio::pin!(advertisements);
        let deadline = time::sleep(settings.timeout());
        tokio::pin!(deadline);
        let mut sampler = time::interval(settings.sample_interval());
        sampler.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Discovery started!");
        loop {
            tokio::select! {
                item = advertisements.next() => {
                    match item {
                        Some(Ok(advertisement)) => self.queue(advertisement),
                        Some(Err(e)) => {
                            error!("Scan error: {e}");
                            self.error_tx
                                .send_replace(Some(DeviceError::detailed("Scan error", e)));
                            break;
                        }
                        None => {
                            debug!("Advertisement stream ended");
                            break;
                        }
                    }
                }
                _ = sampler.tick() => {
                    self.flush();
                }
                _ = &mut deadline => {
                    info!("Discovery timed out after {} seconds", settings.timeout_secs);
                    break;
                }
                _ = cancel_token.cancelled() => {
                    info!("Stopping discovery");
                    break;
                }
            }
        }
        self.flush();
    }
    fn queue(&mut self, advertisement: Advertisement) {
        match self
            .pending
            .iter_mut()
            .find(|a| a.address == advertisement.address)
        {
            Some(existing) => *existing = advertisement,
            None => self.pending.push(advertisement),
        }
    }
    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        for advertisement in self.pending.drain(..) {
            self.list.upsert(&advertisement, &self.bound);
        }
        let devices = self.list.devices();
        self.devices_tx.send_if_modified(|published| {
            if published.as_slice() == devices {
                false
            } else {
                *published = devices.to_vec();
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::classifier::DeviceRole;
    use futures::stream;
    use std::time::Duration;

    fn settings() -> DiscoverySettings {
        DiscoverySettings {
            timeout_secs: 15,
            sample_interval_ms: 500,
        }
    }

    fn advert(name: &str, address: &str, rssi: i16) -> Result<Advertisement, AppError> {
        Ok(Advertisement {
            name: Some(name.into()),
            address: address.into(),
            services: Vec::new(),
            rssi,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn stops_itself_after_timeout() {
        let token = CancellationToken::new();
        let ads = stream::iter(vec![advert("Polar H10", "A", -50)]).chain(stream::pending());
        let discovery = Discovery::start(ads, BoundDevices::default(), settings(), &token);
        let mut scanning = discovery.scanning();

        tokio::time::sleep(Duration::from_secs(14)).await;
        assert!(discovery.is_scanning());
        scanning.wait_for(|s| !s).await.unwrap();

        let devices = discovery.devices().borrow().clone();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].role, DeviceRole::HeartRateMonitor);
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_are_collapsed_per_address() {
        let token = CancellationToken::new();
        let ads = stream::iter(vec![
            advert("FS-1", "A", -80),
            advert("FS-1", "A", -70),
            advert("Wahoo", "B", -75),
            advert("FS-1", "A", -60),
        ])
        .chain(stream::pending());
        let discovery = Discovery::start(ads, BoundDevices::default(), settings(), &token);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let devices = discovery.devices().borrow().clone();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].address, "A");
        assert_eq!(devices[0].rssi, -60);

        let final_list = discovery.stop().await;
        assert_eq!(final_list, devices);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_errors_end_discovery() {
        let token = CancellationToken::new();
        let ads = stream::iter(vec![Err(AppError::DeviceNotFound("adapter".into()))]);
        let discovery = Discovery::start(ads, BoundDevices::default(), settings(), &token);
        let mut scanning = discovery.scanning();
        scanning.wait_for(|s| !s).await.unwrap();
        assert!(discovery.error().borrow().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancel_stops_scan() {
        let token = CancellationToken::new();
        let discovery = Discovery::start(
            stream::pending::<Result<Advertisement, AppError>>(),
            BoundDevices::default(),
            settings(),
            &token,
        );
        let mut scanning = discovery.scanning();
        token.cancel();
        scanning.wait_for(|s| !s).await.unwrap();
    }
}
