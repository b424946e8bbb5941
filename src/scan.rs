use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{stream, Stream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::discovery::classifier::Advertisement;
use crate::errors::AppError;

/// First Bluetooth adapter on the system.
pub async fn adapter() -> Result<Adapter, AppError> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| AppError::DeviceNotFound("No Bluetooth adapters found".into()))
}

/// Some platforms (macOS) hide the MAC, fall back to the platform ID there.
fn address_of(peripheral: &Peripheral, properties: &PeripheralProperties) -> String {
    if properties.address == BDAddr::default() {
        peripheral.id().to_string()
    } else {
        properties.address.to_string()
    }
}

async fn advertisement(peripheral: &Peripheral) -> Option<Advertisement> {
    let properties = match peripheral.properties().await {
        Ok(Some(properties)) => properties,
        Ok(None) => return None,
        Err(e) => {
            debug!("Couldn't read properties: {e}");
            return None;
        }
    };
    Some(Advertisement {
        address: address_of(peripheral, &properties),
        name: properties.local_name,
        services: properties.services,
        rssi: properties.rssi.unwrap_or(i16::MIN),
    })
}

/// Streams advertisements from the first adapter until `cancel_token` fires.
///
/// Adapter failures are yielded as a single `Err`, after which the stream ends.
pub fn advertisements(
    cancel_token: CancellationToken,
) -> impl Stream<Item = Result<Advertisement, AppError>> + Send + 'static {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(scan_thread(tx, cancel_token));
    stream::unfold(rx, |mut rx| async move {
        let item = rx.recv().await?;
        Some((item, rx))
    })
}

async fn scan_thread(
    tx: mpsc::Sender<Result<Advertisement, AppError>>,
    cancel_token: CancellationToken,
) {
    let central = match start_scan(ScanFilter::default()).await {
        Ok(central) => central,
        Err(e) => {
            error!("Scanning failure: {e}");
            let _ = tx.send(Err(e)).await;
            return;
        }
    };
    let mut events = match central.events().await {
        Ok(events) => events,
        Err(e) => {
            error!("BLE failure: {e}");
            let _ = tx.send(Err(e.into())).await;
            return;
        }
    };
    info!("Bluetooth scan started!");

    loop {
        tokio::select! {
            Some(event) = events.next() => {
                let (CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) = event else {
                    continue;
                };
                let Ok(peripheral) = central.peripheral(&id).await else {
                    continue;
                };
                if let Some(advertisement) = advertisement(&peripheral).await {
                    if tx.send(Ok(advertisement)).await.is_err() {
                        debug!("Advertisement receiver dropped");
                        break;
                    }
                }
            }
            _ = cancel_token.cancelled() => {
                info!("Shutting down Bluetooth scan!");
                break;
            }
            _ = tx.closed() => break,
        }
    }
    if let Err(e) = central.stop_scan().await {
        warn!("Failed to stop scan: {e}");
    }
}

async fn start_scan(filter: ScanFilter) -> Result<Adapter, AppError> {
    let central = adapter().await?;
    central.start_scan(filter).await?;
    Ok(central)
}

/// Waits until a peripheral shows up that matches `target`, or advertises `service`
/// when nothing is bound. `Ok(None)` means we were cancelled first.
pub async fn find_peripheral(
    target: Option<&str>,
    service: Uuid,
    scan_timeout: Duration,
    cancel_token: &CancellationToken,
) -> Result<Option<Peripheral>, AppError> {
    let filter = match target {
        Some(_) => ScanFilter::default(),
        None => ScanFilter {
            services: vec![service],
        },
    };
    let central = start_scan(filter).await?;
    let mut events = central.events().await?;

    let matches = |advertisement: &Advertisement| match target {
        Some(address) => advertisement.address.eq_ignore_ascii_case(address),
        None => advertisement.services.contains(&service),
    };

    // Already known to the adapter, no need to wait for another advertisement
    for peripheral in central.peripherals().await? {
        if advertisement(&peripheral).await.is_some_and(|a| matches(&a)) {
            central.stop_scan().await?;
            return Ok(Some(peripheral));
        }
    }

    let search = async {
        while let Some(event) = events.next().await {
            let (CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) = event else {
                continue;
            };
            if let Ok(peripheral) = central.peripheral(&id).await {
                if advertisement(&peripheral).await.is_some_and(|a| matches(&a)) {
                    return Some(peripheral);
                }
            }
        }
        None
    };

    let found = tokio::select! {
        found = timeout(scan_timeout, search) => found,
        _ = cancel_token.cancelled() => {
            central.stop_scan().await?;
            return Ok(None);
        }
    };
    central.stop_scan().await?;

    match found {
        Ok(Some(peripheral)) => Ok(Some(peripheral)),
        Ok(None) => Err(AppError::DeviceNotFound("Scan ended early".into())),
        Err(_) => Err(AppError::DeviceNotFound(
            target.map_or_else(|| service.to_string(), str::to_owned),
        )),
    }
}

/// Connects and discovers services, bounded by `connect_timeout`.
pub async fn connect(peripheral: &Peripheral, connect_timeout: Duration) -> Result<(), AppError> {
    timeout(connect_timeout, peripheral.connect())
        .await
        .map_err(|_| AppError::ConnectTimeout)??;
    peripheral.discover_services().await?;
    debug!("Found {} characteristics", peripheral.characteristics().len());
    Ok(())
}

pub fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic, AppError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or(AppError::MissingCharacteristic(uuid))
}

pub async fn disconnect(peripheral: &Peripheral) {
    if peripheral.is_connected().await.unwrap_or(false) {
        if let Err(e) = peripheral.disconnect().await {
            warn!("Failed to disconnect: {e}");
        }
    }
}
