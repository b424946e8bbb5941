use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

use crate::heart_rate::ble::HEART_RATE_SERVICE_UUID;
use crate::rower::ftms::FTMS_SERVICE_UUID;

/// Name prefixes of rowers that don't always advertise FTMS
const ROWER_NAME_PREFIXES: &[&str] = &["fs-"];
const ROWER_NAME_KEYWORDS: &[&str] = &["styrke", "skandika"];
const HRM_NAME_KEYWORDS: &[&str] = &[
    "polar", "garmin", "wahoo", "tickr", "hr-", "heart", "coospo", "magene", "ble-",
];

pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceRole {
    Rower,
    HeartRateMonitor,
    #[default]
    Unknown,
}

/// Addresses the active user has already paired with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundDevices {
    pub rower: Option<String>,
    pub heart_rate: Option<String>,
}

impl BoundDevices {
    pub fn role_of(&self, address: &str) -> Option<DeviceRole> {
        if self.rower.as_deref() == Some(address) {
            Some(DeviceRole::Rower)
        } else if self.heart_rate.as_deref() == Some(address) {
            Some(DeviceRole::HeartRateMonitor)
        } else {
            None
        }
    }
    /// Binds `device` to the slot for its role. Unknown devices can't be bound.
    pub fn bind(&mut self, device: &DiscoveredDevice) -> bool {
        match device.role {
            DeviceRole::Rower => self.rower = Some(device.address.clone()),
            DeviceRole::HeartRateMonitor => self.heart_rate = Some(device.address.clone()),
            DeviceRole::Unknown => return false,
        }
        true
    }
}

/// A single advertisement seen during a scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Advertisement {
    pub name: Option<String>,
    pub address: String,
    pub services: Vec<Uuid>,
    pub rssi: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub name: String,
    pub address: String,
    pub rssi: i16,
    pub role: DeviceRole,
}

/// First match wins: bound address, advertised service, then name heuristics.
pub fn classify(advertisement: &Advertisement, bound: &BoundDevices) -> DeviceRole {
    if let Some(role) = bound.role_of(&advertisement.address) {
        return role;
    }
    if advertisement.services.contains(&FTMS_SERVICE_UUID) {
        return DeviceRole::Rower;
    }
    if advertisement.services.contains(&HEART_RATE_SERVICE_UUID) {
        return DeviceRole::HeartRateMonitor;
    }
    advertisement
        .name
        .as_deref()
        .map(classify_name)
        .unwrap_or_default()
}

fn classify_name(name: &str) -> DeviceRole {
    let name = name.to_lowercase();
    if ROWER_NAME_PREFIXES.iter().any(|p| name.starts_with(p))
        || ROWER_NAME_KEYWORDS.iter().any(|k| name.contains(k))
    {
        DeviceRole::Rower
    } else if HRM_NAME_KEYWORDS.iter().any(|k| name.contains(k)) {
        DeviceRole::HeartRateMonitor
    } else {
        DeviceRole::Unknown
    }
}

/// Discovered devices keyed by address, strongest signal first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceList {
    devices: Vec<DiscoveredDevice>,
}

impl DeviceList {
    /// Seeds the list with the already bound devices, so they show up before advertising.
    pub fn seeded(bound: &BoundDevices) -> Self {
        let mut devices = Vec::new();
        if let Some(address) = &bound.rower {
            devices.push(DiscoveredDevice {
                name: "Linked Rower".into(),
                address: address.clone(),
                rssi: 0,
                role: DeviceRole::Rower,
            });
        }
        if let Some(address) = &bound.heart_rate {
            devices.push(DiscoveredDevice {
                name: "Linked HRM".into(),
                address: address.clone(),
                rssi: 0,
                role: DeviceRole::HeartRateMonitor,
            });
        }
        Self { devices }
    }
    /// Inserts or updates the entry for the advertisement's address.
    ///
    /// An Unknown classification never replaces a known role, and a nameless
    /// advertisement keeps the name we already have.
    pub fn upsert(&mut self, advertisement: &Advertisement, bound: &BoundDevices) {
        let existing = self
            .devices
            .iter()
            .position(|d| d.address == advertisement.address);

        let mut role = classify(advertisement, bound);
        let mut name = advertisement
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_owned());

        if let Some(index) = existing {
            let previous = &self.devices[index];
            if role == DeviceRole::Unknown {
                role = previous.role;
            }
            if name == UNKNOWN_DEVICE_NAME {
                name = previous.name.clone();
            }
        }

        let device = DiscoveredDevice {
            name,
            address: advertisement.address.clone(),
            rssi: advertisement.rssi,
            role,
        };

        match existing {
            Some(index) => self.devices[index] = device,
            None => self.devices.push(device),
        }
        // Stable, so equal signal strengths keep their order
        self.devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));
    }
    pub fn get(&self, address: &str) -> Option<&DiscoveredDevice> {
        self.devices.iter().find(|d| d.address == address)
    }
    pub fn devices(&self) -> &[DiscoveredDevice] {
        &self.devices
    }
    pub fn len(&self) -> usize {
        self.devices.len()
    }
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
