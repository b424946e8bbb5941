pub mod ble;
pub mod dummy;
pub mod measurement;
