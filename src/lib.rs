#![deny(unused_must_use)]
//! Rowing ergometer and heart rate telemetry over BLE, plus the workout session
//! engine that turns it into splits, training segments and saved workouts.

pub mod discovery;
pub mod errors;
pub mod heart_rate;
pub mod logging;
mod macros;
pub mod metrics;
pub mod rower;
pub mod scan;
pub mod session;
pub mod settings;
pub mod smoothing;
pub mod source;

pub use discovery::classifier::{BoundDevices, DeviceRole, DiscoveredDevice};
pub use discovery::Discovery;
pub use errors::AppError;
pub use metrics::{MetricPoint, MetricsSnapshot};
pub use session::machine::{SessionMachine, SessionState};
pub use session::store::{MemoryStore, WorkoutStore, WorkoutSummary};
pub use session::training::{TrainingAlert, TrainingPlan};
pub use session::{SessionEvent, SessionHandle, SessionSources};
pub use settings::Settings;
pub use source::{DeviceError, MetricsSource};
