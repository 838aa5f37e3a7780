//! `tilt-bridge` library.
//!
//! The binary (`src/main.rs`) is responsible for configuration loading, signal
//! handling and process exit codes. The scan cycle lives in [`crate::monitor`]
//! where it can be tested deterministically with an injected scanner and
//! dispatcher.

pub mod calibration;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod identity;
pub mod monitor;
pub mod reading;
pub mod registry;
pub mod scanner;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use calibration::{CalibratedValue, CalibrationTable, Correction, LinearCalibration};
pub use config::{ConfigError, Options, Settings, parse_duration};
pub use dedup::distinct;
pub use dispatch::{Dispatcher, SinkDispatcher, SinkError};
pub use identity::BeaconId;
pub use monitor::{CycleReport, Monitor};
pub use reading::{DispatchEnvelope, Reading};
pub use registry::{DeviceRegistry, KnownDevice};
pub use scanner::{BeaconScanner, DecodeError, RawAdvertisement, ScanError, ScanWindow};
