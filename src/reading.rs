//! Calibrated Tilt readings and their dispatch envelope.

use crate::calibration::{CalibratedValue, CalibrationTable, to_celsius};
use crate::scanner::RawAdvertisement;
use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};
use uuid::Uuid;

/// Timestamp layout used on the wire, e.g. `2022-02-02 10:23:05.123456`.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

fn serialize_time<S: Serializer>(time: &DateTime<Local>, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(&time.format(TIME_FORMAT))
}

/// Calibrated values go out as numbers, uncalibrated ones as `null`.
fn serialize_calibrated<S: Serializer>(value: &CalibratedValue, s: S) -> Result<S::Ok, S::Error> {
    value.calibrated().serialize(s)
}

/// One observation of one known device in one scan cycle.
///
/// Temperatures are in Celsius; gravity is specific gravity in thousandths
/// (1.050 is reported as 1050).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    /// Device label, e.g. "orange"
    #[serde(rename = "tilt")]
    pub label: String,
    /// When the advertisement was turned into a reading
    #[serde(rename = "time", serialize_with = "serialize_time")]
    pub timestamp: DateTime<Local>,
    /// Converted, uncorrected temperature
    pub temperature: f64,
    #[serde(rename = "temperature_cal", serialize_with = "serialize_calibrated")]
    pub temperature_calibrated: CalibratedValue,
    /// Raw gravity as advertised
    #[serde(rename = "sg")]
    pub gravity: u16,
    #[serde(rename = "sg_cal", serialize_with = "serialize_calibrated")]
    pub gravity_calibrated: CalibratedValue,
    #[serde(rename = "measurementID")]
    pub measurement_id: Uuid,
}

impl Reading {
    /// Build a reading for `label` from a raw advertisement.
    ///
    /// Every call gets a fresh random `measurement_id`.
    pub fn from_advertisement(
        label: &str,
        advertisement: &RawAdvertisement,
        calibration: &CalibrationTable,
        timestamp: DateTime<Local>,
    ) -> Self {
        let fahrenheit = f64::from(advertisement.major);
        Reading {
            label: label.to_string(),
            timestamp,
            temperature: to_celsius(fahrenheit),
            temperature_calibrated: calibration.calibrate_temperature(fahrenheit, label),
            gravity: advertisement.minor,
            gravity_calibrated: calibration.calibrate_gravity(advertisement.minor, label),
            measurement_id: Uuid::new_v4(),
        }
    }
}

/// A reading stamped at the sink boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchEnvelope {
    #[serde(flatten)]
    pub reading: Reading,
    #[serde(rename = "msg_uuid")]
    pub dispatch_id: Uuid,
    #[serde(rename = "time_send", serialize_with = "serialize_time")]
    pub dispatch_time: DateTime<Local>,
}

impl DispatchEnvelope {
    pub fn new(reading: Reading) -> Self {
        Self {
            reading,
            dispatch_id: Uuid::new_v4(),
            dispatch_time: Local::now(),
        }
    }

    /// JSON payload published to the message channel.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
