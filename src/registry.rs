//! Known Tilt devices.
//!
//! Tilt hydrometers advertise one of eight fixed iBeacon UUIDs, one per
//! colour. Any other beacon in radio range belongs to unrelated hardware and
//! is ignored. Extra devices can be registered with `--device ID=label`.

use crate::identity::BeaconId;
use std::collections::BTreeMap;

/// The eight Tilt colours and their iBeacon UUIDs.
pub const TILT_DEVICES: [(&str, &str); 8] = [
    ("a495bb10c5b14b44b5121370f02d74de", "red"),
    ("a495bb20c5b14b44b5121370f02d74de", "green"),
    ("a495bb30c5b14b44b5121370f02d74de", "black"),
    ("a495bb40c5b14b44b5121370f02d74de", "purple"),
    ("a495bb50c5b14b44b5121370f02d74de", "orange"),
    ("a495bb60c5b14b44b5121370f02d74de", "blue"),
    ("a495bb70c5b14b44b5121370f02d74de", "yellow"),
    ("a495bb80c5b14b44b5121370f02d74de", "pink"),
];

/// A device identity paired with its human-readable label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownDevice {
    pub id: BeaconId,
    pub label: String,
}

/// Parse a device from a string in the format "ID=LABEL".
///
/// # Example
/// ```
/// use tilt_bridge::registry::parse_device;
///
/// let device = parse_device("a495bb90c5b14b44b5121370f02d74de=spare").unwrap();
/// assert_eq!(device.label, "spare");
/// ```
pub fn parse_device(src: &str) -> Result<KnownDevice, String> {
    let (id, label) = src
        .split_once('=')
        .ok_or_else(|| "invalid device: expected format ID=LABEL".to_string())?;

    let label = label.trim();
    if label.is_empty() {
        return Err("invalid device: label must not be empty".into());
    }

    let id = id.parse::<BeaconId>().map_err(|e| e.to_string())?;
    Ok(KnownDevice {
        id,
        label: label.to_string(),
    })
}

/// Static mapping from beacon identity to device label.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<BeaconId, String>,
}

impl DeviceRegistry {
    /// An empty registry that recognises nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// The eight standard Tilt colours.
    pub fn tilts() -> Self {
        let mut registry = Self::new();
        for (id, label) in TILT_DEVICES {
            // The table above is fixed, so every entry parses.
            if let Ok(id) = id.parse() {
                registry.insert(id, label);
            }
        }
        registry
    }

    /// Register `id` under `label`, replacing any previous label.
    pub fn insert(&mut self, id: BeaconId, label: impl Into<String>) {
        self.devices.insert(id, label.into());
    }

    /// Extend the registry with additional devices.
    pub fn extend<'a>(&mut self, devices: impl IntoIterator<Item = &'a KnownDevice>) {
        for device in devices {
            self.insert(device.id, device.label.clone());
        }
    }

    /// Resolve a beacon identity to its label. Unknown identities yield `None`.
    pub fn lookup(&self, id: &BeaconId) -> Option<&str> {
        self.devices.get(id).map(String::as_str)
    }

    /// Every registered label, in identity order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.devices.values().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
