//! Beacon scanning.
//!
//! A backend streams every iBeacon advertisement it hears into a channel.
//! [`ChannelScanner`] turns that stream into bounded batches, one per scan
//! window, which is what the monitor loop consumes.

#[cfg(feature = "hci")]
pub mod hci;

use crate::identity::BeaconId;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};

/// Apple's Bluetooth SIG company identifier, which iBeacon frames carry.
pub const APPLE_COMPANY_ID: u16 = 0x004C;

/// iBeacon subtype and payload length following the company identifier.
pub const IBEACON_TYPE: u8 = 0x02;
pub const IBEACON_LENGTH: u8 = 0x15;

/// Bluetooth manufacturer-specific data type (AD type 0xFF)
pub const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// Channel buffer size between a backend and the batch collector.
pub const ADVERTISEMENT_CHANNEL_BUFFER_SIZE: usize = 256;

/// One decoded iBeacon advertisement.
///
/// For a Tilt, `major` is the temperature in whole degrees Fahrenheit and
/// `minor` the specific gravity in thousandths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawAdvertisement {
    pub id: BeaconId,
    pub major: u16,
    pub minor: u16,
}

/// Error types for decoding manufacturer data.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Apple manufacturer data that is not an iBeacon frame
    #[error("Not an iBeacon frame (type {0:#04x})")]
    NotIBeacon(u8),
    /// Invalid or truncated data
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Error type for scanner operations.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// Backend not available (not compiled in)
    #[error("Backend '{0}' not available (not compiled in)")]
    BackendNotAvailable(String),
    /// The backend stopped producing advertisements
    #[error("Scan stream closed")]
    Closed,
}

/// Decode the manufacturer data of an Apple advertisement as an iBeacon.
///
/// # Arguments
/// * `data` - manufacturer-specific data following the company identifier
///
/// # Layout
/// `0x02 0x15 | uuid (16) | major (2, BE) | minor (2, BE) | tx power (1)`
pub fn decode_ibeacon(data: &[u8]) -> Result<RawAdvertisement, DecodeError> {
    let (&kind, rest) = data
        .split_first()
        .ok_or_else(|| DecodeError::InvalidData("Empty data".into()))?;
    if kind != IBEACON_TYPE {
        return Err(DecodeError::NotIBeacon(kind));
    }

    let (&length, payload) = rest
        .split_first()
        .ok_or_else(|| DecodeError::InvalidData("Missing iBeacon length".into()))?;
    if length != IBEACON_LENGTH || payload.len() < usize::from(IBEACON_LENGTH) {
        return Err(DecodeError::InvalidData(format!(
            "iBeacon payload length {} (declared {length})",
            payload.len()
        )));
    }

    let mut id = [0u8; 16];
    id.copy_from_slice(&payload[..16]);
    let major = u16::from_be_bytes([payload[16], payload[17]]);
    let minor = u16::from_be_bytes([payload[18], payload[19]]);

    Ok(RawAdvertisement {
        id: BeaconId(id),
        major,
        minor,
    })
}

/// Find and decode an iBeacon frame in raw advertising data.
///
/// Returns `None` when the advertisement carries no Apple manufacturer data,
/// which is the common case for unrelated devices.
pub fn decode_advertising_data(ad_data: &[u8]) -> Option<Result<RawAdvertisement, DecodeError>> {
    let mut offset = 0;
    while offset + 2 <= ad_data.len() {
        let len = ad_data[offset] as usize;
        if len == 0 || offset + 1 + len > ad_data.len() {
            break;
        }

        let ad_type = ad_data[offset + 1];
        if ad_type == AD_TYPE_MANUFACTURER_DATA && len >= 3 {
            // Company ID is little-endian on air
            let company = u16::from_le_bytes([ad_data[offset + 2], ad_data[offset + 3]]);
            if company == APPLE_COMPANY_ID {
                return Some(decode_ibeacon(&ad_data[offset + 4..offset + 1 + len]));
            }
        }

        offset += 1 + len;
    }

    None
}

/// Bounds of one acquisition: stop after `max_events` or when `timeout` elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanWindow {
    pub max_events: usize,
    pub timeout: Duration,
}

impl Default for ScanWindow {
    fn default() -> Self {
        Self {
            max_events: 100,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Future returned by [`BeaconScanner::acquire_batch`].
pub type BatchFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<RawAdvertisement>, ScanError>> + Send + 'a>>;

/// Scanner abstraction to enable deterministic unit tests without Bluetooth hardware.
pub trait BeaconScanner: Send {
    /// Collect the advertisements observed during one scan window.
    fn acquire_batch(&mut self, window: ScanWindow) -> BatchFuture<'_>;
}

/// Batches advertisements streamed by a backend task.
#[derive(Debug)]
pub struct ChannelScanner {
    rx: mpsc::Receiver<RawAdvertisement>,
}

impl ChannelScanner {
    pub fn new(rx: mpsc::Receiver<RawAdvertisement>) -> Self {
        Self { rx }
    }

    /// Drop whatever queued up while we were idle, so that each batch only
    /// holds advertisements from its own window.
    fn discard_stale(&mut self) -> Result<usize, ScanError> {
        let mut discarded = 0;
        loop {
            match self.rx.try_recv() {
                Ok(_) => discarded += 1,
                Err(mpsc::error::TryRecvError::Empty) => return Ok(discarded),
                Err(mpsc::error::TryRecvError::Disconnected) => return Err(ScanError::Closed),
            }
        }
    }
}

impl BeaconScanner for ChannelScanner {
    fn acquire_batch(&mut self, window: ScanWindow) -> BatchFuture<'_> {
        Box::pin(async move {
            let stale = self.discard_stale()?;
            if stale > 0 {
                tracing::trace!(stale, "discarded advertisements queued between scans");
            }

            let deadline = Instant::now() + window.timeout;
            let mut batch = Vec::with_capacity(window.max_events);
            while batch.len() < window.max_events {
                match timeout_at(deadline, self.rx.recv()).await {
                    Ok(Some(advertisement)) => batch.push(advertisement),
                    Ok(None) => return Err(ScanError::Closed),
                    Err(_) => break, // window elapsed
                }
            }
            Ok(batch)
        })
    }
}

/// Open Bluetooth adapter `device` (0 for hci0), configure LE scanning and
/// start streaming advertisements.
///
/// # Errors
/// Returns `ScanError` if the adapter cannot be opened or configured.
pub async fn open(device: u16) -> Result<ChannelScanner, ScanError> {
    #[cfg(feature = "hci")]
    {
        let rx = hci::start_scan(device).await?;
        Ok(ChannelScanner::new(rx))
    }
    #[cfg(not(feature = "hci"))]
    {
        let _ = device;
        Err(ScanError::BackendNotAvailable("hci".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ORANGE_ID, ibeacon_ad_data, ibeacon_payload};

    #[test]
    fn test_decode_ibeacon() {
        let adv = decode_ibeacon(&ibeacon_payload(ORANGE_ID, 65, 1050)).unwrap();
        assert_eq!(adv.id, ORANGE_ID);
        assert_eq!(adv.major, 65);
        assert_eq!(adv.minor, 1050);
    }

    #[test]
    fn test_decode_ibeacon_rejects_other_apple_frames() {
        // Apple "nearby" frames use other subtypes
        assert_eq!(
            decode_ibeacon(&[0x10, 0x05, 0x01, 0x18, 0x00, 0x00, 0x00]),
            Err(DecodeError::NotIBeacon(0x10))
        );
    }

    #[test]
    fn test_decode_ibeacon_truncated() {
        let mut payload = ibeacon_payload(ORANGE_ID, 65, 1050);
        payload.truncate(10);
        assert!(matches!(
            decode_ibeacon(&payload),
            Err(DecodeError::InvalidData(_))
        ));
        assert!(matches!(
            decode_ibeacon(&[]),
            Err(DecodeError::InvalidData(_))
        ));
    }

    #[test]
    fn test_decode_advertising_data_finds_manufacturer_block() {
        let ad = ibeacon_ad_data(ORANGE_ID, 70, 1012);
        let adv = decode_advertising_data(&ad).unwrap().unwrap();
        assert_eq!(adv.major, 70);
        assert_eq!(adv.minor, 1012);
    }

    #[test]
    fn test_decode_advertising_data_ignores_other_vendors() {
        // Flags + manufacturer data from another vendor (0x0499)
        let ad = [0x02, 0x01, 0x06, 0x05, 0xFF, 0x99, 0x04, 0x05, 0x12];
        assert!(decode_advertising_data(&ad).is_none());
    }

    #[test]
    fn test_decode_advertising_data_malformed_length() {
        let ad = [0x1A, 0xFF, 0x4C, 0x00];
        assert!(decode_advertising_data(&ad).is_none());
    }

    #[test]
    fn test_scan_error_display() {
        let err = ScanError::Bluetooth("hci0 is down".to_string());
        assert_eq!(format!("{}", err), "Bluetooth error: hci0 is down");
        assert_eq!(ScanError::Closed.to_string(), "Scan stream closed");
    }

    fn adv(minor: u16) -> RawAdvertisement {
        RawAdvertisement {
            id: ORANGE_ID,
            major: 65,
            minor,
        }
    }

    #[tokio::test]
    async fn test_channel_scanner_stops_at_max_events() {
        let (tx, rx) = mpsc::channel(16);
        let mut scanner = ChannelScanner::new(rx);

        let window = ScanWindow {
            max_events: 3,
            timeout: Duration::from_secs(60),
        };
        // Sent once the collector is waiting, so nothing counts as stale
        tokio::spawn(async move {
            for minor in 1000..1005 {
                tx.send(adv(minor)).await.unwrap();
            }
        });

        let batch = scanner.acquire_batch(window).await.unwrap();
        assert_eq!(
            batch.iter().map(|a| a.minor).collect::<Vec<_>>(),
            vec![1000, 1001, 1002]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_scanner_stops_when_window_elapses() {
        let (tx, rx) = mpsc::channel(16);
        let mut scanner = ChannelScanner::new(rx);

        let window = ScanWindow {
            max_events: 100,
            timeout: Duration::from_secs(5),
        };
        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send(adv(1001)).await.unwrap();
            // keep the channel open past the window
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(tx);
        });

        let batch = scanner.acquire_batch(window).await.unwrap();
        assert_eq!(batch, vec![adv(1001)]);
        sender.abort();
    }

    #[tokio::test]
    async fn test_channel_scanner_discards_stale_advertisements() {
        let (tx, rx) = mpsc::channel(16);
        let mut scanner = ChannelScanner::new(rx);
        tx.send(adv(999)).await.unwrap();

        let window = ScanWindow {
            max_events: 1,
            timeout: Duration::from_secs(60),
        };
        let collect = scanner.acquire_batch(window);
        let feed = async {
            tokio::task::yield_now().await;
            tx.send(adv(1010)).await.unwrap();
        };
        let (batch, ()) = tokio::join!(collect, feed);
        assert_eq!(batch.unwrap(), vec![adv(1010)]);
    }

    #[tokio::test]
    async fn test_channel_scanner_closed_stream_is_an_error() {
        let (tx, rx) = mpsc::channel(1);
        let mut scanner = ChannelScanner::new(rx);
        drop(tx);

        let result = scanner.acquire_batch(ScanWindow::default()).await;
        assert!(matches!(result, Err(ScanError::Closed)));
    }
}
