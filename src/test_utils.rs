use crate::identity::BeaconId;
use crate::scanner::RawAdvertisement;
use chrono::{DateTime, Local, TimeZone};
use std::io;
use std::sync::{Arc, Mutex};

/// The orange Tilt's identity.
pub const ORANGE_ID: BeaconId = BeaconId([
    0xa4, 0x95, 0xbb, 0x50, 0xc5, 0xb1, 0x4b, 0x44, 0xb5, 0x12, 0x13, 0x70, 0xf0, 0x2d, 0x74, 0xde,
]);

/// The purple Tilt's identity.
pub const PURPLE_ID: BeaconId = BeaconId([
    0xa4, 0x95, 0xbb, 0x40, 0xc5, 0xb1, 0x4b, 0x44, 0xb5, 0x12, 0x13, 0x70, 0xf0, 0x2d, 0x74, 0xde,
]);

/// A beacon that is not a Tilt.
pub const STRANGER_ID: BeaconId = BeaconId([0x42; 16]);

pub fn advertisement(id: BeaconId, major: u16, minor: u16) -> RawAdvertisement {
    RawAdvertisement { id, major, minor }
}

/// A stable local timestamp for readings built in tests.
pub fn fixed_time() -> DateTime<Local> {
    Local
        .with_ymd_and_hms(2022, 2, 2, 10, 23, 5)
        .single()
        .expect("unambiguous local time")
}

/// iBeacon manufacturer data following the company identifier.
pub fn ibeacon_payload(id: BeaconId, major: u16, minor: u16) -> Vec<u8> {
    let mut payload = vec![0x02, 0x15];
    payload.extend_from_slice(&id.0);
    payload.extend_from_slice(&major.to_be_bytes());
    payload.extend_from_slice(&minor.to_be_bytes());
    payload.push(0xC5); // measured power -59 dBm
    payload
}

/// Complete advertising data: flags followed by Apple manufacturer data.
pub fn ibeacon_ad_data(id: BeaconId, major: u16, minor: u16) -> Vec<u8> {
    let payload = ibeacon_payload(id, major, minor);
    let mut ad = vec![0x02, 0x01, 0x04];
    ad.push((payload.len() + 3) as u8);
    ad.push(0xFF);
    ad.extend_from_slice(&[0x4C, 0x00]);
    ad.extend(payload);
    ad
}

/// Collects everything logged on the current thread while alive.
///
/// Works with `#[tokio::test]`, which runs the test on a single thread.
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    _guard: tracing::subscriber::DefaultGuard,
}

struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogCapture {
    pub fn start() -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .without_time()
            .with_writer(move || CaptureWriter(writer.clone()))
            .finish();

        Self {
            buffer,
            _guard: tracing::subscriber::set_default(subscriber),
        }
    }

    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
    }

    /// Number of log lines containing `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.output().lines().filter(|l| l.contains(needle)).count()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.count(needle) > 0
    }
}
