//! The scan → dedup → calibrate → dispatch cycle.
//!
//! This module is decoupled from option parsing, process exit codes and the
//! concrete radio and sink clients so it can be tested deterministically.

use crate::calibration::CalibrationTable;
use crate::dedup::distinct;
use crate::dispatch::Dispatcher;
use crate::reading::Reading;
use crate::registry::DeviceRegistry;
use crate::scanner::{BeaconScanner, ScanError, ScanWindow};
use chrono::Local;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Where the monitor currently is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Between scans, processing a batch or pausing.
    Idle,
    /// Waiting on the radio for a batch.
    Scanning,
}

/// What happened during one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Advertisements received from the radio
    pub observed: usize,
    /// Distinct identities among them
    pub unique: usize,
    /// Readings handed to the dispatcher
    pub dispatched: usize,
}

/// Drives the polling cycle over a scanner and a dispatcher.
pub struct Monitor<S, D> {
    scanner: S,
    dispatcher: D,
    registry: DeviceRegistry,
    calibration: CalibrationTable,
    window: ScanWindow,
    interval: Duration,
    state: MonitorState,
}

impl<S: BeaconScanner, D: Dispatcher> Monitor<S, D> {
    /// # Arguments
    /// * `interval` - pause between the end of one cycle and the next scan
    pub fn new(
        scanner: S,
        dispatcher: D,
        registry: DeviceRegistry,
        calibration: CalibrationTable,
        interval: Duration,
    ) -> Self {
        Self {
            scanner,
            dispatcher,
            registry,
            calibration,
            window: ScanWindow::default(),
            interval,
            state: MonitorState::Idle,
        }
    }

    pub fn with_window(mut self, window: ScanWindow) -> Self {
        self.window = window;
        self
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Run one cycle: acquire a batch, keep the first advertisement of each
    /// known device and dispatch a calibrated reading for it.
    ///
    /// # Errors
    /// Returns `ScanError` if the radio fails; nothing is dispatched then.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, ScanError> {
        debug!("scanning for tilts");
        self.state = MonitorState::Scanning;
        let batch = self.scanner.acquire_batch(self.window).await;
        self.state = MonitorState::Idle;
        let batch = batch?;

        let mut report = CycleReport {
            observed: batch.len(),
            ..Default::default()
        };
        let unique = distinct(batch);
        report.unique = unique.len();

        for advertisement in &unique {
            let Some(label) = self.registry.lookup(&advertisement.id) else {
                trace!(id = %advertisement.id, "ignoring unknown beacon");
                continue;
            };

            let reading =
                Reading::from_advertisement(label, advertisement, &self.calibration, Local::now());
            debug!(label, measurement_id = %reading.measurement_id, ?reading, "reading");
            self.dispatcher.dispatch(reading).await;
            report.dispatched += 1;
        }

        if report.dispatched == 0 {
            warn!(
                observed = report.observed,
                "no known device observed this cycle"
            );
        }

        Ok(report)
    }

    /// Run cycles until `shutdown` becomes `true`.
    ///
    /// The flag is checked before every scan and while pausing between cycles.
    ///
    /// # Errors
    /// A scan failure ends the loop and is returned to the caller.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ScanError> {
        info!(interval = ?self.interval, "retrieving data every {:?}", self.interval);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let report = self.run_cycle().await?;
            trace!(?report, "cycle finished");

            if self.pause(&mut shutdown).await {
                break;
            }
        }

        info!("monitor stopped");
        Ok(())
    }

    /// Sleep for the configured interval. Returns `true` if shutdown was requested.
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let sleep = tokio::time::sleep(self.interval);
        tokio::pin!(sleep);

        let requested = tokio::select! {
            _ = &mut sleep => return false,
            stop = shutdown.wait_for(|stop| *stop) => stop.is_ok(),
        };

        if !requested {
            // Sender gone, no shutdown can arrive any more
            sleep.await;
        }
        requested
    }
}
