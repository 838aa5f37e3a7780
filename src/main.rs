use clap::Parser;
use std::panic::{self, PanicHookInfo};
use tilt_bridge::config::{Options, Settings};
use tilt_bridge::dispatch::SinkDispatcher;
use tilt_bridge::dispatch::brewfather::BrewfatherLogger;
use tilt_bridge::dispatch::mqtt::MqttChannel;
use tilt_bridge::monitor::Monitor;
use tilt_bridge::scanner;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

/// Log to stderr. `RUST_LOG` wins over the configured level when set.
fn init_logging(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Resolve to `true` on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("cannot listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Wire the radio, the sinks and the monitor together and run until a
/// shutdown signal or a scan failure.
///
/// # Errors
/// Returns an error message for anything that should end the process with
/// a non-zero status.
async fn run(settings: Settings) -> Result<(), String> {
    let scanner = scanner::open(settings.hci_device)
        .await
        .map_err(|e| format!("error accessing bluetooth device: {e}"))?;

    let channel = MqttChannel::new(settings.mqtt_endpoint.clone(), settings.client_id.clone());
    let logger = BrewfatherLogger::new(settings.logging_url.clone(), settings.sink_timeout)
        .map_err(|e| format!("cannot create remote logger: {e}"))?;
    let dispatcher = SinkDispatcher::new(channel, logger, settings.mqtt_channel.clone())
        .with_timeout(settings.sink_timeout);

    let mut monitor = Monitor::new(
        scanner,
        dispatcher,
        settings.registry,
        settings.calibration,
        settings.interval,
    )
    .with_window(settings.scan_window);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    monitor
        .run(shutdown_rx)
        .await
        .map_err(|e| format!("scanning failed: {e}"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    let settings = match Settings::load(options) {
        Ok(settings) => settings,
        Err(why) => {
            eprintln!("error: {}", why);
            std::process::exit(EXIT_ERROR);
        }
    };

    init_logging(&settings);
    info!(
        level = %settings.log_level,
        sources = ?settings.sources,
        broker = %settings.mqtt_endpoint,
        topic = %settings.mqtt_channel,
        devices = settings.registry.len(),
        "starting tilt bridge"
    );

    match run(settings).await {
        Ok(_) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            error!("{why}");
            std::process::exit(EXIT_ERROR);
        }
    }
}
