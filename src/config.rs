//! Runtime configuration.
//!
//! Settings come from three layers, highest precedence first: command line
//! (or the matching environment variable), INI files, built-in defaults. The
//! INI files look like this:
//!
//! ```ini
//! [LOG]
//! LEVEL = INFO
//!
//! [TILT]
//! Interval = 900
//!
//! [MQTT]
//! Ip = 192.168.1.10
//! channel = brewing/tilt
//!
//! [BREWFATHER]
//! LoggingURL = https://log.brewfather.net/stream?id=...
//!
//! [CALIBRATION]
//! orange.temperature = offset -0.3
//! orange.gravity = 1000:1000,1072:1074
//! ```

use crate::calibration::{CalibrationError, CalibrationTable, Correction, Quantity};
use crate::dispatch::mqtt::MqttEndpoint;
use crate::registry::{DeviceRegistry, KnownDevice, parse_device};
use crate::scanner::ScanWindow;
use clap::Parser;
use ini::Ini;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

/// Command line options. Every option falls back to the INI files.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// INI file to read; later files override earlier ones, missing files are skipped.
    #[arg(
        long = "config",
        value_name = "FILE",
        default_values = ["tilt2mqtt.ini", "tilt2mqtt_local.ini"]
    )]
    pub config_files: Vec<PathBuf>,

    /// Log level (trace, debug, info, warning, error). Overrides LOG.LEVEL.
    #[arg(long, env = "TILT_LOG_LEVEL", value_parser = parse_log_level)]
    pub log_level: Option<LevelFilter>,

    /// Pause between scans, e.g. 900, 15m. Overrides TILT.Interval.
    #[arg(long, env = "TILT_INTERVAL", value_parser = parse_duration)]
    pub interval: Option<Duration>,

    /// MQTT broker as host or host:port. Overrides MQTT.Ip.
    #[arg(long, env = "TILT_MQTT_IP", value_parser = clap::value_parser!(MqttEndpoint))]
    pub mqtt_ip: Option<MqttEndpoint>,

    /// Topic prefix; readings go to <prefix>/<colour>. Overrides MQTT.channel.
    #[arg(long, env = "TILT_MQTT_CHANNEL")]
    pub mqtt_channel: Option<String>,

    /// Remote logging URL. Overrides BREWFATHER.LoggingURL.
    #[arg(long, env = "TILT_BREWFATHER_URL")]
    pub brewfather_url: Option<String>,

    /// Register an additional beacon.
    /// Format: --device a495bb90c5b14b44b5121370f02d74de=spare
    #[arg(long = "device", value_parser = parse_device, value_name = "ID=LABEL")]
    pub devices: Vec<KnownDevice>,

    /// Bluetooth adapter index (0 for hci0)
    #[arg(long, default_value_t = 0)]
    pub hci_device: u16,

    /// Longest time one scan may collect advertisements
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub scan_window: Duration,

    /// Most advertisements collected per scan
    #[arg(long, default_value_t = 100)]
    pub scan_events: usize,

    /// Upper bound for each MQTT publish and remote log request
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub sink_timeout: Duration,

    /// MQTT client identifier
    #[arg(long, default_value = "tilt-bridge")]
    pub client_id: String,
}

/// Errors raised while assembling [`Settings`]. All of them are fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: ini::Error,
    },
    #[error("missing required option {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
    #[error("invalid calibration {key}: {source}")]
    Calibration {
        key: String,
        #[source]
        source: CalibrationError,
    },
}

/// Parse a log level name. Accepts Python logging names (WARNING, CRITICAL)
/// and numeric levels as well as the usual Rust ones.
pub fn parse_log_level(src: &str) -> Result<LevelFilter, String> {
    match src.trim().to_lowercase().as_str() {
        "off" | "none" => Ok(LevelFilter::OFF),
        "trace" => Ok(LevelFilter::TRACE),
        "debug" | "10" => Ok(LevelFilter::DEBUG),
        "info" | "20" => Ok(LevelFilter::INFO),
        "warn" | "warning" | "30" => Ok(LevelFilter::WARN),
        "error" | "critical" | "fatal" | "40" | "50" => Ok(LevelFilter::ERROR),
        other => Err(format!("unknown log level: {other}")),
    }
}

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
/// - `ms`: milliseconds
///
/// # Examples
/// ```
/// use tilt_bridge::config::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("900").unwrap(), Duration::from_secs(900));
/// assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let number = |num: &str, unit: &str| -> Result<u64, String> {
        num.trim()
            .parse()
            .map_err(|_| format!("invalid {unit}: {num}"))
    };

    if let Some(num) = src.strip_suffix("ms") {
        return Ok(Duration::from_millis(number(num, "milliseconds")?));
    }
    let scaled = |value: u64, factor: u64| {
        value
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration too large: {src}"))
    };

    if let Some(num) = src.strip_suffix('h') {
        return scaled(number(num, "hours")?, 3600);
    }
    if let Some(num) = src.strip_suffix('m') {
        return scaled(number(num, "minutes")?, 60);
    }
    if let Some(num) = src.strip_suffix('s') {
        return Ok(Duration::from_secs(number(num, "seconds")?));
    }

    Ok(Duration::from_secs(number(src, "duration")?))
}

/// INI files stacked in load order; later files win.
#[derive(Debug, Default)]
pub struct IniLayers {
    layers: Vec<Ini>,
    sources: Vec<PathBuf>,
}

impl IniLayers {
    /// Load every file that exists, in order.
    pub fn load(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut layers = Self::default();
        for path in paths.iter().filter(|p| p.exists()) {
            let ini = Ini::load_from_file(path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            layers.push(ini, path);
        }
        Ok(layers)
    }

    pub fn push(&mut self, ini: Ini, source: &Path) {
        self.layers.push(ini);
        self.sources.push(source.to_path_buf());
    }

    /// Files that were actually read.
    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// Look up `section.key`. Section names are case-sensitive, keys are not.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.layers.iter().rev().find_map(|ini| {
            ini.section(Some(section))?
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.trim())
        })
    }

    /// All entries of `section` across files, in load order.
    pub fn entries<'a>(&'a self, section: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.layers
            .iter()
            .filter_map(move |ini| ini.section(Some(section)))
            .flat_map(|props| props.iter())
    }
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub log_level: LevelFilter,
    pub interval: Duration,
    pub mqtt_endpoint: MqttEndpoint,
    pub mqtt_channel: String,
    pub logging_url: String,
    pub registry: DeviceRegistry,
    pub calibration: CalibrationTable,
    pub hci_device: u16,
    pub scan_window: ScanWindow,
    pub sink_timeout: Duration,
    pub client_id: String,
    /// INI files the settings were read from
    pub sources: Vec<PathBuf>,
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        message: message.into(),
    }
}

impl Settings {
    /// Read the configured INI files and merge them with `options`.
    pub fn load(options: Options) -> Result<Self, ConfigError> {
        let layers = IniLayers::load(&options.config_files)?;
        Self::resolve(options, &layers)
    }

    pub fn resolve(options: Options, ini: &IniLayers) -> Result<Self, ConfigError> {
        let log_level = match options.log_level {
            Some(level) => level,
            None => match ini.get("LOG", "LEVEL") {
                Some(level) => parse_log_level(level).map_err(|e| invalid("LOG.LEVEL", e))?,
                None => LevelFilter::INFO,
            },
        };

        let interval = match options.interval {
            Some(interval) => interval,
            None => {
                let raw = ini
                    .get("TILT", "Interval")
                    .ok_or(ConfigError::Missing("TILT.Interval"))?;
                parse_duration(raw).map_err(|e| invalid("TILT.Interval", e))?
            }
        };

        let mqtt_endpoint = match options.mqtt_ip {
            Some(endpoint) => endpoint,
            None => ini
                .get("MQTT", "Ip")
                .ok_or(ConfigError::Missing("MQTT.Ip"))?
                .parse()
                .map_err(|e: String| invalid("MQTT.Ip", e))?,
        };

        let mqtt_channel = options
            .mqtt_channel
            .or_else(|| ini.get("MQTT", "channel").map(str::to_string))
            .filter(|c| !c.is_empty())
            .ok_or(ConfigError::Missing("MQTT.channel"))?;

        let logging_url = options
            .brewfather_url
            .or_else(|| ini.get("BREWFATHER", "LoggingURL").map(str::to_string))
            .filter(|u| !u.is_empty())
            .ok_or(ConfigError::Missing("BREWFATHER.LoggingURL"))?;

        let mut registry = DeviceRegistry::tilts();
        registry.extend(&options.devices);

        let calibration = calibration_table(ini, &registry)?;

        if options.scan_events == 0 {
            return Err(invalid("--scan-events", "must be at least 1"));
        }

        Ok(Settings {
            log_level,
            interval,
            mqtt_endpoint,
            mqtt_channel,
            logging_url,
            registry,
            calibration,
            hci_device: options.hci_device,
            scan_window: ScanWindow {
                max_events: options.scan_events,
                timeout: options.scan_window,
            },
            sink_timeout: options.sink_timeout,
            client_id: options.client_id,
            sources: ini.sources().to_vec(),
        })
    }
}

/// Built-in corrections, overridden by `[CALIBRATION]` entries.
///
/// Labels match registered devices regardless of case; a label no device
/// carries is rejected, since its correction could never apply.
fn calibration_table(
    ini: &IniLayers,
    registry: &DeviceRegistry,
) -> Result<CalibrationTable, ConfigError> {
    let mut table = CalibrationTable::builtin().map_err(|source| ConfigError::Calibration {
        key: "built-in".into(),
        source,
    })?;

    for (key, value) in ini.entries("CALIBRATION") {
        let full_key = format!("CALIBRATION.{key}");
        let (label, quantity) = key
            .rsplit_once('.')
            .ok_or_else(|| invalid(&full_key, "expected <label>.<temperature|gravity>"))?;
        let quantity: Quantity = quantity.parse().map_err(|e: String| invalid(&full_key, e))?;
        let correction: Correction =
            value
                .parse()
                .map_err(|source| ConfigError::Calibration {
                    key: full_key.clone(),
                    source,
                })?;
        let label = label.trim();
        let label = registry
            .labels()
            .find(|known| known.eq_ignore_ascii_case(label))
            .ok_or_else(|| {
                invalid(&full_key, format!("no registered device is labelled '{label}'"))
            })?;
        table.set(label, quantity, correction);
    }

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::BeaconId;

    const BASE: &str = "\
[LOG]
LEVEL = WARNING

[TILT]
Interval = 900

[MQTT]
Ip = 192.168.1.10
channel = brewing/tilt

[BREWFATHER]
LoggingURL = http://log.example/stream?id=abc
";

    fn layers(files: &[&str]) -> IniLayers {
        let mut layers = IniLayers::default();
        for (i, text) in files.iter().enumerate() {
            let ini = Ini::load_from_str(text).unwrap();
            layers.push(ini, Path::new(&format!("test{i}.ini")));
        }
        layers
    }

    fn options(args: &[&str]) -> Options {
        let mut argv = vec!["tilt-bridge"];
        argv.extend_from_slice(args);
        Options::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_settings_from_ini() {
        let settings = Settings::resolve(options(&[]), &layers(&[BASE])).unwrap();

        assert_eq!(settings.log_level, LevelFilter::WARN);
        assert_eq!(settings.interval, Duration::from_secs(900));
        assert_eq!(settings.mqtt_endpoint.to_string(), "192.168.1.10:1883");
        assert_eq!(settings.mqtt_channel, "brewing/tilt");
        assert_eq!(settings.logging_url, "http://log.example/stream?id=abc");
        assert_eq!(settings.registry.len(), 8);
        assert_eq!(settings.scan_window, ScanWindow::default());
        assert_eq!(settings.sources, vec![PathBuf::from("test0.ini")]);
    }

    #[test]
    fn test_later_files_override_earlier() {
        let local = "[MQTT]\nip = broker.local:1884\n[TILT]\ninterval = 5m\n";
        let settings = Settings::resolve(options(&[]), &layers(&[BASE, local])).unwrap();

        assert_eq!(settings.mqtt_endpoint.host, "broker.local");
        assert_eq!(settings.mqtt_endpoint.port, 1884);
        assert_eq!(settings.interval, Duration::from_secs(300));
        // untouched keys still come from the base file
        assert_eq!(settings.mqtt_channel, "brewing/tilt");
    }

    #[test]
    fn test_command_line_overrides_ini() {
        let opts = options(&[
            "--log-level",
            "debug",
            "--interval",
            "30s",
            "--mqtt-channel",
            "cellar",
            "--device",
            "a495bb90c5b14b44b5121370f02d74de=spare",
        ]);
        let settings = Settings::resolve(opts, &layers(&[BASE])).unwrap();

        assert_eq!(settings.log_level, LevelFilter::DEBUG);
        assert_eq!(settings.interval, Duration::from_secs(30));
        assert_eq!(settings.mqtt_channel, "cellar");

        let spare: BeaconId = "a495bb90c5b14b44b5121370f02d74de".parse().unwrap();
        assert_eq!(settings.registry.lookup(&spare), Some("spare"));
    }

    #[test]
    fn test_missing_required_options() {
        let err = Settings::resolve(options(&[]), &layers(&["[TILT]\nInterval = 10\n"]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("MQTT.Ip")));

        let err = Settings::resolve(options(&[]), &IniLayers::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("TILT.Interval")));
        assert_eq!(err.to_string(), "missing required option TILT.Interval");
    }

    #[test]
    fn test_invalid_values() {
        let err =
            Settings::resolve(options(&[]), &layers(&[BASE, "[LOG]\nLEVEL = LOUD\n"])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "LOG.LEVEL"));

        let err = Settings::resolve(options(&[]), &layers(&[BASE, "[TILT]\nInterval = soon\n"]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "TILT.Interval"));

        let err = Settings::resolve(options(&["--scan-events", "0"]), &layers(&[BASE])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_calibration_section_overrides_builtin() {
        let calibration = "\
[CALIBRATION]
orange.temperature = offset -0.5
red.gravity = 1000:1002,1050:1050
";
        let settings = Settings::resolve(options(&[]), &layers(&[BASE, calibration])).unwrap();
        let table = &settings.calibration;

        assert_eq!(
            table.get("orange", Quantity::Temperature),
            Some(&Correction::Offset(-0.5))
        );
        assert!(table.get("orange", Quantity::Gravity).is_some());
        assert!(table.calibrate_gravity(1050, "red").is_calibrated());
        assert!(!table.calibrate_gravity(1050, "blue").is_calibrated());
    }

    #[test]
    fn test_degenerate_calibration_is_rejected_at_startup() {
        let calibration = "[CALIBRATION]\npurple.gravity = 1000:1000,1000:1074\n";
        let err = Settings::resolve(options(&[]), &layers(&[BASE, calibration])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Calibration {
                source: CalibrationError::Degenerate(_),
                ..
            }
        ));
    }

    #[test]
    fn test_calibration_labels_ignore_case() {
        let calibration = "[CALIBRATION]\nRed.temperature = offset 1\n";
        let settings = Settings::resolve(options(&[]), &layers(&[BASE, calibration])).unwrap();

        let red = settings.calibration.calibrate_temperature(68.0, "red");
        assert_eq!(red.calibrated(), Some(21.0));
    }

    #[test]
    fn test_calibration_for_custom_device() {
        let calibration = "[CALIBRATION]\nspare.gravity = offset 2\n";
        let opts = options(&["--device", "a495bb90c5b14b44b5121370f02d74de=spare"]);
        let settings = Settings::resolve(opts, &layers(&[BASE, calibration])).unwrap();
        assert!(settings.calibration.calibrate_gravity(1000, "spare").is_calibrated());
    }

    #[test]
    fn test_calibration_for_unknown_label_is_rejected() {
        let calibration = "[CALIBRATION]\nmauve.temperature = offset 1\n";
        let err = Settings::resolve(options(&[]), &layers(&[BASE, calibration])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { ref key, .. } if key == "CALIBRATION.mauve.temperature"
        ));
        assert!(err.to_string().contains("no registered device is labelled 'mauve'"));
    }

    #[test]
    fn test_calibration_key_needs_quantity() {
        let calibration = "[CALIBRATION]\norange = offset 1\n";
        let err = Settings::resolve(options(&[]), &layers(&[BASE, calibration])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_load_skips_missing_files() {
        let layers = IniLayers::load(&[PathBuf::from("/nonexistent/tilt2mqtt.ini")]).unwrap();
        assert!(layers.sources().is_empty());
        assert_eq!(layers.get("MQTT", "Ip"), None);
    }

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("DEBUG"), Ok(LevelFilter::DEBUG));
        assert_eq!(parse_log_level("Warning"), Ok(LevelFilter::WARN));
        assert_eq!(parse_log_level("CRITICAL"), Ok(LevelFilter::ERROR));
        assert_eq!(parse_log_level("20"), Ok(LevelFilter::INFO));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(
            parse_duration("1000ms").unwrap(),
            Duration::from_millis(1000)
        );
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_duration_with_whitespace() {
        assert_eq!(parse_duration(" 3s ").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("3 s").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_duration_too_large() {
        assert!(parse_duration("6000000000000000h").is_err());
        assert!(parse_duration("400000000000000000m").is_err());
        assert_eq!(
            parse_duration(&format!("{}s", u64::MAX)).unwrap(),
            Duration::from_secs(u64::MAX)
        );

        let err = Settings::resolve(
            options(&[]),
            &layers(&[BASE, "[TILT]\nInterval = 6000000000000000h\n"]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "TILT.Interval"));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("-1s").is_err());
    }
}
