//! Dispatch of finished readings to the outside world.
//!
//! Every reading goes to two independent sinks: an MQTT topic and a remote
//! brewing log. A failure in one sink is logged and never stops the other, nor
//! the monitor loop.

pub mod brewfather;
pub mod mqtt;

use crate::reading::{DispatchEnvelope, Reading};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Gravities above this are almost certainly a bad reading or a bad curve.
pub const GRAVITY_SANITY_LIMIT: f64 = 1.2;

/// Default upper bound for a single sink call.
pub const DEFAULT_SINK_TIMEOUT: Duration = Duration::from_secs(10);

/// A failed call to one sink.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("MQTT error: {0}")]
    Mqtt(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("{sink} did not answer within {after:?}")]
    Timeout { sink: &'static str, after: Duration },
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Future returned by sink clients.
pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SinkError>> + Send + 'a>>;

/// Delivery guarantee requested from the message channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryQos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// How a message is handed to the message channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    pub qos: DeliveryQos,
    /// Ask the broker to keep the message for future subscribers
    pub retain: bool,
}

impl PublishOptions {
    /// Readings go out at least once and stay retained on their topic.
    pub const READING: Self = Self {
        qos: DeliveryQos::AtLeastOnce,
        retain: true,
    };
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self::READING
    }
}

/// Publish/subscribe message channel.
pub trait MessageChannel: Send + Sync {
    /// Publish `payload` to `topic` with the requested delivery options.
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> SinkFuture<'a, ()>;
}

/// One submission to the remote log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub name: String,
    pub temp: f64,
    pub temp_unit: &'static str,
    pub gravity: f64,
    pub gravity_unit: &'static str,
}

impl LogRecord {
    /// Temperature in Celsius, gravity as a ratio (1.050).
    pub fn new(name: impl Into<String>, temp: f64, gravity: f64) -> Self {
        Self {
            name: name.into(),
            temp,
            temp_unit: "C",
            gravity,
            gravity_unit: "G",
        }
    }
}

/// What the remote log answered.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubmitResponse {
    pub result: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SubmitResponse {
    pub fn is_ignored(&self) -> bool {
        self.result.eq_ignore_ascii_case("ignored")
    }

    pub fn is_success(&self) -> bool {
        matches!(self.result.to_lowercase().as_str(), "success" | "ok")
    }
}

/// Request/response remote logging endpoint.
pub trait RemoteLogger: Send + Sync {
    fn submit<'a>(&'a self, record: &'a LogRecord) -> SinkFuture<'a, SubmitResponse>;
}

/// Receives each reading produced by the monitor loop.
pub trait Dispatcher: Send {
    fn dispatch(&mut self, reading: Reading) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Fans a reading out to the message channel and the remote log.
pub struct SinkDispatcher<C, L> {
    channel: C,
    logger: L,
    topic_prefix: String,
    publish_options: PublishOptions,
    sink_timeout: Duration,
}

impl<C: MessageChannel, L: RemoteLogger> SinkDispatcher<C, L> {
    /// # Arguments
    /// * `topic_prefix` - readings are published to `<topic_prefix>/<label>`
    pub fn new(channel: C, logger: L, topic_prefix: impl Into<String>) -> Self {
        Self {
            channel,
            logger,
            topic_prefix: topic_prefix.into(),
            publish_options: PublishOptions::READING,
            sink_timeout: DEFAULT_SINK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, sink_timeout: Duration) -> Self {
        self.sink_timeout = sink_timeout;
        self
    }

    pub fn with_publish_options(mut self, options: PublishOptions) -> Self {
        self.publish_options = options;
        self
    }

    pub fn topic(&self, label: &str) -> String {
        format!("{}/{}", self.topic_prefix.trim_end_matches('/'), label)
    }

    async fn publish(&self, envelope: &DispatchEnvelope) -> Result<(), SinkError> {
        let topic = self.topic(&envelope.reading.label);
        let payload = envelope.to_json()?;

        let publish = self.channel.publish(&topic, payload, self.publish_options);
        timeout(self.sink_timeout, publish)
            .await
            .map_err(|_| SinkError::Timeout {
                sink: "MQTT broker",
                after: self.sink_timeout,
            })??;

        debug!(%topic, "published");
        Ok(())
    }

    async fn log_remotely(&self, reading: &Reading) -> Result<SubmitResponse, SinkError> {
        let gravity = reading.gravity_calibrated.value() / 1000.0;
        let temperature = reading.temperature_calibrated.value();

        if gravity > GRAVITY_SANITY_LIMIT {
            warn!(
                label = %reading.label,
                gravity,
                "gravity above {GRAVITY_SANITY_LIMIT}, check the device or its calibration"
            );
        }

        let record = LogRecord::new(&reading.label, temperature, gravity);
        let response = timeout(self.sink_timeout, self.logger.submit(&record))
            .await
            .map_err(|_| SinkError::Timeout {
                sink: "remote log",
                after: self.sink_timeout,
            })??;

        debug!(?record, result = %response.result, "submitted to remote log");
        if response.is_ignored() {
            warn!(label = %reading.label, "remote log ignored the submission");
        } else if !response.is_success() {
            warn!(label = %reading.label, result = %response.result, "unexpected remote log result");
        }
        Ok(response)
    }
}

impl<C: MessageChannel, L: RemoteLogger> Dispatcher for SinkDispatcher<C, L> {
    fn dispatch(&mut self, reading: Reading) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let envelope = DispatchEnvelope::new(reading);
            let label = envelope.reading.label.clone();

            if let Err(e) = self.publish(&envelope).await {
                error!(%label, "publish failed: {e}");
            }

            if let Err(e) = self.log_remotely(&envelope.reading).await {
                error!(%label, "remote logging failed: {e}");
            }
        })
    }
}
