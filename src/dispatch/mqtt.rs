//! MQTT message channel.
//!
//! Readings arrive at most once per device per scan interval, so every publish
//! opens its own connection, waits for the broker's acknowledgement and
//! disconnects again. No session outlives a dispatch.

use super::{DeliveryQos, MessageChannel, PublishOptions, SinkError, SinkFuture};
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::trace;

pub const DEFAULT_MQTT_PORT: u16 = 1883;

const KEEP_ALIVE: Duration = Duration::from_secs(5);
const REQUEST_CHANNEL_CAPACITY: usize = 10;

impl From<rumqttc::ClientError> for SinkError {
    fn from(err: rumqttc::ClientError) -> Self {
        SinkError::Mqtt(err.to_string())
    }
}

impl From<rumqttc::ConnectionError> for SinkError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        SinkError::Mqtt(err.to_string())
    }
}

impl From<DeliveryQos> for QoS {
    fn from(qos: DeliveryQos) -> Self {
        match qos {
            DeliveryQos::AtMostOnce => QoS::AtMostOnce,
            DeliveryQos::AtLeastOnce => QoS::AtLeastOnce,
            DeliveryQos::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// Broker address: `host`, `host:port` or `mqtt://host:port`.
///
/// IPv6 addresses are written `[::1]:1884`; a bare `::1` uses the default port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for MqttEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(port: &str) -> Result<u16, String> {
    port.parse()
        .map_err(|_| format!("invalid MQTT port: {port}"))
}

impl FromStr for MqttEndpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let src = s.trim();
        let src = src
            .strip_prefix("mqtt://")
            .or_else(|| src.strip_prefix("tcp://"))
            .unwrap_or(src)
            .trim_end_matches('/');

        let (host, port) = if let Some(bracketed) = src.strip_prefix('[') {
            let (host, rest) = bracketed
                .split_once(']')
                .ok_or_else(|| format!("unterminated IPv6 address: '{s}'"))?;
            let port = match rest {
                "" => DEFAULT_MQTT_PORT,
                _ => rest
                    .strip_prefix(':')
                    .ok_or_else(|| format!("invalid MQTT endpoint: '{s}'"))
                    .and_then(parse_port)?,
            };
            (host, port)
        } else if src.matches(':').count() > 1 {
            // Bare IPv6 address, no room for a port
            (src, DEFAULT_MQTT_PORT)
        } else {
            match src.rsplit_once(':') {
                Some((host, port)) => (host, parse_port(port)?),
                None => (src, DEFAULT_MQTT_PORT),
            }
        };

        if host.is_empty() || host.trim_start_matches(':').is_empty() {
            return Err(format!("invalid MQTT endpoint: '{s}'"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Publishes through a fresh broker connection per message.
#[derive(Debug, Clone)]
pub struct MqttChannel {
    endpoint: MqttEndpoint,
    client_id: String,
}

impl MqttChannel {
    pub fn new(endpoint: MqttEndpoint, client_id: impl Into<String>) -> Self {
        Self {
            endpoint,
            client_id: client_id.into(),
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options =
            MqttOptions::new(&self.client_id, &self.endpoint.host, self.endpoint.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        options
    }
}

impl MessageChannel for MqttChannel {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            let (client, mut eventloop) =
                AsyncClient::new(self.options(), REQUEST_CHANNEL_CAPACITY);
            let qos = QoS::from(options.qos);
            client.publish(topic, qos, options.retain, payload).await?;

            // Connects on the first poll, then sends the queued publish
            loop {
                match (qos, eventloop.poll().await?) {
                    (QoS::AtMostOnce, Event::Outgoing(Outgoing::Publish(_)))
                    | (QoS::AtLeastOnce, Event::Incoming(Packet::PubAck(_)))
                    | (QoS::ExactlyOnce, Event::Incoming(Packet::PubComp(_))) => break,
                    (_, event) => trace!(?event, "mqtt"),
                }
            }

            client.disconnect().await?;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(event) => trace!(?event, "mqtt"),
                    // The broker may close first; the message is already acknowledged
                    Err(_) => break,
                }
            }

            Ok(())
        })
    }
}
