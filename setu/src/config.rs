//! Channel configuration
//!
//! A deployment describes its channels in one TOML file; each channel names
//! the transport it rides on:
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [[channels]]
//! name = "controls"
//! [channels.transport]
//! kind = "tcp"
//! host = "192.168.1.10"
//! port = 3233
//!
//! [[channels]]
//! name = "camera"
//! format = "json"
//! [channels.transport]
//! kind = "udp"
//! port = 37021
//! ```
//!
//! Publishers and subscribers read the same file; each side only uses the
//! fields it needs (a TCP server ignores `host`, a UDP subscriber ignores
//! `target`).

use crate::error::{Error, Result};
use crate::streaming::envelope::{EnvelopeCodec, WireFormat};
use crate::transport::tcp_client::TcpClientConfig;
use crate::transport::tcp_server::DEFAULT_TCP_PORT;
use crate::transport::udp::{is_broadcast_target, DEFAULT_UDP_PORT};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

/// Default ZeroMQ port, duplicated here so configs parse without the feature
const DEFAULT_ZMQ_PORT: u16 = 5556;
const DEFAULT_ZMQ_HWM: i32 = 10;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SetuConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Default log filter (trace, debug, info, warn, error, or an
    /// `env_logger` directive such as `setu=debug`); `RUST_LOG` overrides it
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// One named channel and the transport carrying it
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChannelConfig {
    /// Channel name, stamped on every envelope (the topic for MQTT)
    pub name: String,
    /// Envelope serialization format; both ends must agree
    #[serde(default)]
    pub format: WireFormat,
    pub transport: TransportConfig,
}

impl ChannelConfig {
    /// Channel over a given transport with the default wire format
    pub fn new(name: &str, transport: TransportConfig) -> Self {
        Self {
            name: name.to_string(),
            format: WireFormat::default(),
            transport,
        }
    }

    /// Envelope codec for this channel
    pub fn codec(&self) -> EnvelopeCodec {
        EnvelopeCodec::new(self.format)
    }
}

/// Transport selection, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Datagram broadcast
    Udp {
        /// Port subscribers listen on and publishers send to
        #[serde(default = "default_udp_port")]
        port: u16,
        /// Publisher destination override (subnet broadcast or unicast);
        /// `255.255.255.255:port` when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<SocketAddr>,
    },
    /// Reliable stream: the publisher serves, subscribers connect
    Tcp {
        /// Server host, used by subscribers
        #[serde(default = "default_host")]
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
        /// Subscriber timing parameters
        #[serde(default)]
        client: TcpClientConfig,
    },
    /// Brokered pub/sub over ZeroMQ
    Zmq {
        /// Publisher host, used by subscribers
        #[serde(default = "default_host")]
        host: String,
        #[serde(default = "default_zmq_port")]
        port: u16,
        /// Publisher send high-water-mark
        #[serde(default = "default_zmq_hwm")]
        hwm: i32,
    },
    /// External MQTT broker
    Mqtt {
        /// `host` or `host:port`
        broker: String,
    },
}

fn default_udp_port() -> u16 {
    DEFAULT_UDP_PORT
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_zmq_port() -> u16 {
    DEFAULT_ZMQ_PORT
}

fn default_zmq_hwm() -> i32 {
    DEFAULT_ZMQ_HWM
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl TransportConfig {
    /// The `kind` tag as written in TOML
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::Udp { .. } => "udp",
            TransportConfig::Tcp { .. } => "tcp",
            TransportConfig::Zmq { .. } => "zmq",
            TransportConfig::Mqtt { .. } => "mqtt",
        }
    }
}

impl SetuConfig {
    /// Load configuration from TOML file
    ///
    /// # Example
    /// ```no_run
    /// use setu::config::SetuConfig;
    ///
    /// let config = SetuConfig::from_file("setu.toml")?;
    /// let controls = config.channel("controls")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: SetuConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Look up a channel by name
    pub fn channel(&self, name: &str) -> Result<&ChannelConfig> {
        self.channels
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::Config(format!("no channel named '{}'", name)))
    }

    /// Reject empty or duplicate channel names, empty broker addresses and
    /// UDP channels that share a port without broadcasting
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let mut udp_ports: HashMap<u16, Vec<&ChannelConfig>> = HashMap::new();
        for channel in &self.channels {
            if channel.name.is_empty() {
                return Err(Error::Config("channel name must not be empty".to_string()));
            }
            if !seen.insert(channel.name.as_str()) {
                return Err(Error::Config(format!(
                    "channel '{}' is defined more than once",
                    channel.name
                )));
            }
            if let TransportConfig::Mqtt { broker } = &channel.transport {
                if broker.trim().is_empty() {
                    return Err(Error::Config(format!(
                        "channel '{}' has an empty MQTT broker address",
                        channel.name
                    )));
                }
            }
            if let TransportConfig::Udp { port, .. } = &channel.transport {
                udp_ports.entry(*port).or_default().push(channel);
            }
        }

        // A unicast datagram reaches only one of the sockets sharing a port
        for (port, channels) in &udp_ports {
            if channels.len() < 2 {
                continue;
            }
            for channel in channels {
                if let TransportConfig::Udp {
                    target: Some(target),
                    ..
                } = &channel.transport
                {
                    if !is_broadcast_target(target) {
                        return Err(Error::Config(format!(
                            "channel '{}' sends unicast to {} but shares UDP port {} with other channels; use a broadcast target or its own port",
                            channel.name, target, port
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Controls over TCP and camera over UDP broadcast, both on localhost
    ///
    /// Suitable for bench testing; a car and its controller should share a
    /// real TOML file.
    pub fn loopback_defaults() -> Self {
        Self {
            logging: LoggingConfig::default(),
            channels: vec![
                ChannelConfig::new(
                    "controls",
                    TransportConfig::Tcp {
                        host: default_host(),
                        port: DEFAULT_TCP_PORT,
                        client: TcpClientConfig::default(),
                    },
                ),
                ChannelConfig::new(
                    "camera",
                    TransportConfig::Udp {
                        port: DEFAULT_UDP_PORT,
                        target: None,
                    },
                ),
            ],
        }
    }
}

impl Default for SetuConfig {
    fn default() -> Self {
        Self::loopback_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = SetuConfig::loopback_defaults();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.channels.len(), 2);

        let controls = config.channel("controls").unwrap();
        assert_eq!(controls.transport.kind(), "tcp");
        assert_eq!(controls.format, WireFormat::MessagePack);

        let camera = config.channel("camera").unwrap();
        assert_eq!(
            camera.transport,
            TransportConfig::Udp {
                port: 37021,
                target: None
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_every_transport_kind_parses() {
        let toml_content = r#"
[logging]
level = "debug"

[[channels]]
name = "camera"
format = "json"
[channels.transport]
kind = "udp"
target = "192.168.1.255:37021"

[[channels]]
name = "controls"
[channels.transport]
kind = "tcp"
host = "donkey.local"
port = 4000
[channels.transport.client]
liveness_timeout = 1500

[[channels]]
name = "lidar"
[channels.transport]
kind = "zmq"
host = "10.0.0.5"
hwm = 4

[[channels]]
name = "donkey/throttle"
[channels.transport]
kind = "mqtt"
broker = "broker.local:1884"
"#;

        let config: SetuConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.channels.len(), 4);

        let camera = config.channel("camera").unwrap();
        assert_eq!(camera.format, WireFormat::Json);
        assert_eq!(
            camera.transport,
            TransportConfig::Udp {
                port: DEFAULT_UDP_PORT,
                target: Some("192.168.1.255:37021".parse().unwrap()),
            }
        );

        match &config.channel("controls").unwrap().transport {
            TransportConfig::Tcp { host, port, client } => {
                assert_eq!(host, "donkey.local");
                assert_eq!(*port, 4000);
                assert_eq!(client.liveness_timeout, Duration::from_millis(1500));
                // Unspecified timings keep their defaults
                assert_eq!(client.connect_timeout, Duration::from_millis(100));
            }
            other => panic!("expected tcp, got {:?}", other),
        }

        assert_eq!(
            config.channel("lidar").unwrap().transport,
            TransportConfig::Zmq {
                host: "10.0.0.5".to_string(),
                port: DEFAULT_ZMQ_PORT,
                hwm: 4,
            }
        );

        assert_eq!(
            config.channel("donkey/throttle").unwrap().transport,
            TransportConfig::Mqtt {
                broker: "broker.local:1884".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let toml_content = r#"
[[channels]]
name = "controls"
[channels.transport]
kind = "carrier-pigeon"
"#;
        assert!(toml::from_str::<SetuConfig>(toml_content).is_err());
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let mut config = SetuConfig::loopback_defaults();
        config.channels.push(config.channels[0].clone());
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = SetuConfig::loopback_defaults();
        config.channels[0].name.clear();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_shared_udp_port_requires_broadcast() {
        let udp = |name: &str, target: Option<&str>| {
            ChannelConfig::new(
                name,
                TransportConfig::Udp {
                    port: 37021,
                    target: target.map(|t| t.parse().unwrap()),
                },
            )
        };

        let mut config = SetuConfig {
            logging: LoggingConfig::default(),
            channels: vec![udp("camera", None), udp("status", Some("192.168.1.255:37021"))],
        };
        assert!(config.validate().is_ok());

        config.channels.push(udp("controls", Some("192.168.1.20:37021")));
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        // Unicast is fine on a port of its own
        config.channels.pop();
        config.channels.push(ChannelConfig::new(
            "controls",
            TransportConfig::Udp {
                port: 37022,
                target: Some("192.168.1.20:37022".parse().unwrap()),
            },
        ));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_channel() {
        let config = SetuConfig::loopback_defaults();
        assert!(matches!(config.channel("lidar"), Err(Error::Config(_))));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("setu.toml");

        let mut config = SetuConfig::loopback_defaults();
        config.channels.push(ChannelConfig::new(
            "status",
            TransportConfig::Mqtt {
                broker: "localhost".to_string(),
            },
        ));
        config.to_file(&path).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[logging]"));
        assert!(contents.contains("kind = \"tcp\""));

        let loaded = SetuConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            SetuConfig::from_file("/nonexistent/setu.toml"),
            Err(Error::Io(_))
        ));
    }
}
