//! Transports and the configuration-driven factory
//!
//! Each transport module provides one publisher and one subscriber type.
//! [`open_publisher`] and [`open_subscriber`] pick the right pair from a
//! [`ChannelConfig`], so an application can switch transports without
//! touching its control loop:
//!
//! ```no_run
//! use setu::config::SetuConfig;
//! use setu::core::traits::ValueSubscriber;
//! use setu::transport::open_subscriber;
//!
//! let config = SetuConfig::from_file("setu.toml")?;
//! let mut controls = open_subscriber(config.channel("controls")?, (0.0f64, 0.0f64))?;
//! let (steering, throttle) = controls.receive();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod poll;
pub mod tcp_client;
pub mod tcp_server;
pub mod udp;

#[cfg(feature = "mqtt")]
pub mod mqtt;
#[cfg(feature = "zmq")]
pub mod zmq;

use crate::config::{ChannelConfig, TransportConfig};
use crate::core::traits::{ValuePublisher, ValueSubscriber};
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tcp_client::TcpClientValue;
use tcp_server::TcpServeValue;
use udp::{UdpValuePub, UdpValueSub};

#[cfg(feature = "mqtt")]
use self::mqtt::{MqttLink, MqttValuePub, MqttValueSub};
#[cfg(feature = "zmq")]
use self::zmq::{ZmqValuePub, ZmqValueSub};

/// Publisher over any transport
pub enum Publisher {
    Udp(UdpValuePub),
    Tcp(TcpServeValue),
    #[cfg(feature = "zmq")]
    Zmq(ZmqValuePub),
    #[cfg(feature = "mqtt")]
    Mqtt(MqttValuePub),
}

/// Subscriber over any transport
pub enum Subscriber<T> {
    Udp(UdpValueSub<T>),
    Tcp(TcpClientValue<T>),
    #[cfg(feature = "zmq")]
    Zmq(ZmqValueSub<T>),
    #[cfg(feature = "mqtt")]
    Mqtt(MqttValueSub<T>),
}

impl Publisher {
    /// The `kind` of transport behind this publisher
    pub fn kind(&self) -> &'static str {
        match self {
            Publisher::Udp(_) => "udp",
            Publisher::Tcp(_) => "tcp",
            #[cfg(feature = "zmq")]
            Publisher::Zmq(_) => "zmq",
            #[cfg(feature = "mqtt")]
            Publisher::Mqtt(_) => "mqtt",
        }
    }
}

impl ValuePublisher for Publisher {
    fn name(&self) -> &str {
        match self {
            Publisher::Udp(p) => p.name(),
            Publisher::Tcp(p) => p.name(),
            #[cfg(feature = "zmq")]
            Publisher::Zmq(p) => p.name(),
            #[cfg(feature = "mqtt")]
            Publisher::Mqtt(p) => p.name(),
        }
    }

    fn publish<V: Serialize + ?Sized>(&mut self, value: &V) {
        match self {
            Publisher::Udp(p) => p.publish(value),
            Publisher::Tcp(p) => p.publish(value),
            #[cfg(feature = "zmq")]
            Publisher::Zmq(p) => p.publish(value),
            #[cfg(feature = "mqtt")]
            Publisher::Mqtt(p) => p.publish(value),
        }
    }

    fn close(&mut self) {
        match self {
            Publisher::Udp(p) => p.close(),
            Publisher::Tcp(p) => p.close(),
            #[cfg(feature = "zmq")]
            Publisher::Zmq(p) => p.close(),
            #[cfg(feature = "mqtt")]
            Publisher::Mqtt(p) => p.close(),
        }
    }
}

impl<T> Subscriber<T> {
    /// The `kind` of transport behind this subscriber
    pub fn kind(&self) -> &'static str {
        match self {
            Subscriber::Udp(_) => "udp",
            Subscriber::Tcp(_) => "tcp",
            #[cfg(feature = "zmq")]
            Subscriber::Zmq(_) => "zmq",
            #[cfg(feature = "mqtt")]
            Subscriber::Mqtt(_) => "mqtt",
        }
    }
}

impl<T: DeserializeOwned + Clone + Send + 'static> ValueSubscriber<T> for Subscriber<T> {
    fn name(&self) -> &str {
        match self {
            Subscriber::Udp(s) => s.name(),
            Subscriber::Tcp(s) => s.name(),
            #[cfg(feature = "zmq")]
            Subscriber::Zmq(s) => s.name(),
            #[cfg(feature = "mqtt")]
            Subscriber::Mqtt(s) => s.name(),
        }
    }

    fn receive(&mut self) -> T {
        match self {
            Subscriber::Udp(s) => s.receive(),
            Subscriber::Tcp(s) => s.receive(),
            #[cfg(feature = "zmq")]
            Subscriber::Zmq(s) => s.receive(),
            #[cfg(feature = "mqtt")]
            Subscriber::Mqtt(s) => s.receive(),
        }
    }

    fn receive_latest(&self) -> T {
        match self {
            Subscriber::Udp(s) => s.receive_latest(),
            Subscriber::Tcp(s) => s.receive_latest(),
            #[cfg(feature = "zmq")]
            Subscriber::Zmq(s) => s.receive_latest(),
            #[cfg(feature = "mqtt")]
            Subscriber::Mqtt(s) => s.receive_latest(),
        }
    }

    fn close(&mut self) {
        match self {
            Subscriber::Udp(s) => s.close(),
            Subscriber::Tcp(s) => s.close(),
            #[cfg(feature = "zmq")]
            Subscriber::Zmq(s) => s.close(),
            #[cfg(feature = "mqtt")]
            Subscriber::Mqtt(s) => s.close(),
        }
    }
}

/// Create the publishing end of a channel
pub fn open_publisher(channel: &ChannelConfig) -> Result<Publisher> {
    let name = channel.name.as_str();
    let codec = channel.codec();

    match &channel.transport {
        TransportConfig::Udp { port, target } => {
            let target = target.unwrap_or(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::BROADCAST,
                *port,
            )));
            let publisher = UdpValuePub::with_target(name, target)?.with_codec(codec);
            Ok(Publisher::Udp(publisher))
        }
        TransportConfig::Tcp { port, .. } => {
            let publisher = TcpServeValue::new(name, *port)?.with_codec(codec);
            Ok(Publisher::Tcp(publisher))
        }
        #[cfg(feature = "zmq")]
        TransportConfig::Zmq { port, hwm, .. } => {
            let endpoint = format!("tcp://*:{}", port);
            let publisher = ZmqValuePub::bind(name, &endpoint, *hwm)?.with_codec(codec);
            Ok(Publisher::Zmq(publisher))
        }
        #[cfg(feature = "mqtt")]
        TransportConfig::Mqtt { broker } => {
            let publisher = MqttLink::connect(broker)?.publisher(name).with_codec(codec);
            Ok(Publisher::Mqtt(publisher))
        }
        #[allow(unreachable_patterns)]
        other => Err(missing_feature(name, other)),
    }
}

/// Create the subscribing end of a channel
///
/// `default` is returned by `receive()` until the first value arrives (and,
/// for the TCP transport, whenever the server is unreachable).
pub fn open_subscriber<T>(channel: &ChannelConfig, default: T) -> Result<Subscriber<T>>
where
    T: DeserializeOwned + Clone + Send + 'static,
{
    let name = channel.name.as_str();
    let codec = channel.codec();

    match &channel.transport {
        TransportConfig::Udp { port, .. } => {
            let subscriber = UdpValueSub::new(name, *port, default)?.with_codec(codec);
            Ok(Subscriber::Udp(subscriber))
        }
        TransportConfig::Tcp { host, port, client } => {
            let subscriber =
                TcpClientValue::with_config(name, host, *port, default, *client)?.with_codec(codec);
            Ok(Subscriber::Tcp(subscriber))
        }
        #[cfg(feature = "zmq")]
        TransportConfig::Zmq { host, port, .. } => {
            let subscriber = ZmqValueSub::new(name, host, *port, default)?.with_codec(codec);
            Ok(Subscriber::Zmq(subscriber))
        }
        #[cfg(feature = "mqtt")]
        TransportConfig::Mqtt { broker } => {
            let subscriber = MqttLink::connect(broker)?.subscriber_with_codec(name, default, codec)?;
            Ok(Subscriber::Mqtt(subscriber))
        }
        #[allow(unreachable_patterns)]
        other => Err(missing_feature(name, other)),
    }
}

#[allow(dead_code)]
fn missing_feature(name: &str, transport: &TransportConfig) -> Error {
    Error::Config(format!(
        "channel '{}' uses the '{}' transport, but setu was built without the '{}' feature",
        name,
        transport.kind(),
        transport.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::envelope::WireFormat;
    use std::time::{Duration, Instant};

    fn udp_channel(name: &str, port: u16, target: Option<SocketAddr>) -> ChannelConfig {
        ChannelConfig::new(name, TransportConfig::Udp { port, target })
    }

    #[test]
    fn test_udp_through_factory() {
        // Bind the subscriber first on an ephemeral port, then aim at it
        let sub_config = udp_channel("camera", 0, None);
        let mut sub = open_subscriber(&sub_config, String::new()).unwrap();
        assert_eq!(sub.kind(), "udp");
        let addr = match &sub {
            Subscriber::Udp(s) => s.local_addr().unwrap(),
            _ => unreachable!(),
        };
        let target = SocketAddr::from(([127, 0, 0, 1], addr.port()));

        let mut publisher = open_publisher(&udp_channel("camera", addr.port(), Some(target))).unwrap();
        assert_eq!(publisher.kind(), "udp");
        assert_eq!(publisher.name(), "camera");

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut got = String::new();
        while got.is_empty() && Instant::now() < deadline {
            publisher.publish("frame-1");
            got = sub.receive();
        }
        assert_eq!(got, "frame-1");
        assert_eq!(sub.receive_latest(), "frame-1");

        publisher.close();
        sub.close();
    }

    #[test]
    fn test_tcp_through_factory() {
        let mut config = ChannelConfig::new(
            "controls",
            TransportConfig::Tcp {
                host: "127.0.0.1".to_string(),
                port: 0,
                client: Default::default(),
            },
        );
        config.format = WireFormat::Json;

        let mut publisher = open_publisher(&config).unwrap();
        let port = match &publisher {
            Publisher::Tcp(p) => p.local_addr().unwrap().port(),
            _ => unreachable!(),
        };

        if let TransportConfig::Tcp { port: p, .. } = &mut config.transport {
            *p = port;
        }
        let mut sub = open_subscriber(&config, (0.0f64, 0.0f64)).unwrap();
        assert_eq!(sub.kind(), "tcp");

        let deadline = Instant::now() + Duration::from_secs(3);
        let mut got = (0.0, 0.0);
        while got != (0.5, -0.2) && Instant::now() < deadline {
            publisher.publish(&(0.5f64, -0.2f64));
            got = sub.receive();
        }
        assert_eq!(got, (0.5, -0.2));
    }

    #[test]
    fn test_tcp_subscriber_bad_host() {
        let config = ChannelConfig::new(
            "controls",
            TransportConfig::Tcp {
                host: "no such host!".to_string(),
                port: 3233,
                client: Default::default(),
            },
        );
        assert!(matches!(
            open_subscriber(&config, 0u8),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[cfg(feature = "mqtt")]
    #[test]
    fn test_mqtt_unreachable_broker() {
        let config = ChannelConfig::new(
            "donkey/controls",
            TransportConfig::Mqtt {
                broker: "127.0.0.1:1".to_string(),
            },
        );
        assert!(matches!(open_publisher(&config), Err(Error::Mqtt(_))));
        assert!(matches!(open_subscriber(&config, 0u8), Err(Error::Mqtt(_))));
    }

    #[cfg(not(feature = "zmq"))]
    #[test]
    fn test_zmq_without_feature() {
        let config = ChannelConfig::new(
            "lidar",
            TransportConfig::Zmq {
                host: "127.0.0.1".to_string(),
                port: 5556,
                hwm: 10,
            },
        );
        assert!(matches!(open_publisher(&config), Err(Error::Config(_))));
    }
}
