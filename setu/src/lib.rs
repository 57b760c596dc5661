//! Setu - latest-value telemetry and command distribution
//!
//! Moves named values (steering/throttle commands, camera frames, status)
//! between processes on a small robot and its controller. Every channel is
//! last-value-wins: subscribers keep only the most recent value and a
//! `receive()` call never blocks the control loop for more than a few
//! milliseconds.
//!
//! ## Transports
//!
//! - UDP broadcast (`transport::udp`): connectionless, LAN-wide
//! - TCP fan-out (`transport::tcp_server`, `transport::tcp_client`): one
//!   server, many reconnecting clients
//! - ZeroMQ PUB/SUB (`transport::zmq`)
//! - MQTT via an external broker (`transport::mqtt`)
//!
//! ## Features
//!
//! - `zmq` (default): ZeroMQ transport over libzmq
//! - `mqtt` (default): MQTT transport

pub mod config;
pub mod core;
pub mod error;
pub mod streaming;
pub mod transport;

// Re-export commonly used types
pub use config::{ChannelConfig, SetuConfig, TransportConfig};
pub use crate::core::{LatestSlot, ThreadedSubscriber, ValuePublisher, ValueSubscriber};
pub use error::{Error, Result};
pub use transport::{open_publisher, open_subscriber, Publisher, Subscriber};
