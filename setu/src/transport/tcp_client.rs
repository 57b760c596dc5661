//! Reliable stream transport: subscribing client
//!
//! # Connection Lifecycle
//!
//! ```text
//!            connect ok
//!  ┌──────────────┐ ───────────► ┌───────────┐
//!  │ Disconnected │              │ Connected │
//!  └──────────────┘ ◄─────────── └───────────┘
//!     ▲      │     error / EOF / hang-up /
//!     └──────┘     silence > liveness timeout
//!   refused: wait backoff, return default
//! ```
//!
//! Reconnection is lazy: it happens inside the next `receive()` call once
//! the backoff has elapsed, never on a background thread. While
//! disconnected `receive()` returns the default value, so a control loop
//! falls back to its neutral command when the server goes away.
//!
//! # Framing
//!
//! Frames are length-prefixed (see [`crate::streaming::framing`]). A read
//! that ends mid-frame keeps the partial bytes for the next call; two frames
//! arriving in one read are both decoded and the later one wins.

use crate::core::traits::ValueSubscriber;
use crate::error::{Error, Result};
use crate::streaming::envelope::EnvelopeCodec;
use crate::streaming::framing::FrameReader;
use crate::transport::poll::{self, Interest};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::AsFd;
use std::time::{Duration, Instant};

/// Size of one non-blocking read
const READ_CHUNK: usize = 64 * 1024;

/// Client timing parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpClientConfig {
    /// Bound on a single connect attempt
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Bound on the readiness check in each `receive()`
    #[serde(with = "millis")]
    pub poll_timeout: Duration,
    /// Upper bound on finishing a partially received frame within one call
    #[serde(with = "millis")]
    pub drain_timeout: Duration,
    /// Silence after which the server is presumed dead
    #[serde(with = "millis")]
    pub liveness_timeout: Duration,
    /// Minimum gap between connect attempts
    #[serde(with = "millis")]
    pub reconnect_backoff: Duration,
}

impl Default for TcpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(100),
            poll_timeout: Duration::from_millis(10),
            drain_timeout: Duration::from_millis(50),
            liveness_timeout: Duration::from_secs(3),
            reconnect_backoff: Duration::from_millis(500),
        }
    }
}

/// Connection state as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket; next `receive()` may try to connect
    Disconnected,
    /// Socket open and considered alive
    Connected,
}

struct Connection {
    stream: TcpStream,
    last_read: Instant,
}

/// What one drain pass observed
enum DrainOutcome {
    /// Connection still healthy
    Open,
    /// Connection must be torn down
    Dead(String),
}

/// Subscribes to a [`TcpServeValue`](crate::transport::tcp_server::TcpServeValue)
pub struct TcpClientValue<T> {
    name: String,
    addr: SocketAddr,
    config: TcpClientConfig,
    codec: EnvelopeCodec,
    connection: Option<Connection>,
    last_attempt: Option<Instant>,
    reader: FrameReader,
    chunk: Vec<u8>,
    default: T,
    cache: T,
    closed: bool,
}

impl<T: DeserializeOwned + Clone> TcpClientValue<T> {
    /// Subscribe to `name` served at `host:port`
    ///
    /// Only address resolution can fail here; the server does not need to
    /// be up yet.
    pub fn new(name: &str, host: &str, port: u16, default: T) -> Result<Self> {
        Self::with_config(name, host, port, default, TcpClientConfig::default())
    }

    /// Same as [`new`](Self::new) with explicit timing parameters
    pub fn with_config(
        name: &str,
        host: &str,
        port: u16,
        default: T,
        config: TcpClientConfig,
    ) -> Result<Self> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::InvalidAddress(format!("{}:{}: {}", host, port, e)))?
            .next()
            .ok_or_else(|| Error::InvalidAddress(format!("{}:{}", host, port)))?;

        Ok(Self {
            name: name.to_string(),
            addr,
            config,
            codec: EnvelopeCodec::default(),
            connection: None,
            last_attempt: None,
            reader: FrameReader::new(),
            chunk: vec![0u8; READ_CHUNK],
            cache: default.clone(),
            default,
            closed: false,
        })
    }

    /// Replace the envelope codec
    pub fn with_codec(mut self, codec: EnvelopeCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        if self.connection.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Shorthand for `state() == Connected`
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Server address
    pub fn server_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Try to connect unless the backoff window is still open
    fn try_connect(&mut self) {
        if let Some(at) = self.last_attempt {
            if at.elapsed() < self.config.reconnect_backoff {
                return;
            }
        }

        match TcpStream::connect_timeout(&self.addr, self.config.connect_timeout) {
            Ok(stream) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    log::warn!("Failed to set non-blocking mode for '{}': {}", self.name, e);
                    self.last_attempt = Some(Instant::now());
                    return;
                }
                let _ = stream.set_nodelay(true);

                log::info!("Connected to {} for '{}'", self.addr, self.name);
                self.reader.clear();
                self.last_attempt = None;
                self.connection = Some(Connection {
                    stream,
                    last_read: Instant::now(),
                });
            }
            Err(e) => {
                if self.last_attempt.is_none() {
                    log::info!("Server {} for '{}' unavailable: {}", self.addr, self.name, e);
                } else {
                    log::trace!("Reconnect to {} failed: {}", self.addr, e);
                }
                self.last_attempt = Some(Instant::now());
            }
        }
    }

    /// Close the socket and fall back to the default value
    fn disconnect(&mut self, reason: &str) {
        if self.connection.take().is_some() {
            log::info!("Disconnected from {} for '{}': {}", self.addr, self.name, reason);
        }
        self.reader.clear();
        self.cache = self.default.clone();
        // Retry on the very next call; only refused attempts back off
        self.last_attempt = None;
    }

    /// Pull everything currently readable into the frame reader
    fn drain(&mut self) -> DrainOutcome {
        let Some(conn) = self.connection.as_mut() else {
            return DrainOutcome::Dead("not connected".to_string());
        };

        let deadline = Instant::now() + self.config.drain_timeout;
        let mut wait = self.config.poll_timeout;

        loop {
            let ready = match poll::wait_one(conn.stream.as_fd(), Interest::READ, wait) {
                Ok(r) => r,
                Err(e) => return DrainOutcome::Dead(e.to_string()),
            };

            if ready.readable {
                // Read until the socket would block
                loop {
                    match conn.stream.read(&mut self.chunk) {
                        Ok(0) => return DrainOutcome::Dead("closed by server".to_string()),
                        Ok(n) => {
                            self.reader.extend(&self.chunk[..n]);
                            conn.last_read = Instant::now();
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => return DrainOutcome::Dead(e.to_string()),
                    }
                }
            } else if ready.error {
                return DrainOutcome::Dead("socket error or hang-up".to_string());
            }

            // Keep waiting only for the tail of a frame that has started
            let now = Instant::now();
            if !self.reader.has_partial() || now >= deadline {
                return DrainOutcome::Open;
            }
            wait = (deadline - now).min(self.config.poll_timeout);
        }
    }

    /// Decode every complete frame, keeping the last matching value
    fn consume_frames(&mut self) -> Result<()> {
        while let Some(frame) = self.reader.next_frame()? {
            if let Some(value) = self.codec.decode_named(&self.name, &frame) {
                self.cache = value;
            }
        }
        Ok(())
    }
}

impl<T: DeserializeOwned + Clone> ValueSubscriber<T> for TcpClientValue<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn receive(&mut self) -> T {
        if self.closed {
            return self.cache.clone();
        }

        if self.connection.is_none() {
            self.try_connect();
            if self.connection.is_none() {
                return self.default.clone();
            }
        }

        if let Some(conn) = self.connection.as_ref() {
            if conn.last_read.elapsed() > self.config.liveness_timeout {
                self.disconnect("liveness timeout");
                return self.default.clone();
            }
        }

        if let DrainOutcome::Dead(reason) = self.drain() {
            self.disconnect(&reason);
            return self.default.clone();
        }

        // An oversized prefix means the stream position is lost
        if let Err(e) = self.consume_frames() {
            self.disconnect(&e.to_string());
            return self.default.clone();
        }

        self.cache.clone()
    }

    fn receive_latest(&self) -> T {
        self.cache.clone()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Some(conn) = self.connection.take() {
                let _ = conn.stream.shutdown(std::net::Shutdown::Both);
            }
            log::info!("TCP client for '{}' closed", self.name);
        }
    }
}

/// Durations as integer milliseconds in config files
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
