//! Brokered pub/sub transport over ZeroMQ
//!
//! The publisher binds a PUB socket with a small send high-water-mark; once
//! that many messages are queued for a slow subscriber, libzmq drops new
//! ones. For a live camera or control feed a fresh value beats a complete
//! history.
//!
//! Subscribers connect a SUB socket subscribed to every message. Topic
//! filtering stays at the envelope level (the `name` field), the same as
//! the UDP transport, so one PUB port can carry several channels.

use crate::core::traits::{ValuePublisher, ValueSubscriber};
use crate::error::Result;
use crate::streaming::envelope::EnvelopeCodec;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Default ZeroMQ port for value publishing
pub const DEFAULT_ZMQ_PORT: u16 = 5556;

/// Default send high-water-mark (messages)
pub const DEFAULT_HWM: i32 = 10;

/// Publishes values on a ZeroMQ PUB socket
pub struct ZmqValuePub {
    name: String,
    socket: Option<zmq::Socket>,
    endpoint: String,
    codec: EnvelopeCodec,
    dropped: u64,
    // Keeps the I/O threads alive for as long as the socket exists
    _context: zmq::Context,
}

impl ZmqValuePub {
    /// Bind `tcp://*:port` with the default high-water-mark
    pub fn new(name: &str, port: u16) -> Result<Self> {
        Self::bind(name, &format!("tcp://*:{}", port), DEFAULT_HWM)
    }

    /// Bind any ZeroMQ endpoint (`tcp://127.0.0.1:*` picks an ephemeral port)
    pub fn bind(name: &str, endpoint: &str, hwm: i32) -> Result<Self> {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::PUB)?;
        socket.set_sndhwm(hwm)?;
        socket.set_linger(0)?;
        socket.bind(endpoint)?;

        let endpoint = socket
            .get_last_endpoint()?
            .unwrap_or_else(|_| endpoint.to_string());

        log::info!(
            "ZeroMQ publisher '{}' bound to {} (hwm {})",
            name,
            endpoint,
            hwm
        );

        Ok(Self {
            name: name.to_string(),
            socket: Some(socket),
            endpoint,
            codec: EnvelopeCodec::default(),
            dropped: 0,
            _context: context,
        })
    }

    /// Replace the envelope codec
    pub fn with_codec(mut self, codec: EnvelopeCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Endpoint actually bound (ephemeral ports resolved)
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Messages dropped because the outbound queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl ValuePublisher for ZmqValuePub {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish<T: Serialize + ?Sized>(&mut self, value: &T) {
        let Some(socket) = self.socket.as_ref() else {
            log::debug!("ZeroMQ publisher '{}' is closed, dropping value", self.name);
            return;
        };

        let payload = match self.codec.encode(&self.name, value) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("Failed to encode '{}': {}", self.name, e);
                return;
            }
        };

        match socket.send(payload, zmq::DONTWAIT) {
            Ok(()) => {}
            Err(zmq::Error::EAGAIN) => {
                self.dropped += 1;
                if self.dropped % 100 == 1 {
                    log::warn!(
                        "ZeroMQ queue full for '{}' ({} dropped so far)",
                        self.name,
                        self.dropped
                    );
                }
            }
            Err(e) => log::debug!("ZeroMQ send for '{}' failed: {}", self.name, e),
        }
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            log::info!("ZeroMQ publisher '{}' closed", self.name);
        }
    }
}

/// Receives values from a ZeroMQ PUB socket
pub struct ZmqValueSub<T> {
    name: String,
    socket: Option<zmq::Socket>,
    codec: EnvelopeCodec,
    cache: T,
    _context: zmq::Context,
}

impl<T: DeserializeOwned + Clone> ZmqValueSub<T> {
    /// Connect to `tcp://host:port`
    pub fn new(name: &str, host: &str, port: u16, default: T) -> Result<Self> {
        Self::connect(name, &format!("tcp://{}:{}", host, port), default)
    }

    /// Connect to any ZeroMQ endpoint
    ///
    /// ZeroMQ connects in the background, so this succeeds even when the
    /// publisher is not up yet.
    pub fn connect(name: &str, endpoint: &str, default: T) -> Result<Self> {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::SUB)?;
        socket.set_linger(0)?;
        socket.connect(endpoint)?;
        socket.set_subscribe(b"")?;

        log::info!("ZeroMQ subscriber '{}' connected to {}", name, endpoint);

        Ok(Self {
            name: name.to_string(),
            socket: Some(socket),
            codec: EnvelopeCodec::default(),
            cache: default,
            _context: context,
        })
    }

    /// Replace the envelope codec
    pub fn with_codec(mut self, codec: EnvelopeCodec) -> Self {
        self.codec = codec;
        self
    }
}

impl<T: DeserializeOwned + Clone> ValueSubscriber<T> for ZmqValueSub<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn receive(&mut self) -> T {
        let Some(socket) = self.socket.as_ref() else {
            return self.cache.clone();
        };

        // Drain everything queued; the newest matching envelope wins
        loop {
            match socket.recv_bytes(zmq::DONTWAIT) {
                Ok(bytes) => {
                    if let Some(value) = self.codec.decode_named(&self.name, &bytes) {
                        self.cache = value;
                    }
                }
                Err(zmq::Error::EAGAIN) => break,
                Err(zmq::Error::EINTR) => continue,
                Err(e) => {
                    log::debug!("ZeroMQ recv for '{}' failed: {}", self.name, e);
                    break;
                }
            }
        }

        self.cache.clone()
    }

    fn receive_latest(&self) -> T {
        self.cache.clone()
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            log::info!("ZeroMQ subscriber '{}' closed", self.name);
        }
    }
}
