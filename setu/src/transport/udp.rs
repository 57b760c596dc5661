//! Datagram broadcast transport
//!
//! Connectionless and best effort: the publisher fires one datagram per
//! tick at the LAN broadcast address and forgets about it; subscribers keep
//! whatever arrived last.
//!
//! # Delivery Semantics
//!
//! | Situation | Behaviour |
//! |-----------|-----------|
//! | Datagram lost | Subscriber keeps its previous value |
//! | Duplicate / reordered | Accepted as-is, last one read wins |
//! | Foreign channel name | Silently ignored |
//! | Undecodable datagram | Logged at debug, ignored |
//! | Payload > 65507 bytes | Not sent, logged at warn |
//!
//! # Sharing a Port
//!
//! Several subscribers (even several channels) can bind one port on the same
//! host: the socket is bound with `SO_REUSEADDR` and `SO_REUSEPORT`. Only
//! broadcast datagrams reach every one of them. A unicast datagram goes to
//! a single socket in the group, possibly one for another channel, which
//! then drops it as foreign. Channels that share a port must therefore
//! publish to a broadcast address; [`is_broadcast_target`] is the check the
//! configuration applies.

use crate::core::traits::{ValuePublisher, ValueSubscriber};
use crate::error::{Error, Result};
use crate::streaming::envelope::EnvelopeCodec;
use crate::transport::poll::{self, Interest};
use serde::de::DeserializeOwned;
use serde::Serialize;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::fd::AsFd;
use std::time::Duration;

/// Default UDP port for value broadcast
pub const DEFAULT_UDP_PORT: u16 = 37021;

/// Largest payload a single IPv4 UDP datagram can carry
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// Bound on a single send
const SEND_TIMEOUT: Duration = Duration::from_millis(20);

/// Default bound on how long `receive()` waits for the first datagram
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(10);

/// Whether datagrams sent to `target` reach every socket bound to its port
///
/// True for the limited broadcast address, multicast groups and addresses
/// ending in `.255` (directed broadcast on the common /24 and wider
/// subnets, and `127.255.255.255` on loopback).
pub fn is_broadcast_target(target: &SocketAddr) -> bool {
    match target {
        SocketAddr::V4(v4) => {
            let ip = v4.ip();
            ip.is_broadcast() || ip.is_multicast() || ip.octets()[3] == 255
        }
        SocketAddr::V6(v6) => v6.ip().is_multicast(),
    }
}

/// Publishes values as broadcast datagrams
pub struct UdpValuePub {
    name: String,
    socket: Option<UdpSocket>,
    target: SocketAddr,
    codec: EnvelopeCodec,
}

impl UdpValuePub {
    /// Broadcast `name` to `255.255.255.255:port`
    pub fn new(name: &str, port: u16) -> Result<Self> {
        Self::with_target(
            name,
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port)),
        )
    }

    /// Send to an explicit address (subnet broadcast, unicast or loopback)
    pub fn with_target(name: &str, target: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(|source| Error::Bind {
            addr: "0.0.0.0:0".to_string(),
            source,
        })?;
        socket.set_broadcast(true)?;
        socket.set_write_timeout(Some(SEND_TIMEOUT))?;

        log::info!("UDP publisher '{}' sending to {}", name, target);

        Ok(Self {
            name: name.to_string(),
            socket: Some(socket),
            target,
            codec: EnvelopeCodec::default(),
        })
    }

    /// Replace the envelope codec
    pub fn with_codec(mut self, codec: EnvelopeCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Destination of every datagram
    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl ValuePublisher for UdpValuePub {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish<T: Serialize + ?Sized>(&mut self, value: &T) {
        let Some(socket) = self.socket.as_ref() else {
            log::debug!("UDP publisher '{}' is closed, dropping value", self.name);
            return;
        };

        let payload = match self.codec.encode(&self.name, value) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("Failed to encode '{}': {}", self.name, e);
                return;
            }
        };

        if payload.len() > MAX_DATAGRAM_SIZE {
            log::warn!(
                "'{}' envelope is {} bytes, above the {} byte datagram limit; dropped",
                self.name,
                payload.len(),
                MAX_DATAGRAM_SIZE
            );
            return;
        }

        // Fire-and-forget: a lost datagram is just a missed tick
        if let Err(e) = socket.send_to(&payload, self.target) {
            log::debug!("UDP send for '{}' failed: {}", self.name, e);
        }
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            log::info!("UDP publisher '{}' closed", self.name);
        }
    }
}

/// Receives broadcast datagrams and caches the latest matching value
pub struct UdpValueSub<T> {
    name: String,
    socket: Option<UdpSocket>,
    codec: EnvelopeCodec,
    recv_timeout: Duration,
    buffer: Vec<u8>,
    cache: T,
}

impl<T: DeserializeOwned + Clone> UdpValueSub<T> {
    /// Listen on `0.0.0.0:port`
    pub fn new(name: &str, port: u16, default: T) -> Result<Self> {
        Self::bind(
            name,
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)),
            default,
        )
    }

    /// Listen on an explicit local address (port 0 picks an ephemeral port)
    pub fn bind(name: &str, addr: SocketAddr, default: T) -> Result<Self> {
        let socket = reusable_socket(addr).map_err(|source| Error::Bind {
            addr: addr.to_string(),
            source,
        })?;

        log::info!(
            "UDP subscriber '{}' listening on {}",
            name,
            socket.local_addr().unwrap_or(addr)
        );

        Ok(Self {
            name: name.to_string(),
            socket: Some(socket),
            codec: EnvelopeCodec::default(),
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            buffer: vec![0u8; MAX_DATAGRAM_SIZE],
            cache: default,
        })
    }

    /// Replace the envelope codec
    pub fn with_codec(mut self, codec: EnvelopeCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Change how long `receive()` waits when nothing is pending
    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    /// Local address the socket is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Read every datagram queued on the socket, keeping the last match
    fn drain(&mut self) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };

        match poll::wait_one(socket.as_fd(), Interest::READ, self.recv_timeout) {
            Ok(ready) if ready.readable => {}
            Ok(_) => return,
            Err(e) => {
                log::debug!("UDP poll for '{}' failed: {}", self.name, e);
                return;
            }
        }

        loop {
            match socket.recv_from(&mut self.buffer) {
                Ok((len, src)) => {
                    log::trace!("'{}': {} byte datagram from {}", self.name, len, src);
                    if let Some(value) = self.codec.decode_named(&self.name, &self.buffer[..len]) {
                        self.cache = value;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("UDP recv for '{}' failed: {}", self.name, e);
                    break;
                }
            }
        }
    }
}

impl<T: DeserializeOwned + Clone> ValueSubscriber<T> for UdpValueSub<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn receive(&mut self) -> T {
        self.drain();
        self.cache.clone()
    }

    fn receive_latest(&self) -> T {
        self.cache.clone()
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            log::info!("UDP subscriber '{}' closed", self.name);
        }
    }
}

/// Non-blocking datagram socket that tolerates other listeners on the port
fn reusable_socket(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(addr))?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn loopback_sub<T: DeserializeOwned + Clone>(name: &str, default: T) -> UdpValueSub<T> {
        UdpValueSub::bind(name, "127.0.0.1:0".parse().unwrap(), default).unwrap()
    }

    fn publisher_for<T>(name: &str, sub: &UdpValueSub<T>) -> UdpValuePub
    where
        T: DeserializeOwned + Clone,
    {
        UdpValuePub::with_target(name, sub.local_addr().unwrap()).unwrap()
    }

    /// Poll until `want` shows up or two seconds pass
    fn receive_until<T>(sub: &mut UdpValueSub<T>, want: &T) -> T
    where
        T: DeserializeOwned + Clone + PartialEq,
    {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let got = sub.receive();
            if &got == want || Instant::now() > deadline {
                return got;
            }
        }
    }

    #[test]
    fn test_default_before_first_datagram() {
        let mut sub = loopback_sub("controls", (0.0f64, 0.0f64));
        assert_eq!(sub.receive(), (0.0, 0.0));
        assert_eq!(sub.receive_latest(), (0.0, 0.0));
    }

    #[test]
    fn test_publish_and_receive() {
        let mut sub = loopback_sub("controls", (0.0f64, 0.0f64));
        let mut publisher = publisher_for("controls", &sub);

        publisher.publish(&(0.5f64, -0.2f64));
        assert_eq!(receive_until(&mut sub, &(0.5, -0.2)), (0.5, -0.2));

        // Nothing new: the cached value is stable
        for _ in 0..5 {
            assert_eq!(sub.receive(), (0.5, -0.2));
        }
    }

    #[test]
    fn test_foreign_name_is_ignored() {
        let mut sub = loopback_sub("a", 0u32);
        let mut other = publisher_for("b", &sub);
        let mut own = publisher_for("a", &sub);

        other.publish(&99u32);
        own.publish(&7u32);
        other.publish(&100u32);

        assert_eq!(receive_until(&mut sub, &7), 7);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(sub.receive(), 7);
    }

    #[test]
    fn test_garbage_datagram_keeps_cache() {
        let mut sub = loopback_sub("controls", (1.0f64, 1.0f64));
        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.send_to(b"\x00\x01garbage", sub.local_addr().unwrap())
            .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(sub.receive(), (1.0, 1.0));
    }

    #[test]
    fn test_receive_is_bounded_without_publisher() {
        let mut sub =
            loopback_sub("controls", 0u8).with_recv_timeout(Duration::from_millis(5));
        let start = Instant::now();
        for _ in 0..10 {
            sub.receive();
        }
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_oversized_payload_is_dropped() {
        let mut sub = loopback_sub("blob", Vec::<u8>::new());
        let mut publisher = publisher_for("blob", &sub);

        // Incompressible bytes so zstd cannot bring it under the limit
        let mut state = 0x2545_f491_u32;
        let blob: Vec<u8> = (0..200_000)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();
        publisher.publish(&blob);

        std::thread::sleep(Duration::from_millis(20));
        assert!(sub.receive().is_empty());
    }

    #[test]
    fn test_broadcast_targets() {
        let yes = ["255.255.255.255:37021", "192.168.1.255:37021", "127.255.255.255:1", "239.0.0.1:5000"];
        for addr in yes {
            assert!(is_broadcast_target(&addr.parse().unwrap()), "{}", addr);
        }
        let no = ["127.0.0.1:37021", "192.168.1.20:37021", "[::1]:37021"];
        for addr in no {
            assert!(!is_broadcast_target(&addr.parse().unwrap()), "{}", addr);
        }
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut sub = loopback_sub("controls", 3u8);
        let mut publisher = publisher_for("controls", &sub);

        publisher.close();
        publisher.close();
        publisher.publish(&4u8);

        sub.close();
        sub.close();
        assert_eq!(sub.receive(), 3);
        assert!(sub.local_addr().is_none());
    }
}
