//! Reliable stream transport: fan-out server
//!
//! Serves one latest-value channel to any number of TCP clients. All work
//! happens inside `publish()`, on the caller's thread, bounded by the poll
//! timeout:
//!
//! ```text
//! 1. poll({listener} ∪ peers)           bounded wait
//! 2. drop peers reporting error / EOF   POLLERR, POLLHUP, read() == 0
//! 3. write frame to each writable peer  non-blocking, failure drops only that peer
//! 4. drop peers past the frame deadline a started frame is still unsent
//! 5. accept pending connections         they join from the next tick
//! ```
//!
//! Peers are non-blocking, so no write ever waits. When a socket takes only
//! part of a frame, the unsent tail becomes that peer's backlog: later ticks
//! flush it before anything new, and frames published meanwhile are skipped
//! for that peer. A peer that cannot take a whole frame within
//! [`FRAME_DEADLINE`] is dropped; the stream would stay mid-frame otherwise.
//!
//! A peer that is not writable this tick simply misses this value; the next
//! tick overwrites it anyway.

use crate::core::traits::ValuePublisher;
use crate::error::{Error, Result};
use crate::streaming::envelope::EnvelopeCodec;
use crate::streaming::framing::write_frame;
use crate::transport::poll::{self, Interest};
use serde::Serialize;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::AsFd;
use std::time::{Duration, Instant};

/// Default TCP port for value serving
pub const DEFAULT_TCP_PORT: u16 = 3233;

/// Default bound on the readiness check inside `publish()`
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Time a peer has to take the rest of a partially written frame
pub const FRAME_DEADLINE: Duration = Duration::from_millis(500);

/// One connected client and the unsent tail of its current frame
struct Peer {
    stream: TcpStream,
    backlog: Vec<u8>,
    sent: usize,
    backlog_since: Option<Instant>,
}

impl Peer {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            backlog: Vec::new(),
            sent: 0,
            backlog_since: None,
        }
    }

    fn is_backlogged(&self) -> bool {
        self.sent < self.backlog.len()
    }

    /// Flush the backlog, then `frame` if the backlog cleared. Never blocks;
    /// an error means the peer is gone.
    fn send(&mut self, frame: &[u8], now: Instant) -> io::Result<()> {
        if self.is_backlogged() {
            self.sent += write_nonblocking(&mut self.stream, &self.backlog[self.sent..])?;
            if self.is_backlogged() {
                return Ok(());
            }
            self.backlog.clear();
            self.sent = 0;
            self.backlog_since = None;
        }

        let written = write_nonblocking(&mut self.stream, frame)?;
        if written < frame.len() {
            self.backlog.extend_from_slice(&frame[written..]);
            self.backlog_since = Some(now);
        }
        Ok(())
    }

    /// A started frame has been pending longer than [`FRAME_DEADLINE`]
    fn is_overdue(&self, now: Instant) -> bool {
        self.backlog_since
            .is_some_and(|since| now.duration_since(since) > FRAME_DEADLINE)
    }
}

/// Serves the latest value to every connected client
pub struct TcpServeValue {
    name: String,
    listener: Option<TcpListener>,
    peers: Vec<Peer>,
    codec: EnvelopeCodec,
    poll_timeout: Duration,
    /// Reusable frame buffer (avoids allocation per tick)
    frame: Vec<u8>,
    published: u64,
}

impl TcpServeValue {
    /// Listen on `0.0.0.0:port`
    pub fn new(name: &str, port: u16) -> Result<Self> {
        Self::bind(name, ("0.0.0.0", port))
    }

    /// Listen on an explicit address (port 0 picks an ephemeral port)
    pub fn bind<A: ToSocketAddrs + std::fmt::Debug>(name: &str, addr: A) -> Result<Self> {
        let listener = TcpListener::bind(&addr).map_err(|source| Error::Bind {
            addr: format!("{:?}", addr),
            source,
        })?;
        listener.set_nonblocking(true)?;

        log::info!(
            "TCP server for '{}' listening on {}",
            name,
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| format!("{:?}", addr))
        );

        Ok(Self {
            name: name.to_string(),
            listener: Some(listener),
            peers: Vec::new(),
            codec: EnvelopeCodec::default(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            frame: Vec::with_capacity(4096),
            published: 0,
        })
    }

    /// Replace the envelope codec
    pub fn with_codec(mut self, codec: EnvelopeCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Change the readiness bound used by `publish()`
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Number of currently connected peers
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Number of publish calls that produced a frame
    pub fn published(&self) -> u64 {
        self.published
    }

    /// One multiplexed fan-out cycle for the frame already in `self.frame`
    fn fan_out(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };

        let mut fds = Vec::with_capacity(self.peers.len() + 1);
        fds.push((listener.as_fd(), Interest::READ));
        fds.extend(self.peers.iter().map(|p| (p.stream.as_fd(), Interest::READ_WRITE)));

        let ready = match poll::wait_many(&fds, self.poll_timeout) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("Poll failed for '{}': {}", self.name, e);
                return;
            }
        };
        drop(fds);

        let listener_ready = ready[0];
        let frame = &self.frame;
        let name = &self.name;
        let mut scratch = [0u8; 256];
        let now = Instant::now();

        let mut index = 0;
        self.peers.retain_mut(|peer| {
            let state = ready[1 + index];
            index += 1;

            if state.error {
                log_departure(name, &peer.stream, "socket error or hang-up");
                return false;
            }

            // Clients never send; readable means EOF or stray bytes
            if state.readable {
                match peer.stream.read(&mut scratch) {
                    Ok(0) => {
                        log_departure(name, &peer.stream, "closed by peer");
                        return false;
                    }
                    Ok(n) => log::trace!("'{}': discarding {} unexpected bytes", name, n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        log_departure(name, &peer.stream, &e.to_string());
                        return false;
                    }
                }
            }

            if state.writable {
                if let Err(e) = peer.send(frame, now) {
                    log_departure(name, &peer.stream, &e.to_string());
                    return false;
                }
            }

            if peer.is_overdue(now) {
                log_departure(name, &peer.stream, "frame not taken in time");
                return false;
            }
            true
        });

        if listener_ready.readable {
            self.accept_pending();
        }
    }

    /// Accept every queued connection
    fn accept_pending(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };

        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = configure_peer(&stream) {
                        log::warn!("Failed to configure client {} for '{}': {}", addr, self.name, e);
                        continue;
                    }
                    log::info!("Client {} subscribed to '{}'", addr, self.name);
                    self.peers.push(Peer::new(stream));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("Error accepting client for '{}': {}", self.name, e);
                    break;
                }
            }
        }
    }
}

impl ValuePublisher for TcpServeValue {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish<T: Serialize + ?Sized>(&mut self, value: &T) {
        if self.listener.is_none() {
            log::debug!("TCP server '{}' is closed, dropping value", self.name);
            return;
        }

        let payload = match self.codec.encode(&self.name, value) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("Failed to encode '{}': {}", self.name, e);
                return;
            }
        };
        if let Err(e) = write_frame(&payload, &mut self.frame) {
            log::warn!("Failed to frame '{}': {}", self.name, e);
            return;
        }

        self.fan_out();
        self.published += 1;
    }

    fn close(&mut self) {
        if self.listener.take().is_some() {
            for peer in self.peers.drain(..) {
                let _ = peer.stream.shutdown(std::net::Shutdown::Both);
            }
            log::info!("TCP server for '{}' closed", self.name);
        }
    }
}

impl Drop for TcpServeValue {
    fn drop(&mut self) {
        self.close();
    }
}

fn configure_peer(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;
    Ok(())
}

/// Write as much of `bytes` as the socket takes right now
fn write_nonblocking(stream: &mut TcpStream, bytes: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < bytes.len() {
        match stream.write(&bytes[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

fn log_departure(name: &str, peer: &TcpStream, reason: &str) {
    match peer.peer_addr() {
        Ok(addr) => log::info!("Client {} left '{}': {}", addr, name, reason),
        Err(_) => log::info!("Client left '{}': {}", name, reason),
    }
}
