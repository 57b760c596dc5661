//! Publisher / subscriber contract shared by every transport

use serde::Serialize;

/// Sending half of a channel
///
/// `publish` is fire-and-forget: transport failures are logged, never
/// returned, so a dead peer cannot stall the control loop.
pub trait ValuePublisher {
    /// Channel name stamped on every envelope
    fn name(&self) -> &str;

    /// Send `value` to whoever is listening right now
    fn publish<T: Serialize + ?Sized>(&mut self, value: &T);

    /// Release sockets and threads. Idempotent; later publishes are no-ops.
    fn close(&mut self);
}

/// Receiving half of a channel
pub trait ValueSubscriber<T> {
    /// Channel name accepted by this subscriber
    fn name(&self) -> &str;

    /// Poll the transport (bounded wait) and return the latest value, or the
    /// default if nothing has arrived yet
    fn receive(&mut self) -> T;

    /// Return the cached value without touching the network
    fn receive_latest(&self) -> T;

    /// Release sockets and threads. Idempotent; later receives return the
    /// cached value.
    fn close(&mut self);
}
