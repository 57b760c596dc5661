//! Topic-routed transport over an external MQTT broker
//!
//! The broker does delivery and fan-out; the client library does
//! reconnection. This module only maps channels onto topics and keeps the
//! latest value per subscriber.
//!
//! # Shared Connection
//!
//! [`MqttLink`] owns one broker connection and its network thread. It is
//! handed around as `Arc<MqttLink>`: every publisher and subscriber created
//! from a link holds a reference, and the connection shuts down when the
//! last one is dropped.
//!
//! ```text
//!   control loop                    setu-mqtt thread
//!   ────────────                    ────────────────
//!   MqttValuePub::publish ──► Client ──► broker ──► Connection
//!                                                      │ Publish{topic}
//!                                                      ▼
//!   MqttValueSub::receive ◄── LatestSlot ◄── handler registry
//! ```
//!
//! Handlers run on the network thread and must not block. They decode the
//! envelope and overwrite the subscriber's slot, nothing more.

use crate::core::slot::LatestSlot;
use crate::core::traits::{ValuePublisher, ValueSubscriber};
use crate::error::{Error, Result};
use crate::streaming::envelope::EnvelopeCodec;
use parking_lot::{Mutex, RwLock};
use rumqttc::{
    Client, ConnectReturnCode, Connection, Event, MqttOptions, Packet, QoS, RecvTimeoutError,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default MQTT broker port
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Bound on waiting for CONNACK at construction
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Network thread wake-up interval (shutdown latency)
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pause after a connection error before the library retries
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Outgoing request queue size
const REQUEST_CAPACITY: usize = 32;

static CLIENT_SEQ: AtomicU64 = AtomicU64::new(0);

type Handler = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Topic → handlers map shared with the network thread
#[derive(Default)]
struct Registry {
    handlers: HashMap<String, Vec<(u64, Handler)>>,
    next_id: u64,
}

impl Registry {
    /// Register a handler; returns its id and whether the topic is new
    fn add(&mut self, topic: &str, handler: Handler) -> (u64, bool) {
        let id = self.next_id;
        self.next_id += 1;
        let entry = self.handlers.entry(topic.to_string()).or_default();
        let first = entry.is_empty();
        entry.push((id, handler));
        (id, first)
    }

    /// Remove a handler; returns true when the topic has no handlers left
    fn remove(&mut self, topic: &str, id: u64) -> bool {
        let Some(entry) = self.handlers.get_mut(topic) else {
            return false;
        };
        entry.retain(|(hid, _)| *hid != id);
        if entry.is_empty() {
            self.handlers.remove(topic);
            true
        } else {
            false
        }
    }

    /// Run every handler registered for `topic`; returns how many ran
    fn dispatch(&self, topic: &str, payload: &[u8]) -> usize {
        match self.handlers.get(topic) {
            Some(entry) => {
                for (_, handler) in entry {
                    handler(payload);
                }
                entry.len()
            }
            None => 0,
        }
    }

    fn topics(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

/// Split `host`, `host:port` or `mqtt://host:port` into host and port
pub fn parse_broker(broker: &str) -> Result<(String, u16)> {
    let trimmed = broker
        .trim()
        .trim_start_matches("mqtt://")
        .trim_start_matches("tcp://");

    if trimmed.is_empty() {
        return Err(Error::InvalidAddress(format!("empty broker address '{}'", broker)));
    }

    match trimmed.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::InvalidAddress(format!("bad broker port in '{}'", broker)))?;
            Ok((host.to_string(), port))
        }
        Some(_) => Err(Error::InvalidAddress(format!("missing broker host in '{}'", broker))),
        None => Ok((trimmed.to_string(), DEFAULT_MQTT_PORT)),
    }
}

/// One broker connection shared by any number of channels
pub struct MqttLink {
    broker: String,
    client: Client,
    registry: Arc<RwLock<Registry>>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttLink {
    /// Connect to `broker` and start the network thread
    ///
    /// Fails if the broker does not acknowledge the connection within a few
    /// seconds, so a misconfigured robot stops at startup instead of driving
    /// blind.
    pub fn connect(broker: &str) -> Result<Arc<Self>> {
        let (host, port) = parse_broker(broker)?;
        let client_id = format!(
            "setu-{}-{}",
            std::process::id(),
            CLIENT_SEQ.fetch_add(1, Ordering::Relaxed)
        );

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(5));

        let (client, mut connection) = Client::new(options, REQUEST_CAPACITY);
        wait_for_connack(&mut connection, broker)?;
        log::info!("Connected to MQTT broker {}", broker);

        let registry = Arc::new(RwLock::new(Registry::default()));
        let running = Arc::new(AtomicBool::new(true));

        let thread_client = client.clone();
        let thread_registry = Arc::clone(&registry);
        let thread_running = Arc::clone(&running);
        let thread_broker = broker.to_string();

        let handle = thread::Builder::new()
            .name("setu-mqtt".to_string())
            .spawn(move || {
                network_loop(
                    connection,
                    thread_client,
                    thread_registry,
                    thread_running,
                    &thread_broker,
                );
            })
            .map_err(|e| Error::Thread(format!("failed to spawn MQTT thread: {}", e)))?;

        Ok(Arc::new(Self {
            broker: broker.to_string(),
            client,
            registry,
            running,
            handle: Mutex::new(Some(handle)),
        }))
    }

    /// Broker address as configured
    pub fn broker(&self) -> &str {
        &self.broker
    }

    /// Publisher for `topic` sharing this connection
    pub fn publisher(self: &Arc<Self>, topic: &str) -> MqttValuePub {
        MqttValuePub {
            topic: topic.to_string(),
            link: Some(Arc::clone(self)),
            codec: EnvelopeCodec::default(),
        }
    }

    /// Subscriber for `topic` sharing this connection
    pub fn subscriber<T>(self: &Arc<Self>, topic: &str, default: T) -> Result<MqttValueSub<T>>
    where
        T: DeserializeOwned + Clone + Send + 'static,
    {
        self.subscriber_with_codec(topic, default, EnvelopeCodec::default())
    }

    /// Subscriber for `topic` with an explicit envelope codec
    pub fn subscriber_with_codec<T>(
        self: &Arc<Self>,
        topic: &str,
        default: T,
        codec: EnvelopeCodec,
    ) -> Result<MqttValueSub<T>>
    where
        T: DeserializeOwned + Clone + Send + 'static,
    {
        let slot = LatestSlot::new(default);
        let handler_slot = slot.clone();
        let name = topic.to_string();

        let handler: Handler = Box::new(move |payload: &[u8]| {
            if let Some(value) = codec.decode_named::<T>(&name, payload) {
                handler_slot.store(value);
            }
        });

        let id = self.register(topic, handler)?;
        Ok(MqttValueSub {
            topic: topic.to_string(),
            slot,
            link: Some(Arc::clone(self)),
            handler_id: id,
        })
    }

    fn register(&self, topic: &str, handler: Handler) -> Result<u64> {
        let (id, first) = self.registry.write().add(topic, handler);
        if first {
            if let Err(e) = self.client.try_subscribe(topic, QoS::AtMostOnce) {
                self.registry.write().remove(topic, id);
                return Err(Error::Mqtt(format!("subscribe to '{}' failed: {}", topic, e)));
            }
            log::info!("Subscribed to MQTT topic '{}'", topic);
        }
        Ok(id)
    }

    fn unregister(&self, topic: &str, id: u64) {
        let last = self.registry.write().remove(topic, id);
        if last {
            if let Err(e) = self.client.try_unsubscribe(topic) {
                log::debug!("Unsubscribe from '{}' failed: {}", topic, e);
            }
        }
    }

    fn send(&self, topic: &str, payload: Vec<u8>) {
        // try_publish: a full request queue drops this tick instead of blocking
        if let Err(e) = self.client.try_publish(topic, QoS::AtMostOnce, false, payload) {
            log::debug!("MQTT publish to '{}' dropped: {}", topic, e);
        }
    }

    /// Stop the network thread and disconnect. Idempotent.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.client.try_disconnect();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                log::error!("MQTT network thread panicked");
            }
        }
        log::info!("Disconnected from MQTT broker {}", self.broker);
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Poll the fresh connection until the broker accepts or refuses us
fn wait_for_connack(connection: &mut Connection, broker: &str) -> Result<()> {
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Mqtt(format!("timed out connecting to {}", broker)));
        }

        match connection.recv_timeout(remaining) {
            Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                return Err(Error::Mqtt(format!(
                    "broker {} refused connection: {:?}",
                    broker, ack.code
                )));
            }
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => {
                return Err(Error::Mqtt(format!("cannot reach broker {}: {}", broker, e)));
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                return Err(Error::Mqtt(format!("connection to {} closed", broker)));
            }
        }
    }
}

/// Network thread: drive the connection, route publishes, resubscribe
fn network_loop(
    mut connection: Connection,
    client: Client,
    registry: Arc<RwLock<Registry>>,
    running: Arc<AtomicBool>,
    broker: &str,
) {
    log::debug!("MQTT network thread started for {}", broker);
    let mut connected = true;

    while running.load(Ordering::Relaxed) {
        match connection.recv_timeout(POLL_INTERVAL) {
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                let handled = registry.read().dispatch(&publish.topic, &publish.payload);
                log::trace!(
                    "MQTT '{}': {} bytes, {} handler(s)",
                    publish.topic,
                    publish.payload.len(),
                    handled
                );
            }
            Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                // Clean sessions forget subscriptions across reconnects
                let topics = registry.read().topics();
                for topic in &topics {
                    if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                        log::warn!("Resubscribe to '{}' failed: {}", topic, e);
                    }
                }
                if !connected {
                    log::info!(
                        "Reconnected to MQTT broker {} ({} topic(s) restored)",
                        broker,
                        topics.len()
                    );
                }
                connected = true;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                if connected {
                    log::warn!("MQTT connection to {} lost: {}", broker, e);
                    connected = false;
                } else {
                    log::trace!("MQTT reconnect to {} failed: {}", broker, e);
                }
                sleep_while_running(&running, RECONNECT_DELAY);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    log::debug!("MQTT network thread stopped for {}", broker);
}

fn sleep_while_running(running: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::Relaxed) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
}

/// Publishes values to an MQTT topic
pub struct MqttValuePub {
    topic: String,
    link: Option<Arc<MqttLink>>,
    codec: EnvelopeCodec,
}

impl MqttValuePub {
    /// Publish to `topic` over a dedicated broker connection
    pub fn new(topic: &str, broker: &str) -> Result<Self> {
        Ok(MqttLink::connect(broker)?.publisher(topic))
    }

    /// Replace the envelope codec
    pub fn with_codec(mut self, codec: EnvelopeCodec) -> Self {
        self.codec = codec;
        self
    }

    /// The underlying shared connection, if still open
    pub fn link(&self) -> Option<&Arc<MqttLink>> {
        self.link.as_ref()
    }
}

impl ValuePublisher for MqttValuePub {
    fn name(&self) -> &str {
        &self.topic
    }

    fn publish<T: Serialize + ?Sized>(&mut self, value: &T) {
        let Some(link) = self.link.as_ref() else {
            log::debug!("MQTT publisher '{}' is closed, dropping value", self.topic);
            return;
        };

        match self.codec.encode(&self.topic, value) {
            Ok(payload) => link.send(&self.topic, payload),
            Err(e) => log::warn!("Failed to encode '{}': {}", self.topic, e),
        }
    }

    fn close(&mut self) {
        if self.link.take().is_some() {
            log::info!("MQTT publisher '{}' closed", self.topic);
        }
    }
}

/// Receives values from an MQTT topic
pub struct MqttValueSub<T> {
    topic: String,
    slot: LatestSlot<T>,
    link: Option<Arc<MqttLink>>,
    handler_id: u64,
}

impl<T: DeserializeOwned + Clone + Send + 'static> MqttValueSub<T> {
    /// Subscribe to `topic` over a dedicated broker connection
    pub fn new(topic: &str, broker: &str, default: T) -> Result<Self> {
        MqttLink::connect(broker)?.subscriber(topic, default)
    }

    /// Number of envelopes accepted so far
    pub fn updates(&self) -> u64 {
        self.slot.stores()
    }

    /// The underlying shared connection, if still open
    pub fn link(&self) -> Option<&Arc<MqttLink>> {
        self.link.as_ref()
    }
}

impl<T: Clone> ValueSubscriber<T> for MqttValueSub<T> {
    fn name(&self) -> &str {
        &self.topic
    }

    fn receive(&mut self) -> T {
        self.slot.load()
    }

    fn receive_latest(&self) -> T {
        self.slot.load()
    }

    fn close(&mut self) {
        if let Some(link) = self.link.take() {
            link.unregister(&self.topic, self.handler_id);
            log::info!("MQTT subscriber '{}' closed", self.topic);
        }
    }
}

impl<T> Drop for MqttValueSub<T> {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.unregister(&self.topic, self.handler_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_parse_broker() {
        assert_eq!(
            parse_broker("broker.local").unwrap(),
            ("broker.local".to_string(), DEFAULT_MQTT_PORT)
        );
        assert_eq!(
            parse_broker("10.0.0.2:1884").unwrap(),
            ("10.0.0.2".to_string(), 1884)
        );
        assert_eq!(
            parse_broker("mqtt://localhost:1883").unwrap(),
            ("localhost".to_string(), 1883)
        );
        assert!(parse_broker("").is_err());
        assert!(parse_broker(":1883").is_err());
        assert!(parse_broker("host:notaport").is_err());
    }

    #[test]
    fn test_registry_routes_by_topic() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::default();

        let counter = Arc::clone(&hits);
        let (a, first) = registry.add(
            "donkey/controls",
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(first);

        let counter = Arc::clone(&hits);
        let (b, first) = registry.add(
            "donkey/controls",
            Box::new(move |_| {
                counter.fetch_add(10, Ordering::SeqCst);
            }),
        );
        assert!(!first);

        assert_eq!(registry.dispatch("donkey/controls", b"x"), 2);
        assert_eq!(registry.dispatch("donkey/camera", b"x"), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 11);

        assert!(!registry.remove("donkey/controls", a));
        assert!(registry.remove("donkey/controls", b));
        assert!(registry.topics().is_empty());
    }

    #[test]
    fn test_handler_decodes_into_slot() {
        let slot = LatestSlot::new((0.0f64, 0.0f64));
        let handler_slot = slot.clone();
        let codec = EnvelopeCodec::default();
        let name = "donkey/controls".to_string();

        let mut registry = Registry::default();
        registry.add(
            "donkey/controls",
            Box::new(move |payload: &[u8]| {
                if let Some(v) = codec.decode_named::<(f64, f64)>(&name, payload) {
                    handler_slot.store(v);
                }
            }),
        );

        let good = EnvelopeCodec::default()
            .encode("donkey/controls", &(0.5f64, -0.2f64))
            .unwrap();
        registry.dispatch("donkey/controls", &good);
        assert_eq!(slot.load(), (0.5, -0.2));

        // Garbage and mislabelled payloads leave the slot alone
        registry.dispatch("donkey/controls", b"garbage");
        let mislabelled = EnvelopeCodec::default()
            .encode("donkey/other", &(9.0f64, 9.0f64))
            .unwrap();
        registry.dispatch("donkey/controls", &mislabelled);
        assert_eq!(slot.load(), (0.5, -0.2));
        assert_eq!(slot.stores(), 1);
    }

    #[test]
    fn test_unreachable_broker_fails_fast() {
        let start = Instant::now();
        let result = MqttLink::connect("127.0.0.1:1");
        assert!(matches!(result, Err(Error::Mqtt(_))));
        assert!(start.elapsed() <= CONNECT_TIMEOUT + Duration::from_secs(1));
    }
}
