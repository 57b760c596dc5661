//! ZeroMQ transport integration tests
//!
//! Run with: `cargo test --test zmq_pubsub`

#![cfg(feature = "zmq")]

use setu::config::{ChannelConfig, TransportConfig};
use setu::core::traits::{ValuePublisher, ValueSubscriber};
use setu::core::ThreadedSubscriber;
use setu::transport::zmq::{ZmqValuePub, ZmqValueSub, DEFAULT_HWM};
use setu::transport::{open_publisher, open_subscriber, Publisher};
use std::thread;
use std::time::{Duration, Instant};

fn ephemeral(name: &str) -> ZmqValuePub {
    ZmqValuePub::bind(name, "tcp://127.0.0.1:*", DEFAULT_HWM).unwrap()
}

#[test]
fn test_every_subscriber_gets_the_value() {
    let mut publisher = ephemeral("controls");
    let mut subs: Vec<ZmqValueSub<(f64, f64)>> = (0..3)
        .map(|_| ZmqValueSub::connect("controls", publisher.endpoint(), (0.0, 0.0)).unwrap())
        .collect();

    let want = (0.5, -0.2);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        publisher.publish(&want);
        thread::sleep(Duration::from_millis(10));
        if subs.iter_mut().all(|s| s.receive() == want) {
            break;
        }
        assert!(Instant::now() < deadline, "subscribers never caught up");
    }
}

#[test]
fn test_threaded_zmq_subscriber() {
    let mut publisher = ephemeral("camera");
    let sub = ZmqValueSub::connect("camera", publisher.endpoint(), 0u64).unwrap();
    let mut threaded = ThreadedSubscriber::spawn(sub).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut frame = 0u64;
    while threaded.receive() == 0 && Instant::now() < deadline {
        frame += 1;
        publisher.publish(&frame);
        thread::sleep(Duration::from_millis(10));
    }
    assert!(threaded.receive() > 0);
    assert!(threaded.receive() <= frame);
    threaded.close();
}

#[test]
fn test_factory_builds_zmq_pair() {
    let port = {
        let scratch = ephemeral("scratch");
        let endpoint = scratch.endpoint().to_string();
        endpoint
            .rsplit(':')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap()
    };

    let channel = ChannelConfig::new(
        "lidar",
        TransportConfig::Zmq {
            host: "127.0.0.1".to_string(),
            port,
            hwm: 4,
        },
    );
    let mut publisher = open_publisher(&channel).unwrap();
    assert!(matches!(publisher, Publisher::Zmq(_)));
    let mut sub = open_subscriber(&channel, Vec::<u16>::new()).unwrap();
    assert_eq!(sub.kind(), "zmq");

    let scan = vec![100u16, 200, 300];
    let deadline = Instant::now() + Duration::from_secs(5);
    while sub.receive() != scan && Instant::now() < deadline {
        publisher.publish(&scan);
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(sub.receive_latest(), scan);
}
