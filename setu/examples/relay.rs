//! Relay - poke a configured channel by hand
//!
//! Publishes `"hi there"` once per second, or prints whatever a channel
//! carries once per second, using the same TOML file as the robot:
//!
//! ```text
//! cargo run --example relay -- --config setu.toml --publish camera
//! cargo run --example relay -- --config setu.toml --subscribe camera
//! cargo run --example relay -- -c setu.toml --subscribe controls --threaded
//! ```
//!
//! Values are printed as JSON regardless of the wire format, so the relay
//! can watch any channel without knowing its value type.

use setu::config::SetuConfig;
use setu::core::traits::{ValuePublisher, ValueSubscriber};
use setu::core::ThreadedSubscriber;
use setu::transport::{open_publisher, open_subscriber};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TICK: Duration = Duration::from_secs(1);

enum Mode {
    Publish(String),
    Subscribe { channel: String, threaded: bool },
}

struct Args {
    config_path: String,
    mode: Mode,
}

/// Parse command line arguments.
///
/// Supports:
/// - `--config <path>` / `-c <path>` (defaults to `setu.toml`)
/// - `--publish <channel>` or `--subscribe <channel>`
/// - `--threaded` to receive on a background thread
fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = env::args().collect();
    let mut config_path = "setu.toml".to_string();
    let mut publish = None;
    let mut subscribe = None;
    let mut threaded = false;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1).cloned();
        match args[i].as_str() {
            "--config" | "-c" => {
                config_path = value.ok_or("--config needs a path")?;
                i += 1;
            }
            "--publish" | "-p" => {
                publish = Some(value.ok_or("--publish needs a channel name")?);
                i += 1;
            }
            "--subscribe" | "-s" => {
                subscribe = Some(value.ok_or("--subscribe needs a channel name")?);
                i += 1;
            }
            "--threaded" => threaded = true,
            other => return Err(format!("unknown argument '{}'", other)),
        }
        i += 1;
    }

    let mode = match (publish, subscribe) {
        (Some(channel), None) => Mode::Publish(channel),
        (None, Some(channel)) => Mode::Subscribe { channel, threaded },
        _ => return Err("pass exactly one of --publish or --subscribe".to_string()),
    };

    Ok(Args { config_path, mode })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!(
                "usage: relay [--config <path>] (--publish <channel> | --subscribe <channel> [--threaded])"
            );
            std::process::exit(2);
        }
    };

    let config = SetuConfig::from_file(&args.config_path)?;

    // RUST_LOG still wins over the configured level
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();
    log::info!("Using config: {}", args.config_path);

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })?;

    match args.mode {
        Mode::Publish(name) => {
            let channel = config.channel(&name)?;
            let mut publisher = open_publisher(channel)?;
            log::info!("Publishing on '{}' over {}", name, publisher.kind());

            while running.load(Ordering::Relaxed) {
                publisher.publish("hi there");
                thread::sleep(TICK);
            }
            publisher.close();
        }
        Mode::Subscribe { channel: name, threaded } => {
            let channel = config.channel(&name)?;
            let subscriber = open_subscriber(channel, serde_json::Value::Null)?;
            log::info!("Subscribed to '{}' over {}", name, subscriber.kind());

            if threaded {
                let mut subscriber = ThreadedSubscriber::spawn(subscriber)?;
                while running.load(Ordering::Relaxed) {
                    println!("{}: {}", name, subscriber.receive());
                    thread::sleep(TICK);
                }
                subscriber.close();
            } else {
                let mut subscriber = subscriber;
                while running.load(Ordering::Relaxed) {
                    println!("{}: {}", name, subscriber.receive());
                    thread::sleep(TICK);
                }
                subscriber.close();
            }
        }
    }

    log::info!("Relay stopped");
    Ok(())
}
