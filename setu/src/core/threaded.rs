//! Background receive loop for any subscriber
//!
//! Moves network I/O off the control loop: a dedicated thread calls the
//! wrapped subscriber's `receive()` continuously and stores each result in a
//! [`LatestSlot`]. The foreground only ever reads the slot.

use crate::core::slot::LatestSlot;
use crate::core::traits::ValueSubscriber;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Pause between receive calls. Subscribers with their own bounded wait
/// (UDP, TCP) barely notice it; non-blocking ones (ZeroMQ) stop spinning.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Subscriber running on its own thread
pub struct ThreadedSubscriber<T> {
    name: String,
    slot: LatestSlot<T>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Clone + Send + 'static> ThreadedSubscriber<T> {
    /// Start a receive loop for `inner` with the default poll interval
    pub fn spawn<S>(inner: S) -> Result<Self>
    where
        S: ValueSubscriber<T> + Send + 'static,
    {
        Self::spawn_with_interval(inner, DEFAULT_POLL_INTERVAL)
    }

    /// Start a receive loop for `inner`, sleeping `interval` between calls
    pub fn spawn_with_interval<S>(mut inner: S, interval: Duration) -> Result<Self>
    where
        S: ValueSubscriber<T> + Send + 'static,
    {
        let name = inner.name().to_string();
        let slot = LatestSlot::new(inner.receive_latest());
        let running = Arc::new(AtomicBool::new(true));

        let thread_slot = slot.clone();
        let thread_running = Arc::clone(&running);
        let thread_name = name.clone();

        let handle = thread::Builder::new()
            .name("setu-sub".to_string())
            .spawn(move || {
                log::debug!("Receive thread for '{}' started", thread_name);
                while thread_running.load(Ordering::Relaxed) {
                    thread_slot.store(inner.receive());
                    thread::sleep(interval);
                }
                inner.close();
                log::debug!("Receive thread for '{}' stopped", thread_name);
            })
            .map_err(|e| Error::Thread(format!("failed to spawn receive thread: {}", e)))?;

        Ok(Self {
            name,
            slot,
            running,
            handle: Some(handle),
        })
    }

    /// Whether the background loop is still running
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl<T: Clone + Send + 'static> ValueSubscriber<T> for ThreadedSubscriber<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn receive(&mut self) -> T {
        self.slot.load()
    }

    fn receive_latest(&self) -> T {
        self.slot.load()
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Receive thread for '{}' panicked", self.name);
            }
        }
    }
}

impl<T> Drop for ThreadedSubscriber<T> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
