//! Transport-independent building blocks

pub mod slot;
pub mod threaded;
pub mod traits;

pub use slot::LatestSlot;
pub use threaded::ThreadedSubscriber;
pub use traits::{ValuePublisher, ValueSubscriber};
