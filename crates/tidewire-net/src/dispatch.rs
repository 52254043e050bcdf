//! Routing of network events to application handlers.

pub mod concurrency;
pub mod handler;
pub mod router;

pub use concurrency::{ConcurrencyPolicy, ConcurrentExcept, ListedConcurrent, Serialized};
pub use handler::{LogHandler, SessionHandler};
pub use router::dispatch_net_events;
