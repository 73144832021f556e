//! Client-side tracking pipeline — session tracking, the batched event
//! queue, delivery to the remote collector, and the `track()` facade.
//!
//! # Modules
//!
//! - [`session`] — one session per application lifetime, with attribution
//! - [`queue`] — pending-event buffer with batched, retrying flushes
//! - [`delivery`] — collector sinks and the connectivity signal
//! - [`tracker`] — the enriched `track()` entry point

pub mod delivery;
pub mod queue;
pub mod session;
pub mod tracker;

pub use delivery::{Collector, Connectivity, HttpCollector, LogCollector};
pub use queue::{EventQueue, FlushOutcome, QueueStats};
pub use session::{NavigationContext, SessionTracker};
pub use tracker::{DeviceInfo, Tracker};
