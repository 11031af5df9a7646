//! # instrumental-core
//!
//! Client library for reporting application metrics (counters and gauges) to
//! an Instrumental collector over a persistent TCP connection.
//!
//! The collector speaks a small ASCII line protocol guarded by a two-step
//! handshake: the client announces itself (`hello`), authenticates with its
//! API key (`authenticate`), and only then submits metric lines. This crate
//! provides:
//! - The collector session state machine (connect, handshake, flush, recover)
//! - Metric line formatting for the wire protocol
//! - A tokio TCP transport behind a capability interface
//! - Configuration loading and logging infrastructure
//!
//! Metric submission is fire-and-forget by design: calls never block and
//! never fail. Metrics submitted before the handshake completes are buffered
//! and flushed in order once the collector accepts the API key; metrics that
//! cannot be sent at all are dropped (and counted).
//!
//! ## Example
//!
//! ```rust,no_run
//! use instrumental_core::{Collector, CollectorConfig};
//!
//! #[tokio::main]
//! async fn main() -> instrumental_core::Result<()> {
//!     let config = CollectorConfig::new("ik_live_xxxxxxxx").with_prefix("app");
//!     let collector = Collector::new(config)?;
//!
//!     collector.increment("signups");
//!     collector.gauge("queue_depth", 12.0);
//!     Ok(())
//! }
//! ```

// Re-export commonly used items at the crate root
pub use config::{ClientIdentity, CollectorConfig, Config};
pub use error::{Error, Result};
pub use session::Collector;

// Public modules
pub mod blocking;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod transport;
