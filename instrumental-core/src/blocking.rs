//! Blocking facade for synchronous applications
//!
//! [`Collector`](crate::Collector) needs a tokio runtime to live on. Hosts
//! that already run one should use it directly; everything else can hold a
//! [`BlockingCollector`], which brings its own single-worker runtime and
//! forwards the same fire-and-forget operations.

use crate::config::CollectorConfig;
use crate::error::{Error, Result};
use crate::session::Collector;

/// A collector session that owns the runtime it runs on.
///
/// Every operation has the same semantics as on [`Collector`]: non-blocking,
/// never failing, best effort.
pub struct BlockingCollector {
    inner: Collector,
    _runtime: tokio::runtime::Runtime,
}

impl BlockingCollector {
    /// Create a session on a private runtime and start connecting
    pub fn new(config: CollectorConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("instrumental-collector")
            .enable_all()
            .build()
            .map_err(|e| Error::TransportCreation(format!("failed to create runtime: {}", e)))?;

        let inner = {
            let _guard = runtime.enter();
            Collector::new(config)?
        };

        Ok(Self {
            inner,
            _runtime: runtime,
        })
    }

    /// Increment a counter metric by 1
    pub fn increment(&self, name: &str) {
        self.inner.increment(name)
    }

    /// Increment a counter metric by an arbitrary amount
    pub fn increment_by(&self, name: &str, amount: i64) {
        self.inner.increment_by(name, amount)
    }

    /// Report a gauge reading
    pub fn gauge(&self, name: &str, value: f64) {
        self.inner.gauge(name, value)
    }

    /// Report an absolute gauge reading
    pub fn gauge_absolute(&self, name: &str, value: f64) {
        self.inner.gauge_absolute(name, value)
    }

    /// Ensure a transport exists and initiate a connection if necessary
    pub fn connect(&self) -> Result<()> {
        self.inner.connect()
    }

    /// Flush pending lines best-effort and close the connection
    pub fn disconnect(&self) {
        self.inner.disconnect()
    }

    /// Whether the handshake has completed on the current connection
    pub fn is_authenticated(&self) -> bool {
        self.inner.is_authenticated()
    }

    /// Number of metric lines buffered while unauthenticated
    pub fn pending_count(&self) -> usize {
        self.inner.pending_count()
    }

    /// Number of metric lines dropped because no transport was available
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped_count()
    }
}
