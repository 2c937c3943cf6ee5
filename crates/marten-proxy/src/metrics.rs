use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time counters for a running proxy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyMetrics {
    pub total_connections: u64,
    pub active_sockets: u64,
    pub upstream_connect_errors: u64,
    pub upstream_timeouts: u64,
    pub client_aborts: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ProxyMetricsStore {
    total_connections: AtomicU64,
    upstream_connect_errors: AtomicU64,
    upstream_timeouts: AtomicU64,
    client_aborts: AtomicU64,
}

impl ProxyMetricsStore {
    pub(crate) fn record_connection(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_upstream_connect_error(&self) {
        self.upstream_connect_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_upstream_timeout(&self) {
        self.upstream_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_client_abort(&self) {
        self.client_aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, active_sockets: u64) -> ProxyMetrics {
        ProxyMetrics {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_sockets,
            upstream_connect_errors: self.upstream_connect_errors.load(Ordering::Relaxed),
            upstream_timeouts: self.upstream_timeouts.load(Ordering::Relaxed),
            client_aborts: self.client_aborts.load(Ordering::Relaxed),
        }
    }
}
