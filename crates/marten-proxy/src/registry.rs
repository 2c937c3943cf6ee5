use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::AbortHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketKind {
    Client,
    Upstream,
}

#[derive(Debug)]
struct TrackedSocket {
    kind: SocketKind,
    peer: String,
    abort: Option<AbortHandle>,
}

#[derive(Debug, Default)]
struct Inner {
    closing: bool,
    sockets: HashMap<u64, TrackedSocket>,
}

/// Monotonically-keyed table of every live client and upstream socket.
/// Entries are removed through [`SocketGuard`] drops, so cancelled tasks
/// still deregister themselves.
#[derive(Debug, Default)]
pub(crate) struct SocketRegistry {
    next_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl SocketRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns `None` once shutdown has begun; callers drop the socket.
    pub(crate) fn register(
        self: &Arc<Self>,
        kind: SocketKind,
        peer: String,
    ) -> Option<(u64, SocketGuard)> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(id, ?kind, %peer, "tracking socket");
        {
            let mut inner = self.inner.lock();
            if inner.closing {
                return None;
            }
            inner.sockets.insert(
                id,
                TrackedSocket {
                    kind,
                    peer,
                    abort: None,
                },
            );
        }
        Some((
            id,
            SocketGuard {
                registry: Arc::clone(self),
                id,
            },
        ))
    }

    /// Attach the owning task so shutdown can force-destroy the socket.
    /// If shutdown already started, the task is aborted on the spot.
    pub(crate) fn bind_abort(&self, id: u64, handle: AbortHandle) {
        let abort_now = {
            let mut inner = self.inner.lock();
            if inner.closing {
                true
            } else if let Some(tracked) = inner.sockets.get_mut(&id) {
                tracked.abort = Some(handle.clone());
                false
            } else {
                // Already deregistered; nothing to track.
                false
            }
        };
        if abort_now {
            handle.abort();
        }
    }

    pub(crate) fn active_count(&self) -> usize {
        self.inner.lock().sockets.len()
    }

    /// Refuse new registrations from now on.
    pub(crate) fn begin_close(&self) {
        self.inner.lock().closing = true;
    }

    /// Force-destroy every still-present socket of `kind`. Snapshots the
    /// abort handles under the lock, aborts outside it.
    pub(crate) fn abort_kind(&self, kind: SocketKind) -> usize {
        let handles: Vec<AbortHandle> = {
            let inner = self.inner.lock();
            inner
                .sockets
                .values()
                .filter(|tracked| tracked.kind == kind)
                .filter_map(|tracked| tracked.abort.clone())
                .collect()
        };
        let count = handles.len();
        for handle in handles {
            handle.abort();
        }
        count
    }

    fn deregister(&self, id: u64) {
        self.inner.lock().sockets.remove(&id);
    }
}

/// Removes its registry entry on drop.
pub(crate) struct SocketGuard {
    registry: Arc<SocketRegistry>,
    id: u64,
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::{SocketKind, SocketRegistry};

    #[test]
    fn ids_are_monotonic_and_guards_deregister() {
        let registry = SocketRegistry::new();
        let (first_id, first_guard) = registry
            .register(SocketKind::Client, "a".to_string())
            .expect("register");
        let (second_id, second_guard) = registry
            .register(SocketKind::Upstream, "b".to_string())
            .expect("register");
        assert!(second_id > first_id);
        assert_eq!(registry.active_count(), 2);

        drop(first_guard);
        assert_eq!(registry.active_count(), 1);
        drop(second_guard);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn registration_is_refused_after_close_begins() {
        let registry = SocketRegistry::new();
        registry.begin_close();
        assert!(registry
            .register(SocketKind::Client, "late".to_string())
            .is_none());
    }

    #[tokio::test]
    async fn abort_kind_only_touches_matching_sockets() {
        let registry = SocketRegistry::new();

        let (client_id, client_guard) = registry
            .register(SocketKind::Client, "client".to_string())
            .expect("register client");
        let client_task = tokio::spawn(async move {
            let _guard = client_guard;
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        registry.bind_abort(client_id, client_task.abort_handle());

        let (upstream_id, upstream_guard) = registry
            .register(SocketKind::Upstream, "upstream".to_string())
            .expect("register upstream");
        let upstream_task = tokio::spawn(async move {
            let _guard = upstream_guard;
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        registry.bind_abort(upstream_id, upstream_task.abort_handle());

        assert_eq!(registry.abort_kind(SocketKind::Upstream), 1);
        assert!(upstream_task.await.expect_err("aborted").is_cancelled());
        // Guard drop ran despite the abort.
        assert_eq!(registry.active_count(), 1);

        assert_eq!(registry.abort_kind(SocketKind::Client), 1);
        assert!(client_task.await.expect_err("aborted").is_cancelled());
        assert_eq!(registry.active_count(), 0);
    }
}
