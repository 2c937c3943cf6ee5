use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{sign_leaf, CertIssueError, LeafCert, RootCa};

/// Entries this close to expiry are reissued instead of reused.
const REISSUE_WINDOW: Duration = Duration::from_secs(60 * 60);

type IssueResult = Result<Arc<LeafCert>, CertIssueError>;

enum Slot {
    /// Issuance in flight; late callers subscribe and receive the same
    /// terminal result.
    Pending(watch::Receiver<Option<IssueResult>>),
    Ready(Arc<LeafCert>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CertCacheMetrics {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaves_issued: u64,
}

/// Hostname→leaf cache with at-most-one concurrent issuance per
/// hostname. Keys are literal lowercased hostnames; no wildcards.
pub struct CertCache {
    root: Option<Arc<RootCa>>,
    entries: Mutex<HashMap<String, Slot>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_issued: AtomicU64,
}

impl CertCache {
    pub fn new(root: Option<Arc<RootCa>>) -> Self {
        Self {
            root,
            entries: Mutex::new(HashMap::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            leaves_issued: AtomicU64::new(0),
        }
    }

    pub fn has_root(&self) -> bool {
        self.root.is_some()
    }

    pub fn root(&self) -> Option<&Arc<RootCa>> {
        self.root.as_ref()
    }

    pub fn metrics_snapshot(&self) -> CertCacheMetrics {
        CertCacheMetrics {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            leaves_issued: self.leaves_issued.load(Ordering::Relaxed),
        }
    }

    /// Fetch the leaf for `hostname`, issuing at most once no matter how
    /// many callers race. Failed issuance discards the slot so the next
    /// caller retries; near-expiry entries are reissued in place.
    pub async fn get(&self, hostname: &str) -> IssueResult {
        let host = normalize_host(hostname);
        loop {
            enum Action {
                Use(Arc<LeafCert>),
                Wait(watch::Receiver<Option<IssueResult>>),
                Issue(watch::Sender<Option<IssueResult>>),
            }

            let action = {
                let mut entries = self.entries.lock();
                match entries.get(&host) {
                    Some(Slot::Ready(leaf))
                        if !leaf_needs_reissue(leaf.not_after, SystemTime::now()) =>
                    {
                        Action::Use(Arc::clone(leaf))
                    }
                    Some(Slot::Pending(rx)) => Action::Wait(rx.clone()),
                    _ => {
                        let (tx, rx) = watch::channel(None);
                        entries.insert(host.clone(), Slot::Pending(rx));
                        Action::Issue(tx)
                    }
                }
            };

            match action {
                Action::Use(leaf) => {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(leaf);
                }
                Action::Issue(tx) => {
                    self.cache_misses.fetch_add(1, Ordering::Relaxed);
                    let result = self.issue(&host).await;
                    {
                        let mut entries = self.entries.lock();
                        match &result {
                            Ok(leaf) => {
                                entries.insert(host.clone(), Slot::Ready(Arc::clone(leaf)));
                            }
                            Err(_) => {
                                entries.remove(&host);
                            }
                        }
                    }
                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
                Action::Wait(mut rx) => {
                    loop {
                        let published = rx.borrow().clone();
                        if let Some(result) = published {
                            return result;
                        }
                        if rx.changed().await.is_err() {
                            // Issuer went away without publishing (its
                            // task was cancelled). Clear the stale slot
                            // if it is still ours and start over.
                            let mut entries = self.entries.lock();
                            if let Some(Slot::Pending(slot_rx)) = entries.get(&host) {
                                if slot_rx.same_channel(&rx) {
                                    entries.remove(&host);
                                }
                            }
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn issue(&self, host: &str) -> IssueResult {
        let Some(root) = self.root.as_ref().map(Arc::clone) else {
            return Err(CertIssueError::RootUnavailable);
        };
        let hostname = host.to_string();
        let joined =
            tokio::task::spawn_blocking(move || sign_leaf(&root, &hostname).map(Arc::new)).await;
        let result = match joined {
            Ok(result) => result,
            Err(error) => Err(CertIssueError::Generation(format!(
                "issuance task failed: {error}"
            ))),
        };
        if result.is_ok() {
            self.leaves_issued.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(host, "issued leaf certificate");
        }
        result
    }
}

pub(crate) fn leaf_needs_reissue(not_after: SystemTime, now: SystemTime) -> bool {
    match not_after.duration_since(now) {
        Ok(remaining) => remaining < REISSUE_WINDOW,
        Err(_) => true,
    }
}

fn normalize_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}
