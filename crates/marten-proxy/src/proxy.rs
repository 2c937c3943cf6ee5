//! Proxy lifecycle: builder, the INIT→READY→CLOSED start/close
//! sequence, and the handle a running proxy is driven through.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

use marten_tls::{CaStore, CertCache};

use crate::config::{ProxyConfig, ServerType};
use crate::dispatcher::{serve_connection, LocalHandler, Shared, StreamOrigin};
use crate::events::{EventSender, ProxyEvent};
use crate::metrics::{ProxyMetrics, ProxyMetricsStore};
use crate::recorder::{Recorder, RecorderChoice};
use crate::registry::{SocketKind, SocketRegistry};
use crate::rule::{DefaultRule, Rule};
use crate::ProxyError;

/// How long `close` waits for the accept loop to drain before aborting
/// it outright.
const SERVER_CLOSE_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStatus {
    Init,
    Ready,
    Closed,
}

/// Observable status cell shared between the proxy, its handle, and any
/// host that wants to watch the lifecycle.
#[derive(Clone)]
pub struct ProxyStatusHandle {
    cell: Arc<Mutex<ProxyStatus>>,
}

impl ProxyStatusHandle {
    fn new() -> Self {
        Self {
            cell: Arc::new(Mutex::new(ProxyStatus::Init)),
        }
    }

    pub fn get(&self) -> ProxyStatus {
        *self.cell.lock()
    }

    fn set(&self, status: ProxyStatus) {
        *self.cell.lock() = status;
    }
}

pub struct ProxyBuilder<R: Rule = DefaultRule> {
    config: ProxyConfig,
    rule: R,
    recorder: RecorderChoice,
    local_handler: Option<LocalHandler>,
}

impl ProxyBuilder<DefaultRule> {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            rule: DefaultRule,
            recorder: RecorderChoice::Unset,
            local_handler: None,
        }
    }
}

impl<R: Rule> ProxyBuilder<R> {
    pub fn with_rule<R2: Rule>(self, rule: R2) -> ProxyBuilder<R2> {
        ProxyBuilder {
            config: self.config,
            rule,
            recorder: self.recorder,
            local_handler: self.local_handler,
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn Recorder>) -> Self {
        self.recorder = RecorderChoice::Enabled(recorder);
        self
    }

    /// Explicitly run without a recorder. Leaving the choice unset is a
    /// startup error.
    pub fn without_recorder(mut self) -> Self {
        self.recorder = RecorderChoice::Disabled;
        self
    }

    pub fn with_local_handler(mut self, handler: LocalHandler) -> Self {
        self.local_handler = Some(handler);
        self
    }

    pub fn build(self) -> Proxy<R> {
        let (events, events_rx) = EventSender::channel();
        Proxy {
            config: self.config,
            rule: Arc::new(self.rule),
            recorder: self.recorder,
            local_handler: self.local_handler,
            status: ProxyStatusHandle::new(),
            events,
            events_rx: Some(events_rx),
        }
    }
}

pub struct Proxy<R: Rule> {
    config: ProxyConfig,
    rule: Arc<R>,
    recorder: RecorderChoice,
    local_handler: Option<LocalHandler>,
    status: ProxyStatusHandle,
    events: EventSender,
    events_rx: Option<mpsc::UnboundedReceiver<ProxyEvent>>,
}

impl<R: Rule> Proxy<R> {
    /// Receiver for the `ready`/`error` lifecycle events. Take it before
    /// calling `start`.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ProxyEvent>> {
        self.events_rx.take()
    }

    pub fn status(&self) -> ProxyStatus {
        self.status.get()
    }

    pub fn status_handle(&self) -> ProxyStatusHandle {
        self.status.clone()
    }

    /// Validate, load CA material, bind, and begin accepting. Emits
    /// `ready` on success; on failure emits `error` once and the status
    /// stays INIT. Consuming `self` makes a second `start` (or a `close`
    /// before `start`) unrepresentable.
    pub async fn start(mut self) -> Result<ProxyHandle<R>, ProxyError> {
        let events = self.events.clone();
        let status = self.status.clone();
        self.events_rx = None;
        match self.start_inner().await {
            Ok(handle) => {
                status.set(ProxyStatus::Ready);
                events.emit(ProxyEvent::Ready {
                    addr: handle.local_addr(),
                });
                Ok(handle)
            }
            Err(error) => {
                events.emit(ProxyEvent::Error {
                    message: error.to_string(),
                });
                Err(error)
            }
        }
    }

    async fn start_inner(self) -> Result<ProxyHandle<R>, ProxyError> {
        self.config.validate()?;
        let Some(recorder) = self.recorder.resolved() else {
            return Err(ProxyError::ConfigInvalid(
                "a recorder must be supplied, or explicitly disabled".to_string(),
            ));
        };

        let store = match &self.config.cert_dir {
            Some(dir) => CaStore::new(dir.clone()),
            None => CaStore::open_default()
                .map_err(|error| ProxyError::CaUnavailable(error.to_string()))?,
        };
        let root = if store.exists() {
            let loaded = store
                .load()
                .map_err(|error| ProxyError::CaUnavailable(error.to_string()))?;
            Some(Arc::new(loaded))
        } else {
            None
        };

        if self.config.force_proxy_https && root.is_none() {
            return Err(ProxyError::CaUnavailable(format!(
                "force_proxy_https requires a root CA under {}",
                store.dir().display()
            )));
        }
        if self.config.server_type == ServerType::Https && root.is_none() {
            return Err(ProxyError::CaUnavailable(format!(
                "an https proxy needs a root CA under {}",
                store.dir().display()
            )));
        }
        if self.config.force_proxy_https {
            // Configuration conflict, not an error: the decision hook is
            // bypassed for every CONNECT while the flag is set.
            tracing::warn!(
                rule = %self.rule.summary(),
                "force_proxy_https is set; before_deal_https_request will not be consulted"
            );
        }

        let cert_cache = Arc::new(CertCache::new(root));

        let own_tls = match self.config.server_type {
            ServerType::Http => None,
            ServerType::Https => {
                let hostname = self.config.hostname.as_deref().unwrap_or_default();
                let leaf = cert_cache.get(hostname).await?;
                Some(TlsAcceptor::from(Arc::clone(&leaf.server_config)))
            }
        };

        let listener =
            TcpListener::bind((self.config.bind_host.as_str(), self.config.port)).await?;
        let local_addr = listener.local_addr()?;

        let local_hosts = build_local_hosts(&self.config, local_addr);
        let registry = SocketRegistry::new();
        let metrics = Arc::new(ProxyMetricsStore::default());
        let shared = Arc::new(Shared::new(
            self.config,
            self.rule,
            recorder,
            Arc::clone(&registry),
            cert_cache,
            Arc::clone(&metrics),
            local_hosts,
            self.local_handler,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&shared),
            own_tls,
            shutdown_rx,
        ));

        Ok(ProxyHandle {
            status: self.status,
            shared,
            shutdown_tx,
            server_task,
            local_addr,
        })
    }
}

pub struct ProxyHandle<R: Rule> {
    status: ProxyStatusHandle,
    shared: Arc<Shared<R>>,
    shutdown_tx: watch::Sender<bool>,
    server_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl<R: Rule> std::fmt::Debug for ProxyHandle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl<R: Rule> ProxyHandle<R> {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn status(&self) -> ProxyStatus {
        self.status.get()
    }

    pub fn status_handle(&self) -> ProxyStatusHandle {
        self.status.clone()
    }

    pub fn active_sockets(&self) -> usize {
        self.shared.registry.active_count()
    }

    pub fn metrics(&self) -> ProxyMetrics {
        self.shared
            .metrics
            .snapshot(self.shared.registry.active_count() as u64)
    }

    /// READY→CLOSED. Destroys upstream connections, shuts the MITM
    /// pool, force-destroys remaining client sockets, then waits for
    /// the outer server to stop. Problems surface in the return value;
    /// teardown always runs to completion.
    pub async fn close(self) -> Result<(), ProxyError> {
        let _ = self.shutdown_tx.send(true);
        self.shared.registry.begin_close();

        let upstream_count = self.shared.registry.abort_kind(SocketKind::Upstream);
        self.shared.pool.shutdown().await;
        let client_count = self.shared.registry.abort_kind(SocketKind::Client);
        tracing::debug!(upstream_count, client_count, "destroyed tracked sockets");

        let server_task = self.server_task;
        let aborter = server_task.abort_handle();
        let result = match timeout(SERVER_CLOSE_GRACE, server_task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(join_error)) if join_error.is_cancelled() => Ok(()),
            Ok(Err(join_error)) => Err(ProxyError::Join(join_error)),
            Err(_) => {
                aborter.abort();
                Ok(())
            }
        };

        self.status.set(ProxyStatus::Closed);
        result
    }
}

async fn accept_loop<R: Rule>(
    listener: TcpListener,
    shared: Arc<Shared<R>>,
    tls: Option<TlsAcceptor>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown_rx.changed() => return,
            accepted = listener.accept() => accepted,
        };
        let (tcp, peer) = match accepted {
            Ok(pair) => pair,
            Err(error) => {
                tracing::debug!(%error, "accept failed");
                continue;
            }
        };

        shared.metrics.record_connection();
        let Some((id, guard)) = shared
            .registry
            .register(SocketKind::Client, peer.to_string())
        else {
            return;
        };
        let task_shared = Arc::clone(&shared);
        let acceptor = tls.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            let served = match acceptor {
                Some(acceptor) => match acceptor.accept(tcp).await {
                    Ok(tls_stream) => {
                        serve_connection(task_shared, tls_stream, StreamOrigin::Outer).await
                    }
                    Err(error) => {
                        tracing::debug!(%error, "client TLS handshake failed");
                        Ok(())
                    }
                },
                None => serve_connection(task_shared, tcp, StreamOrigin::Outer).await,
            };
            if let Err(error) = served {
                tracing::debug!(%error, "client connection ended with an error");
            }
        });
        shared.registry.bind_abort(id, task.abort_handle());
    }
}

fn build_local_hosts(config: &ProxyConfig, local_addr: SocketAddr) -> HashSet<String> {
    let port = local_addr.port();
    let mut hosts = HashSet::new();
    for host in ["localhost", "127.0.0.1", "::1"] {
        hosts.insert(format!("{host}:{port}"));
    }
    hosts.insert(format!("{}:{}", local_addr.ip(), port));
    hosts.insert(format!("{}:{}", config.bind_host.to_ascii_lowercase(), port));
    if let Some(hostname) = &config.hostname {
        hosts.insert(format!("{}:{}", hostname.to_ascii_lowercase(), port));
    }
    for entry in &config.extra_local_hosts {
        let entry = entry.to_ascii_lowercase();
        let has_port = entry
            .rsplit_once(':')
            .map(|(_, tail)| tail.parse::<u16>().is_ok())
            .unwrap_or(false);
        if has_port {
            hosts.insert(entry);
        } else {
            hosts.insert(format!("{entry}:{port}"));
        }
    }
    hosts
}
