//! The MITM listener: one shared loopback TLS listener whose leaf is
//! selected per-connection from the ClientHello SNI, fed by the
//! single-flight cert cache. CONNECT interception splices client
//! sockets into it; decrypted streams re-enter the dispatcher flagged
//! as https.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::LazyConfigAcceptor;

use marten_tls::CertCache;

use crate::dispatcher::{serve_connection, Shared, StreamOrigin};
use crate::registry::SocketKind;
use crate::rule::Rule;
use crate::ProxyError;

pub(crate) struct MitmPool {
    cert_cache: Arc<CertCache>,
    shutdown_tx: watch::Sender<bool>,
    state: tokio::sync::Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
}

impl MitmPool {
    pub(crate) fn new(cert_cache: Arc<CertCache>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            cert_cache,
            shutdown_tx,
            state: tokio::sync::Mutex::new(PoolState::default()),
        }
    }

    /// Address of the shared TLS listener, ready to present a leaf for
    /// `hostname`. Issuance happens here (single-flight), so a signing
    /// failure surfaces before the client is told the tunnel is up.
    pub(crate) fn listener_addr<'a, R: Rule>(
        &'a self,
        shared: &'a Arc<Shared<R>>,
        hostname: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<SocketAddr, ProxyError>> + Send + 'a>> {
        Box::pin(async move {
            self.cert_cache
                .get(hostname)
                .await
                .map_err(ProxyError::CertIssueFailed)?;

            let mut state = self.state.lock().await;
            if *self.shutdown_tx.borrow() {
                return Err(ProxyError::UpstreamConnectFailed(
                    "proxy is shutting down".to_string(),
                ));
            }
            if let Some(addr) = state.addr {
                return Ok(addr);
            }

            let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
            let addr = listener.local_addr()?;
            let shutdown_rx = self.shutdown_tx.subscribe();
            let shared = Arc::clone(shared);
            let task = tokio::spawn(accept_loop(listener, shared, shutdown_rx));
            state.addr = Some(addr);
            state.accept_task = Some(task);
            tracing::debug!(%addr, "MITM listener bound");
            Ok(addr)
        })
    }

    /// Stop accepting and abort any pending handshakes.
    pub(crate) async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut state = self.state.lock().await;
        if let Some(task) = state.accept_task.take() {
            task.abort();
            let _ = task.await;
        }
        state.addr = None;
    }
}

async fn accept_loop<R: Rule>(
    listener: TcpListener,
    shared: Arc<Shared<R>>,
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
                tracing::debug!(%error, "MITM accept failed");
                continue;
            }
        };

        let Some((id, guard)) = shared
            .registry
            .register(SocketKind::Client, format!("mitm-client:{peer}"))
        else {
            return;
        };
        let task_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            let _guard = guard;
            let served: Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>> =
                Box::pin(serve_decrypted(task_shared, tcp));
            if let Err(error) = served.await {
                tracing::debug!(%error, "intercepted stream ended with an error");
            }
        });
        shared.registry.bind_abort(id, task.abort_handle());
    }
}

/// Complete the TLS handshake with a leaf chosen from the SNI, then run
/// the plaintext through the ordinary request path.
async fn serve_decrypted<R: Rule>(shared: Arc<Shared<R>>, tcp: TcpStream) -> std::io::Result<()> {
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), tcp);
    let start = acceptor.await?;

    let Some(hostname) = start.client_hello().server_name().map(str::to_string) else {
        // Without SNI the shared listener cannot know which leaf to
        // present; the CONNECT target is long gone at this point.
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "client sent no SNI; cannot select a leaf certificate",
        ));
    };

    let leaf = shared
        .cert_cache
        .get(&hostname)
        .await
        .map_err(std::io::Error::other)?;
    let tls = start.into_stream(Arc::clone(&leaf.server_config)).await?;

    serve_connection(shared, tls, StreamOrigin::Intercepted { hostname }).await
}
