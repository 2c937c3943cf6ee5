//! Per-connection state machine: plain forward requests, CONNECT
//! tunnel/intercept decisions, and the shared in-TLS request path that
//! MITM listener streams re-enter.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::Uri;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use marten_tls::CertCache;

use crate::config::ProxyConfig;
use crate::http1::{
    capture_or_plan, header_value, is_websocket_upgrade, parse_request_head, parse_response_head,
    relay_body, write_simple_response, BodyMode, BodyPlan, BufferedConn, Prefixed, RequestHead,
    HEAD_TERMINATOR,
};
use crate::metrics::ProxyMetricsStore;
use crate::mitm_pool::MitmPool;
use crate::recorder::{Recorder, RequestRecord};
use crate::registry::{SocketKind, SocketRegistry};
use crate::rule::{ProxyRequest, ProxyResponse, Rule, Scheme};
use crate::ProxyError;

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Response synthesized when a request targets the proxy itself and no
/// embedded handler is configured.
pub type LocalHandler = Arc<dyn Fn(&ProxyRequest) -> ProxyResponse + Send + Sync>;

/// Everything a connection task needs, owned by the lifecycle.
pub(crate) struct Shared<R: Rule> {
    pub(crate) config: ProxyConfig,
    pub(crate) rule: Arc<R>,
    pub(crate) recorder: Option<Arc<dyn Recorder>>,
    pub(crate) registry: Arc<SocketRegistry>,
    pub(crate) cert_cache: Arc<CertCache>,
    pub(crate) pool: MitmPool,
    pub(crate) metrics: Arc<ProxyMetricsStore>,
    pub(crate) local_hosts: HashSet<String>,
    pub(crate) local_handler: Option<LocalHandler>,
    pub(crate) upstream_tls: Arc<ClientConfig>,
    request_ids: AtomicU64,
}

impl<R: Rule> Shared<R> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: ProxyConfig,
        rule: Arc<R>,
        recorder: Option<Arc<dyn Recorder>>,
        registry: Arc<SocketRegistry>,
        cert_cache: Arc<CertCache>,
        metrics: Arc<ProxyMetricsStore>,
        local_hosts: HashSet<String>,
        local_handler: Option<LocalHandler>,
    ) -> Self {
        let upstream_tls = build_upstream_client_config(config.verify_upstream_tls);
        let pool = MitmPool::new(Arc::clone(&cert_cache));
        Self {
            config,
            rule,
            recorder,
            registry,
            cert_cache,
            pool,
            metrics,
            local_hosts,
            local_handler,
            upstream_tls,
            request_ids: AtomicU64::new(0),
        }
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.request_ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn is_local(&self, host: &str, port: u16) -> bool {
        self.local_hosts
            .contains(&format!("{}:{}", host.to_ascii_lowercase(), port))
    }

    fn emit_record(&self, id: u64, request: &ProxyRequest, status: Option<u16>) {
        if let Some(recorder) = &self.recorder {
            recorder.emit_update(&RequestRecord {
                id,
                method: request.method.clone(),
                scheme: request.scheme,
                host: request.host.clone(),
                port: request.port,
                path: request.path.clone(),
                status,
            });
        }
    }

    fn emit_record_body(&self, id: u64, chunk: &[u8]) {
        if let Some(recorder) = &self.recorder {
            recorder.emit_update_body(id, chunk);
        }
    }
}

/// Where a stream entered the dispatcher from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StreamOrigin {
    /// The outer proxy port (plain or TLS-wrapped). CONNECT is legal.
    Outer,
    /// Decrypted stream from the MITM pool; requests are https and the
    /// hostname comes from the client's SNI.
    Intercepted { hostname: String },
}

enum Next {
    KeepAlive,
    Close,
}

/// Drive one client stream until it closes. Requests are processed
/// strictly in arrival order.
pub(crate) async fn serve_connection<R, S>(
    shared: Arc<Shared<R>>,
    stream: S,
    origin: StreamOrigin,
) -> io::Result<()>
where
    R: Rule,
    S: AsyncStream,
{
    let mut conn = BufferedConn::new(stream);
    let mut upstream: Option<UpstreamSession> = None;

    loop {
        let raw = match conn
            .read_until(HEAD_TERMINATOR, shared.config.max_head_bytes)
            .await
        {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(()),
            Err(error) => {
                if error.kind() == io::ErrorKind::InvalidData {
                    let _ = write_simple_response(
                        &mut conn.stream,
                        "400 Bad Request",
                        "request head too large",
                    )
                    .await;
                }
                return Ok(());
            }
        };

        let head = match parse_request_head(&raw) {
            Ok(head) => head,
            Err(error) => {
                tracing::debug!(%error, "rejecting malformed request head");
                let _ = write_simple_response(&mut conn.stream, "400 Bad Request", "malformed request")
                    .await;
                return Ok(());
            }
        };

        if head.method.eq_ignore_ascii_case("CONNECT") {
            return match &origin {
                StreamOrigin::Outer => handle_connect(shared, conn, head).await,
                StreamOrigin::Intercepted { .. } => {
                    write_simple_response(
                        &mut conn.stream,
                        "400 Bad Request",
                        "CONNECT is not valid inside an intercepted stream",
                    )
                    .await
                }
            };
        }

        if is_websocket_upgrade(&head) {
            return handle_upgrade(shared, conn, head, &origin).await;
        }

        match handle_request(&shared, &mut conn, head, &origin, &mut upstream).await? {
            Next::KeepAlive => continue,
            Next::Close => return Ok(()),
        }
    }
}

struct UpstreamSession {
    key: (Scheme, String, u16),
    conn: BufferedConn<Box<dyn AsyncStream>>,
    _guard: crate::registry::SocketGuard,
}

async fn handle_request<R, S>(
    shared: &Arc<Shared<R>>,
    conn: &mut BufferedConn<S>,
    head: RequestHead,
    origin: &StreamOrigin,
    upstream_slot: &mut Option<UpstreamSession>,
) -> io::Result<Next>
where
    R: Rule,
    S: AsyncStream,
{
    let target = match resolve_target(&head, origin) {
        Ok(target) => target,
        Err(detail) => {
            tracing::debug!(%detail, "rejecting unroutable request");
            write_simple_response(&mut conn.stream, "400 Bad Request", &detail).await?;
            return Ok(Next::Close);
        }
    };

    let request_close = head.close;
    let body_plan = capture_or_plan(conn, head.body, shared.config.max_body_buffer_bytes).await?;
    let request_body_streamed = matches!(body_plan, BodyPlan::Streamed(_));

    let mut request = ProxyRequest {
        method: head.method,
        scheme: target.scheme,
        host: target.host,
        port: target.port,
        path: target.path,
        version: head.version,
        headers: head.headers,
        body: match &body_plan {
            BodyPlan::Captured(bytes) => Some(bytes.clone()),
            BodyPlan::Streamed(_) => None,
        },
    };

    // Requests for the proxy's own addresses never leave the process.
    if shared.is_local(&request.host, request.port) {
        let response = match &shared.local_handler {
            Some(handler) => handler(&request),
            None => ProxyResponse::synthetic(200, "OK", "marten proxy is running"),
        };
        write_full_response(&mut conn.stream, &response).await?;
        return Ok(if request_close { Next::Close } else { Next::KeepAlive });
    }

    let record_id = shared.next_request_id();
    shared.emit_record(record_id, &request, None);

    shared.rule.before_send_request(&mut request).await;

    let key = (request.scheme, request.host.clone(), request.port);
    let mut session = match upstream_slot.take() {
        Some(session) if session.key == key => session,
        _ => match connect_upstream(shared, &request).await {
            Ok(session) => session,
            Err(error) => {
                respond_with_error(shared, &mut conn.stream, &request, error).await?;
                return Ok(Next::Close);
            }
        },
    };

    let head_bytes = serialize_request_head(&request, request_body_streamed);
    let forwarded: io::Result<()> = async {
        session.conn.stream.write_all(&head_bytes).await?;
        match body_plan {
            BodyPlan::Captured(_) => {
                if let Some(body) = &request.body {
                    if !body.is_empty() {
                        session.conn.stream.write_all(body).await?;
                    }
                }
            }
            BodyPlan::Streamed(mode) => {
                let mut observe = |_chunk: &[u8]| {};
                relay_body(conn, &mut session.conn.stream, mode, &mut observe).await?;
            }
        }
        Ok(())
    }
    .await;
    if let Err(error) = forwarded {
        let error = ProxyError::UpstreamConnectFailed(format!(
            "writing request to {}:{} failed: {error}",
            request.host, request.port
        ));
        respond_with_error(shared, &mut conn.stream, &request, error).await?;
        return Ok(Next::Close);
    }

    let response_raw = match timeout(
        shared.config.upstream_read_timeout,
        session
            .conn
            .read_until(HEAD_TERMINATOR, shared.config.max_head_bytes),
    )
    .await
    {
        Err(_) => {
            let error = ProxyError::UpstreamTimeout(format!(
                "no response from {}:{} within {:?}",
                request.host, request.port, shared.config.upstream_read_timeout
            ));
            respond_with_error(shared, &mut conn.stream, &request, error).await?;
            return Ok(Next::Close);
        }
        Ok(Ok(Some(raw))) => raw,
        Ok(Ok(None)) | Ok(Err(_)) => {
            let error = ProxyError::UpstreamConnectFailed(format!(
                "{}:{} closed before sending response headers",
                request.host, request.port
            ));
            respond_with_error(shared, &mut conn.stream, &request, error).await?;
            return Ok(Next::Close);
        }
    };

    let response_head = match parse_response_head(&response_raw, &request.method) {
        Ok(head) => head,
        Err(error) => {
            let error =
                ProxyError::UpstreamConnectFailed(format!("invalid upstream response: {error}"));
            respond_with_error(shared, &mut conn.stream, &request, error).await?;
            return Ok(Next::Close);
        }
    };
    let upstream_close = response_head.close;

    let response_plan = match response_head.body {
        BodyMode::Sized(length) if length <= shared.config.max_body_buffer_bytes as u64 => {
            match timeout(
                shared.config.upstream_read_timeout,
                session.conn.read_exact_buffered(length as usize),
            )
            .await
            {
                Err(_) => {
                    let error = ProxyError::UpstreamTimeout(format!(
                        "response body from {}:{} stalled",
                        request.host, request.port
                    ));
                    respond_with_error(shared, &mut conn.stream, &request, error).await?;
                    return Ok(Next::Close);
                }
                Ok(Err(error)) => {
                    let error = ProxyError::UpstreamConnectFailed(format!(
                        "reading response body failed: {error}"
                    ));
                    respond_with_error(shared, &mut conn.stream, &request, error).await?;
                    return Ok(Next::Close);
                }
                Ok(Ok(body)) => BodyPlan::Captured(Bytes::from(body)),
            }
        }
        BodyMode::Empty => BodyPlan::Captured(Bytes::new()),
        other => BodyPlan::Streamed(other),
    };
    let response_body_streamed = matches!(response_plan, BodyPlan::Streamed(_));

    let mut response = ProxyResponse {
        status: response_head.status,
        reason: response_head.reason,
        headers: response_head.headers,
        body: match &response_plan {
            BodyPlan::Captured(bytes) => Some(bytes.clone()),
            BodyPlan::Streamed(_) => None,
        },
    };
    shared.rule.before_send_response(&request, &mut response).await;
    shared.emit_record(record_id, &request, Some(response.status));

    let client_head = serialize_response_head(&response, response_body_streamed);
    if let Err(error) = conn.stream.write_all(&client_head).await {
        shared.metrics.record_client_abort();
        return Err(error);
    }
    match response_plan {
        BodyPlan::Captured(_) => {
            if let Some(body) = &response.body {
                if !body.is_empty() {
                    if let Err(error) = conn.stream.write_all(body).await {
                        shared.metrics.record_client_abort();
                        return Err(error);
                    }
                    shared.emit_record_body(record_id, body);
                }
            }
        }
        BodyPlan::Streamed(mode) => {
            let recorder = shared.recorder.clone();
            let mut observe = |chunk: &[u8]| {
                if let Some(recorder) = &recorder {
                    recorder.emit_update_body(record_id, chunk);
                }
            };
            if let Err(error) = relay_body(&mut session.conn, &mut conn.stream, mode, &mut observe).await {
                shared.metrics.record_client_abort();
                return Err(error);
            }
        }
    }

    if !upstream_close {
        *upstream_slot = Some(session);
    }
    Ok(if request_close || upstream_close {
        Next::Close
    } else {
        Next::KeepAlive
    })
}

async fn handle_connect<R, S>(
    shared: Arc<Shared<R>>,
    mut conn: BufferedConn<S>,
    head: RequestHead,
) -> io::Result<()>
where
    R: Rule,
    S: AsyncStream,
{
    let Some((host, port)) = parse_connect_target(&head.target) else {
        write_simple_response(&mut conn.stream, "400 Bad Request", "invalid CONNECT target").await?;
        return Ok(());
    };

    // Loop safety: never open an outbound socket back to ourselves.
    if shared.is_local(&host, port) {
        tracing::warn!(%host, port, "blocked CONNECT to the proxy's own address");
        write_simple_response(
            &mut conn.stream,
            "400 Bad Request",
            "CONNECT target is the proxy itself",
        )
        .await?;
        return Ok(());
    }

    let intercept = if shared.config.force_proxy_https {
        true
    } else {
        shared.rule.before_deal_https_request(&host, port).await
    };

    // Bytes the client pipelined after the CONNECT head (usually the
    // start of its TLS hello) must reach the other side.
    let leftover = conn.take_leftover();

    if intercept {
        let pool_addr = match shared.pool.listener_addr(&shared, &host).await {
            Ok(addr) => addr,
            Err(error) => {
                shared.rule.on_connect_error(&host, port, &error);
                write_simple_response(&mut conn.stream, error.response_status(), &error.to_string())
                    .await?;
                return Ok(());
            }
        };
        conn.stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        let mut splice = match TcpStream::connect(pool_addr).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::debug!(%error, "splice into the MITM listener failed");
                return Ok(());
            }
        };
        let Some((_, _guard)) = shared
            .registry
            .register(SocketKind::Upstream, format!("mitm:{host}:{port}"))
        else {
            return Ok(());
        };
        if !leftover.is_empty() {
            splice.write_all(&leftover).await?;
        }
        let _ = tokio::io::copy_bidirectional(&mut conn.stream, &mut splice).await;
        Ok(())
    } else {
        let mut upstream = match timeout(
            shared.config.connect_timeout,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => {
                let error = ProxyError::UpstreamConnectFailed(format!("{host}:{port}: {error}"));
                shared.rule.on_connect_error(&host, port, &error);
                shared.metrics.record_upstream_connect_error();
                write_simple_response(&mut conn.stream, "502 Bad Gateway", &error.to_string())
                    .await?;
                return Ok(());
            }
            Err(_) => {
                let error = ProxyError::UpstreamConnectFailed(format!(
                    "{host}:{port}: connect timed out"
                ));
                shared.rule.on_connect_error(&host, port, &error);
                shared.metrics.record_upstream_connect_error();
                write_simple_response(&mut conn.stream, "502 Bad Gateway", &error.to_string())
                    .await?;
                return Ok(());
            }
        };
        let Some((_, _guard)) = shared
            .registry
            .register(SocketKind::Upstream, format!("{host}:{port}"))
        else {
            return Ok(());
        };
        conn.stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        if !leftover.is_empty() {
            upstream.write_all(&leftover).await?;
        }
        if let Err(error) = tokio::io::copy_bidirectional(&mut conn.stream, &mut upstream).await {
            tracing::debug!(%error, "tunnel relay ended with an error");
        }
        Ok(())
    }
}

async fn handle_upgrade<R, S>(
    shared: Arc<Shared<R>>,
    mut conn: BufferedConn<S>,
    head: RequestHead,
    origin: &StreamOrigin,
) -> io::Result<()>
where
    R: Rule,
    S: AsyncStream,
{
    let target = match resolve_target(&head, origin) {
        Ok(target) => target,
        Err(detail) => {
            write_simple_response(&mut conn.stream, "400 Bad Request", &detail).await?;
            return Ok(());
        }
    };
    if shared.is_local(&target.host, target.port) {
        write_simple_response(
            &mut conn.stream,
            "400 Bad Request",
            "upgrade target is the proxy itself",
        )
        .await?;
        return Ok(());
    }

    let request = ProxyRequest {
        method: head.method,
        scheme: target.scheme,
        host: target.host,
        port: target.port,
        path: target.path,
        version: head.version,
        headers: head.headers,
        body: None,
    };

    let mut session = match connect_upstream(&shared, &request).await {
        Ok(session) => session,
        Err(error) => {
            respond_with_error(&shared, &mut conn.stream, &request, error).await?;
            return Ok(());
        }
    };

    // Forward the upgrade head with its handshake headers intact.
    let head_bytes = serialize_request_head(&request, true);
    session.conn.stream.write_all(&head_bytes).await?;

    let response_raw = match timeout(
        shared.config.upstream_read_timeout,
        session
            .conn
            .read_until(HEAD_TERMINATOR, shared.config.max_head_bytes),
    )
    .await
    {
        Err(_) => {
            let error = ProxyError::UpstreamTimeout(format!(
                "no upgrade response from {}:{}",
                request.host, request.port
            ));
            respond_with_error(&shared, &mut conn.stream, &request, error).await?;
            return Ok(());
        }
        Ok(Ok(Some(raw))) => raw,
        Ok(Ok(None)) | Ok(Err(_)) => {
            let error = ProxyError::UpstreamConnectFailed(format!(
                "{}:{} closed during the upgrade handshake",
                request.host, request.port
            ));
            respond_with_error(&shared, &mut conn.stream, &request, error).await?;
            return Ok(());
        }
    };
    let response_head = match parse_response_head(&response_raw, "GET") {
        Ok(head) => head,
        Err(error) => {
            let error =
                ProxyError::UpstreamConnectFailed(format!("invalid upgrade response: {error}"));
            respond_with_error(&shared, &mut conn.stream, &request, error).await?;
            return Ok(());
        }
    };

    conn.stream.write_all(&response_head.raw).await?;
    if response_head.status != 101 {
        let mut observe = |_chunk: &[u8]| {};
        let _ = relay_body(
            &mut session.conn,
            &mut conn.stream,
            response_head.body,
            &mut observe,
        )
        .await;
        return Ok(());
    }

    let client_stream = Prefixed::new(conn.take_leftover(), conn.stream);
    let upstream_leftover = session.conn.take_leftover();
    let upstream_stream = Prefixed::new(upstream_leftover, session.conn.stream);
    crate::websocket::bridge(shared.rule.as_ref(), client_stream, upstream_stream).await
}

async fn connect_upstream<R: Rule>(
    shared: &Arc<Shared<R>>,
    request: &ProxyRequest,
) -> Result<UpstreamSession, ProxyError> {
    let host = request.host.clone();
    let port = request.port;

    let tcp = match timeout(
        shared.config.connect_timeout,
        TcpStream::connect((host.as_str(), port)),
    )
    .await
    {
        Ok(Ok(tcp)) => tcp,
        Ok(Err(error)) => {
            return Err(ProxyError::UpstreamConnectFailed(format!(
                "{host}:{port}: {error}"
            )))
        }
        Err(_) => {
            return Err(ProxyError::UpstreamConnectFailed(format!(
                "{host}:{port}: connect timed out"
            )))
        }
    };

    let Some((_, guard)) = shared
        .registry
        .register(SocketKind::Upstream, format!("{host}:{port}"))
    else {
        return Err(ProxyError::UpstreamConnectFailed(
            "proxy is shutting down".to_string(),
        ));
    };

    let stream: Box<dyn AsyncStream> = match request.scheme {
        Scheme::Http => Box::new(tcp),
        Scheme::Https => {
            let server_name = ServerName::try_from(host.clone()).map_err(|_| {
                ProxyError::UpstreamConnectFailed(format!("invalid upstream server name {host}"))
            })?;
            let connector = TlsConnector::from(Arc::clone(&shared.upstream_tls));
            match timeout(shared.config.connect_timeout, connector.connect(server_name, tcp)).await
            {
                Ok(Ok(tls)) => Box::new(tls),
                Ok(Err(error)) => {
                    return Err(ProxyError::UpstreamConnectFailed(format!(
                        "TLS handshake with {host}:{port} failed: {error}"
                    )))
                }
                Err(_) => {
                    return Err(ProxyError::UpstreamConnectFailed(format!(
                        "TLS handshake with {host}:{port} timed out"
                    )))
                }
            }
        }
    };

    Ok(UpstreamSession {
        key: (request.scheme, host, port),
        conn: BufferedConn::new(stream),
        _guard: guard,
    })
}

/// Consult `on_error` first, then fall back to the built-in status for
/// the error kind.
async fn respond_with_error<R: Rule, W: AsyncWrite + Unpin>(
    shared: &Arc<Shared<R>>,
    stream: &mut W,
    request: &ProxyRequest,
    error: ProxyError,
) -> io::Result<()> {
    match &error {
        ProxyError::UpstreamConnectFailed(_) => shared.metrics.record_upstream_connect_error(),
        ProxyError::UpstreamTimeout(_) => shared.metrics.record_upstream_timeout(),
        _ => {}
    }
    tracing::debug!(%error, host = %request.host, "request failed");
    if let Some(response) = shared.rule.on_error(request, &error).await {
        write_full_response(stream, &response).await
    } else {
        write_simple_response(stream, error.response_status(), &error.to_string()).await
    }
}

async fn write_full_response<W: AsyncWrite + Unpin>(
    stream: &mut W,
    response: &ProxyResponse,
) -> io::Result<()> {
    let head = serialize_response_head(response, false);
    stream.write_all(&head).await?;
    if let Some(body) = &response.body {
        if !body.is_empty() {
            stream.write_all(body).await?;
        }
    }
    Ok(())
}

/// Rebuild an outgoing request head from the (possibly rewritten) rule
/// view. Captured bodies get a recomputed Content-Length; streamed ones
/// keep their framing headers verbatim. `Proxy-Connection` never leaves
/// the proxy.
fn serialize_request_head(request: &ProxyRequest, streamed: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(request.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(request.path.as_bytes());
    out.push(b' ');
    out.extend_from_slice(request.version.as_str().as_bytes());
    out.extend_from_slice(b"\r\n");

    let had_framing = header_value(&request.headers, "content-length").is_some()
        || header_value(&request.headers, "transfer-encoding").is_some();
    for header in &request.headers {
        if header.name.eq_ignore_ascii_case("proxy-connection") {
            continue;
        }
        if !streamed
            && (header.name.eq_ignore_ascii_case("content-length")
                || header.name.eq_ignore_ascii_case("transfer-encoding"))
        {
            continue;
        }
        out.extend_from_slice(header.name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(header.value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if !streamed {
        let body_len = request.body.as_ref().map(Bytes::len).unwrap_or(0);
        if body_len > 0 || had_framing {
            out.extend_from_slice(format!("Content-Length: {body_len}\r\n").as_bytes());
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn serialize_response_head(response: &ProxyResponse, streamed: bool) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {} {}\r\n", response.status, response.reason).into_bytes();

    let had_framing = header_value(&response.headers, "content-length").is_some()
        || header_value(&response.headers, "transfer-encoding").is_some();
    for header in &response.headers {
        if !streamed
            && (header.name.eq_ignore_ascii_case("content-length")
                || header.name.eq_ignore_ascii_case("transfer-encoding"))
        {
            continue;
        }
        out.extend_from_slice(header.name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(header.value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if !streamed {
        let body_len = response.body.as_ref().map(Bytes::len).unwrap_or(0);
        if body_len > 0 || had_framing {
            out.extend_from_slice(format!("Content-Length: {body_len}\r\n").as_bytes());
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}

pub(crate) struct RequestTarget {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// Resolve where a non-CONNECT request is headed: absolute-form
/// authority first, else the Host header; intercepted streams are https
/// to the SNI hostname, with the Host header consulted only for an
/// explicit port.
pub(crate) fn resolve_target(
    head: &RequestHead,
    origin: &StreamOrigin,
) -> Result<RequestTarget, String> {
    match origin {
        StreamOrigin::Intercepted { hostname } => {
            let port = header_value(&head.headers, "host")
                .and_then(|value| value.parse::<http::uri::Authority>().ok())
                .and_then(|authority| authority.port_u16())
                .unwrap_or(443);
            Ok(RequestTarget {
                scheme: Scheme::Https,
                host: hostname.clone(),
                port,
                path: origin_form_path(&head.target),
            })
        }
        StreamOrigin::Outer => {
            if head.target.contains("://") {
                let uri: Uri = head
                    .target
                    .parse()
                    .map_err(|_| "request target was not a valid URI".to_string())?;
                match uri.scheme_str() {
                    Some("http") | Some("ws") => {}
                    Some("https") | Some("wss") => {
                        return Err("encrypted absolute-form requires CONNECT".to_string());
                    }
                    _ => return Err("unsupported request scheme".to_string()),
                }
                let host = uri
                    .host()
                    .ok_or_else(|| "absolute URI is missing a host".to_string())?
                    .to_string();
                Ok(RequestTarget {
                    scheme: Scheme::Http,
                    port: uri.port_u16().unwrap_or(80),
                    path: uri
                        .path_and_query()
                        .map(|pq| pq.as_str().to_string())
                        .unwrap_or_else(|| "/".to_string()),
                    host,
                })
            } else {
                let host_header = header_value(&head.headers, "host").ok_or_else(|| {
                    "request had neither an absolute URI nor a Host header".to_string()
                })?;
                let authority: http::uri::Authority = host_header
                    .parse()
                    .map_err(|_| "invalid Host header".to_string())?;
                Ok(RequestTarget {
                    scheme: Scheme::Http,
                    host: authority.host().to_string(),
                    port: authority.port_u16().unwrap_or(80),
                    path: origin_form_path(&head.target),
                })
            }
        }
    }
}

fn origin_form_path(target: &str) -> String {
    if target.starts_with('/') || target == "*" {
        return target.to_string();
    }
    target
        .parse::<Uri>()
        .ok()
        .and_then(|uri| uri.path_and_query().map(|pq| pq.as_str().to_string()))
        .unwrap_or_else(|| "/".to_string())
}

/// Parse a CONNECT request target. The port defaults to 443.
pub fn parse_connect_target(target: &str) -> Option<(String, u16)> {
    let target = target.trim();
    if target.is_empty() {
        return None;
    }

    // Bracketed IPv6: [::1] or [::1]:8443
    if let Some(rest) = target.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        if host.is_empty() {
            return None;
        }
        let port = match tail.strip_prefix(':') {
            Some(port_text) => port_text.parse::<u16>().ok().filter(|port| *port != 0)?,
            None if tail.is_empty() => 443,
            None => return None,
        };
        return Some((host.to_string(), port));
    }

    match target.rsplit_once(':') {
        Some((host, port_text)) if !host.contains(':') => {
            if host.is_empty() {
                return None;
            }
            let port = port_text.parse::<u16>().ok().filter(|port| *port != 0)?;
            Some((host.to_string(), port))
        }
        // More than one colon without brackets: bare IPv6 literal.
        Some(_) => Some((target.to_string(), 443)),
        None => Some((target.to_string(), 443)),
    }
}

fn build_upstream_client_config(verify: bool) -> Arc<ClientConfig> {
    let mut config = if verify {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureUpstreamVerifier))
            .with_no_client_auth()
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Accepts any upstream chain; behind `verify_upstream_tls = false` for
/// self-signed origins.
#[derive(Debug)]
struct InsecureUpstreamVerifier;

impl ServerCertVerifier for InsecureUpstreamVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_connect_target, resolve_target, StreamOrigin};
    use crate::http1::parse_request_head;
    use crate::rule::Scheme;

    #[test]
    fn connect_targets_default_to_port_443() {
        assert_eq!(
            parse_connect_target("example.com"),
            Some(("example.com".to_string(), 443))
        );
        assert_eq!(
            parse_connect_target("example.com:8443"),
            Some(("example.com".to_string(), 8443))
        );
        assert_eq!(
            parse_connect_target("[::1]:9000"),
            Some(("::1".to_string(), 9000))
        );
        assert_eq!(parse_connect_target("[::1]"), Some(("::1".to_string(), 443)));
    }

    #[test]
    fn garbage_connect_targets_are_rejected() {
        assert_eq!(parse_connect_target(""), None);
        assert_eq!(parse_connect_target(":443"), None);
        assert_eq!(parse_connect_target("example.com:0"), None);
        assert_eq!(parse_connect_target("example.com:notaport"), None);
        assert_eq!(parse_connect_target("example.com:70000"), None);
    }

    #[test]
    fn absolute_form_beats_the_host_header() {
        let head = parse_request_head(
            b"GET http://origin.example:8080/a?b=1 HTTP/1.1\r\nHost: other.example\r\n\r\n",
        )
        .expect("parse");
        let target = resolve_target(&head, &StreamOrigin::Outer).expect("resolve");
        assert_eq!(target.scheme, Scheme::Http);
        assert_eq!(target.host, "origin.example");
        assert_eq!(target.port, 8080);
        assert_eq!(target.path, "/a?b=1");
    }

    #[test]
    fn origin_form_uses_the_host_header() {
        let head = parse_request_head(b"GET /x HTTP/1.1\r\nHost: origin.example\r\n\r\n")
            .expect("parse");
        let target = resolve_target(&head, &StreamOrigin::Outer).expect("resolve");
        assert_eq!(target.host, "origin.example");
        assert_eq!(target.port, 80);
        assert_eq!(target.path, "/x");
    }

    #[test]
    fn missing_host_and_relative_target_is_unroutable() {
        let head = parse_request_head(b"GET /x HTTP/1.1\r\n\r\n").expect("parse");
        assert!(resolve_target(&head, &StreamOrigin::Outer).is_err());
    }

    #[test]
    fn https_absolute_form_requires_connect() {
        let head = parse_request_head(
            b"GET https://secure.example/ HTTP/1.1\r\nHost: secure.example\r\n\r\n",
        )
        .expect("parse");
        assert!(resolve_target(&head, &StreamOrigin::Outer).is_err());
    }

    #[test]
    fn intercepted_streams_inject_the_sni_hostname() {
        let head = parse_request_head(b"GET /x HTTP/1.1\r\nHost: api.example.com:8443\r\n\r\n")
            .expect("parse");
        let origin = StreamOrigin::Intercepted {
            hostname: "api.example.com".to_string(),
        };
        let target = resolve_target(&head, &origin).expect("resolve");
        assert_eq!(target.scheme, Scheme::Https);
        assert_eq!(target.host, "api.example.com");
        assert_eq!(target.port, 8443);

        let head = parse_request_head(b"GET /x HTTP/1.1\r\nHost: api.example.com\r\n\r\n")
            .expect("parse");
        let target = resolve_target(&head, &origin).expect("resolve");
        assert_eq!(target.port, 443);
    }
}
