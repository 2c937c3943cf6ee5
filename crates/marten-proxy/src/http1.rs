//! HTTP/1.x plumbing shared by the plain-proxy and intercepted request
//! paths: buffered head reading, start-line/header parsing, and the
//! capture-or-stream body machinery.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

pub(crate) const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";
const IO_CHUNK: usize = 8 * 1024;
const CHUNK_LINE_LIMIT: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyMode {
    Empty,
    Sized(u64),
    Chunked,
    UntilClose,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub headers: Vec<HttpHeader>,
    pub body: BodyMode,
    pub close: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResponseHead {
    pub raw: Vec<u8>,
    pub version: HttpVersion,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<HttpHeader>,
    pub body: BodyMode,
    pub close: bool,
}

/// Byte stream plus whatever was read past the last parsed boundary.
pub(crate) struct BufferedConn<S> {
    pub stream: S,
    pub leftover: Vec<u8>,
}

impl<S> BufferedConn<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            leftover: Vec::new(),
        }
    }

    pub(crate) fn take_leftover(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.leftover)
    }
}

impl<S: AsyncRead + Unpin> BufferedConn<S> {
    /// Read until `pattern` is seen and drain through it. `Ok(None)`
    /// means the peer closed cleanly before sending anything.
    pub(crate) async fn read_until(
        &mut self,
        pattern: &[u8],
        limit: usize,
    ) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(start) = find_subsequence(&self.leftover, pattern) {
                let end = start + pattern.len();
                return Ok(Some(self.leftover.drain(..end).collect()));
            }
            if self.leftover.len() > limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "message head exceeded the configured limit",
                ));
            }

            let mut chunk = [0_u8; IO_CHUNK];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                if self.leftover.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before the message boundary",
                ));
            }
            self.leftover.extend_from_slice(&chunk[..read]);
        }
    }

    pub(crate) async fn read_exact_buffered(&mut self, len: usize) -> io::Result<Vec<u8>> {
        while self.leftover.len() < len {
            let mut chunk = [0_u8; IO_CHUNK];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before the body completed",
                ));
            }
            self.leftover.extend_from_slice(&chunk[..read]);
        }
        Ok(self.leftover.drain(..len).collect())
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn protocol_error(detail: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, detail.to_string())
}

pub(crate) fn parse_request_head(raw: &[u8]) -> io::Result<RequestHead> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| protocol_error("request head was not valid UTF-8"))?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| protocol_error("request line is missing"))?;

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| protocol_error("request method is missing"))?;
    let target = parts
        .next()
        .ok_or_else(|| protocol_error("request target is missing"))?;
    let version = parts
        .next()
        .ok_or_else(|| protocol_error("HTTP version is missing"))?;
    if parts.next().is_some() {
        return Err(protocol_error("request line had extra fields"));
    }
    let version = parse_version(version)?;

    let headers = parse_headers(lines)?;
    let body = request_body_mode(&headers)?;
    let close = wants_close(version, &headers);

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version,
        headers,
        body,
        close,
    })
}

pub(crate) fn parse_response_head(raw: &[u8], request_method: &str) -> io::Result<ResponseHead> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| protocol_error("response head was not valid UTF-8"))?;
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| protocol_error("status line is missing"))?;

    let mut parts = status_line.split_whitespace();
    let version = parse_version(
        parts
            .next()
            .ok_or_else(|| protocol_error("response version is missing"))?,
    )?;
    let status = parts
        .next()
        .ok_or_else(|| protocol_error("response status is missing"))?
        .parse::<u16>()
        .map_err(|_| protocol_error("response status was not numeric"))?;
    let reason = parts.collect::<Vec<_>>().join(" ");

    let headers = parse_headers(lines)?;
    let body = response_body_mode(&headers, request_method, status)?;
    let close = wants_close(version, &headers) || body == BodyMode::UntilClose;

    Ok(ResponseHead {
        raw: raw.to_vec(),
        version,
        status,
        reason,
        headers,
        body,
        close,
    })
}

fn parse_version(text: &str) -> io::Result<HttpVersion> {
    match text {
        "HTTP/1.0" => Ok(HttpVersion::Http10),
        "HTTP/1.1" => Ok(HttpVersion::Http11),
        _ => Err(protocol_error("only HTTP/1.0 and HTTP/1.1 are supported")),
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> io::Result<Vec<HttpHeader>> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| protocol_error("malformed header line"))?;
        headers.push(HttpHeader {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
        });
    }
    Ok(headers)
}

fn request_body_mode(headers: &[HttpHeader]) -> io::Result<BodyMode> {
    if has_header_token(headers, "transfer-encoding", "chunked") {
        return Ok(BodyMode::Chunked);
    }
    match content_length(headers)? {
        Some(0) | None => Ok(BodyMode::Empty),
        Some(length) => Ok(BodyMode::Sized(length)),
    }
}

fn response_body_mode(
    headers: &[HttpHeader],
    request_method: &str,
    status: u16,
) -> io::Result<BodyMode> {
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return Ok(BodyMode::Empty);
    }
    if has_header_token(headers, "transfer-encoding", "chunked") {
        return Ok(BodyMode::Chunked);
    }
    match content_length(headers)? {
        Some(0) => Ok(BodyMode::Empty),
        Some(length) => Ok(BodyMode::Sized(length)),
        None => Ok(BodyMode::UntilClose),
    }
}

fn content_length(headers: &[HttpHeader]) -> io::Result<Option<u64>> {
    let mut value = None;
    for header in headers {
        if header.name.eq_ignore_ascii_case("content-length") {
            let parsed = header
                .value
                .parse::<u64>()
                .map_err(|_| protocol_error("invalid Content-Length value"))?;
            value = Some(parsed);
        }
    }
    Ok(value)
}

pub(crate) fn has_header_token(headers: &[HttpHeader], name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|header| header.name.eq_ignore_ascii_case(name))
        .flat_map(|header| header.value.split(','))
        .any(|value| value.trim().eq_ignore_ascii_case(token))
}

pub(crate) fn header_value<'a>(headers: &'a [HttpHeader], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.as_str())
}

fn wants_close(version: HttpVersion, headers: &[HttpHeader]) -> bool {
    if has_header_token(headers, "connection", "close") {
        return true;
    }
    version == HttpVersion::Http10 && !has_header_token(headers, "connection", "keep-alive")
}

pub(crate) fn is_websocket_upgrade(head: &RequestHead) -> bool {
    head.method.eq_ignore_ascii_case("GET")
        && has_header_token(&head.headers, "connection", "upgrade")
        && header_value(&head.headers, "upgrade")
            .map(|value| value.trim().eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
}

/// Either the whole body captured for the rewrite hooks, or a decision
/// to stream it through verbatim.
pub(crate) enum BodyPlan {
    Captured(Bytes),
    Streamed(BodyMode),
}

/// Capture bodies with a known length that fit the budget; plan to
/// stream everything else.
pub(crate) async fn capture_or_plan<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    mode: BodyMode,
    budget: usize,
) -> io::Result<BodyPlan> {
    match mode {
        BodyMode::Empty => Ok(BodyPlan::Captured(Bytes::new())),
        BodyMode::Sized(length) if length <= budget as u64 => {
            let body = conn.read_exact_buffered(length as usize).await?;
            Ok(BodyPlan::Captured(Bytes::from(body)))
        }
        other => Ok(BodyPlan::Streamed(other)),
    }
}

/// Relay a body from `source` to `sink` without rewriting, invoking
/// `observe` with every payload chunk that passes.
pub(crate) async fn relay_body<R, W>(
    source: &mut BufferedConn<R>,
    sink: &mut W,
    mode: BodyMode,
    observe: &mut (dyn FnMut(&[u8]) + Send),
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match mode {
        BodyMode::Empty => Ok(0),
        BodyMode::Sized(length) => relay_exact(source, sink, length, observe).await,
        BodyMode::Chunked => relay_chunked(source, sink, observe).await,
        BodyMode::UntilClose => relay_until_eof(source, sink, observe).await,
    }
}

async fn relay_exact<R, W>(
    source: &mut BufferedConn<R>,
    sink: &mut W,
    mut length: u64,
    observe: &mut (dyn FnMut(&[u8]) + Send),
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0_u64;

    if !source.leftover.is_empty() && length > 0 {
        let take = std::cmp::min(length as usize, source.leftover.len());
        sink.write_all(&source.leftover[..take]).await?;
        observe(&source.leftover[..take]);
        source.leftover.drain(..take);
        length -= take as u64;
        total += take as u64;
    }

    let mut chunk = [0_u8; IO_CHUNK];
    while length > 0 {
        let want = std::cmp::min(IO_CHUNK as u64, length) as usize;
        let read = source.stream.read(&mut chunk[..want]).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before the body completed",
            ));
        }
        sink.write_all(&chunk[..read]).await?;
        observe(&chunk[..read]);
        length -= read as u64;
        total += read as u64;
    }
    Ok(total)
}

async fn relay_chunked<R, W>(
    source: &mut BufferedConn<R>,
    sink: &mut W,
    observe: &mut (dyn FnMut(&[u8]) + Send),
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0_u64;
    loop {
        let line = source
            .read_until(b"\r\n", CHUNK_LINE_LIMIT)
            .await?
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before the chunk size line",
                )
            })?;
        sink.write_all(&line).await?;
        let chunk_len = parse_chunk_len(&line)?;
        if chunk_len == 0 {
            // Trailer section ends with a bare CRLF.
            let trailers = source
                .read_until(b"\r\n", CHUNK_LINE_LIMIT)
                .await?
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed before the chunked trailers",
                    )
                })?;
            sink.write_all(&trailers).await?;
            if trailers.as_slice() != b"\r\n" {
                // Non-empty trailers: copy lines until the blank one.
                loop {
                    let line = source
                        .read_until(b"\r\n", CHUNK_LINE_LIMIT)
                        .await?
                        .ok_or_else(|| {
                            io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed inside chunked trailers",
                            )
                        })?;
                    sink.write_all(&line).await?;
                    if line.as_slice() == b"\r\n" {
                        break;
                    }
                }
            }
            return Ok(total);
        }

        total += relay_exact(source, sink, chunk_len, observe).await?;

        let terminator = source.read_exact_buffered(2).await?;
        if terminator.as_slice() != b"\r\n" {
            return Err(protocol_error("invalid chunk terminator"));
        }
        sink.write_all(&terminator).await?;
    }
}

async fn relay_until_eof<R, W>(
    source: &mut BufferedConn<R>,
    sink: &mut W,
    observe: &mut (dyn FnMut(&[u8]) + Send),
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0_u64;
    if !source.leftover.is_empty() {
        sink.write_all(&source.leftover).await?;
        observe(&source.leftover);
        total += source.leftover.len() as u64;
        source.leftover.clear();
    }

    let mut chunk = [0_u8; IO_CHUNK];
    loop {
        let read = source.stream.read(&mut chunk).await?;
        if read == 0 {
            return Ok(total);
        }
        sink.write_all(&chunk[..read]).await?;
        observe(&chunk[..read]);
        total += read as u64;
    }
}

fn parse_chunk_len(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| protocol_error("chunk size line was not valid UTF-8"))?;
    let trimmed = text.trim();
    let size_text = trimmed.split(';').next().unwrap_or(trimmed).trim();
    u64::from_str_radix(size_text, 16).map_err(|_| protocol_error("invalid chunk size"))
}

pub(crate) async fn write_simple_response<W: AsyncWrite + Unpin>(
    stream: &mut W,
    status: &str,
    body: &str,
) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await
}

/// Replays a prefix before reading from the inner stream; writes pass
/// straight through. Used to hand drained bytes to the WebSocket layer.
pub(crate) struct Prefixed<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> Prefixed<S> {
    pub(crate) fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let remaining = &this.prefix[this.offset..];
            let take = std::cmp::min(remaining.len(), buf.remaining());
            buf.put_slice(&remaining[..take]);
            this.offset += take;
            if this.offset == this.prefix.len() {
                this.prefix.clear();
                this.offset = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::{
        capture_or_plan, parse_request_head, parse_response_head, relay_body, BodyMode, BodyPlan,
        BufferedConn, HttpVersion, Prefixed,
    };

    #[test]
    fn parses_a_connect_request_line() {
        let head = parse_request_head(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .expect("parse CONNECT");
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.target, "example.com:443");
        assert_eq!(head.version, HttpVersion::Http11);
        assert_eq!(head.body, BodyMode::Empty);
    }

    #[test]
    fn request_body_mode_prefers_chunked_over_length() {
        let head = parse_request_head(
            b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .expect("parse");
        assert_eq!(head.body, BodyMode::Chunked);
    }

    #[test]
    fn response_without_length_is_close_delimited() {
        let head = parse_response_head(b"HTTP/1.1 200 OK\r\nX-Seen: 1\r\n\r\n", "GET")
            .expect("parse");
        assert_eq!(head.body, BodyMode::UntilClose);
        assert!(head.close);
    }

    #[test]
    fn head_responses_have_no_body() {
        let head = parse_response_head(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n", "HEAD")
            .expect("parse");
        assert_eq!(head.body, BodyMode::Empty);
    }

    #[test]
    fn malformed_heads_are_rejected() {
        assert!(parse_request_head(b"GET /\r\n\r\n").is_err());
        assert!(parse_request_head(b"GET / HTTP/2.0\r\n\r\n").is_err());
        assert!(parse_request_head(b"GET / HTTP/1.1\r\nno-colon-here\r\n\r\n").is_err());
        assert!(parse_response_head(b"HTTP/1.1 abc OK\r\n\r\n", "GET").is_err());
    }

    #[tokio::test]
    async fn small_sized_bodies_are_captured() {
        let payload: &[u8] = b"hello";
        let mut conn = BufferedConn::new(payload);
        let plan = capture_or_plan(&mut conn, BodyMode::Sized(5), 1024)
            .await
            .expect("capture");
        match plan {
            BodyPlan::Captured(body) => assert_eq!(&body[..], b"hello"),
            BodyPlan::Streamed(_) => panic!("expected captured body"),
        }
    }

    #[tokio::test]
    async fn oversize_bodies_fall_back_to_streaming() {
        let payload: &[u8] = b"hello";
        let mut conn = BufferedConn::new(payload);
        let plan = capture_or_plan(&mut conn, BodyMode::Sized(5), 4)
            .await
            .expect("plan");
        assert!(matches!(plan, BodyPlan::Streamed(BodyMode::Sized(5))));
    }

    #[tokio::test]
    async fn chunked_relay_preserves_wire_format_and_observes_payload() {
        let wire: &[u8] = b"5\r\nhello\r\n3\r\nabc\r\n0\r\n\r\n";
        let mut source = BufferedConn::new(wire);
        let mut sink = std::io::Cursor::new(Vec::new());
        let mut seen = Vec::new();
        let total = relay_body(&mut source, &mut sink, BodyMode::Chunked, &mut |chunk| {
            seen.extend_from_slice(chunk)
        })
        .await
        .expect("relay");
        assert_eq!(total, 8);
        assert_eq!(sink.into_inner(), wire);
        assert_eq!(seen, b"helloabc");
    }

    #[tokio::test]
    async fn prefixed_reader_replays_drained_bytes_first() {
        let rest: &[u8] = b" world";
        let mut prefixed = Prefixed::new(b"hello".to_vec(), rest);
        let mut out = String::new();
        prefixed.read_to_string(&mut out).await.expect("read");
        assert_eq!(out, "hello world");
    }
}
