use std::future::Future;

use bytes::Bytes;
use tokio_tungstenite::tungstenite::Message;

use crate::http1::{header_value, HttpHeader, HttpVersion};
use crate::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsDirection {
    ClientToServer,
    ServerToClient,
}

/// Request view handed to the rule hooks. Rewrites to method, target,
/// headers and the captured body flow through to the upstream exchange.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: String,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub version: HttpVersion,
    pub headers: Vec<HttpHeader>,
    /// Captured body; `None` when the body is streamed past the hooks.
    pub body: Option<Bytes>,
}

impl ProxyRequest {
    pub fn is_https(&self) -> bool {
        self.scheme == Scheme::Https
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        for header in &mut self.headers {
            if header.name.eq_ignore_ascii_case(name) {
                header.value = value.to_string();
                return;
            }
        }
        self.headers.push(HttpHeader {
            name: name.to_string(),
            value: value.to_string(),
        });
    }
}

#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<HttpHeader>,
    /// Captured body; `None` when the body is streamed past the hooks.
    pub body: Option<Bytes>,
}

impl ProxyResponse {
    /// Small synthesized response, the shape `on_error` hooks return.
    pub fn synthetic(status: u16, reason: &str, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            reason: reason.to_string(),
            headers: vec![HttpHeader {
                name: "Content-Type".to_string(),
                value: "text/plain".to_string(),
            }],
            body: Some(body.into()),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        for header in &mut self.headers {
            if header.name.eq_ignore_ascii_case(name) {
                header.value = value.to_string();
                return;
            }
        }
        self.headers.push(HttpHeader {
            name: name.to_string(),
            value: value.to_string(),
        });
    }
}

/// Externally supplied traffic policy. Every hook has a no-op default;
/// implement the subset you need. Hooks receive borrowed views and
/// cannot retain them past the call.
pub trait Rule: Send + Sync + 'static {
    /// Label for logging.
    fn summary(&self) -> String {
        "default rule".to_string()
    }

    fn before_send_request(
        &self,
        _request: &mut ProxyRequest,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn before_send_response(
        &self,
        _request: &ProxyRequest,
        _response: &mut ProxyResponse,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Decide whether a CONNECT to `host:port` is intercepted. Ignored
    /// when `force_proxy_https` is configured.
    fn before_deal_https_request(
        &self,
        _host: &str,
        _port: u16,
    ) -> impl Future<Output = bool> + Send {
        async { false }
    }

    /// Synthesize a response when the upstream exchange fails. `None`
    /// falls back to the built-in 502/504.
    fn on_error(
        &self,
        _request: &ProxyRequest,
        _error: &ProxyError,
    ) -> impl Future<Output = Option<ProxyResponse>> + Send {
        async { None }
    }

    /// Observability only; fires when a CONNECT tunnel or splice fails.
    fn on_connect_error(&self, _host: &str, _port: u16, _error: &ProxyError) {}

    /// May transform relayed WebSocket messages in either direction.
    fn on_websocket_message(
        &self,
        _direction: WsDirection,
        _message: &mut Message,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Pass-through rule: no interception, no rewrites.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRule;

impl Rule for DefaultRule {}
