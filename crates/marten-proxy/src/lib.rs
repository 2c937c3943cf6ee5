//! marten-proxy: an intercepting HTTP/HTTPS/WebSocket forward proxy.
//!
//! A [`Proxy`] accepts client connections on one port and, per request,
//! either forwards plain HTTP, tunnels CONNECT traffic opaquely, or
//! terminates TLS with a leaf minted by `marten-tls` and re-enters the
//! request path on the decrypted stream. Behavior is customized through
//! the [`Rule`] collaborator; traffic is reported to a [`Recorder`].

mod config;
mod dispatcher;
mod errors;
mod events;
mod http1;
mod metrics;
mod mitm_pool;
mod proxy;
mod recorder;
mod registry;
mod rule;
mod websocket;

pub use config::{ProxyConfig, ServerType};
pub use dispatcher::{parse_connect_target, LocalHandler};
pub use errors::ProxyError;
pub use events::ProxyEvent;
pub use http1::{HttpHeader, HttpVersion};
pub use metrics::ProxyMetrics;
pub use proxy::{Proxy, ProxyBuilder, ProxyHandle, ProxyStatus, ProxyStatusHandle};
pub use recorder::{Recorder, RequestRecord};
pub use rule::{DefaultRule, ProxyRequest, ProxyResponse, Rule, Scheme, WsDirection};

/// Re-exported message type seen by the WebSocket rule hook.
pub use tokio_tungstenite::tungstenite::Message as WsMessage;
