use std::path::PathBuf;
use std::time::Duration;

use crate::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerType {
    Http,
    Https,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy listening port. Required and non-zero.
    pub port: u16,
    pub bind_host: String,
    /// Whether the proxy's own listening socket speaks TLS.
    pub server_type: ServerType,
    /// The proxy's own hostname; required when `server_type` is https.
    pub hostname: Option<String>,
    /// Intercept every CONNECT, bypassing the rule's decision hook.
    pub force_proxy_https: bool,
    /// Verify upstream TLS chains against the system roots. Turn off for
    /// self-signed upstreams.
    pub verify_upstream_tls: bool,
    /// Root CA directory; defaults to `$HOME/.marten/certificates`.
    pub cert_dir: Option<PathBuf>,
    pub connect_timeout: Duration,
    /// Idle cap on waiting for upstream response bytes.
    pub upstream_read_timeout: Duration,
    pub max_head_bytes: usize,
    /// Bodies with a known length up to this size are captured for the
    /// rewrite hooks; everything else streams through verbatim.
    pub max_body_buffer_bytes: usize,
    /// Per-proxy throttle setting. Validated but not enforced here;
    /// rate-limiting integration lives outside the core.
    pub throttle_kbps: Option<u64>,
    /// Additional `host` or `host:port` entries treated as this proxy's
    /// own addresses.
    pub extra_local_hosts: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 8001,
            bind_host: "127.0.0.1".to_string(),
            server_type: ServerType::Http,
            hostname: None,
            force_proxy_https: false,
            verify_upstream_tls: true,
            cert_dir: None,
            connect_timeout: Duration::from_secs(10),
            upstream_read_timeout: Duration::from_secs(120),
            max_head_bytes: 64 * 1024,
            max_body_buffer_bytes: 10 * 1024 * 1024,
            throttle_kbps: None,
            extra_local_hosts: Vec::new(),
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.port == 0 {
            return Err(ProxyError::ConfigInvalid(
                "port is required and must be greater than zero".to_string(),
            ));
        }
        if self.bind_host.trim().is_empty() {
            return Err(ProxyError::ConfigInvalid(
                "bind_host must not be empty".to_string(),
            ));
        }
        if self.server_type == ServerType::Https
            && self.hostname.as_deref().map_or(true, |h| h.trim().is_empty())
        {
            return Err(ProxyError::ConfigInvalid(
                "server_type https requires a hostname".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ProxyError::ConfigInvalid(
                "connect_timeout must be greater than zero".to_string(),
            ));
        }
        if self.upstream_read_timeout.is_zero() {
            return Err(ProxyError::ConfigInvalid(
                "upstream_read_timeout must be greater than zero".to_string(),
            ));
        }
        if self.max_head_bytes == 0 {
            return Err(ProxyError::ConfigInvalid(
                "max_head_bytes must be greater than zero".to_string(),
            ));
        }
        if self.max_body_buffer_bytes == 0 {
            return Err(ProxyError::ConfigInvalid(
                "max_body_buffer_bytes must be greater than zero".to_string(),
            ));
        }
        if matches!(self.throttle_kbps, Some(0)) {
            return Err(ProxyError::ConfigInvalid(
                "throttle_kbps must be greater than zero when set".to_string(),
            ));
        }
        Ok(())
    }
}
