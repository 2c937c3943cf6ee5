use marten_tls::CertIssueError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("root certificate authority unavailable: {0}")]
    CaUnavailable(String),
    #[error("leaf certificate issuance failed: {0}")]
    CertIssueFailed(#[from] CertIssueError),
    #[error("upstream connect failed: {0}")]
    UpstreamConnectFailed(String),
    #[error("upstream timed out: {0}")]
    UpstreamTimeout(String),
    #[error("client aborted: {0}")]
    ClientAborted(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("CONNECT target resolves to this proxy: {0}")]
    LocalLoopBlocked(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ProxyError {
    /// Exit code a CLI host should map a startup failure to: validation
    /// problems exit 1, bind failures exit 2. The core itself never
    /// exits the process.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Io(_) => 2,
            _ => 1,
        }
    }

    /// HTTP status written to the client when this error fails a single
    /// request rather than the whole proxy.
    pub(crate) fn response_status(&self) -> &'static str {
        match self {
            Self::UpstreamTimeout(_) => "504 Gateway Timeout",
            Self::ProtocolViolation(_) | Self::LocalLoopBlocked(_) => "400 Bad Request",
            _ => "502 Bad Gateway",
        }
    }
}
