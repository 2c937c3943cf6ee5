//! Certificate plumbing for the marten intercepting proxy: the on-disk
//! root CA, per-host leaf issuance, the single-flight leaf cache and the
//! OS trust-store probe.

use std::path::PathBuf;

use thiserror::Error;

mod ca_store;
mod cert_cache;
mod leaf;
mod trust;

pub use ca_store::{CaStore, CaSubject, RootCa, ROOT_CERT_FILE, ROOT_KEY_FILE};
pub use cert_cache::{CertCache, CertCacheMetrics};
pub use leaf::{sign_leaf, LeafCert};
pub use trust::{install_trust, trust_status, uninstall_trust, TrustStatus};

#[derive(Debug, Error)]
pub enum CaError {
    #[error("root CA material already exists at {path} (pass overwrite to replace it)")]
    AlreadyExists { path: PathBuf },
    #[error("root CA files are missing from {dir}")]
    Missing { dir: PathBuf },
    #[error("invalid certificate authority material: {0}")]
    InvalidMaterial(String),
    #[error("permission denied while performing {operation}: {detail}")]
    PermissionDenied { operation: String, detail: String },
    #[error("certificate authority operation failed: {0}")]
    OperationFailed(String),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Leaf issuance failures are broadcast to every caller waiting on the
/// same hostname, so the type stays cheap to clone.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CertIssueError {
    #[error("no root certificate authority is loaded")]
    RootUnavailable,
    #[error("hostname {0:?} is not a valid certificate subject")]
    InvalidHostname(String),
    #[error("leaf generation failed: {0}")]
    Generation(String),
}
