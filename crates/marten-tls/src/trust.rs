#[cfg(any(target_os = "macos", target_os = "linux"))]
use std::ffi::OsStr;
#[cfg(any(target_os = "macos", target_os = "linux"))]
use std::process::Command;

use crate::{CaError, CaStore, RootCa};

/// Whether the root is trusted by the operating system. `Unknown` covers
/// platforms without a probe (Windows) and probes that could not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustStatus {
    Trusted,
    NotTrusted,
    Unknown,
}

impl TrustStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trusted => "trusted",
            Self::NotTrusted => "not_trusted",
            Self::Unknown => "unknown",
        }
    }
}

/// Query the platform trust store for the root certificate.
pub fn trust_status(ca: &RootCa) -> TrustStatus {
    platform_trust_status(ca)
}

/// Add the root to the platform trust store without prompting. The
/// caller decides when this is appropriate; nothing in the proxy core
/// invokes it.
pub fn install_trust(store: &CaStore, ca: &RootCa) -> Result<(), CaError> {
    platform_install_trust(store, ca)
}

/// Undo [`install_trust`].
pub fn uninstall_trust(store: &CaStore) -> Result<(), CaError> {
    platform_uninstall_trust(store)
}

#[cfg(any(target_os = "macos", target_os = "linux"))]
#[derive(Debug)]
struct CommandOutcome {
    success: bool,
    #[cfg_attr(not(target_os = "macos"), allow(dead_code))]
    stdout: String,
    stderr: String,
}

#[cfg(any(target_os = "macos", target_os = "linux"))]
fn run_command<I, S>(operation: &str, program: &str, args: I) -> Result<CommandOutcome, CaError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(program).args(args).output().map_err(|error| {
        if error.kind() == std::io::ErrorKind::NotFound {
            return CaError::UnsupportedOperation(format!(
                "{operation}: command '{program}' not found"
            ));
        }
        if error.kind() == std::io::ErrorKind::PermissionDenied {
            return CaError::PermissionDenied {
                operation: operation.to_string(),
                detail: error.to_string(),
            };
        }
        CaError::Io(error)
    })?;

    Ok(CommandOutcome {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

#[cfg(any(target_os = "macos", target_os = "linux"))]
fn operation_error(operation: &str, detail: impl Into<String>) -> CaError {
    let detail = detail.into();
    let lower = detail.to_ascii_lowercase();
    if lower.contains("permission denied") || lower.contains("not permitted") {
        return CaError::PermissionDenied {
            operation: operation.to_string(),
            detail,
        };
    }
    CaError::OperationFailed(format!("{operation}: {detail}"))
}

#[cfg(target_os = "macos")]
fn platform_trust_status(ca: &RootCa) -> TrustStatus {
    // The keychain prints "SHA-1 hash: <hex>" for each match; compare
    // against the root's fingerprint.
    let outcome = match run_command(
        "trust_status",
        "security",
        ["find-certificate", "-a", "-c", &ca.common_name, "-Z"],
    ) {
        Ok(outcome) => outcome,
        Err(error) => {
            tracing::debug!(%error, "macOS keychain probe failed");
            return TrustStatus::Unknown;
        }
    };
    if !outcome.success {
        return TrustStatus::NotTrusted;
    }
    if outcome.stdout.contains(&ca.fingerprint_sha1) {
        TrustStatus::Trusted
    } else {
        TrustStatus::NotTrusted
    }
}

#[cfg(target_os = "macos")]
fn platform_install_trust(store: &CaStore, ca: &RootCa) -> Result<(), CaError> {
    if platform_trust_status(ca) == TrustStatus::Trusted {
        return Ok(());
    }
    let cert_path = store.root_cert_path();
    let keychain = login_keychain_path()?;
    let outcome = run_command(
        "install_trust",
        "security",
        [
            OsStr::new("add-trusted-cert"),
            OsStr::new("-d"),
            OsStr::new("-r"),
            OsStr::new("trustRoot"),
            OsStr::new("-k"),
            keychain.as_os_str(),
            cert_path.as_os_str(),
        ],
    )?;
    if !outcome.success {
        return Err(operation_error("install_trust", outcome.stderr));
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn platform_uninstall_trust(store: &CaStore) -> Result<(), CaError> {
    let cert_path = store.root_cert_path();
    let outcome = run_command(
        "uninstall_trust",
        "security",
        [
            OsStr::new("remove-trusted-cert"),
            OsStr::new("-d"),
            cert_path.as_os_str(),
        ],
    )?;
    if !outcome.success {
        let lower = outcome.stderr.to_ascii_lowercase();
        if !lower.contains("could not find") && !lower.contains("not found") {
            return Err(operation_error("uninstall_trust", outcome.stderr));
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn platform_trust_status(ca: &RootCa) -> TrustStatus {
    let candidates = [
        "/etc/ssl/certs/ca-certificates.crt",
        "/etc/pki/tls/certs/ca-bundle.crt",
        "/etc/ssl/ca-bundle.pem",
        LINUX_ANCHOR_PATH,
    ];
    let needle = pem_body(&ca.cert_pem);
    let mut any_readable = false;
    for path in candidates {
        let Ok(bundle) = std::fs::read_to_string(path) else {
            continue;
        };
        any_readable = true;
        if pem_bundle_contains(&bundle, &needle) {
            return TrustStatus::Trusted;
        }
    }
    if any_readable {
        TrustStatus::NotTrusted
    } else {
        TrustStatus::Unknown
    }
}

#[cfg(target_os = "linux")]
const LINUX_ANCHOR_PATH: &str = "/usr/local/share/ca-certificates/marten-root-ca.crt";

#[cfg(target_os = "linux")]
fn platform_install_trust(_store: &CaStore, ca: &RootCa) -> Result<(), CaError> {
    let anchor = std::path::Path::new(LINUX_ANCHOR_PATH);
    if let Some(parent) = anchor.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(anchor, ca.cert_pem.as_bytes()).map_err(|error| {
        if error.kind() == std::io::ErrorKind::PermissionDenied {
            return CaError::PermissionDenied {
                operation: "install_trust".to_string(),
                detail: error.to_string(),
            };
        }
        CaError::Io(error)
    })?;
    let outcome = run_command("install_trust", "update-ca-certificates", ["--fresh"])?;
    if !outcome.success {
        return Err(operation_error("install_trust", outcome.stderr));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn platform_uninstall_trust(_store: &CaStore) -> Result<(), CaError> {
    match std::fs::remove_file(LINUX_ANCHOR_PATH) {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(CaError::PermissionDenied {
                operation: "uninstall_trust".to_string(),
                detail: error.to_string(),
            });
        }
        Err(error) => return Err(CaError::Io(error)),
    }
    let outcome = run_command("uninstall_trust", "update-ca-certificates", ["--fresh"])?;
    if !outcome.success {
        return Err(operation_error("uninstall_trust", outcome.stderr));
    }
    Ok(())
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn platform_trust_status(_ca: &RootCa) -> TrustStatus {
    TrustStatus::Unknown
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn platform_install_trust(_store: &CaStore, _ca: &RootCa) -> Result<(), CaError> {
    Err(CaError::UnsupportedOperation(
        "trust installation is not supported on this platform".to_string(),
    ))
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn platform_uninstall_trust(_store: &CaStore) -> Result<(), CaError> {
    Err(CaError::UnsupportedOperation(
        "trust removal is not supported on this platform".to_string(),
    ))
}

#[cfg(target_os = "macos")]
fn login_keychain_path() -> Result<std::path::PathBuf, CaError> {
    let Some(home) = std::env::var_os("HOME") else {
        return Err(CaError::UnsupportedOperation(
            "HOME is not set; cannot resolve the macOS login keychain".to_string(),
        ));
    };
    Ok(std::path::PathBuf::from(home).join("Library/Keychains/login.keychain-db"))
}

/// Base64 payload of the first PEM block, whitespace stripped, so the
/// comparison survives different line wrapping in system bundles.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn pem_body(pem: &str) -> String {
    pem.lines()
        .filter(|line| !line.starts_with("-----"))
        .collect::<Vec<_>>()
        .concat()
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn pem_bundle_contains(bundle: &str, body: &str) -> bool {
    let flattened: String = bundle.split_whitespace().collect();
    flattened.contains(body)
}
