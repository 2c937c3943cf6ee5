use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use rand::Rng;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};

use crate::{CertIssueError, RootCa};

/// 825 days is the strictest client-side cap on leaf lifetimes in the
/// wild (macOS/Safari); the window is backdated a day for clock skew.
const LEAF_VALIDITY_DAYS: i64 = 825;
const LEAF_BACKDATE_DAYS: i64 = 1;

/// A minted per-host server certificate, plus the ready-to-serve rustls
/// config built from it. Lives only as long as its cache entry.
#[derive(Debug)]
pub struct LeafCert {
    pub hostname: String,
    pub server_config: Arc<ServerConfig>,
    pub cert_der: rustls::pki_types::CertificateDer<'static>,
    pub cert_pem: String,
    pub key_pem: String,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
    pub issued_at: SystemTime,
}

/// Sign a fresh leaf for `hostname` under the root. CPU-bound (key
/// generation); callers off-load it from async contexts.
pub fn sign_leaf(root: &RootCa, hostname: &str) -> Result<LeafCert, CertIssueError> {
    if !is_valid_leaf_host(hostname) {
        return Err(CertIssueError::InvalidHostname(hostname.to_string()));
    }

    let now = OffsetDateTime::now_utc();
    let not_before = now - Duration::days(LEAF_BACKDATE_DAYS);
    let not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|error| CertIssueError::Generation(error.to_string()))?;
    params.is_ca = IsCa::NoCa;
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.not_before = not_before;
    params.not_after = not_after;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname.to_string());
    params.distinguished_name = dn;

    if let Ok(ip) = hostname.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params.subject_alt_names.push(SanType::DnsName(
            hostname
                .try_into()
                .map_err(|_| CertIssueError::InvalidHostname(hostname.to_string()))?,
        ));
    }

    let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|error| CertIssueError::Generation(error.to_string()))?;
    let leaf_cert = params
        .signed_by(&leaf_key, &root.issuer)
        .map_err(|error| CertIssueError::Generation(error.to_string()))?;

    let cert_der = leaf_cert.der().clone();
    let chain = vec![cert_der.clone(), root.cert_der.clone()];
    let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, private_key)
        .map_err(|error| CertIssueError::Generation(error.to_string()))?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(LeafCert {
        hostname: hostname.to_string(),
        server_config: Arc::new(server_config),
        cert_der,
        cert_pem: leaf_cert.pem(),
        key_pem: leaf_key.serialize_pem(),
        not_before: not_before.into(),
        not_after: not_after.into(),
        issued_at: SystemTime::now(),
    })
}

/// RFC 1035 host name or IP literal. Wildcards are rejected: cache keys
/// are literal hostnames from SNI or CONNECT targets.
fn is_valid_leaf_host(host: &str) -> bool {
    if host.parse::<IpAddr>().is_ok() {
        return true;
    }
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::{is_valid_leaf_host, sign_leaf};
    use crate::{CaStore, CertIssueError};

    fn test_root() -> crate::RootCa {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = CaStore::new(dir.path());
        store.generate(false).expect("generate root");
        store.load().expect("load root")
    }

    #[test]
    fn leaf_validity_window_brackets_now() {
        let root = test_root();
        let leaf = sign_leaf(&root, "api.example.com").expect("sign leaf");
        let now = SystemTime::now();
        assert!(leaf.not_before <= now);
        assert!(leaf.not_after >= now);
        assert_eq!(leaf.hostname, "api.example.com");
    }

    #[test]
    fn leaf_rejects_invalid_hostnames() {
        let root = test_root();
        for bad in ["", "-leading.example.com", "trailing-.example.com", "a b", "*"] {
            let error = sign_leaf(&root, bad).expect_err("must reject");
            assert!(
                matches!(error, CertIssueError::InvalidHostname(_)),
                "{bad:?}: {error}"
            );
        }
    }

    #[test]
    fn leaf_accepts_ip_literals() {
        let root = test_root();
        let leaf = sign_leaf(&root, "127.0.0.1").expect("sign ip leaf");
        assert_eq!(leaf.hostname, "127.0.0.1");
    }

    #[test]
    fn host_validation_accepts_common_shapes() {
        assert!(is_valid_leaf_host("example.com"));
        assert!(is_valid_leaf_host("a.b-c.example"));
        assert!(is_valid_leaf_host("::1"));
        assert!(!is_valid_leaf_host("exa mple.com"));
        assert!(!is_valid_leaf_host(&"a".repeat(254)));
    }
}
