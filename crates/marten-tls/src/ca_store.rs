use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rand::Rng;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;
use sha1::{Digest, Sha1};
use time::OffsetDateTime;
use x509_parser::parse_x509_certificate;

use crate::CaError;

pub const ROOT_KEY_FILE: &str = "rootCA.key";
pub const ROOT_CERT_FILE: &str = "rootCA.crt";

/// Fixed CommonName of every root this store mints. The remaining
/// subject attributes come from [`CaSubject`].
const ROOT_COMMON_NAME: &str = "Marten";
const ROOT_VALIDITY_DAYS: i64 = 3650;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaSubject {
    pub country: String,
    pub organization: String,
    pub state_or_province: String,
    pub organizational_unit: String,
}

impl Default for CaSubject {
    fn default() -> Self {
        Self {
            country: "US".to_string(),
            organization: "Marten".to_string(),
            state_or_province: "Internet".to_string(),
            organizational_unit: "Marten TLS interception".to_string(),
        }
    }
}

/// Root CA key and certificate persisted under a single directory.
/// Immutable once generated; regeneration requires the overwrite flag.
#[derive(Debug)]
pub struct CaStore {
    dir: PathBuf,
    subject: CaSubject,
}

/// Loaded root material, ready to sign leaves.
#[derive(Debug)]
pub struct RootCa {
    pub(crate) issuer: Issuer<'static, KeyPair>,
    pub cert_pem: String,
    pub cert_der: CertificateDer<'static>,
    pub common_name: String,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
    /// Uppercase hex SHA-1 of the certificate DER, the form the macOS
    /// keychain prints for `security find-certificate -Z`.
    pub fingerprint_sha1: String,
}

impl CaStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            subject: CaSubject::default(),
        }
    }

    /// Store at the conventional per-user location,
    /// `$HOME/.marten/certificates`.
    pub fn open_default() -> Result<Self, CaError> {
        let Some(home) = std::env::var_os("HOME") else {
            return Err(CaError::UnsupportedOperation(
                "HOME is not set; pass an explicit certificate directory".to_string(),
            ));
        };
        Ok(Self::new(
            PathBuf::from(home).join(".marten").join("certificates"),
        ))
    }

    pub fn with_subject(mut self, subject: CaSubject) -> Self {
        self.subject = subject;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn root_key_path(&self) -> PathBuf {
        self.dir.join(ROOT_KEY_FILE)
    }

    pub fn root_cert_path(&self) -> PathBuf {
        self.dir.join(ROOT_CERT_FILE)
    }

    /// True iff both the root key and the root certificate are present.
    pub fn exists(&self) -> bool {
        self.root_key_path().is_file() && self.root_cert_path().is_file()
    }

    /// Create and persist a fresh self-signed root. Refuses to touch
    /// existing material unless `overwrite` is set.
    pub fn generate(&self, overwrite: bool) -> Result<(PathBuf, PathBuf), CaError> {
        let key_path = self.root_key_path();
        let cert_path = self.root_cert_path();
        if !overwrite {
            for path in [&key_path, &cert_path] {
                if path.exists() {
                    return Err(CaError::AlreadyExists { path: path.clone() });
                }
            }
        }

        let key = KeyPair::generate()
            .map_err(|error| CaError::InvalidMaterial(error.to_string()))?;
        let params = self.build_root_params();
        let cert = params
            .self_signed(&key)
            .map_err(|error| CaError::InvalidMaterial(error.to_string()))?;

        fs::create_dir_all(&self.dir).map_err(map_write_error)?;
        fs::write(&key_path, key.serialize_pem()).map_err(map_write_error)?;
        fs::write(&cert_path, cert.pem()).map_err(map_write_error)?;
        Ok((key_path, cert_path))
    }

    /// Read the persisted pair back into signing-ready form.
    pub fn load(&self) -> Result<RootCa, CaError> {
        if !self.exists() {
            return Err(CaError::Missing {
                dir: self.dir.clone(),
            });
        }

        let cert_pem = fs::read_to_string(self.root_cert_path())?;
        let key_pem = fs::read_to_string(self.root_key_path())?;

        let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
            CaError::InvalidMaterial(format!("failed to parse root certificate PEM: {error}"))
        })?;
        let key = KeyPair::from_pem(&key_pem)
            .map_err(|error| CaError::InvalidMaterial(format!("failed to parse root key: {error}")))?;
        let issuer = Issuer::from_ca_cert_der(&cert_der, key).map_err(|error| {
            CaError::InvalidMaterial(format!("failed to rebuild issuer from root cert: {error}"))
        })?;

        let (common_name, not_before, not_after) = read_cert_identity(cert_der.as_ref())?;

        Ok(RootCa {
            issuer,
            fingerprint_sha1: sha1_fingerprint(cert_der.as_ref()),
            cert_pem,
            cert_der,
            common_name,
            not_before,
            not_after,
        })
    }

    fn build_root_params(&self) -> CertificateParams {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(ROOT_VALIDITY_DAYS);

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, ROOT_COMMON_NAME);
        dn.push(DnType::CountryName, self.subject.country.clone());
        dn.push(DnType::OrganizationName, self.subject.organization.clone());
        dn.push(
            DnType::StateOrProvinceName,
            self.subject.state_or_province.clone(),
        );
        dn.push(
            DnType::OrganizationalUnitName,
            self.subject.organizational_unit.clone(),
        );
        params.distinguished_name = dn;
        params
    }
}

fn map_write_error(error: std::io::Error) -> CaError {
    if error.kind() == std::io::ErrorKind::PermissionDenied {
        return CaError::PermissionDenied {
            operation: "write_root_ca".to_string(),
            detail: error.to_string(),
        };
    }
    CaError::Io(error)
}

fn read_cert_identity(der: &[u8]) -> Result<(String, SystemTime, SystemTime), CaError> {
    let (_, cert) = parse_x509_certificate(der)
        .map_err(|error| CaError::InvalidMaterial(format!("failed to parse root DER: {error}")))?;
    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .unwrap_or(ROOT_COMMON_NAME)
        .to_string();
    let validity = cert.validity();
    Ok((
        common_name,
        unix_time(validity.not_before.timestamp()),
        unix_time(validity.not_after.timestamp()),
    ))
}

fn unix_time(timestamp: i64) -> SystemTime {
    if timestamp <= 0 {
        return SystemTime::UNIX_EPOCH;
    }
    SystemTime::UNIX_EPOCH + Duration::from_secs(timestamp as u64)
}

pub(crate) fn sha1_fingerprint(der: &[u8]) -> String {
    let digest = Sha1::digest(der);
    let mut rendered = String::with_capacity(digest.len() * 2);
    for byte in digest {
        rendered.push_str(&format!("{byte:02X}"));
    }
    rendered
}
