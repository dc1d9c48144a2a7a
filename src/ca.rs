use crate::error::{Error, Result};
use log::{debug, info};
use moka::sync::Cache;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, PKCS_RSA_SHA256,
};
use rsa::{
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding},
    RsaPrivateKey,
};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use time::{ext::NumericalDuration, OffsetDateTime};
use tokio_rustls::rustls::{self, ServerConfig};

const ROOT_CERT_FILE: &str = "ca-cert.pem";
const ROOT_KEY_FILE: &str = "ca-key.pem";
const ROOT_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_HOURS: i64 = 24;
const LEAF_CACHE_CAPACITY: u64 = 1_000;

/// A host-scoped certificate minted by the root, ready for a TLS handshake.
pub struct LeafCert {
    pub cert_pem: String,
    pub key_pem: String,
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
}

impl LeafCert {
    fn from_pem(cert_pem: String, key_pem: String) -> Result<Self> {
        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())?
            .into_iter()
            .next()
            .ok_or_else(|| Error::TlsMaterial(String::from("no certificate in PEM")))?;
        let key_der = rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_bytes())?
            .into_iter()
            .next()
            .ok_or_else(|| Error::TlsMaterial(String::from("no private key in PEM")))?;
        Ok(Self {
            cert_pem,
            key_pem,
            cert_der,
            key_der,
        })
    }
}

/// Loads or generates a long-lived self-signed root and mints short-lived
/// leaf certificates for MITM sessions.
///
/// Root material is persisted PEM-encoded when a directory is configured;
/// leaves are cached in memory and, with a directory, on disk under
/// `<host>-cert.pem` / `<host>-key.pem`. The root private key is never
/// logged.
pub struct CertificateAuthority {
    root_cert_pem: String,
    root_key_pem: String,
    dir: Option<PathBuf>,
    leaf_cache: Cache<String, Arc<LeafCert>>,
    mint_lock: Mutex<()>,
}

impl CertificateAuthority {
    /// Loads root material from `dir` when present, otherwise generates a
    /// fresh 2048-bit RSA root and persists it there (in-memory only when
    /// `dir` is `None`).
    pub fn new(dir: Option<&Path>) -> Result<Self> {
        if let Some(dir) = dir {
            fs::create_dir_all(dir)?;
            restrict_dir_permissions(dir)?;
        }

        let existing = dir.map(|d| d.join(ROOT_CERT_FILE)).filter(|p| p.exists());
        let (root_cert_pem, root_key_pem) = match (existing, dir) {
            (Some(_), Some(dir)) => Self::load_root(dir)?,
            (_, dir) => {
                let (cert_pem, key_pem) = Self::generate_root()?;
                if let Some(dir) = dir {
                    fs::write(dir.join(ROOT_CERT_FILE), &cert_pem)?;
                    fs::write(dir.join(ROOT_KEY_FILE), &key_pem)?;
                    restrict_file_permissions(&dir.join(ROOT_KEY_FILE))?;
                    info!("generated root certificate in {}", dir.display());
                }
                (cert_pem, key_pem)
            }
        };

        Ok(Self {
            root_cert_pem,
            root_key_pem,
            dir: dir.map(Path::to_path_buf),
            leaf_cache: Cache::builder().max_capacity(LEAF_CACHE_CAPACITY).build(),
            mint_lock: Mutex::new(()),
        })
    }

    fn load_root(dir: &Path) -> Result<(String, String)> {
        let cert_pem = fs::read_to_string(dir.join(ROOT_CERT_FILE))?;
        let key_pem = fs::read_to_string(dir.join(ROOT_KEY_FILE))?;
        let key_pem = normalize_rsa_key_pem(&key_pem)?;

        // Validate that the key signs for the loaded certificate.
        let key_pair = KeyPair::from_pem_and_sign_algo(&key_pem, &PKCS_RSA_SHA256)?;
        CertificateParams::from_ca_cert_pem(&cert_pem, key_pair)?;

        info!("loaded root certificate from {}", dir.display());
        Ok((cert_pem, key_pem))
    }

    fn generate_root() -> Result<(String, String)> {
        let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048)
            .map_err(|err| Error::TlsMaterial(format!("generating RSA key: {err}")))?;
        let key_pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| Error::TlsMaterial(format!("encoding RSA key: {err}")))?
            .to_string();

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "mdmitm root CA");
        dn.push(DnType::OrganizationName, "mdmitm");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + ROOT_VALIDITY_DAYS.days();
        params.serial_number = Some(1);
        params.alg = &PKCS_RSA_SHA256;
        params.key_pair = Some(KeyPair::from_pem_and_sign_algo(&key_pem, &PKCS_RSA_SHA256)?);

        let cert = Certificate::from_params(params)?;
        Ok((cert.serialize_pem()?, key_pem))
    }

    /// The root certificate PEM, for distribution to clients.
    pub fn root_cert_pem(&self) -> &str {
        &self.root_cert_pem
    }

    /// Path of the persisted root certificate, when a directory is configured.
    pub fn root_cert_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(ROOT_CERT_FILE))
    }

    /// Returns the leaf certificate for a host, minting one on first use.
    /// Concurrent callers for the same host observe the same certificate.
    pub fn get_cert_for_domain(&self, domain: &str) -> Result<Arc<LeafCert>> {
        let host = strip_port(domain);

        if let Some(leaf) = self.leaf_cache.get(host) {
            return Ok(leaf);
        }

        let _guard = self.mint_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(leaf) = self.leaf_cache.get(host) {
            return Ok(leaf);
        }

        if let Some(leaf) = self.load_leaf(host) {
            self.leaf_cache.insert(host.to_string(), Arc::clone(&leaf));
            return Ok(leaf);
        }

        let leaf = Arc::new(self.mint_leaf(host)?);
        self.store_leaf(host, &leaf);
        self.leaf_cache.insert(host.to_string(), Arc::clone(&leaf));
        debug!("minted leaf certificate for {host}");
        Ok(leaf)
    }

    /// Builds a rustls server configuration serving the host's leaf as the
    /// sole certificate, restricted to http/1.1.
    pub fn server_config(&self, domain: &str) -> Result<Arc<ServerConfig>> {
        let leaf = self.get_cert_for_domain(domain)?;
        let mut config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                vec![rustls::Certificate(leaf.cert_der.clone())],
                rustls::PrivateKey(leaf.key_der.clone()),
            )
            .map_err(|err| Error::TlsMaterial(err.to_string()))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }

    fn leaf_paths(&self, host: &str) -> Option<(PathBuf, PathBuf)> {
        self.dir.as_ref().map(|d| {
            (
                d.join(format!("{host}-cert.pem")),
                d.join(format!("{host}-key.pem")),
            )
        })
    }

    fn load_leaf(&self, host: &str) -> Option<Arc<LeafCert>> {
        let (cert_path, key_path) = self.leaf_paths(host)?;
        let cert_pem = fs::read_to_string(cert_path).ok()?;
        let key_pem = fs::read_to_string(key_path).ok()?;
        LeafCert::from_pem(cert_pem, key_pem).ok().map(Arc::new)
    }

    fn store_leaf(&self, host: &str, leaf: &LeafCert) {
        if let Some((cert_path, key_path)) = self.leaf_paths(host) {
            if let Err(err) = fs::write(&cert_path, &leaf.cert_pem)
                .and_then(|_| fs::write(&key_path, &leaf.key_pem))
                .and_then(|_| restrict_file_permissions(&key_path))
            {
                debug!("persisting leaf for {host} failed: {err}");
            }
        }
    }

    fn mint_leaf(&self, host: &str) -> Result<LeafCert> {
        // Each leaf gets its own key; only ca-key.pem ever holds the root's.
        let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048)
            .map_err(|err| Error::TlsMaterial(format!("generating leaf key: {err}")))?;
        let key_pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| Error::TlsMaterial(format!("encoding leaf key: {err}")))?
            .to_string();

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        params
            .subject_alt_names
            .push(SanType::DnsName(host.to_string()));
        if !host.is_empty() && !host.starts_with('*') {
            params
                .subject_alt_names
                .push(SanType::DnsName(format!("*.{host}")));
        }

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + LEAF_VALIDITY_HOURS.hours();
        params.serial_number = Some(now.unix_timestamp_nanos() as u64);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.alg = &PKCS_RSA_SHA256;
        params.key_pair = Some(KeyPair::from_pem_and_sign_algo(&key_pem, &PKCS_RSA_SHA256)?);

        let issuer_key = KeyPair::from_pem_and_sign_algo(&self.root_key_pem, &PKCS_RSA_SHA256)?;
        let issuer_params = CertificateParams::from_ca_cert_pem(&self.root_cert_pem, issuer_key)?;
        let issuer = Certificate::from_params(issuer_params)?;

        let leaf = Certificate::from_params(params)?;
        let cert_pem = leaf.serialize_pem_with_signer(&issuer)?;

        LeafCert::from_pem(cert_pem, key_pem)
    }
}

/// Accepts PKCS#1 or PKCS#8 RSA private keys and normalizes to PKCS#8 PEM.
/// A PKCS#8 key that is not RSA fails with [`Error::UnsupportedKeyType`].
fn normalize_rsa_key_pem(key_pem: &str) -> Result<String> {
    let key = if key_pem.contains("BEGIN RSA PRIVATE KEY") {
        RsaPrivateKey::from_pkcs1_pem(key_pem)
            .map_err(|err| Error::TlsMaterial(format!("parsing PKCS#1 key: {err}")))?
    } else if key_pem.contains("BEGIN PRIVATE KEY") {
        RsaPrivateKey::from_pkcs8_pem(key_pem).map_err(|_| Error::UnsupportedKeyType)?
    } else if key_pem.contains("BEGIN EC PRIVATE KEY") {
        return Err(Error::UnsupportedKeyType);
    } else {
        return Err(Error::TlsMaterial(String::from(
            "no private key block in PEM",
        )));
    };

    Ok(key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|err| Error::TlsMaterial(format!("encoding RSA key: {err}")))?
        .to_string())
}

fn strip_port(domain: &str) -> &str {
    match domain.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => domain,
    }
}

#[cfg(unix)]
fn restrict_dir_permissions(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_dir_permissions(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn restrict_file_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_file_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use x509_parser::prelude::*;

    #[test]
    fn strips_ports_but_not_bare_hosts() {
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("localhost:8080"), "localhost");
    }

    #[test]
    fn generates_and_persists_root_material() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::new(Some(dir.path())).unwrap();
        assert!(dir.path().join("ca-cert.pem").exists());
        assert!(dir.path().join("ca-key.pem").exists());
        assert!(ca.root_cert_pem().contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn reload_reuses_the_persisted_root() {
        let dir = TempDir::new().unwrap();
        let first = CertificateAuthority::new(Some(dir.path())).unwrap();
        let second = CertificateAuthority::new(Some(dir.path())).unwrap();
        assert_eq!(first.root_cert_pem(), second.root_cert_pem());
    }

    #[test]
    fn in_memory_root_touches_no_disk() {
        let ca = CertificateAuthority::new(None).unwrap();
        let leaf = ca.get_cert_for_domain("example.com").unwrap();
        assert!(leaf.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(ca.root_cert_path().is_none());
    }

    #[test]
    fn root_is_a_constrained_ca() {
        let ca = CertificateAuthority::new(None).unwrap();
        let der = rustls_pemfile::certs(&mut ca.root_cert_pem().as_bytes())
            .unwrap()
            .remove(0);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        let bc = cert.basic_constraints().unwrap().unwrap();
        assert!(bc.value.ca);
        assert_eq!(bc.value.path_len_constraint, Some(0));
    }

    #[test]
    fn leaf_carries_host_and_wildcard_sans() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::new(Some(dir.path())).unwrap();
        let leaf = ca.get_cert_for_domain("example.com:443").unwrap();

        let (_, cert) = X509Certificate::from_der(&leaf.cert_der).unwrap();
        let san = cert.subject_alternative_name().unwrap().unwrap();
        let names: Vec<String> = san
            .value
            .general_names
            .iter()
            .filter_map(|n| match n {
                GeneralName::DNSName(name) => Some(name.to_string()),
                _ => None,
            })
            .collect();
        assert!(names.contains(&String::from("example.com")), "{names:?}");
        assert!(names.contains(&String::from("*.example.com")), "{names:?}");

        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .unwrap()
            .as_str()
            .unwrap();
        assert_eq!(cn, "example.com");
    }

    #[test]
    fn leaf_issuer_matches_root_subject() {
        let ca = CertificateAuthority::new(None).unwrap();
        let leaf = ca.get_cert_for_domain("example.com").unwrap();

        let root_der = rustls_pemfile::certs(&mut ca.root_cert_pem().as_bytes())
            .unwrap()
            .remove(0);
        let (_, root) = X509Certificate::from_der(&root_der).unwrap();
        let (_, cert) = X509Certificate::from_der(&leaf.cert_der).unwrap();
        assert_eq!(cert.issuer(), root.subject());
    }

    #[test]
    fn leaf_expires_a_day_after_minting() {
        let ca = CertificateAuthority::new(None).unwrap();
        let leaf = ca.get_cert_for_domain("example.com").unwrap();
        let (_, cert) = X509Certificate::from_der(&leaf.cert_der).unwrap();
        let validity = cert.validity();
        let lifetime = validity.not_after.timestamp() - validity.not_before.timestamp();
        assert_eq!(lifetime, 24 * 60 * 60);
    }

    #[test]
    fn leaves_for_different_hosts_use_distinct_keys() {
        let ca = CertificateAuthority::new(None).unwrap();
        let first = ca.get_cert_for_domain("a.example.com").unwrap();
        let second = ca.get_cert_for_domain("b.example.com").unwrap();
        assert_ne!(first.key_pem, second.key_pem);
        assert_ne!(first.cert_pem, second.cert_pem);
    }

    #[test]
    fn repeat_lookups_share_one_certificate() {
        let ca = CertificateAuthority::new(None).unwrap();
        let first = ca.get_cert_for_domain("example.com").unwrap();
        let second = ca.get_cert_for_domain("example.com:8443").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn leaves_are_persisted_per_host() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::new(Some(dir.path())).unwrap();
        ca.get_cert_for_domain("example.com").unwrap();
        assert!(dir.path().join("example.com-cert.pem").exists());
        assert!(dir.path().join("example.com-key.pem").exists());
    }

    #[test]
    fn persisted_leaf_is_reused_by_a_fresh_authority() {
        let dir = TempDir::new().unwrap();
        let first = CertificateAuthority::new(Some(dir.path())).unwrap();
        let minted = first.get_cert_for_domain("example.com").unwrap();

        let second = CertificateAuthority::new(Some(dir.path())).unwrap();
        let loaded = second.get_cert_for_domain("example.com").unwrap();
        assert_eq!(minted.cert_pem, loaded.cert_pem);
    }

    #[test]
    fn non_rsa_root_key_is_rejected() {
        let dir = TempDir::new().unwrap();

        let ec_key = KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let key_pem = ec_key.serialize_pem();
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
        params.key_pair = Some(ec_key);
        let cert = Certificate::from_params(params).unwrap();

        fs::write(dir.path().join("ca-cert.pem"), cert.serialize_pem().unwrap()).unwrap();
        fs::write(dir.path().join("ca-key.pem"), key_pem).unwrap();

        assert!(matches!(
            CertificateAuthority::new(Some(dir.path())),
            Err(Error::UnsupportedKeyType)
        ));
    }

    #[test]
    fn server_config_builds_for_a_host() {
        let ca = CertificateAuthority::new(None).unwrap();
        let config = ca.server_config("example.com").unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
