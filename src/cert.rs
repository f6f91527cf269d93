//! Dynamic leaf certificate minting for intercepted hosts.
//!
//! Leaf certificates are minted on demand, signed by an in-memory CA, and
//! cached by their wildcarded hostname pattern with a TTL. The store hands
//! out ready-to-use `rustls::ServerConfig`s restricted to the configured
//! protocol versions.

use crate::config::TlsProtocols;
use crate::error::ProxyError;
use lru::LruCache;
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

const DEFAULT_CACHE_SIZE: usize = 1000;
const DEFAULT_CERT_TTL: Duration = Duration::from_secs(86400);

/// Derive the certificate name pattern for a host.
///
/// Hosts with three or more labels collapse to a wildcard of their parent
/// domain so one leaf covers sibling subdomains. IP literals and short
/// names are used as-is.
pub fn wildcard_pattern(host: &str) -> String {
    if host.parse::<IpAddr>().is_ok() {
        return host.to_string();
    }
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 || labels.iter().any(|l| l.is_empty()) {
        return host.to_string();
    }
    format!("*.{}", labels[1..].join("."))
}

struct CachedConfig {
    config: Arc<ServerConfig>,
    created_at: Instant,
}

impl CachedConfig {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// Process-wide certificate store. Safe for concurrent access; the
/// connection handlers only read from it.
pub struct CertificateStore {
    ca: Certificate,
    ca_der: Vec<u8>,
    cache: Mutex<LruCache<String, CachedConfig>>,
    cert_ttl: Duration,
    protocols: TlsProtocols,
}

impl CertificateStore {
    /// Create a store with a freshly generated CA.
    pub fn new(protocols: TlsProtocols) -> Result<Self, ProxyError> {
        Self::with_ttl(protocols, DEFAULT_CACHE_SIZE, DEFAULT_CERT_TTL)
    }

    pub fn with_ttl(
        protocols: TlsProtocols,
        cache_size: usize,
        cert_ttl: Duration,
    ) -> Result<Self, ProxyError> {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "interpose proxy CA");
        params
            .distinguished_name
            .push(DnType::OrganizationName, "interpose");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(3650);

        let ca = Certificate::from_params(params)
            .map_err(|e| ProxyError::Certificate(format!("CA generation failed: {}", e)))?;
        let ca_der = ca
            .serialize_der()
            .map_err(|e| ProxyError::Certificate(format!("CA serialization failed: {}", e)))?;

        let cache_size =
            NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::new(DEFAULT_CACHE_SIZE).unwrap());

        Ok(Self {
            ca,
            ca_der,
            cache: Mutex::new(LruCache::new(cache_size)),
            cert_ttl,
            protocols,
        })
    }

    /// DER encoding of the CA certificate, for distribution to clients.
    pub fn ca_certificate_der(&self) -> &[u8] {
        &self.ca_der
    }

    /// PEM encoding of the CA certificate.
    pub fn ca_certificate_pem(&self) -> Result<String, ProxyError> {
        self.ca
            .serialize_pem()
            .map_err(|e| ProxyError::Certificate(format!("CA serialization failed: {}", e)))
    }

    /// Server config carrying a leaf for `host`, minted or cached.
    pub async fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, ProxyError> {
        let pattern = wildcard_pattern(host);

        {
            let mut cache = self.cache.lock().await;
            if let Some(cached) = cache.get(&pattern) {
                if cached.is_expired(self.cert_ttl) {
                    debug!(pattern = %pattern, "cached certificate expired, re-minting");
                    cache.pop(&pattern);
                } else {
                    debug!(pattern = %pattern, "certificate cache hit");
                    return Ok(Arc::clone(&cached.config));
                }
            }
        }

        debug!(host = %host, pattern = %pattern, "minting leaf certificate");
        let config = Arc::new(self.mint(host, &pattern)?);

        let mut cache = self.cache.lock().await;
        cache.put(
            pattern,
            CachedConfig {
                config: Arc::clone(&config),
                created_at: Instant::now(),
            },
        );
        Ok(config)
    }

    fn mint(&self, host: &str, pattern: &str) -> Result<ServerConfig, ProxyError> {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, pattern.to_string());

        if let Ok(ip) = host.parse::<IpAddr>() {
            params.subject_alt_names = vec![SanType::IpAddress(ip)];
        } else if pattern == host {
            params.subject_alt_names = vec![SanType::DnsName(host.to_string())];
        } else {
            params.subject_alt_names = vec![
                SanType::DnsName(pattern.to_string()),
                SanType::DnsName(host.to_string()),
            ];
        }

        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(90);
        params.serial_number = Some(random_serial().into());

        let key_pair = KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| ProxyError::Certificate(format!("key generation failed: {}", e)))?;
        params.key_pair = Some(key_pair);
        params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;

        let leaf = Certificate::from_params(params)
            .map_err(|e| ProxyError::Certificate(format!("leaf generation failed: {}", e)))?;
        let leaf_der = leaf
            .serialize_der_with_signer(&self.ca)
            .map_err(|e| ProxyError::Certificate(format!("leaf signing failed: {}", e)))?;
        let key_der = leaf.serialize_private_key_der();

        let chain = vec![
            CertificateDer::from(leaf_der),
            CertificateDer::from(self.ca_der.clone()),
        ];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der));

        server_config_from_parts(chain, key, self.protocols)
    }
}

/// Assemble a server config from a certificate chain and key.
///
/// Also the path for per-endpoint generic certificates supplied as PEM.
pub fn server_config_from_parts(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    protocols: TlsProtocols,
) -> Result<ServerConfig, ProxyError> {
    let mut config = ServerConfig::builder_with_protocol_versions(&protocols.versions())
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| ProxyError::Certificate(format!("TLS config assembly failed: {}", e)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Load a generic certificate (chain + PKCS#8 key) from PEM bytes.
pub fn server_config_from_pem(
    cert_pem: &[u8],
    key_pem: &[u8],
    protocols: TlsProtocols,
) -> Result<Arc<ServerConfig>, ProxyError> {
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<_, _>>()
        .map_err(|e| ProxyError::Certificate(format!("invalid certificate PEM: {}", e)))?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| ProxyError::Certificate(format!("invalid key PEM: {}", e)))?
        .ok_or_else(|| ProxyError::Certificate("no private key in PEM".into()))?;
    Ok(Arc::new(server_config_from_parts(chain, key, protocols)?))
}

fn random_serial() -> u64 {
    use rand::Rng;
    let random_part: u32 = rand::thread_rng().gen();
    let timestamp_part = time::OffsetDateTime::now_utc().unix_timestamp() as u32;
    ((timestamp_part as u64) << 32) | random_part as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_collapses_deep_hosts() {
        assert_eq!(wildcard_pattern("api.example.com"), "*.example.com");
        assert_eq!(wildcard_pattern("a.b.example.com"), "*.b.example.com");
        assert_eq!(wildcard_pattern("example.com"), "example.com");
        assert_eq!(wildcard_pattern("localhost"), "localhost");
        assert_eq!(wildcard_pattern("192.168.1.1"), "192.168.1.1");
        assert_eq!(wildcard_pattern("::1"), "::1");
    }

    #[tokio::test]
    async fn minting_and_cache_hit() {
        let store = CertificateStore::new(TlsProtocols::Tls12And13).unwrap();
        let first = store.server_config("api.example.com").await.unwrap();
        // same wildcard pattern: cache hit, identical config
        let second = store.server_config("www.example.com").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        // different pattern mints a distinct config
        let other = store.server_config("example.org").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[tokio::test]
    async fn expired_certificates_are_reminted() {
        let store =
            CertificateStore::with_ttl(TlsProtocols::Tls12And13, 16, Duration::from_millis(0))
                .unwrap();
        let first = store.server_config("api.example.com").await.unwrap();
        let second = store.server_config("api.example.com").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn ip_hosts_get_ip_sans() {
        let store = CertificateStore::new(TlsProtocols::Tls12And13).unwrap();
        assert!(store.server_config("127.0.0.1").await.is_ok());
    }

    #[test]
    fn ca_pem_is_exportable() {
        let store = CertificateStore::new(TlsProtocols::Tls12And13).unwrap();
        let pem = store.ca_certificate_pem().unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE"));
        assert!(!store.ca_certificate_der().is_empty());
    }
}
