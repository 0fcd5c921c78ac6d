//! MITM certificate store
//!
//! CA material is generated on first use and persisted under the configured
//! directory; the public certificate is exported as PEM so the sandbox image
//! can pre-trust it. Leaves are synthesized per SNI, signed by the CA, and
//! cached in memory behind an LRU bounded by configuration. A leaf is only
//! ever served for the exact SNI it was minted for.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::PrivatePkcs8KeyDer;
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use crate::{Error, Result};

const CA_CERT_FILE: &str = "ca.pem";
const CA_KEY_FILE: &str = "ca.key.pem";
/// Leaf validity window, centered on now.
const LEAF_VALIDITY_DAYS: i64 = 90;

struct LeafCache {
    capacity: usize,
    map: HashMap<String, Arc<ServerConfig>>,
    order: VecDeque<String>,
}

impl LeafCache {
    fn get(&mut self, sni: &str) -> Option<Arc<ServerConfig>> {
        let config = self.map.get(sni).cloned()?;
        self.order.retain(|k| k != sni);
        self.order.push_back(sni.to_string());
        Some(config)
    }

    fn insert(&mut self, sni: String, config: Arc<ServerConfig>) {
        while self.map.len() >= self.capacity {
            let Some(evicted) = self.order.pop_front() else {
                break;
            };
            self.map.remove(&evicted);
        }
        self.order.push_back(sni.clone());
        self.map.insert(sni, config);
    }
}

/// Persistent CA plus in-memory leaf cache.
pub struct MitmStore {
    dir: PathBuf,
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
    cache: RwLock<LeafCache>,
}

impl MitmStore {
    /// Load the CA from `dir`, generating and persisting it on first use.
    pub fn open(dir: impl Into<PathBuf>, leaf_cache_size: usize) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        let (ca_cert, ca_key, ca_cert_pem) = if cert_path.exists() && key_path.exists() {
            load_ca(&cert_path, &key_path)?
        } else {
            let generated = generate_ca()?;
            std::fs::write(&cert_path, &generated.2)?;
            std::fs::write(&key_path, generated.1.serialize_pem())?;
            info!("mitm: generated CA in {}", dir.display());
            generated
        };

        Ok(Self {
            dir,
            ca_cert,
            ca_key,
            ca_cert_pem,
            cache: RwLock::new(LeafCache {
                capacity: leaf_cache_size.max(1),
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        })
    }

    /// The CA certificate in PEM form, for injection into guest trust.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// The CA certificate in DER form, for building trust stores in-process.
    pub fn ca_cert_der(&self) -> rustls::pki_types::CertificateDer<'static> {
        self.ca_cert.der().clone()
    }

    /// Where the CA certificate is persisted.
    pub fn ca_cert_path(&self) -> PathBuf {
        self.dir.join(CA_CERT_FILE)
    }

    /// Server configuration presenting a leaf for exactly `sni`.
    pub fn server_config_for(&self, sni: &str) -> Result<Arc<ServerConfig>> {
        if let Some(config) = self.cache.write().unwrap().get(sni) {
            return Ok(config);
        }
        let config = Arc::new(self.mint_leaf(sni)?);
        self.cache
            .write()
            .unwrap()
            .insert(sni.to_string(), config.clone());
        Ok(config)
    }

    fn mint_leaf(&self, sni: &str) -> Result<ServerConfig> {
        let mut sans = vec![sni.to_string()];
        if let Some(apex) = apex_of(sni) {
            sans.push(apex);
        }
        debug!("mitm: minting leaf for {sni} (san: {sans:?})");

        let key = KeyPair::generate()
            .map_err(|e| Error::Certificate(format!("leaf key for {sni}: {e}")))?;
        let mut params = CertificateParams::new(sans)
            .map_err(|e| Error::Certificate(format!("leaf params for {sni}: {e}")))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, sni);
        params.distinguished_name = dn;
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(LEAF_VALIDITY_DAYS);
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .map_err(|e| Error::Certificate(format!("signing leaf for {sni}: {e}")))?;

        let chain = vec![cert.der().clone(), self.ca_cert.der().clone()];
        let key_der = PrivatePkcs8KeyDer::from(key.serialize_der());
        // TLS 1.2/1.3 only, AEAD-only suites, no client certificates
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Certificate(format!("tls versions: {e}")))?
            .with_no_client_auth()
            .with_single_cert(chain, key_der.into())
            .map_err(|e| Error::Certificate(format!("server config for {sni}: {e}")))
    }
}

fn generate_ca() -> Result<(rcgen::Certificate, KeyPair, String)> {
    let key = KeyPair::generate().map_err(|e| Error::Certificate(format!("CA key: {e}")))?;
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "gatebox sandbox CA");
    dn.push(DnType::OrganizationName, "gatebox");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(3650);
    let cert = params
        .self_signed(&key)
        .map_err(|e| Error::Certificate(format!("CA self-sign: {e}")))?;
    let pem = cert.pem();
    Ok((cert, key, pem))
}

fn load_ca(cert_path: &Path, key_path: &Path) -> Result<(rcgen::Certificate, KeyPair, String)> {
    let cert_pem = std::fs::read_to_string(cert_path)?;
    let key_pem = std::fs::read_to_string(key_path)?;
    let key = KeyPair::from_pem(&key_pem)
        .map_err(|e| Error::Certificate(format!("CA key unreadable: {e}")))?;
    let params = CertificateParams::from_ca_cert_pem(&cert_pem)
        .map_err(|e| Error::Certificate(format!("CA cert unreadable: {e}")))?;
    // re-issue a signing handle over the same key and subject; the exported
    // PEM stays byte-identical to what the guest already trusts
    let cert = params
        .self_signed(&key)
        .map_err(|e| Error::Certificate(format!("CA rebuild: {e}")))?;
    Ok((cert, key, cert_pem))
}

/// Registrable parent of a subdomain SNI: `api.github.com` -> `github.com`.
/// Two-label names have no separate apex.
fn apex_of(sni: &str) -> Option<String> {
    let labels: Vec<&str> = sni.split('.').collect();
    if labels.len() <= 2 {
        return None;
    }
    Some(labels[labels.len() - 2..].join("."))
}
