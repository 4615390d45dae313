use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};

const LEAF_KEY_FILE: &str = "leaf_key.pem";

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(#[from] rcgen::Error),
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid certificate material: {0}")]
    InvalidMaterial(String),
}

#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    /// CA cert/key PEM paths; both set loads-or-persists, both unset keeps
    /// the CA in memory only (throwaway development root).
    pub ca_cert_pem_path: Option<PathBuf>,
    pub ca_key_pem_path: Option<PathBuf>,
    /// Directory of per-hostname leaf bundles; file existence is the cache
    /// key, there is no expiry or rotation.
    pub cert_cache_dir: PathBuf,
    pub ca_common_name: String,
    pub ca_organization: String,
    /// Leaves are valid now ± this many days.
    pub validity_days: i64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            ca_cert_pem_path: None,
            ca_key_pem_path: None,
            cert_cache_dir: PathBuf::from("certs"),
            ca_common_name: "Burrow Development CA".to_string(),
            ca_organization: "burrow".to_string(),
            validity_days: 30,
        }
    }
}

impl AuthorityConfig {
    fn validate(&self) -> Result<(), TlsError> {
        match (&self.ca_cert_pem_path, &self.ca_key_pem_path) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => {
                return Err(TlsError::InvalidMaterial(
                    "ca_cert_pem_path and ca_key_pem_path must either both be set or both be unset"
                        .to_string(),
                ))
            }
        }
        if self.validity_days <= 0 {
            return Err(TlsError::InvalidMaterial(
                "validity_days must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafCacheStatus {
    Memory,
    Disk,
    Minted,
}

impl LeafCacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Minted => "minted",
        }
    }
}

#[derive(Clone)]
pub struct IssuedServerConfig {
    pub server_config: Arc<ServerConfig>,
    pub cache_status: LeafCacheStatus,
    pub leaf_cert_der: CertificateDer<'static>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CertStoreMetrics {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub leaves_minted: u64,
}

#[derive(Debug)]
struct CaMaterial {
    cert_pem: String,
    cert_der: CertificateDer<'static>,
}

#[derive(Debug)]
struct CachedLeaf {
    server_config: Arc<ServerConfig>,
    leaf_cert_der: CertificateDer<'static>,
}

/// Per-hostname leaf certificate issuer backed by an embedded development
/// CA. One leaf key pair is generated per store and reused for every
/// hostname; only the certificate differs.
#[derive(Debug)]
pub struct LeafCertStore {
    config: AuthorityConfig,
    ca: CaMaterial,
    issuer: Mutex<Issuer<'static, KeyPair>>,
    leaf_key_pem: String,
    memory: DashMap<String, CachedLeaf>,
    // Serializes generation per hostname; distinct hostnames mint
    // concurrently.
    mint_locks: DashMap<String, Arc<Mutex<()>>>,
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    leaves_minted: AtomicU64,
}

impl LeafCertStore {
    pub fn new(config: AuthorityConfig) -> Result<Self, TlsError> {
        config.validate()?;
        fs::create_dir_all(&config.cert_cache_dir)?;

        let (ca, issuer) = load_or_generate_ca(&config)?;
        let leaf_key_pem = load_or_generate_leaf_key(&config.cert_cache_dir)?;

        Ok(Self {
            config,
            ca,
            issuer: Mutex::new(issuer),
            leaf_key_pem,
            memory: DashMap::new(),
            mint_locks: DashMap::new(),
            memory_hits: AtomicU64::new(0),
            disk_hits: AtomicU64::new(0),
            leaves_minted: AtomicU64::new(0),
        })
    }

    pub fn ca_certificate_pem(&self) -> &str {
        &self.ca.cert_pem
    }

    pub fn metrics(&self) -> CertStoreMetrics {
        CertStoreMetrics {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            leaves_minted: self.leaves_minted.load(Ordering::Relaxed),
        }
    }

    pub fn server_config_for_host(&self, host: &str) -> Result<IssuedServerConfig, TlsError> {
        let host = normalize_host(host);

        if let Some(cached) = self.memory.get(&host) {
            self.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(IssuedServerConfig {
                server_config: Arc::clone(&cached.server_config),
                cache_status: LeafCacheStatus::Memory,
                leaf_cert_der: cached.leaf_cert_der.clone(),
            });
        }

        let lock = self
            .mint_locks
            .entry(host.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().expect("mint lock poisoned");

        // Another connection may have minted while this one waited.
        if let Some(cached) = self.memory.get(&host) {
            self.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(IssuedServerConfig {
                server_config: Arc::clone(&cached.server_config),
                cache_status: LeafCacheStatus::Memory,
                leaf_cert_der: cached.leaf_cert_der.clone(),
            });
        }

        let bundle_path = self.bundle_path(&host);
        let (status, leaf_cert_der, chain) = if bundle_path.exists() {
            self.disk_hits.fetch_add(1, Ordering::Relaxed);
            let chain = load_bundle(&bundle_path)?;
            let leaf = chain
                .first()
                .cloned()
                .ok_or_else(|| {
                    TlsError::InvalidMaterial(format!(
                        "leaf bundle {} contains no certificates",
                        bundle_path.display()
                    ))
                })?;
            (LeafCacheStatus::Disk, leaf, chain)
        } else {
            let (leaf_pem, leaf_der) = self.mint_leaf(&host)?;
            persist_bundle(&bundle_path, &leaf_pem, &self.ca.cert_pem)?;
            self.leaves_minted.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(host = %host, path = %bundle_path.display(), "minted leaf certificate");
            let chain = vec![leaf_der.clone(), self.ca.cert_der.clone()];
            (LeafCacheStatus::Minted, leaf_der, chain)
        };

        let server_config = self.build_server_config(chain)?;
        self.memory.insert(
            host,
            CachedLeaf {
                server_config: Arc::clone(&server_config),
                leaf_cert_der: leaf_cert_der.clone(),
            },
        );

        Ok(IssuedServerConfig {
            server_config,
            cache_status: status,
            leaf_cert_der,
        })
    }

    fn bundle_path(&self, host: &str) -> PathBuf {
        self.config.cert_cache_dir.join(format!("{host}.pem"))
    }

    fn mint_leaf(&self, host: &str) -> Result<(String, CertificateDer<'static>), TlsError> {
        let params = build_leaf_params(host, self.config.validity_days)?;
        let leaf_key = KeyPair::from_pem(&self.leaf_key_pem)?;
        let issuer = self.issuer.lock().expect("issuer lock poisoned");
        let leaf_cert = params.signed_by(&leaf_key, &issuer)?;
        Ok((leaf_cert.pem(), leaf_cert.der().clone()))
    }

    fn build_server_config(
        &self,
        chain: Vec<CertificateDer<'static>>,
    ) -> Result<Arc<ServerConfig>, TlsError> {
        let leaf_key = KeyPair::from_pem(&self.leaf_key_pem)?;
        let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let mut server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, private_key)?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(server_config))
    }
}

/// Client config that trusts exactly the given development CA; used by the
/// tooling and tests that talk to the proxy's minted certificates.
pub fn client_config_trusting_ca(ca_cert_pem: &str) -> Result<Arc<ClientConfig>, TlsError> {
    let ca_der = CertificateDer::from_pem_slice(ca_cert_pem.as_bytes())
        .map_err(|error| TlsError::InvalidMaterial(format!("CA certificate PEM: {error}")))?;
    let mut roots = RootCertStore::empty();
    roots
        .add(ca_der)
        .map_err(|error| TlsError::InvalidMaterial(format!("CA certificate rejected: {error}")))?;
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

fn load_or_generate_ca(
    config: &AuthorityConfig,
) -> Result<(CaMaterial, Issuer<'static, KeyPair>), TlsError> {
    match (&config.ca_cert_pem_path, &config.ca_key_pem_path) {
        (Some(cert_path), Some(key_path)) => {
            match (cert_path.exists(), key_path.exists()) {
                (true, true) => load_ca(cert_path, key_path),
                (false, false) => {
                    let (material, issuer, key_pem) = generate_ca(config)?;
                    ensure_parent_exists(cert_path)?;
                    ensure_parent_exists(key_path)?;
                    fs::write(cert_path, material.cert_pem.as_bytes())?;
                    fs::write(key_path, key_pem.as_bytes())?;
                    Ok((material, issuer))
                }
                _ => Err(TlsError::InvalidMaterial(
                    "CA cert and key files must both exist or both be absent".to_string(),
                )),
            }
        }
        (None, None) => generate_ca(config).map(|(material, issuer, _key_pem)| (material, issuer)),
        _ => unreachable!("validated in AuthorityConfig::validate"),
    }
}

fn generate_ca(
    config: &AuthorityConfig,
) -> Result<(CaMaterial, Issuer<'static, KeyPair>, String), TlsError> {
    let ca_key = KeyPair::generate()?;
    // The key pair moves into the issuer below; capture the PEM first so
    // callers can persist it.
    let key_pem = ca_key.serialize_pem();

    let params = build_ca_params(config);
    let ca_cert = params.self_signed(&ca_key)?;
    let cert_pem = ca_cert.pem();
    let cert_der = ca_cert.der().clone();
    let issuer = Issuer::new(params, ca_key);

    Ok((CaMaterial { cert_pem, cert_der }, issuer, key_pem))
}

fn load_ca(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(CaMaterial, Issuer<'static, KeyPair>), TlsError> {
    let cert_pem = fs::read_to_string(cert_path)?;
    let key_pem = fs::read_to_string(key_path)?;
    let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
        TlsError::InvalidMaterial(format!(
            "failed to parse CA certificate PEM from {}: {error}",
            cert_path.display()
        ))
    })?;
    let ca_key = KeyPair::from_pem(&key_pem)?;
    let issuer = Issuer::from_ca_cert_der(&cert_der, ca_key).map_err(|error| {
        TlsError::InvalidMaterial(format!(
            "failed to parse issuer metadata from {}: {error}",
            cert_path.display()
        ))
    })?;

    Ok((CaMaterial { cert_pem, cert_der }, issuer))
}

fn load_or_generate_leaf_key(cache_dir: &Path) -> Result<String, TlsError> {
    let key_path = cache_dir.join(LEAF_KEY_FILE);
    if key_path.exists() {
        let pem = fs::read_to_string(&key_path)?;
        // Reject garbage early rather than on the first CONNECT.
        KeyPair::from_pem(&pem)?;
        return Ok(pem);
    }
    let key = KeyPair::generate()?;
    let pem = key.serialize_pem();
    fs::write(&key_path, pem.as_bytes())?;
    Ok(pem)
}

fn build_ca_params(config: &AuthorityConfig) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, config.ca_common_name.clone());
    distinguished_name.push(DnType::OrganizationName, config.ca_organization.clone());
    params.distinguished_name = distinguished_name;
    params
}

fn build_leaf_params(host: &str, validity_days: i64) -> Result<CertificateParams, TlsError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.is_ca = IsCa::NoCa;
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::days(validity_days);
    params.not_after = now + time::Duration::days(validity_days);

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, host.to_string());
    params.distinguished_name = distinguished_name;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params
            .subject_alt_names
            .push(SanType::DnsName(host.try_into()?));
    }

    Ok(params)
}

fn persist_bundle(path: &Path, leaf_pem: &str, ca_pem: &str) -> Result<(), TlsError> {
    ensure_parent_exists(path)?;
    let mut bundle = String::with_capacity(leaf_pem.len() + ca_pem.len() + 1);
    bundle.push_str(leaf_pem);
    if !leaf_pem.ends_with('\n') {
        bundle.push('\n');
    }
    bundle.push_str(ca_pem);
    fs::write(path, bundle.as_bytes())?;
    Ok(())
}

fn load_bundle(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = fs::read(path)?;
    let chain: Result<Vec<_>, _> = CertificateDer::pem_slice_iter(&pem).collect();
    chain.map_err(|error| {
        TlsError::InvalidMaterial(format!(
            "failed to parse leaf bundle {}: {error}",
            path.display()
        ))
    })
}

fn ensure_parent_exists(path: &Path) -> Result<(), TlsError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn normalize_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}
