//! File-backed credential store (`certModules[].plugin = "file"`).
//!
//! Each enabled cert module owns a directory under the database working
//! directory. `create_key` mints a key pair for the module's configured
//! algorithm and returns a PEM CSR carrying the configured extended key
//! usages; `apply_cert` parses the signed certificate, stores it next
//! to the key and publishes a change event. Self-signed modules skip the
//! CSR round and install their certificate at key creation.
//!
//! Module algorithm and extended-key-usage names are resolved when the
//! store is built; an unrecognized value fails at load, not at first
//! use.
//!
//! The store enforces `maxItems` per module by evicting the oldest
//! certificate, matching how a constrained hardware token would recycle
//! slots.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use edgeiam_common::config::CertModuleConfig;
use edgeiam_common::{IamError, Result};

use crate::collaborators::{CertInfo, CredentialStore};
use crate::tls::url_to_path;

const CERT_CHANGED_CAPACITY: usize = 16;
const KEY_FILE: &str = "key.pem";

#[derive(Debug)]
struct Module {
    id: String,
    dir: PathBuf,
    max_items: usize,
    self_signed: bool,
    alg: &'static rcgen::SignatureAlgorithm,
    extended_key_usages: Vec<rcgen::ExtendedKeyUsagePurpose>,
    alternative_names: Vec<String>,
    /// Installed certificates, oldest first.
    certs: Mutex<Vec<CertInfo>>,
}

#[derive(Debug)]
pub struct FileCredentialStore {
    modules: HashMap<String, Module>,
    changed_tx: broadcast::Sender<CertInfo>,
}

impl FileCredentialStore {
    /// Builds the store from the enabled cert modules, loading
    /// certificates installed by previous runs.
    pub fn new(working_dir: impl AsRef<Path>, configs: &[CertModuleConfig]) -> Result<Self> {
        let root = working_dir.as_ref();
        let mut modules = HashMap::new();

        for config in configs.iter().filter(|config| !config.disabled) {
            let dir = root.join(&config.id);
            std::fs::create_dir_all(&dir)?;

            let module = Module {
                id: config.id.clone(),
                dir: dir.clone(),
                max_items: if config.max_items == 0 { 1 } else { config.max_items },
                self_signed: config.self_signed,
                alg: signature_algorithm(&config.algorithm)?,
                extended_key_usages: config
                    .extended_key_usage
                    .iter()
                    .map(|name| extended_key_usage(name))
                    .collect::<Result<Vec<_>>>()?,
                alternative_names: config.alternative_names.clone(),
                certs: Mutex::new(load_existing(&config.id, &dir)),
            };
            modules.insert(config.id.clone(), module);
        }

        let (changed_tx, _) = broadcast::channel(CERT_CHANGED_CAPACITY);
        Ok(Self { modules, changed_tx })
    }

    fn module(&self, cert_type: &str) -> Result<&Module> {
        self.modules
            .get(cert_type)
            .ok_or_else(|| IamError::not_found(format!("unknown cert type: {cert_type}")))
    }

    fn install(&self, module: &Module, cert_pem: &str) -> Result<CertInfo> {
        let parsed = parse_cert_pem(cert_pem)?;
        let cert_path = module.dir.join(format!("cert-{}.pem", parsed.serial));
        std::fs::write(&cert_path, cert_pem)?;

        let info = CertInfo {
            cert_type: module.id.clone(),
            key_url: file_url(&module.dir.join(KEY_FILE)),
            cert_url: file_url(&cert_path),
            serial: parsed.serial,
            issuer: parsed.issuer,
            not_after: parsed.not_after,
        };

        {
            let mut certs = module.certs.lock();
            certs.push(info.clone());
            while certs.len() > module.max_items {
                let evicted = certs.remove(0);
                let _ = std::fs::remove_file(url_to_path(&evicted.cert_url));
                debug!(cert_type = %module.id, serial = %evicted.serial, "evicted oldest certificate");
            }
        }

        let _ = self.changed_tx.send(info.clone());
        Ok(info)
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn cert_types(&self) -> Result<Vec<String>> {
        let mut types: Vec<String> = self.modules.keys().cloned().collect();
        types.sort();
        Ok(types)
    }

    async fn start_provisioning(&self, _password: &str) -> Result<()> {
        Ok(())
    }

    async fn finish_provisioning(&self, _password: &str) -> Result<()> {
        Ok(())
    }

    async fn deprovision(&self, _password: &str) -> Result<()> {
        for module in self.modules.values() {
            module.certs.lock().clear();
            if let Err(err) = std::fs::remove_dir_all(&module.dir) {
                warn!(cert_type = %module.id, error = %err, "failed to clear module directory");
            }
            std::fs::create_dir_all(&module.dir)?;
        }
        Ok(())
    }

    async fn create_key(&self, cert_type: &str, subject: &str, _password: &str) -> Result<String> {
        if subject.is_empty() {
            return Err(IamError::invalid_argument("subject can't be empty"));
        }

        let module = self.module(cert_type)?;

        let mut params = rcgen::CertificateParams::default();
        params.alg = module.alg;
        params.distinguished_name = rcgen::DistinguishedName::new();
        params.distinguished_name.push(rcgen::DnType::CommonName, subject);
        params.extended_key_usages = module.extended_key_usages.clone();
        params.subject_alt_names = module
            .alternative_names
            .iter()
            .map(|name| rcgen::SanType::DnsName(name.clone()))
            .collect();

        let cert = rcgen::Certificate::from_params(params)
            .map_err(|e| IamError::internal(format!("key generation failed: {e}")))?;

        std::fs::write(module.dir.join(KEY_FILE), cert.serialize_private_key_pem())?;

        if module.self_signed {
            let pem = cert
                .serialize_pem()
                .map_err(|e| IamError::internal(format!("self-sign failed: {e}")))?;
            self.install(module, &pem)?;
        }

        let csr = cert
            .serialize_request_pem()
            .map_err(|e| IamError::internal(format!("CSR serialization failed: {e}")))?;

        debug!(cert_type, subject, "created key pair");
        Ok(csr)
    }

    async fn apply_cert(&self, cert_type: &str, cert_pem: &str) -> Result<CertInfo> {
        let module = self.module(cert_type)?;
        let info = self.install(module, cert_pem)?;

        debug!(cert_type, serial = %info.serial, "applied certificate");
        Ok(info)
    }

    async fn get_cert(&self, cert_type: &str, issuer: &[u8], serial: &str) -> Result<CertInfo> {
        let module = self.module(cert_type)?;
        let certs = module.certs.lock();

        certs
            .iter()
            .rev()
            .find(|cert| {
                (serial.is_empty() || cert.serial == serial)
                    && (issuer.is_empty() || cert.issuer == issuer)
            })
            .cloned()
            .ok_or_else(|| {
                IamError::not_found(format!("certificate not found: type={cert_type}, serial={serial}"))
            })
    }

    fn subscribe_cert_changed(&self) -> broadcast::Receiver<CertInfo> {
        self.changed_tx.subscribe()
    }
}

/// Maps the configured `algorithm` to a key-generation algorithm.
/// `ecc` and `rsa` are the names the fleet tooling writes; anything
/// else must name a supported algorithm directly.
fn signature_algorithm(algorithm: &str) -> Result<&'static rcgen::SignatureAlgorithm> {
    match algorithm.to_ascii_lowercase().as_str() {
        "" | "ecc" => Ok(&rcgen::PKCS_ECDSA_P256_SHA256),
        "rsa" => Ok(&rcgen::PKCS_RSA_SHA256),
        "ed25519" => Ok(&rcgen::PKCS_ED25519),
        other => Err(IamError::invalid_argument(format!("unknown key algorithm: {other}"))),
    }
}

/// Maps one configured extended-key-usage name to its X.509 purpose.
fn extended_key_usage(name: &str) -> Result<rcgen::ExtendedKeyUsagePurpose> {
    match name.to_ascii_lowercase().as_str() {
        "any" => Ok(rcgen::ExtendedKeyUsagePurpose::Any),
        "serverauth" => Ok(rcgen::ExtendedKeyUsagePurpose::ServerAuth),
        "clientauth" => Ok(rcgen::ExtendedKeyUsagePurpose::ClientAuth),
        "codesigning" => Ok(rcgen::ExtendedKeyUsagePurpose::CodeSigning),
        "emailprotection" => Ok(rcgen::ExtendedKeyUsagePurpose::EmailProtection),
        "timestamping" => Ok(rcgen::ExtendedKeyUsagePurpose::TimeStamping),
        "ocspsigning" => Ok(rcgen::ExtendedKeyUsagePurpose::OcspSigning),
        other => Err(IamError::invalid_argument(format!("unknown extended key usage: {other}"))),
    }
}

struct ParsedCert {
    serial: String,
    issuer: Vec<u8>,
    not_after: u64,
}

fn parse_cert_pem(cert_pem: &str) -> Result<ParsedCert> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| IamError::invalid_argument(format!("bad certificate PEM: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| IamError::invalid_argument(format!("bad certificate: {e}")))?;

    Ok(ParsedCert {
        serial: hex::encode(cert.raw_serial()),
        issuer: cert.issuer().as_raw().to_vec(),
        not_after: cert.validity().not_after.timestamp().max(0) as u64,
    })
}

fn load_existing(cert_type: &str, dir: &Path) -> Vec<CertInfo> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut certs = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("cert-") || !name.ends_with(".pem") {
            continue;
        }

        let Ok(pem) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        match parse_cert_pem(&pem) {
            Ok(parsed) => certs.push(CertInfo {
                cert_type: cert_type.to_string(),
                key_url: file_url(&dir.join(KEY_FILE)),
                cert_url: file_url(&entry.path()),
                serial: parsed.serial,
                issuer: parsed.issuer,
                not_after: parsed.not_after,
            }),
            Err(err) => warn!(cert_type, file = %name, error = %err, "skipping unreadable certificate"),
        }
    }

    certs.sort_by_key(|cert| cert.not_after);
    certs
}

fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}
