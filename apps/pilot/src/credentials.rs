//! Client identity and server trust material for the mutual-TLS control socket.
//!
//! The identity is a PKCS#12 bundle (private key plus certificate chain). Trust
//! starts from the platform store and may be widened with an extra root or
//! narrowed with SHA-256 pins on the server leaf certificate.

use native_tls::{Certificate, Identity, TlsConnector};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential bundle not found at {0:?}")]
    NotFound(PathBuf),
    #[error("failed to import credential bundle: {0}")]
    ImportFailed(String),
    #[error("failed to read {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("trusted root {path:?} is not a valid certificate: {reason}")]
    InvalidRoot { path: PathBuf, reason: String },
    #[error("invalid sha-256 pin {0:?}")]
    InvalidPin(String),
    #[error("failed to build tls connector: {0}")]
    Connector(String),
}

#[derive(Clone)]
pub struct CredentialConfig {
    pub bundle: PathBuf,
    pub passphrase: String,
    pub trusted_root: Option<PathBuf>,
    pub pins: Vec<String>,
}

impl fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("bundle", &self.bundle)
            .field("passphrase", &"<redacted>")
            .field("trusted_root", &self.trusted_root)
            .field("pins", &self.pins)
            .finish()
    }
}

/// Decoded client identity. Immutable once loaded.
#[derive(Clone)]
pub struct ClientIdentity {
    identity: Identity,
    bundle: PathBuf,
}

impl ClientIdentity {
    pub fn bundle(&self) -> &Path {
        &self.bundle
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("bundle", &self.bundle)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustVerdict {
    Trusted { fingerprint: String },
    Rejected { reason: String },
}

/// Server trust rules applied on top of the TLS handshake.
#[derive(Clone, Default)]
pub struct TrustPolicy {
    extra_roots: Vec<Certificate>,
    pins: Vec<[u8; 32]>,
}

impl fmt::Debug for TrustPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustPolicy")
            .field("extra_roots", &self.extra_roots.len())
            .field("pins", &self.pins.iter().map(hex::encode).collect::<Vec<_>>())
            .finish()
    }
}

impl TrustPolicy {
    /// Platform trust store only.
    pub fn system() -> Self {
        Self::default()
    }

    /// Adds a PEM or DER root certificate read from `path`.
    pub fn with_root_file(mut self, path: &Path) -> Result<Self, CredentialError> {
        let bytes = read_file(path)?;
        let parsed = if bytes.starts_with(b"-----BEGIN") {
            Certificate::from_pem(&bytes)
        } else {
            Certificate::from_der(&bytes)
        };
        let cert = parsed.map_err(|err| CredentialError::InvalidRoot {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        self.extra_roots.push(cert);
        Ok(self)
    }

    /// Accepts hex digests, with or without `:` separators.
    pub fn with_pins<S: AsRef<str>>(mut self, pins: &[S]) -> Result<Self, CredentialError> {
        for pin in pins {
            let raw = pin.as_ref();
            let cleaned: String = raw.chars().filter(|c| *c != ':').collect();
            let decoded = hex::decode(cleaned.trim())
                .map_err(|_| CredentialError::InvalidPin(raw.to_string()))?;
            let digest: [u8; 32] = decoded
                .try_into()
                .map_err(|_| CredentialError::InvalidPin(raw.to_string()))?;
            self.pins.push(digest);
        }
        Ok(self)
    }

    pub fn is_pinned(&self) -> bool {
        !self.pins.is_empty()
    }

    /// Evaluates the leaf certificate the server presented during the
    /// handshake. Chain validation against the roots already happened inside
    /// the TLS stack; this adds the pin check and yields the fingerprint.
    pub fn evaluate(&self, server_der: Option<&[u8]>) -> TrustVerdict {
        let Some(der) = server_der else {
            return TrustVerdict::Rejected {
                reason: "server presented no certificate".into(),
            };
        };
        let digest: [u8; 32] = Sha256::digest(der).into();
        let fingerprint = hex::encode(digest);
        if self.is_pinned() && !self.pins.contains(&digest) {
            return TrustVerdict::Rejected {
                reason: format!("server certificate {fingerprint} matches no configured pin"),
            };
        }
        TrustVerdict::Trusted { fingerprint }
    }
}

/// Everything the secure session needs to dial: who we are and whom we trust.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub identity: ClientIdentity,
    pub trust: TrustPolicy,
}

impl ClientCredentials {
    /// Builds a connector that always presents the client identity.
    pub fn connector(&self) -> Result<TlsConnector, CredentialError> {
        let mut builder = TlsConnector::builder();
        builder.identity(self.identity.identity.clone());
        for root in &self.trust.extra_roots {
            builder.add_root_certificate(root.clone());
        }
        builder
            .build()
            .map_err(|err| CredentialError::Connector(err.to_string()))
    }
}

pub struct CredentialStore;

impl CredentialStore {
    /// One-shot import of a PKCS#12 bundle. Failures are fatal for the caller;
    /// nothing here retries.
    pub fn load(bundle_path: &Path, passphrase: &str) -> Result<ClientIdentity, CredentialError> {
        if !bundle_path.is_file() {
            tracing::error!(
                target: "pilot::credentials",
                bundle = %bundle_path.display(),
                "credential bundle missing"
            );
            return Err(CredentialError::NotFound(bundle_path.to_path_buf()));
        }
        let bytes = read_file(bundle_path)?;
        let identity = Identity::from_pkcs12(&bytes, passphrase).map_err(|err| {
            tracing::error!(
                target: "pilot::credentials",
                bundle = %bundle_path.display(),
                error = %err,
                "credential bundle import failed"
            );
            CredentialError::ImportFailed(err.to_string())
        })?;
        tracing::info!(
            target: "pilot::credentials",
            bundle = %bundle_path.display(),
            "client identity loaded"
        );
        Ok(ClientIdentity {
            identity,
            bundle: bundle_path.to_path_buf(),
        })
    }

    pub fn open(config: &CredentialConfig) -> Result<ClientCredentials, CredentialError> {
        let identity = Self::load(&config.bundle, &config.passphrase)?;
        let mut trust = TrustPolicy::system().with_pins(config.pins.as_slice())?;
        if let Some(root) = &config.trusted_root {
            trust = trust.with_root_file(root)?;
        }
        Ok(ClientCredentials { identity, trust })
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, CredentialError> {
    fs::read(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => CredentialError::NotFound(path.to_path_buf()),
        _ => CredentialError::Io {
            path: path.to_path_buf(),
            source,
        },
    })
}
