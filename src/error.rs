//! Error types for the controller
//!
//! Each collaborator boundary gets its own enum so callers can tell the
//! expected outcomes (a long-poll timeout, lock contention, an exhausted port
//! range) apart from real failures.

use std::path::PathBuf;
use thiserror::Error;

/// Failures talking to the service registry
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The blocking query or request ran past its deadline. Not a failure,
    /// callers re-poll immediately.
    #[error("registry request timed out")]
    Timeout,

    /// The referenced session or key does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Connection level error
    #[error("registry transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// The registry answered with an unexpected status
    #[error("registry returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body could not be decoded
    #[error("invalid registry response: {0}")]
    Decode(String),
}

impl RegistryError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RegistryError::Timeout)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound(_))
    }
}

/// Port allocation failures
#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port in range [{min}, {max})")]
    Exhausted { min: u16, max: u16 },

    #[error("failed to record port mapping: {0}")]
    Registry(#[from] RegistryError),
}

/// Certificate issuance failures
#[derive(Debug, Error)]
pub enum IssueError {
    #[error("no domains requested")]
    NoDomains,

    #[error("key generation failed: {0}")]
    KeyGeneration(#[from] rcgen::Error),

    #[error("issued certificate is unreadable: {0}")]
    InvalidCertificate(String),

    #[error("registry error during issuance: {0}")]
    Registry(#[from] RegistryError),

    #[error("certificate authority error: {0}")]
    Authority(String),

    #[error("issuance task aborted: {0}")]
    Aborted(String),
}

/// Reasons stored key material is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CertificateInvalid {
    #[error("key material is missing")]
    Missing,

    #[error("private key does not parse")]
    PrivateKey,

    #[error("certificate does not parse")]
    PublicKey,

    #[error("certificate expired at {expires_at}")]
    Expired { expires_at: i64 },

    #[error("issued for [{stored}], requested [{expected}]")]
    DomainMismatch { stored: String, expected: String },
}

/// Failures invoking the external proxy binary
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to run {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Failures deploying a rendered configuration set
#[derive(Debug, Error)]
pub enum DeployError {
    /// The dry run rejected the candidate. Nothing was written.
    #[error("configuration rejected by validator: {0}")]
    Validation(#[source] ProxyError),

    #[error("filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DeployError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DeployError::Io {
            path: path.into(),
            source,
        }
    }
}
