pub mod file;
pub mod memory;

pub use file::FileCredentialStore;
pub use memory::MemoryCredentialStore;

use std::{fmt, path::PathBuf};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretSlice};
use thiserror::Error;

use crate::errors::PoolError;
use crate::shared_types::TenantId;

// -----------------------------------------------------------------------------
// ----- Credentials -----------------------------------------------------------

/// Opaque serialized key material. Zeroed on drop, redacted in `Debug`.
pub struct Credentials {
    blob: SecretSlice<u8>,
}

impl Credentials {
    pub fn new(blob: Vec<u8>) -> Self {
        Self {
            blob: SecretSlice::from(blob),
        }
    }

    pub fn expose(&self) -> &[u8] {
        self.blob.expose_secret()
    }

    pub fn len(&self) -> usize {
        self.expose().len()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }
}

impl Clone for Credentials {
    fn clone(&self) -> Self {
        Self::new(self.expose().to_vec())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials([REDACTED; {} bytes])", self.len())
    }
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Eq for Credentials {}

// -----------------------------------------------------------------------------
// ----- CredentialStore -------------------------------------------------------

/// Per-tenant blob persistence. Shared across gateway instances, so
/// implementations must make `save` atomic per tenant.
#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    async fn load(&self, tenant: &TenantId) -> Result<Option<Credentials>, StoreError>;

    async fn save(&self, tenant: &TenantId, credentials: &Credentials) -> Result<(), StoreError>;

    /// Deleting an absent tenant is not an error.
    async fn delete(&self, tenant: &TenantId) -> Result<(), StoreError>;

    /// Tenants that currently have stored credentials.
    async fn list(&self) -> Result<Vec<TenantId>, StoreError>;
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error for {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("credential store unavailable: {0}")]
    Unavailable(String),

    #[error("credential store timed out")]
    Timeout,
}

impl From<StoreError> for PoolError {
    fn from(err: StoreError) -> Self {
        PoolError::connection(format!("credential store: {err}"))
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
