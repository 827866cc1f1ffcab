use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::{CredentialStore, Credentials, StoreError};
use crate::shared_types::TenantId;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const EXTENSION: &str = "creds";

// -----------------------------------------------------------------------------
// ----- FileCredentialStore ---------------------------------------------------

/// One file per tenant under `dir`, named `<tenant>.creds`. Tenant ids are
/// restricted to `[A-Za-z0-9_-]`, so they are always safe file names.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

// -----------------------------------------------------------------------------
// ----- FileCredentialStore: Static -------------------------------------------

impl FileCredentialStore {
    /// Creates `dir` if it does not exist yet.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| io_err(&dir, e))?;
        Ok(Self { dir })
    }
}

// -----------------------------------------------------------------------------
// ----- FileCredentialStore: Public -------------------------------------------

impl FileCredentialStore {
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

// -----------------------------------------------------------------------------
// ----- FileCredentialStore: Private ------------------------------------------

impl FileCredentialStore {
    fn path_for(&self, tenant: &TenantId) -> PathBuf {
        self.dir.join(format!("{tenant}.{EXTENSION}"))
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self, tenant: &TenantId) -> Result<Option<Credentials>, StoreError> {
        let path = self.path_for(tenant);
        match fs::read(&path).await {
            Ok(blob) => Ok(Some(Credentials::new(blob))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    /// Write-then-rename so a crash never leaves a truncated blob behind.
    async fn save(&self, tenant: &TenantId, credentials: &Credentials) -> Result<(), StoreError> {
        let path = self.path_for(tenant);
        let tmp = path.with_extension(format!("{EXTENSION}.tmp"));

        fs::write(&tmp, credentials.expose())
            .await
            .map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &path).await.map_err(|e| io_err(&path, e))
    }

    async fn delete(&self, tenant: &TenantId) -> Result<(), StoreError> {
        let path = self.path_for(tenant);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    async fn list(&self) -> Result<Vec<TenantId>, StoreError> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| io_err(&self.dir, e))?;

        let mut tenants = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&self.dir, e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match TenantId::parse(stem) {
                Ok(tenant) => tenants.push(tenant),
                Err(e) => debug!("skipping credential file {}: {e}", path.display()),
            }
        }

        tenants.sort();
        Ok(tenants)
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
