use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{CredentialStore, Credentials, StoreError};
use crate::shared_types::TenantId;

/// Process-local store. Suitable for tests and single-instance deployments
/// that accept re-pairing after a restart.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    by_tenant: RwLock<HashMap<TenantId, Credentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, tenant: &TenantId) -> bool {
        self.by_tenant.read().contains_key(tenant)
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, tenant: &TenantId) -> Result<Option<Credentials>, StoreError> {
        Ok(self.by_tenant.read().get(tenant).cloned())
    }

    async fn save(&self, tenant: &TenantId, credentials: &Credentials) -> Result<(), StoreError> {
        self.by_tenant
            .write()
            .insert(tenant.clone(), credentials.clone());
        Ok(())
    }

    async fn delete(&self, tenant: &TenantId) -> Result<(), StoreError> {
        self.by_tenant.write().remove(tenant);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<TenantId>, StoreError> {
        let mut tenants: Vec<TenantId> = self.by_tenant.read().keys().cloned().collect();
        tenants.sort();
        Ok(tenants)
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
