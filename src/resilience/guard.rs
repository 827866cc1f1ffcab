use std::{future::Future, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::credentials::{CredentialStore, Credentials, StoreError};
use crate::shared_types::TenantId;

// -----------------------------------------------------------------------------
// ----- GuardedOp -------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardedOp {
    Open,
    Send,
    LoadCredentials,
    SaveCredentials,
}

impl GuardedOp {
    pub fn as_str(self) -> &'static str {
        match self {
            GuardedOp::Open => "open",
            GuardedOp::Send => "send",
            GuardedOp::LoadCredentials => "load_credentials",
            GuardedOp::SaveCredentials => "save_credentials",
        }
    }
}

// -----------------------------------------------------------------------------
// ----- OperationPolicy / PolicyTable -----------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationPolicy {
    pub timeout: Duration,
    /// Extra attempts after the first. Zero for anything not idempotent.
    pub retries: u32,
    pub retry_delay: Duration,
}

/// The full set of guarded operations and their policies. Static on purpose:
/// nothing outside this table gets wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyTable {
    /// Credential load plus transport handshake for a new session.
    pub open: OperationPolicy,
    pub send: OperationPolicy,
    pub load_credentials: OperationPolicy,
    pub save_credentials: OperationPolicy,
}

impl PolicyTable {
    pub fn policy(&self, op: GuardedOp) -> &OperationPolicy {
        match op {
            GuardedOp::Open => &self.open,
            GuardedOp::Send => &self.send,
            GuardedOp::LoadCredentials => &self.load_credentials,
            GuardedOp::SaveCredentials => &self.save_credentials,
        }
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        let store = OperationPolicy {
            timeout: Duration::from_secs(5),
            retries: 2,
            retry_delay: Duration::from_millis(200),
        };

        Self {
            open: OperationPolicy {
                timeout: Duration::from_secs(30),
                retries: 0,
                retry_delay: Duration::ZERO,
            },
            send: OperationPolicy {
                timeout: Duration::from_secs(15),
                retries: 0,
                retry_delay: Duration::ZERO,
            },
            load_credentials: store,
            save_credentials: store,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- guard -----------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GuardError<E> {
    #[error("{op} timed out after {}ms", .after.as_millis())]
    Timeout { op: &'static str, after: Duration },

    #[error(transparent)]
    Failed(E),
}

/// Runs `f` under the policy for `op`. Each attempt gets the full timeout;
/// the last error is returned once retries run out.
pub async fn guard<T, E, F, Fut>(
    table: &PolicyTable,
    op: GuardedOp,
    mut f: F,
) -> Result<T, GuardError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let policy = table.policy(op);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let err = match timeout(policy.timeout, f()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => GuardError::Failed(e),
            Err(_) => GuardError::Timeout {
                op: op.as_str(),
                after: policy.timeout,
            },
        };

        if attempt > policy.retries {
            return Err(err);
        }

        debug!(op = op.as_str(), attempt, "guarded operation failed, retrying");
        sleep(policy.retry_delay).await;
    }
}

// -----------------------------------------------------------------------------
// ----- GuardedStore ----------------------------------------------------------

/// Credential store decorator applying the load/save policies.
#[derive(Clone)]
pub struct GuardedStore {
    inner: Arc<dyn CredentialStore>,
    table: PolicyTable,
}

impl GuardedStore {
    pub fn new(inner: Arc<dyn CredentialStore>, table: PolicyTable) -> Self {
        Self { inner, table }
    }

    pub fn inner(&self) -> &Arc<dyn CredentialStore> {
        &self.inner
    }

    pub async fn load(&self, tenant: &TenantId) -> Result<Option<Credentials>, StoreError> {
        guard(&self.table, GuardedOp::LoadCredentials, || self.inner.load(tenant))
            .await
            .map_err(flatten)
    }

    pub async fn save(&self, tenant: &TenantId, credentials: &Credentials) -> Result<(), StoreError> {
        guard(&self.table, GuardedOp::SaveCredentials, || {
            self.inner.save(tenant, credentials)
        })
        .await
        .map_err(flatten)
    }

    /// Not in the policy table: a single attempt.
    pub async fn delete(&self, tenant: &TenantId) -> Result<(), StoreError> {
        self.inner.delete(tenant).await
    }

    pub async fn list(&self) -> Result<Vec<TenantId>, StoreError> {
        self.inner.list().await
    }
}

fn flatten(err: GuardError<StoreError>) -> StoreError {
    match err {
        GuardError::Timeout { .. } => StoreError::Timeout,
        GuardError::Failed(e) => e,
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = &AtomicU32::new(0);
        let out = guard(&PolicyTable::default(), GuardedOp::LoadCredentials, move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 { Err(format!("flaky #{n}")) } else { Ok(n) }
        })
        .await
        .unwrap();

        assert_eq!(out, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn send_is_never_retried() {
        let calls = &AtomicU32::new(0);
        let err = guard(&PolicyTable::default(), GuardedOp::Send, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("rejected")
        })
        .await
        .unwrap_err();

        assert!(matches!(err, GuardError::Failed("rejected")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_gets_a_single_bounded_attempt() {
        let calls = &AtomicU32::new(0);
        let err = guard(&PolicyTable::default(), GuardedOp::Open, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<Result<(), String>>().await
        })
        .await
        .unwrap_err();

        assert!(matches!(err, GuardError::Timeout { op: "open", after } if after == Duration::from_secs(30)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_each_attempt() {
        let calls = &AtomicU32::new(0);
        let err = guard(&PolicyTable::default(), GuardedOp::SaveCredentials, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<Result<(), String>>().await
        })
        .await
        .unwrap_err();

        assert!(matches!(err, GuardError::Timeout { op: "save_credentials", .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
