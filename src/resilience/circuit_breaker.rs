use std::{collections::HashMap, time::Duration};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::shared_types::TenantId;

// -----------------------------------------------------------------------------
// ----- BreakerConfig ---------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive creation failures that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects creation before allowing a trial.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(300),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- CircuitState ----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Read-only view of one tenant's breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    pub last_failure_at: Option<Instant>,
    pub next_retry_at: Option<Instant>,
}

/// Creation is refused; `remaining` is how long until a trial is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerRejection {
    pub remaining: Duration,
}

impl BreakerRejection {
    /// Whole seconds, rounded up, never zero.
    pub fn remaining_secs(&self) -> u64 {
        let secs = self.remaining.as_secs() + u64::from(self.remaining.subsec_nanos() > 0);
        secs.max(1)
    }
}

// -----------------------------------------------------------------------------
// ----- CircuitBreaker --------------------------------------------------------

/// Per-tenant failure gate in front of session creation.
///
/// ```text
/// Closed   -> Open      failure_threshold consecutive failures
/// Open     -> HalfOpen  cooldown elapsed, next check admits one trial
/// HalfOpen -> Closed    trial succeeded
/// HalfOpen -> Open      trial failed, fresh cooldown
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    by_tenant: Mutex<HashMap<TenantId, BreakerEntry>>,
}

#[derive(Debug, Clone, Default)]
struct BreakerEntry {
    state: Option<OpenState>,
    failures: u32,
    last_failure_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
enum OpenState {
    Open { until: Instant },
    HalfOpen { trial_in_flight: bool },
}

// -----------------------------------------------------------------------------
// ----- CircuitBreaker: Static ------------------------------------------------

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            by_tenant: Mutex::new(HashMap::new()),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- CircuitBreaker: Public ------------------------------------------------

impl CircuitBreaker {
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Called before every creation attempt. An expired open circuit moves to
    /// half-open here and admits exactly one trial.
    pub fn check(&self, tenant: &TenantId) -> Result<(), BreakerRejection> {
        let mut map = self.by_tenant.lock();
        let Some(entry) = map.get_mut(tenant) else {
            return Ok(());
        };

        let now = Instant::now();
        match entry.state {
            None => Ok(()),
            Some(OpenState::Open { until }) if now < until => Err(BreakerRejection {
                remaining: until - now,
            }),
            Some(OpenState::Open { .. }) => {
                entry.state = Some(OpenState::HalfOpen {
                    trial_in_flight: true,
                });
                info!(tenant = %tenant, "circuit half-open, admitting one trial");
                Ok(())
            }
            Some(OpenState::HalfOpen { trial_in_flight }) if trial_in_flight => {
                Err(BreakerRejection {
                    remaining: Duration::ZERO,
                })
            }
            Some(OpenState::HalfOpen { .. }) => {
                entry.state = Some(OpenState::HalfOpen {
                    trial_in_flight: true,
                });
                Ok(())
            }
        }
    }

    pub fn record_success(&self, tenant: &TenantId) {
        let mut map = self.by_tenant.lock();
        let was_open = map.remove(tenant).is_some_and(|entry| entry.state.is_some());
        if was_open {
            info!(tenant = %tenant, "circuit closed after successful trial");
        }
    }

    /// Returns `true` when this failure opened the circuit.
    pub fn record_failure(&self, tenant: &TenantId) -> bool {
        let mut map = self.by_tenant.lock();
        let entry = map.entry(tenant.clone()).or_default();

        let now = Instant::now();
        entry.failures = entry.failures.saturating_add(1);
        entry.last_failure_at = Some(now);

        let trips = match entry.state {
            None => entry.failures >= self.config.failure_threshold,
            Some(OpenState::HalfOpen { .. }) => true,
            Some(OpenState::Open { .. }) => false,
        };

        if trips {
            entry.state = Some(OpenState::Open {
                until: now + self.config.cooldown,
            });
            warn!(
                tenant = %tenant,
                failures = entry.failures,
                cooldown_secs = self.config.cooldown.as_secs(),
                "circuit opened"
            );
        }

        trips
    }

    /// Pure read: does not move an expired circuit to half-open.
    pub fn snapshot(&self, tenant: &TenantId) -> BreakerSnapshot {
        let map = self.by_tenant.lock();
        let Some(entry) = map.get(tenant) else {
            return BreakerSnapshot {
                state: CircuitState::Closed,
                failures: 0,
                last_failure_at: None,
                next_retry_at: None,
            };
        };

        let (state, next_retry_at) = match entry.state {
            None => (CircuitState::Closed, None),
            Some(OpenState::Open { until }) => (CircuitState::Open, Some(until)),
            Some(OpenState::HalfOpen { .. }) => (CircuitState::HalfOpen, None),
        };

        BreakerSnapshot {
            state,
            failures: entry.failures,
            last_failure_at: entry.last_failure_at,
            next_retry_at,
        }
    }

    /// Remaining cooldown when the circuit is open and unexpired.
    pub fn open_remaining(&self, tenant: &TenantId) -> Option<Duration> {
        let map = self.by_tenant.lock();
        match map.get(tenant)?.state {
            Some(OpenState::Open { until }) => {
                let now = Instant::now();
                (now < until).then(|| until - now)
            }
            _ => None,
        }
    }

    /// Admin override.
    pub fn reset(&self, tenant: &TenantId) {
        self.by_tenant.lock().remove(tenant);
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
