use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

// -----------------------------------------------------------------------------
// ----- RateLimitConfig -------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    /// 30 sends per minute per `tenant:recipient`.
    pub fn per_recipient() -> Self {
        Self {
            max_requests: 30,
            window: Duration::from_secs(60),
        }
    }

    /// Shared budget of the whole gateway instance.
    pub fn gateway() -> Self {
        Self {
            max_requests: 600,
            window: Duration::from_secs(60),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::per_recipient()
    }
}

// -----------------------------------------------------------------------------
// ----- Decision / Usage ------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Requests counted in the window after this decision.
    pub current: u32,
    /// Until the oldest counted request leaves the window.
    pub reset_after: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub current: u32,
    pub limit: u32,
    pub reset_after: Duration,
}

// -----------------------------------------------------------------------------
// ----- RateLimitBackend ------------------------------------------------------

/// Shared window storage for horizontally scaled gateways. Must evict, count
/// and record atomically per key.
#[async_trait]
pub trait RateLimitBackend: Send + Sync + 'static {
    async fn check_and_record(
        &self,
        key: &str,
        config: &RateLimitConfig,
    ) -> Result<Decision, RateLimitBackendError>;

    /// Drops the newest recorded request for `key`.
    async fn release(&self, key: &str, config: &RateLimitConfig) -> Result<(), RateLimitBackendError>;
}

#[derive(Debug, Clone, Error)]
pub enum RateLimitBackendError {
    #[error("rate limit backend unreachable: {0}")]
    Unreachable(String),

    #[error("rate limit backend timed out")]
    Timeout,
}

// -----------------------------------------------------------------------------
// ----- LocalWindows ----------------------------------------------------------

/// In-process sliding windows. Used directly when no shared backend is
/// configured and as the fallback when the backend is unreachable.
#[derive(Debug, Default)]
pub struct LocalWindows {
    by_key: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl LocalWindows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evicts expired entries, then admits and records the request if the
    /// window has room. Rejected requests are not recorded.
    pub fn check_and_record(&self, key: &str, config: &RateLimitConfig) -> Decision {
        let now = Instant::now();
        let mut map = self.by_key.lock();
        let window = map.entry(key.to_string()).or_default();

        evict(window, now, config.window);

        let allowed = (window.len() as u32) < config.max_requests;
        if allowed {
            window.push_back(now);
        }

        Decision {
            allowed,
            current: window.len() as u32,
            reset_after: reset_after(window, now, config.window),
        }
    }

    /// Drops the newest recorded request for `key`, if any.
    pub fn release(&self, key: &str) {
        let mut map = self.by_key.lock();
        if let Some(window) = map.get_mut(key) {
            window.pop_back();
        }
    }

    pub fn usage(&self, key: &str, config: &RateLimitConfig) -> Usage {
        let now = Instant::now();
        let mut map = self.by_key.lock();
        let Some(window) = map.get_mut(key) else {
            return Usage {
                current: 0,
                limit: config.max_requests,
                reset_after: Duration::ZERO,
            };
        };

        evict(window, now, config.window);
        Usage {
            current: window.len() as u32,
            limit: config.max_requests,
            reset_after: reset_after(window, now, config.window),
        }
    }

    /// Drops keys whose windows have fully drained. Returns how many went.
    pub fn prune(&self, window: Duration) -> usize {
        let now = Instant::now();
        let mut map = self.by_key.lock();
        let before = map.len();
        map.retain(|_, entries| {
            evict(entries, now, window);
            !entries.is_empty()
        });
        before - map.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.by_key.lock().len()
    }
}

#[async_trait]
impl RateLimitBackend for LocalWindows {
    async fn check_and_record(
        &self,
        key: &str,
        config: &RateLimitConfig,
    ) -> Result<Decision, RateLimitBackendError> {
        Ok(LocalWindows::check_and_record(self, key, config))
    }

    async fn release(&self, key: &str, _config: &RateLimitConfig) -> Result<(), RateLimitBackendError> {
        LocalWindows::release(self, key);
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ----- RateLimiter -----------------------------------------------------------

/// Sliding-window admission control keyed by an arbitrary string.
///
/// When a shared backend is configured but unreachable, decisions fall back to
/// the local windows: a best-effort count, never an unconditional allow.
pub struct RateLimiter {
    config: RateLimitConfig,
    backend: Option<Arc<dyn RateLimitBackend>>,
    local: LocalWindows,
    degraded: AtomicBool,
}

// -----------------------------------------------------------------------------
// ----- RateLimiter: Static ---------------------------------------------------

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            backend: None,
            local: LocalWindows::new(),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn with_backend(config: RateLimitConfig, backend: Arc<dyn RateLimitBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::new(config)
        }
    }
}

// -----------------------------------------------------------------------------
// ----- RateLimiter: Public ---------------------------------------------------

impl RateLimiter {
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub async fn check(&self, key: &str) -> Decision {
        let Some(backend) = &self.backend else {
            return self.local.check_and_record(key, &self.config);
        };

        match backend.check_and_record(key, &self.config).await {
            Ok(decision) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    info!("rate limit backend recovered");
                }
                decision
            }
            Err(e) => {
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    warn!("{e}; falling back to local rate limit windows");
                }
                self.local.check_and_record(key, &self.config)
            }
        }
    }

    pub async fn check_limit(&self, key: &str) -> bool {
        self.check(key).await.allowed
    }

    /// Gives back a slot taken by `check` for a request that was then refused
    /// further down the line. Goes wherever the last decision was recorded.
    pub async fn release(&self, key: &str) {
        match &self.backend {
            Some(backend) if !self.is_degraded() => {
                if let Err(e) = backend.release(key, &self.config).await {
                    warn!(key, "could not release rate limit slot: {e}");
                }
            }
            _ => self.local.release(key),
        }
    }

    /// Usage as seen by this instance's local windows.
    pub fn usage(&self, key: &str) -> Usage {
        self.local.usage(key, &self.config)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn prune(&self) -> usize {
        self.local.prune(self.config.window)
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn evict(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while let Some(&oldest) = window.front() {
        if now.duration_since(oldest) >= span {
            window.pop_front();
        } else {
            break;
        }
    }
}

fn reset_after(window: &VecDeque<Instant>, now: Instant, span: Duration) -> Duration {
    window
        .front()
        .map(|&oldest| (oldest + span).saturating_duration_since(now))
        .unwrap_or(Duration::ZERO)
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn two_per_second() -> RateLimitConfig {
        RateLimitConfig {
            max_requests: 2,
            window: Duration::from_millis(1000),
        }
    }

    struct DownBackend;

    #[async_trait]
    impl RateLimitBackend for DownBackend {
        async fn check_and_record(
            &self,
            _key: &str,
            _config: &RateLimitConfig,
        ) -> Result<Decision, RateLimitBackendError> {
            Err(RateLimitBackendError::Unreachable("connection refused".into()))
        }

        async fn release(
            &self,
            _key: &str,
            _config: &RateLimitConfig,
        ) -> Result<(), RateLimitBackendError> {
            Err(RateLimitBackendError::Unreachable("connection refused".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sliding_window_law() {
        let limiter = RateLimiter::new(two_per_second());

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(limiter.check_limit("k").await);
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        assert_eq!(seen, vec![true, true, false]);

        // 1000ms after the first call
        tokio::time::advance(Duration::from_millis(700)).await;
        assert!(limiter.check_limit("k").await);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_isolated() {
        let limiter = RateLimiter::new(two_per_second());
        assert!(limiter.check_limit("t1:a").await);
        assert!(limiter.check_limit("t1:a").await);
        assert!(!limiter.check_limit("t1:a").await);
        assert!(limiter.check_limit("t1:b").await);
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_reports_reset() {
        let limiter = RateLimiter::new(two_per_second());
        limiter.check("k").await;
        tokio::time::advance(Duration::from_millis(250)).await;
        limiter.check("k").await;

        let d = limiter.check("k").await;
        assert!(!d.allowed);
        assert_eq!(d.current, 2);
        assert_eq!(d.reset_after, Duration::from_millis(750));

        let usage = limiter.usage("k");
        assert_eq!(usage.current, 2);
        assert_eq!(usage.limit, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn released_slot_is_available_again() {
        let limiter = RateLimiter::new(two_per_second());
        assert!(limiter.check_limit("k").await);
        assert!(limiter.check_limit("k").await);

        limiter.release("k").await;
        assert_eq!(limiter.usage("k").current, 1);
        assert!(limiter.check_limit("k").await);
        assert!(!limiter.check_limit("k").await);

        // Unknown keys are left alone.
        limiter.release("other").await;
        assert_eq!(limiter.local.tracked_keys(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn release_follows_the_fallback_windows() {
        let limiter = RateLimiter::with_backend(two_per_second(), Arc::new(DownBackend));
        assert!(limiter.check_limit("k").await);
        assert!(limiter.check_limit("k").await);

        limiter.release("k").await;
        assert!(limiter.check_limit("k").await);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_backend_falls_back_to_local_count() {
        let limiter = RateLimiter::with_backend(two_per_second(), Arc::new(DownBackend));

        assert!(limiter.check_limit("k").await);
        assert!(limiter.is_degraded());
        assert!(limiter.check_limit("k").await);
        assert!(!limiter.check_limit("k").await);
    }

    #[tokio::test(start_paused = true)]
    async fn prune_drops_drained_windows() {
        let limiter = RateLimiter::new(two_per_second());
        limiter.check("a").await;
        limiter.check("b").await;
        assert_eq!(limiter.prune(), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.prune(), 2);
        assert_eq!(limiter.local.tracked_keys(), 0);
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
