use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::time::Instant;

use crate::gateway::PoolEvent;
use crate::shared_types::PairingKind;

// -----------------------------------------------------------------------------
// ----- MetricsSnapshot -------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_created: u64,
    pub sessions_removed: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub qr_codes_issued: u64,
    pub pairing_codes_issued: u64,
    pub errors: u64,
    pub reconnects_scheduled: u64,
    pub reconnects_failed: u64,
    pub circuit_trips: u64,
    pub rate_limited: u64,

    pub active_sessions: u64,
    pub connected_sessions: u64,

    pub uptime_secs: u64,
    pub messages_per_minute: f64,
    /// Errors over (sent + errors). Zero before any traffic.
    pub error_rate: f64,
}

// -----------------------------------------------------------------------------
// ----- MetricsCollector ------------------------------------------------------

/// Counters fed from pool events. Only ever written by `observe` and the
/// gauge setters; nothing in the pool reads them back to make decisions.
#[derive(Debug)]
pub struct MetricsCollector {
    started_at: Instant,

    sessions_created: AtomicU64,
    sessions_removed: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    qr_codes_issued: AtomicU64,
    pairing_codes_issued: AtomicU64,
    errors: AtomicU64,
    reconnects_scheduled: AtomicU64,
    reconnects_failed: AtomicU64,
    circuit_trips: AtomicU64,
    rate_limited: AtomicU64,

    active_sessions: AtomicU64,
    connected_sessions: AtomicU64,
}

// -----------------------------------------------------------------------------
// ----- MetricsCollector: Static ----------------------------------------------

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            sessions_created: AtomicU64::new(0),
            sessions_removed: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            qr_codes_issued: AtomicU64::new(0),
            pairing_codes_issued: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            reconnects_scheduled: AtomicU64::new(0),
            reconnects_failed: AtomicU64::new(0),
            circuit_trips: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            connected_sessions: AtomicU64::new(0),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// -----------------------------------------------------------------------------
// ----- MetricsCollector: Public ----------------------------------------------

impl MetricsCollector {
    pub fn observe(&self, event: &PoolEvent) {
        let counter = match event {
            PoolEvent::SessionCreated { .. } => &self.sessions_created,
            PoolEvent::SessionRemoved { .. } => &self.sessions_removed,
            PoolEvent::MessageSent { .. } => &self.messages_sent,
            PoolEvent::MessageReceived { .. } => &self.messages_received,
            PoolEvent::PairingMaterial {
                kind: PairingKind::Qr,
                ..
            } => &self.qr_codes_issued,
            PoolEvent::PairingMaterial {
                kind: PairingKind::Code,
                ..
            } => &self.pairing_codes_issued,
            PoolEvent::Error { .. } => &self.errors,
            PoolEvent::ReconnectScheduled { .. } => &self.reconnects_scheduled,
            PoolEvent::ReconnectFailed { .. } => &self.reconnects_failed,
            PoolEvent::CircuitOpened { .. } => &self.circuit_trips,
            PoolEvent::RateLimited { .. } => &self.rate_limited,
            PoolEvent::Connected { .. }
            | PoolEvent::Disconnected { .. }
            | PoolEvent::LoggedOut { .. } => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_session_gauges(&self, active: usize, connected: usize) {
        self.active_sessions.store(active as u64, Ordering::Relaxed);
        self.connected_sessions
            .store(connected as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        let uptime = self.started_at.elapsed();
        let messages_sent = load(&self.messages_sent);
        let errors = load(&self.errors);

        let minutes = uptime.as_secs_f64() / 60.0;
        let messages_per_minute = if minutes > 0.0 {
            messages_sent as f64 / minutes
        } else {
            0.0
        };

        let attempts = messages_sent + errors;
        let error_rate = if attempts > 0 {
            errors as f64 / attempts as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            sessions_created: load(&self.sessions_created),
            sessions_removed: load(&self.sessions_removed),
            messages_sent,
            messages_received: load(&self.messages_received),
            qr_codes_issued: load(&self.qr_codes_issued),
            pairing_codes_issued: load(&self.pairing_codes_issued),
            errors,
            reconnects_scheduled: load(&self.reconnects_scheduled),
            reconnects_failed: load(&self.reconnects_failed),
            circuit_trips: load(&self.circuit_trips),
            rate_limited: load(&self.rate_limited),
            active_sessions: load(&self.active_sessions),
            connected_sessions: load(&self.connected_sessions),
            uptime_secs: uptime.as_secs(),
            messages_per_minute,
            error_rate,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_types::TenantId;
    use std::time::Duration;

    fn t1() -> TenantId {
        TenantId::parse("t1").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn counts_events_and_derives_rates() {
        let m = MetricsCollector::new();

        m.observe(&PoolEvent::SessionCreated {
            tenant_id: t1(),
            use_pairing_code: false,
        });
        m.observe(&PoolEvent::PairingMaterial {
            tenant_id: t1(),
            kind: PairingKind::Qr,
        });
        m.observe(&PoolEvent::PairingMaterial {
            tenant_id: t1(),
            kind: PairingKind::Code,
        });
        m.observe(&PoolEvent::Connected { tenant_id: t1() });
        for i in 0..3 {
            m.observe(&PoolEvent::MessageSent {
                tenant_id: t1(),
                message_id: format!("m{i}"),
            });
        }
        m.observe(&PoolEvent::Error {
            tenant_id: t1(),
            code: "CONNECTION_ERROR",
            message: "reset".into(),
        });
        m.set_session_gauges(2, 1);

        tokio::time::advance(Duration::from_secs(120)).await;
        let s = m.snapshot();

        assert_eq!(s.sessions_created, 1);
        assert_eq!(s.qr_codes_issued, 1);
        assert_eq!(s.pairing_codes_issued, 1);
        assert_eq!(s.messages_sent, 3);
        assert_eq!(s.errors, 1);
        assert_eq!(s.active_sessions, 2);
        assert_eq!(s.connected_sessions, 1);
        assert_eq!(s.uptime_secs, 120);
        assert!((s.messages_per_minute - 1.5).abs() < 1e-9);
        assert!((s.error_rate - 0.25).abs() < 1e-9);
    }

    #[test]
    fn empty_snapshot_has_zero_rates() {
        let s = MetricsCollector::new().snapshot();
        assert_eq!(s.error_rate, 0.0);
        assert_eq!(s.messages_sent, 0);
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
