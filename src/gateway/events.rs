use serde::Serialize;

use crate::shared_types::{PairingKind, TenantId};
use crate::transport::InboundMessage;

// -----------------------------------------------------------------------------
// ----- PoolEvent -------------------------------------------------------------

/// What the pool tells its observers. Delivered over a broadcast channel; a
/// subscriber that lags loses events and never slows the pool down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    SessionCreated {
        tenant_id: TenantId,
        use_pairing_code: bool,
    },
    PairingMaterial {
        tenant_id: TenantId,
        kind: PairingKind,
    },
    Connected {
        tenant_id: TenantId,
    },
    Disconnected {
        tenant_id: TenantId,
        reason: String,
        logged_out: bool,
    },
    ReconnectScheduled {
        tenant_id: TenantId,
        attempt: u32,
        delay_ms: u64,
    },
    /// Terminal: reconnect attempts are exhausted. Emitted once per session.
    ReconnectFailed {
        tenant_id: TenantId,
        attempts: u32,
    },
    LoggedOut {
        tenant_id: TenantId,
    },
    CircuitOpened {
        tenant_id: TenantId,
        cooldown_secs: u64,
    },
    SessionRemoved {
        tenant_id: TenantId,
        reason: RemovalReason,
    },
    MessageSent {
        tenant_id: TenantId,
        message_id: String,
    },
    MessageReceived {
        tenant_id: TenantId,
        message: InboundMessage,
    },
    RateLimited {
        tenant_id: TenantId,
        key: String,
    },
    Error {
        tenant_id: TenantId,
        code: &'static str,
        message: String,
    },
}

impl PoolEvent {
    pub fn tenant_id(&self) -> &TenantId {
        match self {
            PoolEvent::SessionCreated { tenant_id, .. }
            | PoolEvent::PairingMaterial { tenant_id, .. }
            | PoolEvent::Connected { tenant_id }
            | PoolEvent::Disconnected { tenant_id, .. }
            | PoolEvent::ReconnectScheduled { tenant_id, .. }
            | PoolEvent::ReconnectFailed { tenant_id, .. }
            | PoolEvent::LoggedOut { tenant_id }
            | PoolEvent::CircuitOpened { tenant_id, .. }
            | PoolEvent::SessionRemoved { tenant_id, .. }
            | PoolEvent::MessageSent { tenant_id, .. }
            | PoolEvent::MessageReceived { tenant_id, .. }
            | PoolEvent::RateLimited { tenant_id, .. }
            | PoolEvent::Error { tenant_id, .. } => tenant_id,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- RemovalReason ---------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    Requested,
    LoggedOut,
    ReconnectFailed,
    CircuitOpen,
    Shutdown,
}
