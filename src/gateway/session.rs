use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle, time::Instant};

use crate::shared_types::{PairingKind, PairingMaterial, PhoneNumber, SessionState, TenantId};
use crate::transport::TransportHandle;

// -----------------------------------------------------------------------------
// ----- CreateOptions ---------------------------------------------------------

/// How a session pairs when it has no usable credentials. Kept on the session
/// so scheduled reconnects pair the same way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOptions {
    pub use_pairing_code: bool,
    pub phone_number: Option<PhoneNumber>,
}

impl CreateOptions {
    pub fn qr() -> Self {
        Self::default()
    }

    pub fn pairing_code(phone: PhoneNumber) -> Self {
        Self {
            use_pairing_code: true,
            phone_number: Some(phone),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- PairingConfig ---------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingConfig {
    pub qr_ttl: Duration,
    pub code_ttl: Duration,
    /// Bound on how long `request_pairing_code` waits for the network.
    pub code_wait: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            qr_ttl: Duration::from_secs(60),
            code_ttl: Duration::from_secs(180),
            code_wait: Duration::from_secs(30),
        }
    }
}

impl PairingConfig {
    pub fn ttl(&self, kind: PairingKind) -> Duration {
        match kind {
            PairingKind::Qr => self.qr_ttl,
            PairingKind::Code => self.code_ttl,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- SessionStatus / HealthReport ------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub tenant_id: TenantId,
    pub connected: bool,
    pub state: SessionState,
    pub reconnect_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing: Option<PairingKind>,
}

impl SessionStatus {
    pub(crate) fn absent(tenant_id: TenantId, state: SessionState) -> Self {
        Self {
            tenant_id,
            connected: false,
            state,
            reconnect_attempts: 0,
            pairing: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            reason: None,
        }
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            healthy: false,
            reason: Some(reason.into()),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- TenantSession ---------------------------------------------------------

/// One tenant's live connection as held in the pool map.
///
/// `generation` identifies this incarnation; event pumps and reconnect timers
/// carry it and are ignored once the entry has been replaced.
pub(crate) struct TenantSession {
    pub generation: u64,
    pub state: SessionState,
    pub options: CreateOptions,
    pub handle: Option<Arc<dyn TransportHandle>>,
    pub pairing: Option<PairingMaterial>,
    pub pairing_tx: watch::Sender<Option<PairingMaterial>>,
    pub reconnect_attempts: u32,
    pub created_at: Instant,
    pub last_activity_at: Instant,
    pub pump: Option<JoinHandle<()>>,
    pub reconnect_timer: Option<JoinHandle<()>>,
}

// -----------------------------------------------------------------------------
// ----- TenantSession: Static -------------------------------------------------

impl TenantSession {
    pub fn new(generation: u64, options: CreateOptions, handle: Arc<dyn TransportHandle>) -> Self {
        let now = Instant::now();
        let (pairing_tx, _) = watch::channel(None);
        Self {
            generation,
            state: SessionState::Pairing,
            options,
            handle: Some(handle),
            pairing: None,
            pairing_tx,
            reconnect_attempts: 0,
            created_at: now,
            last_activity_at: now,
            pump: None,
            reconnect_timer: None,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- TenantSession: Public -------------------------------------------------

impl TenantSession {
    pub fn status(&self, tenant_id: &TenantId) -> SessionStatus {
        SessionStatus {
            tenant_id: tenant_id.clone(),
            connected: self.state.is_connected(),
            state: self.state,
            reconnect_attempts: self.reconnect_attempts,
            pairing: self.pairing.as_ref().map(|m| m.kind),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Instant::now();
    }

    pub fn set_pairing(&mut self, material: Option<PairingMaterial>) {
        self.pairing_tx.send_replace(material.clone());
        self.pairing = material;
    }

    /// Drops material past its expiry. Returns whether anything was cleared.
    pub fn expire_pairing(&mut self) -> bool {
        if self.pairing.as_ref().is_some_and(PairingMaterial::is_expired) {
            self.set_pairing(None);
            true
        } else {
            false
        }
    }

    pub fn connected_handle(&self) -> Option<Arc<dyn TransportHandle>> {
        if self.state.is_connected() {
            self.handle.clone()
        } else {
            None
        }
    }

    /// Stops the reconnect timer and, unless called from the pump itself, the
    /// event pump. Returns the transport handle still to be closed.
    pub fn detach(mut self, stop_pump: bool) -> Option<Arc<dyn TransportHandle>> {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        if let (true, Some(pump)) = (stop_pump, self.pump.take()) {
            pump.abort();
        }
        self.handle.take()
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
