//! Narrow interface to the component that speaks the messaging network's wire
//! protocol. Handshake, frame encryption and key exchange live behind it.
//!
//! `open` hands back the handle together with the receiving end of its event
//! channel. Whatever the adapter emits between the handshake and the pool's
//! first `recv` is buffered, so a `pairing-material` or `open` event can never
//! be lost to a late listener.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::credentials::Credentials;
use crate::errors::PoolError;
use crate::shared_types::{MessagePayload, PairingKind, PhoneNumber, Recipient, SendOptions, TenantId};

// -----------------------------------------------------------------------------
// ----- TransportAdapter ------------------------------------------------------

#[async_trait]
pub trait TransportAdapter: Send + Sync + 'static {
    /// Opens one duplex connection for `tenant`. `credentials` is `None` for a
    /// device that has never been paired.
    async fn open(
        &self,
        tenant: &TenantId,
        credentials: Option<Credentials>,
        config: &OpenConfig,
    ) -> Result<TransportConnection, TransportError>;
}

#[async_trait]
pub trait TransportHandle: Send + Sync + 'static {
    async fn send(
        &self,
        recipient: &Recipient,
        payload: &MessagePayload,
        options: &SendOptions,
    ) -> Result<String, TransportError>;

    async fn request_pairing_code(&self, phone: &PhoneNumber) -> Result<String, TransportError>;

    /// Must be safe to call more than once.
    async fn close(&self);
}

pub struct TransportConnection {
    pub handle: Arc<dyn TransportHandle>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

// -----------------------------------------------------------------------------
// ----- OpenConfig ------------------------------------------------------------

/// Per-connection settings passed through to the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConfig {
    /// Ask the network for a numeric pairing code instead of a QR payload.
    pub use_pairing_code: bool,
    pub phone_number: Option<PhoneNumber>,
    /// Device label shown in the phone's linked-devices list.
    pub device_name: String,
}

// -----------------------------------------------------------------------------
// ----- TransportEvent --------------------------------------------------------

#[derive(Debug)]
pub enum TransportEvent {
    PairingMaterial { kind: PairingKind, value: String },
    StateChange(ConnectionUpdate),
    Message(InboundMessage),
    /// The key material rotated; persist it so a restart resumes cleanly.
    CredentialsUpdated(Credentials),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionUpdate {
    Connecting,
    Open,
    Close(CloseReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// `true` for an explicit logout or device unlink. Never reconnect.
    pub logged_out: bool,
    pub message: String,
}

impl CloseReason {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            logged_out: false,
            message: message.into(),
        }
    }

    pub fn logged_out(message: impl Into<String>) -> Self {
        Self {
            logged_out: true,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundMessage {
    pub id: String,
    pub from: String,
    pub payload: MessagePayload,
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connection closed")]
    Closed,

    #[error("send rejected: {0}")]
    Rejected(String),

    #[error("pairing code unavailable: {0}")]
    Pairing(String),

    #[error("transport error: {0}")]
    Other(String),
}

impl From<TransportError> for PoolError {
    fn from(err: TransportError) -> Self {
        PoolError::connection(err.to_string())
    }
}
