use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// -----------------------------------------------------------------------------
// ----- PairingKind -----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingKind {
    /// Payload to render as a QR code and scan from the phone.
    Qr,
    /// Numeric code typed into the phone ("link with phone number").
    Code,
}

impl fmt::Display for PairingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingKind::Qr => f.write_str("qr"),
            PairingKind::Code => f.write_str("code"),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- PairingMaterial -------------------------------------------------------

/// Short-lived out-of-band authentication payload held by a pairing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingMaterial {
    pub kind: PairingKind,
    pub value: String,
    pub issued_at: Instant,
    pub expires_at: Instant,
}

impl PairingMaterial {
    pub fn new(kind: PairingKind, value: impl Into<String>, ttl: Duration) -> Self {
        let issued_at = Instant::now();
        Self {
            kind,
            value: value.into(),
            issued_at,
            expires_at: issued_at + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
