use std::{fmt, str::FromStr};

use serde::Serialize;

use crate::errors::PoolError;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

pub const TENANT_ID_MAX_LEN: usize = 50;

// -----------------------------------------------------------------------------
// ----- TenantId --------------------------------------------------------------

/// Validated tenant identifier: 1 to 50 ASCII alphanumerics, `_` or `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TenantId(String);

// -----------------------------------------------------------------------------
// ----- TenantId: Static ------------------------------------------------------

impl TenantId {
    pub fn parse(raw: &str) -> Result<Self, PoolError> {
        if raw.is_empty() || raw.len() > TENANT_ID_MAX_LEN {
            return Err(PoolError::validation(
                "tenant_id",
                format!("must be 1-{TENANT_ID_MAX_LEN} characters, got {}", raw.len()),
            ));
        }

        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(PoolError::validation(
                "tenant_id",
                format!("invalid character {bad:?}; allowed: a-z A-Z 0-9 _ -"),
            ));
        }

        Ok(Self(raw.to_string()))
    }
}

// -----------------------------------------------------------------------------
// ----- TenantId: Public ------------------------------------------------------

impl TenantId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
