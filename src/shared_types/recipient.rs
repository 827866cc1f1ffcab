use std::fmt;

use serde::Serialize;

use crate::errors::PoolError;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const PHONE_MIN_DIGITS: usize = 7;
const PHONE_MAX_DIGITS: usize = 15;
const ADDRESS_MAX_LEN: usize = 128;

// -----------------------------------------------------------------------------
// ----- PhoneNumber -----------------------------------------------------------

/// Digits-only phone number (E.164 without the leading `+`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Strips everything but ASCII digits, then checks the digit count.
    ///
    /// Letters are rejected outright rather than stripped, so `"call-me"`
    /// never normalizes to an empty or accidental number.
    pub fn normalize(raw: &str) -> Result<Self, PhoneNumberError> {
        if raw.chars().any(|c| c.is_alphabetic()) {
            return Err(PhoneNumberError::Malformed(raw.to_string()));
        }

        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if !(PHONE_MIN_DIGITS..=PHONE_MAX_DIGITS).contains(&digits.len()) {
            return Err(PhoneNumberError::Length {
                digits: digits.len(),
            });
        }

        Ok(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PhoneNumberError {
    #[error("phone number contains letters: {0:?}")]
    Malformed(String),

    #[error("phone number must have 7-15 digits, got {digits}")]
    Length { digits: usize },
}

// -----------------------------------------------------------------------------
// ----- Recipient -------------------------------------------------------------

/// A message destination: either a bare phone number or an opaque network
/// address (`user@server` for chats, groups and broadcast lists, or a plain
/// identifier the transport resolves itself).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Recipient {
    Phone(PhoneNumber),
    Address(String),
}

impl Recipient {
    pub fn parse(raw: &str) -> Result<Self, PoolError> {
        let raw = raw.trim();
        if raw.is_empty() || raw.len() > ADDRESS_MAX_LEN {
            return Err(PoolError::validation(
                "recipient",
                format!("must be 1-{ADDRESS_MAX_LEN} characters"),
            ));
        }

        if let Some((user, server)) = raw.split_once('@') {
            let user_ok = !user.is_empty() && user.chars().all(is_address_char);
            let server_ok = !server.is_empty()
                && !server.contains('@')
                && server
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.'));

            if !(user_ok && server_ok) {
                return Err(PoolError::validation(
                    "recipient",
                    format!("malformed address {raw:?}"),
                ));
            }
            return Ok(Self::Address(raw.to_string()));
        }

        let phone_like = raw.chars().any(|c| c.is_ascii_digit())
            && raw
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '(' | ')' | ' '));
        if phone_like {
            return PhoneNumber::normalize(raw)
                .map(Self::Phone)
                .map_err(|e| PoolError::validation("recipient", e.to_string()));
        }

        if raw.chars().all(is_address_char) {
            return Ok(Self::Address(raw.to_string()));
        }

        Err(PoolError::validation(
            "recipient",
            format!("malformed recipient {raw:?}"),
        ))
    }

    /// Canonical string used for rate-limit keys and logs.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Phone(p) => p.as_str(),
            Self::Address(a) => a,
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_address_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
