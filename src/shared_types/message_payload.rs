use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------
// ----- MessagePayload --------------------------------------------------------

/// Content handed to the transport. The pool never persists it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    Text {
        body: String,
    },

    /// An empty `emoji` removes a previously sent reaction.
    Reaction {
        target_message_id: String,
        emoji: String,
    },
}

impl MessagePayload {
    pub fn text(body: impl Into<String>) -> Self {
        MessagePayload::Text { body: body.into() }
    }

    pub fn reaction(target_message_id: impl Into<String>, emoji: impl Into<String>) -> Self {
        MessagePayload::Reaction {
            target_message_id: target_message_id.into(),
            emoji: emoji.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MessagePayload::Text { .. } => "text",
            MessagePayload::Reaction { .. } => "reaction",
        }
    }
}

impl From<&str> for MessagePayload {
    fn from(body: &str) -> Self {
        MessagePayload::text(body)
    }
}

impl From<String> for MessagePayload {
    fn from(body: String) -> Self {
        MessagePayload::Text { body }
    }
}

// -----------------------------------------------------------------------------
// ----- SendOptions -----------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOptions {
    /// Message id to quote (reply to).
    #[serde(default)]
    pub quoted_message_id: Option<String>,
}

// -----------------------------------------------------------------------------
// ----- SendReceipt -----------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReceipt {
    pub message_id: String,
}
