pub mod message_payload;
pub mod pairing_material;
pub mod recipient;
pub mod session_state;
pub mod tenant_id;

pub use message_payload::{MessagePayload, SendOptions, SendReceipt};
pub use pairing_material::{PairingKind, PairingMaterial};
pub use recipient::{PhoneNumber, PhoneNumberError, Recipient};
pub use session_state::SessionState;
pub use tenant_id::TenantId;
