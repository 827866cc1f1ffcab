pub mod events;
pub mod pool;
pub mod reconnect;
pub mod session;

pub use events::{PoolEvent, RemovalReason};
pub use pool::{PoolConfig, SessionPool};
pub use reconnect::ReconnectPolicy;
pub use session::{CreateOptions, HealthReport, PairingConfig, SessionStatus};
