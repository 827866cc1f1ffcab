pub mod config;
pub mod credentials;
pub mod errors;
pub mod gateway;
pub mod metrics;
pub mod resilience;
pub mod shared_types;
pub mod transport;

pub use config::GatewayConfig;
pub use credentials::{CredentialStore, Credentials, FileCredentialStore, MemoryCredentialStore};
pub use errors::{PoolError, StandardError};
pub use gateway::{CreateOptions, PoolConfig, PoolEvent, SessionPool, SessionStatus};
pub use transport::{TransportAdapter, TransportEvent, TransportHandle};
