pub mod cli;
pub mod gateway;
pub mod types;

pub use cli::{Args, Command, CredentialsCommand};
pub use gateway::{ConfigError, GatewayConfig};
pub use types::LogLevel;
