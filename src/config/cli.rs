use clap::{Parser, Subcommand};
use std::path::PathBuf;

use super::types::LogLevel;

// -----------------------------------------------------------------------------
// ----- Args ------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "pairgate", version, about = "Per-tenant messaging session pool")]
pub struct Args {
    #[arg(long = "config", env = "PAIRGATE_CONFIG_FILE", default_value = "pairgate.toml")]
    pub config_file: PathBuf,

    #[arg(long = "log", env = "PAIRGATE_LOG", default_value = "info")]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Load and validate the config file, then print the effective policy.
    Check,

    /// Inspect the file-backed credential store.
    #[command(subcommand)]
    Credentials(CredentialsCommand),
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum CredentialsCommand {
    /// Tenants that have stored credentials.
    List,

    /// Forget a tenant's credentials; it must pair again.
    Delete { tenant: String },
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands() {
        let args = Args::try_parse_from(["pairgate", "--config", "x.toml", "check"]).unwrap();
        assert_eq!(args.config_file, PathBuf::from("x.toml"));
        assert_eq!(args.command, Command::Check);

        let args =
            Args::try_parse_from(["pairgate", "--log", "debug", "credentials", "delete", "t1"])
                .unwrap();
        assert_eq!(args.log_level, LogLevel::Debug);
        assert_eq!(
            args.command,
            Command::Credentials(CredentialsCommand::Delete {
                tenant: "t1".into()
            })
        );
    }

    #[test]
    fn rejects_unknown_log_level() {
        assert!(Args::try_parse_from(["pairgate", "--log", "loud", "check"]).is_err());
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
