use clap::Parser;
use std::{path::PathBuf, process::ExitCode};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

use pairgate::config::{Args, Command, CredentialsCommand};
use pairgate::credentials::CredentialStore;
use pairgate::shared_types::TenantId;
use pairgate::{FileCredentialStore, GatewayConfig, PoolError};

// -----------------------------------------------------------------------------
// ----- Main ------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            err.log("cli");
            ExitCode::FAILURE
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Setup -----------------------------------------------------------------

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_new(args.log_level.directive())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

// -----------------------------------------------------------------------------
// ----- Run -------------------------------------------------------------------

async fn run(args: Args) -> Result<(), PoolError> {
    let config = GatewayConfig::from_file_async(&args.config_file).await?;
    info!(path = %args.config_file.display(), "config loaded");

    match args.command {
        Command::Check => {
            print_policy(&config);
            Ok(())
        }
        Command::Credentials(CredentialsCommand::List) => {
            let store = open_store(&config).await?;
            let tenants = store.list().await?;
            for tenant in &tenants {
                println!("{tenant}");
            }
            info!(count = tenants.len(), "stored credentials listed");
            Ok(())
        }
        Command::Credentials(CredentialsCommand::Delete { tenant }) => {
            let tenant = TenantId::parse(&tenant)?;
            let store = open_store(&config).await?;
            store.delete(&tenant).await?;
            info!(tenant = %tenant, "credentials deleted");
            Ok(())
        }
    }
}

async fn open_store(config: &GatewayConfig) -> Result<FileCredentialStore, PoolError> {
    let dir: &PathBuf = config.credentials_dir.as_ref().ok_or_else(|| {
        PoolError::configuration("[credentials] dir is not set; nothing is persisted")
    })?;

    match FileCredentialStore::open(dir.clone()).await {
        Ok(store) => Ok(store),
        Err(e) => {
            error!(dir = %dir.display(), "cannot open credential store");
            Err(e.into())
        }
    }
}

fn print_policy(config: &GatewayConfig) {
    let pool = &config.pool;
    let ms = |d: std::time::Duration| d.as_millis();

    println!("device_name            {}", pool.device_name);
    println!("restore_on_init        {}", pool.restore_on_init);
    println!(
        "reconnect              base={}ms max={}ms attempts={}",
        ms(pool.reconnect.base_delay),
        ms(pool.reconnect.max_delay),
        pool.reconnect.max_attempts
    );
    println!(
        "circuit_breaker        threshold={} cooldown={}ms",
        pool.breaker.failure_threshold,
        ms(pool.breaker.cooldown)
    );
    println!(
        "rate_limit             {}/{}ms per recipient, {}/{}ms per gateway",
        pool.rate_limit.max_requests,
        ms(pool.rate_limit.window),
        pool.gateway_rate_limit.max_requests,
        ms(pool.gateway_rate_limit.window)
    );
    println!(
        "pairing                qr_ttl={}ms code_ttl={}ms code_wait={}ms",
        ms(pool.pairing.qr_ttl),
        ms(pool.pairing.code_ttl),
        ms(pool.pairing.code_wait)
    );
    for (name, p) in [
        ("open", pool.guards.open),
        ("send", pool.guards.send),
        ("load_credentials", pool.guards.load_credentials),
        ("save_credentials", pool.guards.save_credentials),
    ] {
        println!(
            "guard {name:<17}timeout={}ms retries={} delay={}ms",
            ms(p.timeout),
            p.retries,
            ms(p.retry_delay)
        );
    }
    match &config.credentials_dir {
        Some(dir) => println!("credentials            {}", dir.display()),
        None => println!("credentials            in-memory"),
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
