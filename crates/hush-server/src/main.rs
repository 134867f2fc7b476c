//! HUSH relay binary.
//!
//! # Usage
//!
//! ```bash
//! # Development: self-signed certificate, in-memory storage
//! hush-server --auth-hash <hex> --kdf-salt <hex>
//!
//! # Production
//! HUSH_AUTH_HASH=<hex> HUSH_KDF_SALT=<hex> HUSH_TOKEN_SECRET=<hex> \
//!     hush-server --bind 0.0.0.0:4433 --cert cert.pem --key key.pem --db hush.redb
//! ```

use clap::Parser;
use hush_server::{
    MemoryStorage, RedbStorage, Server, ServerConfig, ServerRuntimeConfig, Storage, SystemEnv,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    config.validate()?;

    tracing::info!("HUSH relay starting");
    tracing::info!(
        "Defense: {} after {} failures{}",
        config.failure_mode,
        config.max_auth_failures,
        if config.panic_mode { " (panic mode)" } else { "" }
    );

    if config.cert.is_none() || config.key.is_none() {
        tracing::warn!("No TLS certificate provided - using self-signed certificate");
        tracing::warn!("This is NOT suitable for production use!");
    }
    if config.token_secret.is_none() {
        tracing::warn!("No token secret configured - tokens will not survive a restart");
    }

    let runtime = ServerRuntimeConfig {
        bind_address: config.bind.clone(),
        cert_path: config.cert.clone(),
        key_path: config.key.clone(),
        relay: config.relay_config()?,
    };
    let token_key = config.token_key(&SystemEnv::new())?;

    match &config.db {
        Some(path) => {
            tracing::info!("Using database {}", path.display());
            serve(runtime, RedbStorage::open(path)?, token_key).await
        },
        None => {
            tracing::warn!("No database configured - envelopes are kept in memory only");
            serve(runtime, MemoryStorage::new(), token_key).await
        },
    }
}

async fn serve<S: Storage>(
    runtime: ServerRuntimeConfig,
    storage: S,
    token_key: hush_crypto::TokenKey,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(runtime, storage, token_key)?;

    tracing::info!("Relay listening on {}", server.local_addr()?);

    server.run().await?;

    Ok(())
}
