//! Relay configuration.
//!
//! Every option is a command line flag with a `HUSH_*` environment fallback.
//! The defense mode in particular is only ever read from here; no wire
//! message can carry or change it.

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use hush_core::{ConnectionConfig, Environment};
use hush_crypto::TokenKey;

use crate::{
    auth::AuthConfig,
    defense::{DefenseConfig, FailureMode},
    driver::RelayConfig,
    error::ServerError,
};

/// HUSH zero-knowledge relay
#[derive(Parser, Debug, Clone)]
#[command(name = "hush-server")]
#[command(about = "HUSH zero-knowledge messaging relay")]
#[command(version)]
pub struct ServerConfig {
    /// Address to bind to
    #[arg(short, long, env = "HUSH_BIND", default_value = "0.0.0.0:4433")]
    pub bind: String,

    /// Path to TLS certificate (PEM format)
    #[arg(short, long, env = "HUSH_CERT")]
    pub cert: Option<PathBuf>,

    /// Path to TLS private key (PEM format)
    #[arg(short, long, env = "HUSH_KEY")]
    pub key: Option<PathBuf>,

    /// Database file; envelopes are kept in memory when absent
    #[arg(long, env = "HUSH_DB")]
    pub db: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "HUSH_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Hex SHA-256 knowledge proof of the shared passphrase
    #[arg(long, env = "HUSH_AUTH_HASH", hide_env_values = true)]
    pub auth_hash: Option<String>,

    /// Hex salt handed to clients for vault key derivation
    #[arg(long, env = "HUSH_KDF_SALT")]
    pub kdf_salt: Option<String>,

    /// Hex 32-byte session token secret; random per process when absent
    #[arg(long, env = "HUSH_TOKEN_SECRET", hide_env_values = true)]
    pub token_secret: Option<String>,

    /// Session token lifetime in minutes
    #[arg(long, env = "HUSH_TOKEN_TTL_MINUTES", default_value = "60")]
    pub token_ttl_minutes: u64,

    /// Consecutive authentication failures before the defense action fires
    #[arg(long, env = "HUSH_MAX_AUTH_FAILURES", default_value = "5")]
    pub max_auth_failures: u32,

    /// Defense action: ip_temp, ip_perm, db_wipe or db_wipe_shutdown
    #[arg(long, env = "HUSH_FAILURE_MODE", default_value = "ip_temp")]
    pub failure_mode: FailureMode,

    /// Duration of a temporary block in minutes
    #[arg(long, env = "HUSH_IP_BLOCK_MINUTES", default_value = "60")]
    pub ip_block_minutes: u64,

    /// Wipe and shut down on the first authentication failure
    #[arg(long, env = "HUSH_PANIC_MODE")]
    pub panic_mode: bool,

    /// Seconds between relay heartbeats
    #[arg(long, env = "HUSH_HEARTBEAT_SECS", default_value = "30")]
    pub heartbeat_secs: u64,

    /// Maximum concurrent connections
    #[arg(long, env = "HUSH_MAX_CONNECTIONS", default_value = "10000")]
    pub max_connections: usize,

    /// Hours a stored envelope is kept before the relay purges it (0 keeps
    /// envelopes until a wipe)
    #[arg(long, env = "HUSH_MESSAGE_TTL_HOURS", default_value = "0")]
    pub message_ttl_hours: u64,
}

impl ServerConfig {
    /// Reject configurations the relay cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        self.proof_hash()?;
        self.salt()?;

        if self.max_auth_failures == 0 {
            return Err(ServerError::Config("--max-auth-failures must be at least 1".into()));
        }
        if self.failure_mode == FailureMode::TemporaryBlock && self.ip_block_minutes == 0 {
            return Err(ServerError::Config(
                "--ip-block-minutes must be at least 1 in ip_temp mode".into(),
            ));
        }
        if self.heartbeat_secs == 0 {
            return Err(ServerError::Config("--heartbeat-secs must be at least 1".into()));
        }
        if self.token_ttl_minutes == 0 {
            return Err(ServerError::Config("--token-ttl-minutes must be at least 1".into()));
        }
        if let Some(secret) = &self.token_secret {
            decode_key("--token-secret", secret)?;
        }

        Ok(())
    }

    /// Driver configuration described by these options.
    pub fn relay_config(&self) -> Result<RelayConfig, ServerError> {
        let auth = AuthConfig {
            proof_hash: self.proof_hash()?,
            kdf_salt: self.salt()?,
            token_ttl: Duration::from_secs(self.token_ttl_minutes.saturating_mul(60)),
        };

        let mut relay = RelayConfig::new(auth);
        relay.max_connections = self.max_connections;
        relay.connection = ConnectionConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            ..ConnectionConfig::default()
        };
        relay.defense = DefenseConfig {
            max_failures: self.max_auth_failures,
            mode: self.failure_mode,
            block_duration: Duration::from_secs(self.ip_block_minutes.saturating_mul(60)),
            panic_mode: self.panic_mode,
        };
        relay.message_ttl = (self.message_ttl_hours > 0)
            .then(|| Duration::from_secs(self.message_ttl_hours.saturating_mul(3600)));

        Ok(relay)
    }

    /// Token signing key: the configured secret, or a fresh random one.
    ///
    /// A random key invalidates every token on restart, which only forces
    /// clients to authenticate again.
    pub fn token_key(&self, env: &impl Environment) -> Result<TokenKey, ServerError> {
        if let Some(secret) = &self.token_secret {
            return decode_key("--token-secret", secret).map(TokenKey::from_bytes);
        }

        let mut bytes = [0u8; 32];
        env.random_bytes(&mut bytes);
        Ok(TokenKey::from_bytes(bytes))
    }

    fn proof_hash(&self) -> Result<[u8; 32], ServerError> {
        let hash = self
            .auth_hash
            .as_deref()
            .ok_or_else(|| ServerError::Config("--auth-hash is required".into()))?;
        decode_key("--auth-hash", hash)
    }

    fn salt(&self) -> Result<Vec<u8>, ServerError> {
        let salt = self
            .kdf_salt
            .as_deref()
            .ok_or_else(|| ServerError::Config("--kdf-salt is required".into()))?;
        let bytes = hex::decode(salt.trim())
            .map_err(|e| ServerError::Config(format!("--kdf-salt is not hex: {e}")))?;
        if bytes.is_empty() {
            return Err(ServerError::Config("--kdf-salt must not be empty".into()));
        }
        Ok(bytes)
    }
}

fn decode_key(flag: &str, value: &str) -> Result<[u8; 32], ServerError> {
    let bytes = hex::decode(value.trim())
        .map_err(|e| ServerError::Config(format!("{flag} is not hex: {e}")))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| ServerError::Config(format!("{flag} must be 32 bytes (64 hex digits)")))
}

#[cfg(test)]
mod tests {
    use hush_crypto::knowledge_proof;

    use super::*;

    fn parse(extra: &[&str]) -> ServerConfig {
        let hash = hex::encode(knowledge_proof("open sesame"));
        let mut args = vec!["hush-server", "--auth-hash", hash.as_str(), "--kdf-salt", "00ff"];
        args.extend_from_slice(extra);
        ServerConfig::try_parse_from(args).unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&[]);
        config.validate().unwrap();

        let relay = config.relay_config().unwrap();
        assert_eq!(relay.defense, DefenseConfig::default());
        assert_eq!(relay.auth.kdf_salt, vec![0x00, 0xff]);
        assert_eq!(relay.auth.token_ttl, Duration::from_secs(3600));
        assert_eq!(relay.connection.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(relay.max_connections, 10_000);
        assert_eq!(relay.message_ttl, None);
    }

    #[test]
    fn message_ttl_is_converted_to_a_duration() {
        let relay = parse(&["--message-ttl-hours", "48"]).relay_config().unwrap();

        assert_eq!(relay.message_ttl, Some(Duration::from_secs(48 * 3600)));
    }

    #[test]
    fn failure_mode_parses_from_flag() {
        let config = parse(&["--failure-mode", "db_wipe_shutdown", "--max-auth-failures", "3"]);

        let defense = config.relay_config().unwrap().defense;
        assert_eq!(defense.mode, FailureMode::DataWipeAndHalt);
        assert_eq!(defense.max_failures, 3);

        let hash = hex::encode([0u8; 32]);
        let bogus = ["--auth-hash", hash.as_str(), "--kdf-salt", "00", "--failure-mode", "x"];
        assert!(ServerConfig::try_parse_from(std::iter::once("hush-server").chain(bogus)).is_err());
    }

    #[test]
    fn missing_auth_hash_is_rejected() {
        let config = ServerConfig::try_parse_from(["hush-server", "--kdf-salt", "00"]).unwrap();

        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(parse(&["--max-auth-failures", "0"]).validate().is_err());
        assert!(parse(&["--ip-block-minutes", "0"]).validate().is_err());
        let permanent = parse(&["--ip-block-minutes", "0", "--failure-mode", "ip_perm"]);
        assert!(permanent.validate().is_ok());
        assert!(parse(&["--heartbeat-secs", "0"]).validate().is_err());
        assert!(parse(&["--token-secret", "abcd"]).validate().is_err());

        let short = ServerConfig { auth_hash: Some("abcd".into()), ..parse(&[]) };
        assert!(short.validate().is_err());
        let empty_salt = ServerConfig { kdf_salt: Some(String::new()), ..parse(&[]) };
        assert!(empty_salt.validate().is_err());
    }

    #[test]
    fn configured_token_secret_is_stable() {
        #[derive(Clone)]
        struct NoEnv;
        impl Environment for NoEnv {
            type Instant = std::time::Instant;
            fn now(&self) -> Self::Instant {
                std::time::Instant::now()
            }
            fn unix_time(&self) -> u64 {
                0
            }
            fn sleep(&self, _: Duration) -> impl std::future::Future<Output = ()> + Send {
                async {}
            }
            fn random_bytes(&self, buffer: &mut [u8]) {
                buffer.fill(0xAA);
            }
        }

        let secret = hex::encode([7u8; 32]);
        let config = parse(&["--token-secret", secret.as_str()]);

        let a = config.token_key(&NoEnv).unwrap();
        let b = config.token_key(&NoEnv).unwrap();
        let claims = hush_crypto::SessionClaims {
            participant_id: hush_proto::ParticipantId::new("alice").unwrap(),
            expires_at: 10,
        };
        assert_eq!(b.verify(&a.issue(&claims), 0).unwrap(), claims);
    }
}
