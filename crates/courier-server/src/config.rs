//! Server configuration loaded from `COURIER_*` environment variables.
//!
//! # Environment Variables
//!
//! - `COURIER_BIND_ADDR`: listen address. Default: `0.0.0.0:8787`
//! - `COURIER_JWT_SECRET`: HS256 signing secret. Required unless dev mode is on
//! - `COURIER_DEV_MODE`: `true` generates a throwaway secret when none is set
//! - `COURIER_TOKEN_TTL_HOURS`: lifetime of issued tokens. Default: `24`
//! - `COURIER_CORS_ORIGINS`: comma-separated allowed origins. Default: `http://localhost:5173`
//! - `COURIER_OUTBOUND_BUFFER`: per-connection outbound frame buffer. Default: `64`
//! - `COURIER_SEND_TIMEOUT_MS`: per-frame socket write timeout. Default: `5000`
//! - `COURIER_QUEUE_CAPACITY`: durable queue capacity. Default: `1024`
//! - `COURIER_QUEUE_BATCH`: queue consumer batch size. Default: `32`
//!
//! # Examples
//!
//! ```bash
//! COURIER_JWT_SECRET=change-me cargo run -p courier-server
//! COURIER_DEV_MODE=true COURIER_BIND_ADDR=127.0.0.1:9000 cargo run -p courier-server
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8787";
const DEFAULT_TOKEN_TTL_HOURS: u64 = 24;
const DEFAULT_CORS_ORIGIN: &str = "http://localhost:5173";
const DEFAULT_SEND_TIMEOUT_MS: u64 = 5000;
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("COURIER_JWT_SECRET is required (set COURIER_DEV_MODE=true to generate one)")]
    MissingSecret,

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to
    pub bind_addr: SocketAddr,
    /// Secret for signing and verifying bearer tokens
    pub jwt_secret: Vec<u8>,
    /// Lifetime of issued tokens
    pub token_ttl: Duration,
    /// Origins allowed by the CORS layer
    pub cors_origins: Vec<String>,
    /// Outbound frame buffer per connection
    pub outbound_buffer: usize,
    /// Upper bound for writing one frame to a client
    pub send_timeout: Duration,
    /// Capacity of the durable queue
    pub queue_capacity: usize,
    /// Messages per queue consumer batch
    pub queue_batch_size: usize,
    /// Whether the secret was generated at startup
    pub dev_mode: bool,
}

impl ServerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let dev_mode = lookup("COURIER_DEV_MODE")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let jwt_secret = match lookup("COURIER_JWT_SECRET").filter(|s| !s.is_empty()) {
            Some(secret) => secret.into_bytes(),
            None if dev_mode => {
                warn!("No COURIER_JWT_SECRET set; generated an ephemeral secret (dev mode)");
                let key: [u8; 32] = rand::rng().random();
                key.to_vec()
            }
            None => return Err(ConfigError::MissingSecret),
        };

        let bind_addr: SocketAddr = parse_var(&lookup, "COURIER_BIND_ADDR", DEFAULT_BIND_ADDR.parse().ok())?;
        let ttl_hours: u64 =
            parse_var(&lookup, "COURIER_TOKEN_TTL_HOURS", Some(DEFAULT_TOKEN_TTL_HOURS))?;
        let token_ttl = ttl_hours
            .checked_mul(3600)
            .filter(|secs| i64::try_from(*secs).is_ok())
            .map(Duration::from_secs)
            .ok_or_else(|| ConfigError::InvalidValue {
                name: "COURIER_TOKEN_TTL_HOURS",
                value: ttl_hours.to_string(),
            })?;
        let send_timeout_ms: u64 =
            parse_var(&lookup, "COURIER_SEND_TIMEOUT_MS", Some(DEFAULT_SEND_TIMEOUT_MS))?;

        let cors_origins = lookup("COURIER_CORS_ORIGINS")
            .unwrap_or_else(|| DEFAULT_CORS_ORIGIN.to_string())
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            bind_addr,
            jwt_secret,
            token_ttl,
            cors_origins,
            outbound_buffer: parse_var(
                &lookup,
                "COURIER_OUTBOUND_BUFFER",
                Some(courier_core::coordinator::DEFAULT_OUTBOUND_BUFFER),
            )?,
            send_timeout: Duration::from_millis(send_timeout_ms),
            queue_capacity: parse_var(&lookup, "COURIER_QUEUE_CAPACITY", Some(DEFAULT_QUEUE_CAPACITY))?,
            queue_batch_size: parse_var(
                &lookup,
                "COURIER_QUEUE_BATCH",
                Some(courier_core::sink::DEFAULT_BATCH_SIZE),
            )?,
            dev_mode,
        })
    }

    /// Log the effective configuration. The secret is never logged.
    pub fn log_config(&self) {
        info!("Bind address: {}", self.bind_addr);
        info!("Token lifetime: {}h", self.token_ttl.as_secs() / 3600);
        info!("CORS origins: {}", self.cors_origins.join(", "));
        info!(
            outbound_buffer = self.outbound_buffer,
            send_timeout_ms = self.send_timeout.as_millis() as u64,
            "Connection limits"
        );
        info!(
            capacity = self.queue_capacity,
            batch_size = self.queue_batch_size,
            "Durable queue"
        );
        if self.dev_mode {
            warn!("Dev mode: tokens are signed with an ephemeral secret");
        }
    }

    /// Create a test configuration.
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.parse().unwrap(),
            jwt_secret: b"test-secret-for-courier-tokens".to_vec(),
            token_ttl: Duration::from_secs(DEFAULT_TOKEN_TTL_HOURS * 3600),
            cors_origins: vec![DEFAULT_CORS_ORIGIN.to_string()],
            outbound_buffer: 8,
            send_timeout: Duration::from_millis(500),
            queue_capacity: 16,
            queue_batch_size: 4,
            dev_mode: false,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("jwt_secret", &"<redacted>")
            .field("token_ttl", &self.token_ttl)
            .field("cors_origins", &self.cors_origins)
            .field("outbound_buffer", &self.outbound_buffer)
            .field("send_timeout", &self.send_timeout)
            .field("queue_capacity", &self.queue_capacity)
            .field("queue_batch_size", &self.queue_batch_size)
            .field("dev_mode", &self.dev_mode)
            .finish()
    }
}

fn parse_var<F, T>(lookup: &F, name: &'static str, default: Option<T>) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        None => default.ok_or(ConfigError::InvalidValue {
            name,
            value: String::new(),
        }),
    }
}
