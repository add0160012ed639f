// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : deribit_bridge: Deribit JSON-RPC gateway with websocket fan-out
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Process configuration. `.env` is loaded first, then CLI flags with
          environment fallbacks. Read once at startup.
=============================================================================
*/
use std::time::Duration;

use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use url::Url;

use crate::auth::{AuthMethod, Credentials, RetryPolicy};
use crate::error::{GatewayError, Result};
use crate::gateway::GatewayConfig;
use crate::transport::ReconnectPolicy;

/// Which Deribit environment to talk to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum VenueMode {
    Testnet,
    Mainnet,
}

impl VenueMode {
    pub fn default_ws_url(&self) -> &'static str {
        match self {
            VenueMode::Testnet => "wss://test.deribit.com/ws/api/v2",
            VenueMode::Mainnet => "wss://www.deribit.com/ws/api/v2",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VenueMode::Testnet => "testnet",
            VenueMode::Mainnet => "mainnet",
        }
    }
}

#[derive(Parser, Clone, Debug)]
#[command(name = "deribit_bridge", version, about = "Deribit gateway with downstream websocket fan-out")]
pub struct Args {
    #[arg(long, env = "VENUE_MODE", value_enum, default_value_t = VenueMode::Testnet)]
    pub venue_mode: VenueMode,

    /// Overrides the URL implied by --venue-mode.
    #[arg(long, env = "DERIBIT_WS_URL")]
    pub ws_url: Option<String>,

    #[arg(long, env = "DERIBIT_CLIENT_ID")]
    pub client_id: Option<String>,

    #[arg(long, env = "DERIBIT_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    #[arg(long, env = "AUTH_METHOD", value_enum, default_value_t = AuthMethod::ClientCredentials)]
    pub auth_method: AuthMethod,

    #[arg(
        long,
        env = "INSTRUMENTS",
        value_delimiter = ',',
        default_value = "BTC-PERPETUAL,ETH-PERPETUAL"
    )]
    pub instruments: Vec<String>,

    #[arg(long, env = "BOOK_INTERVAL", default_value = "raw")]
    pub book_interval: String,

    /// e.g. user.orders.any.any.raw (needs credentials)
    #[arg(long, env = "ORDER_CHANNEL")]
    pub order_channel: Option<String>,

    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:9002")]
    pub listen_addr: String,

    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,

    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 5_000)]
    pub request_timeout_ms: u64,

    #[arg(long, env = "AUTH_MAX_ATTEMPTS", default_value_t = 3)]
    pub auth_max_attempts: u32,

    /// 0 disables the venue heartbeat.
    #[arg(long, env = "HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    #[arg(long, env = "RECONNECT_MIN_MS", default_value_t = 500)]
    pub reconnect_min_ms: u64,

    #[arg(long, env = "RECONNECT_MAX_MS", default_value_t = 32_000)]
    pub reconnect_max_ms: u64,

    /// Per downstream client queue length.
    #[arg(long, env = "DOWNSTREAM_BUFFER", default_value_t = 1024)]
    pub downstream_buffer: usize,
}

impl Args {
    pub fn venue_url(&self) -> String {
        self.ws_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| self.venue_mode.default_ws_url().to_string())
    }

    pub fn instruments(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .instruments
            .iter()
            .map(|x| x.trim().to_ascii_uppercase())
            .filter(|x| !x.is_empty())
            .collect();
        out.dedup();
        out
    }

    /// None when no credentials are configured (public data only).
    pub fn credentials(&self) -> Result<Option<Credentials>> {
        let id = self.client_id.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let secret = self.client_secret.as_deref().map(str::trim).filter(|s| !s.is_empty());
        match (id, secret) {
            (Some(id), Some(secret)) => Ok(Some(Credentials {
                client_id: id.to_string(),
                client_secret: secret.to_string(),
                method: self.auth_method,
            })),
            (None, None) => Ok(None),
            _ => Err(GatewayError::Config(
                "DERIBIT_CLIENT_ID and DERIBIT_CLIENT_SECRET must be set together".into(),
            )),
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            heartbeat_secs: self.heartbeat_secs,
            instruments: self.instruments(),
            book_interval: self.book_interval.clone(),
            order_channel: self.order_channel.clone().filter(|c| !c.trim().is_empty()),
            auth_retry: RetryPolicy {
                max_attempts: self.auth_max_attempts.max(1),
                ..RetryPolicy::default()
            },
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            min: Duration::from_millis(self.reconnect_min_ms),
            max: Duration::from_millis(self.reconnect_max_ms),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.venue_url();
        let parsed = Url::parse(&url).map_err(|e| GatewayError::Config(format!("venue url {url}: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(GatewayError::Config(format!("venue url {url} is not ws:// or wss://")));
        }
        if self.request_timeout_ms == 0 {
            return Err(GatewayError::Config("REQUEST_TIMEOUT_MS must be > 0".into()));
        }
        if self.reconnect_min_ms == 0 || self.reconnect_min_ms > self.reconnect_max_ms {
            return Err(GatewayError::Config(
                "need 0 < RECONNECT_MIN_MS <= RECONNECT_MAX_MS".into(),
            ));
        }
        if self.downstream_buffer == 0 {
            return Err(GatewayError::Config("DOWNSTREAM_BUFFER must be > 0".into()));
        }
        self.credentials()?;
        Ok(())
    }
}

pub fn load() -> Result<Args> {
    // .env first so clap's env fallbacks see it
    let _ = dotenv();
    let args = Args::parse();
    args.validate()?;
    Ok(args)
}
