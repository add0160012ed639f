// ===============================
// src/auth.rs (authentication supervisor)
// ===============================
//
// Unauthenticated -> Authenticating -> Authenticated, back to Unauthenticated
// on disconnect or failure.
//
// Retry policy: only timeouts are retried (bounded, doubling delay). A venue
// rejection fails at once; a dropped link aborts and waits for the reconnect.
//
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::correlator::Correlator;
use crate::error::{AuthError, GatewayError, Result};
use crate::metrics::AUTH_STATE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
}

impl AuthState {
    fn gauge(&self) -> i64 {
        match self {
            AuthState::Unauthenticated => 0,
            AuthState::Authenticating => 1,
            AuthState::Authenticated => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum AuthMethod {
    ClientCredentials,
    ClientSignature,
}

#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub method: AuthMethod,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .field("method", &self.method)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, initial_delay: Duration::from_millis(500) }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds.
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default)]
    pub scope: String,
    #[serde(skip, default = "Instant::now")]
    pub obtained_at: Instant,
}

impl AccessToken {
    /// Refresh at 80% of the lifetime.
    pub fn refresh_in(&self) -> Option<Duration> {
        if self.expires_in == 0 || self.refresh_token.is_none() {
            return None;
        }
        let due = Duration::from_millis(self.expires_in.saturating_mul(800));
        Some(due.saturating_sub(self.obtained_at.elapsed()))
    }
}

pub fn timestamp_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// HMAC-SHA256 of `timestamp\nnonce\ndata`, hex encoded.
pub fn sign(secret: &str, timestamp: u64, nonce: &str, data: &str) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::Config(format!("hmac key: {e}")))?;
    mac.update(format!("{timestamp}\n{nonce}\n{data}").as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn nonce() -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(8).map(char::from).collect()
}

pub struct AuthSupervisor {
    credentials: Option<Credentials>,
    policy: RetryPolicy,
    state: watch::Sender<AuthState>,
    token: Mutex<Option<AccessToken>>,
    // bumped on every disconnect; a login started in an older epoch cannot
    // mark the new connection as authenticated. Epoch checks that lead to a
    // state change happen under the token lock, as does the bump itself.
    epoch: AtomicU64,
}

impl AuthSupervisor {
    pub fn new(credentials: Option<Credentials>, policy: RetryPolicy) -> Self {
        let (state, _) = watch::channel(AuthState::Unauthenticated);
        AUTH_STATE.set(0);
        Self { credentials, policy, state, token: Mutex::new(None), epoch: AtomicU64::new(0) }
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn state(&self) -> AuthState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn access_token(&self) -> Option<String> {
        self.token_guard().as_ref().map(|t| t.access_token.clone())
    }

    pub fn refresh_in(&self) -> Option<Duration> {
        self.token_guard().as_ref().and_then(AccessToken::refresh_in)
    }

    /// Local gate for private calls.
    pub fn require_authenticated(&self) -> Result<()> {
        match self.state() {
            AuthState::Authenticated => Ok(()),
            _ => Err(AuthError::NotAuthenticated.into()),
        }
    }

    fn token_guard(&self) -> std::sync::MutexGuard<'_, Option<AccessToken>> {
        self.token.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, s: AuthState) {
        AUTH_STATE.set(s.gauge());
        self.state.send_replace(s);
    }

    /// Transport went away: forget the token, any in-flight login is void.
    pub fn on_disconnect(&self) {
        let mut token = self.token_guard();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        *token = None;
        self.set_state(AuthState::Unauthenticated);
    }

    fn auth_params(&self, creds: &Credentials) -> Result<Value> {
        Ok(match creds.method {
            AuthMethod::ClientCredentials => json!({
                "grant_type": "client_credentials",
                "client_id": creds.client_id,
                "client_secret": creds.client_secret,
            }),
            AuthMethod::ClientSignature => {
                let ts = timestamp_ms();
                let nonce = nonce();
                let data = "";
                json!({
                    "grant_type": "client_signature",
                    "client_id": creds.client_id,
                    "timestamp": ts,
                    "nonce": nonce,
                    "data": data,
                    "signature": sign(&creds.client_secret, ts, &nonce, data)?,
                })
            }
        })
    }

    /// Credential exchange via `public/auth`.
    pub async fn authenticate(&self, correlator: &Correlator, timeout: Duration) -> Result<()> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or_else(|| GatewayError::Config("no venue credentials configured".into()))?;
        let epoch = {
            let _token = self.token_guard();
            self.set_state(AuthState::Authenticating);
            self.epoch()
        };

        let mut delay = self.policy.initial_delay;
        let attempts = self.policy.max_attempts.max(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            let params = self.auth_params(creds)?;
            match correlator.request("public/auth", params, timeout).await {
                Ok(result) => return self.accept_token(epoch, result),
                Err(GatewayError::Timeout { .. }) => {
                    warn!(attempt, max = attempts, "auth timed out");
                    last = "timed out".into();
                    if attempt < attempts {
                        sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                }
                Err(e) => return Err(self.fail(epoch, e)),
            }
            if self.epoch() != epoch {
                return Err(GatewayError::ConnectionClosed("disconnected during auth".into()));
            }
        }
        Err(self.fail(epoch, AuthError::Exhausted { attempts, last }.into()))
    }

    /// `grant_type=refresh_token` with the stored refresh token.
    pub async fn refresh(&self, correlator: &Correlator, timeout: Duration) -> Result<()> {
        let epoch = self.epoch();
        let refresh_token = self
            .token_guard()
            .as_ref()
            .and_then(|t| t.refresh_token.clone())
            .ok_or(AuthError::NotAuthenticated)?;
        let params = json!({"grant_type": "refresh_token", "refresh_token": refresh_token});
        match correlator.request("public/auth", params, timeout).await {
            Ok(result) => self.accept_token(epoch, result),
            Err(e) => Err(self.fail(epoch, e)),
        }
    }

    fn accept_token(&self, epoch: u64, result: Value) -> Result<()> {
        let token: AccessToken = serde_json::from_value(result)
            .map_err(|e| self.fail(epoch, AuthError::BadResponse(e.to_string()).into()))?;
        let mut slot = self.token_guard();
        if self.epoch() != epoch {
            return Err(GatewayError::ConnectionClosed("disconnected during auth".into()));
        }
        info!(scope = %token.scope, expires_in = token.expires_in, "authenticated");
        *slot = Some(token);
        self.set_state(AuthState::Authenticated);
        Ok(())
    }

    // Venue rejections become AuthError::Rejected; everything else passes through.
    fn fail(&self, epoch: u64, e: GatewayError) -> GatewayError {
        let mut slot = self.token_guard();
        if self.epoch() == epoch {
            *slot = None;
            self.set_state(AuthState::Unauthenticated);
        }
        drop(slot);
        match e {
            GatewayError::Rpc(rpc) => AuthError::Rejected(rpc).into(),
            other => other,
        }
    }
}
