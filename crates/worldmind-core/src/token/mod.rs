//! Scoped credential tokens handed to sandboxed agents.
//!
//! Every dispatch carries a short-lived HMAC-SHA256 token scoped to a
//! `(mission, task, iteration)` triple. The sandbox-side policy layer that
//! consumes the scope is external; this module only generates and verifies
//! the credential itself.
//!
//! Format: `wm_at_<scope_hex>_<hmac_hex>` where `scope_hex` encodes
//! `<mission_id>:<task_id>:<iteration>` and the HMAC is computed over the
//! same scope string.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_PREFIX: &str = "wm_at_";

/// Errors that can occur during token operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token format: {0}")]
    InvalidFormat(String),

    #[error("invalid token scope: {0}")]
    InvalidScope(String),

    #[error("token HMAC verification failed")]
    HmacMismatch,

    #[error("missing token secret")]
    MissingSecret,
}

/// Configuration for token generation and validation.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// The HMAC secret key bytes.
    pub secret: Vec<u8>,
}

impl TokenConfig {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// Read the hex-encoded secret from `WORLDMIND_TOKEN_SECRET`.
    pub fn from_env() -> Result<Self, TokenError> {
        let secret_hex =
            std::env::var("WORLDMIND_TOKEN_SECRET").map_err(|_| TokenError::MissingSecret)?;
        let secret = hex::decode(&secret_hex).map_err(|e| {
            TokenError::InvalidFormat(format!("WORLDMIND_TOKEN_SECRET is not valid hex: {e}"))
        })?;
        Ok(Self::new(secret))
    }
}

/// Claims extracted from a validated token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub mission_id: String,
    pub task_id: String,
    pub iteration: u32,
}

fn scope_string(mission_id: &str, task_id: &str, iteration: u32) -> String {
    format!("{mission_id}:{task_id}:{iteration}")
}

fn compute_hmac(secret: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac =
        HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Generate a scoped agent token for one task execution.
pub fn generate_token(
    config: &TokenConfig,
    mission_id: &str,
    task_id: &str,
    iteration: u32,
) -> String {
    let scope = scope_string(mission_id, task_id, iteration);
    let mac = compute_hmac(&config.secret, scope.as_bytes());
    format!(
        "{TOKEN_PREFIX}{}_{}",
        hex::encode(scope.as_bytes()),
        hex::encode(mac)
    )
}

/// Validate a scoped agent token and extract its claims.
///
/// Recomputes the HMAC and compares in constant time before trusting any of
/// the scope fields.
pub fn validate_token(config: &TokenConfig, token: &str) -> Result<TokenClaims, TokenError> {
    let rest = token.strip_prefix(TOKEN_PREFIX).ok_or_else(|| {
        TokenError::InvalidFormat(format!("token must start with {TOKEN_PREFIX:?}"))
    })?;

    let (scope_hex, hmac_hex) = rest.split_once('_').ok_or_else(|| {
        TokenError::InvalidFormat("expected underscore between scope and hmac".to_string())
    })?;

    let scope_bytes = hex::decode(scope_hex)
        .map_err(|e| TokenError::InvalidFormat(format!("scope is not valid hex: {e}")))?;
    let provided_mac = hex::decode(hmac_hex)
        .map_err(|e| TokenError::InvalidFormat(format!("hmac is not valid hex: {e}")))?;

    // Constant-time verification via the Mac API.
    let mut mac =
        HmacSha256::new_from_slice(&config.secret).expect("HMAC accepts keys of any length");
    mac.update(&scope_bytes);
    mac.verify_slice(&provided_mac)
        .map_err(|_| TokenError::HmacMismatch)?;

    let scope = String::from_utf8(scope_bytes)
        .map_err(|e| TokenError::InvalidScope(e.to_string()))?;
    let mut parts = scope.rsplitn(2, ':');
    let iteration_str = parts
        .next()
        .ok_or_else(|| TokenError::InvalidScope("missing iteration".to_string()))?;
    let mission_task = parts
        .next()
        .ok_or_else(|| TokenError::InvalidScope("missing mission/task".to_string()))?;
    let (mission_id, task_id) = mission_task
        .split_once(':')
        .ok_or_else(|| TokenError::InvalidScope("missing task id".to_string()))?;

    let iteration: u32 = iteration_str
        .parse()
        .map_err(|e: std::num::ParseIntError| TokenError::InvalidScope(e.to_string()))?;

    Ok(TokenClaims {
        mission_id: mission_id.to_string(),
        task_id: task_id.to_string(),
        iteration,
    })
}
