//! Access tokens for the NovelAI API.
//!
//! `token` sessions verify the configured token once; `login` sessions derive
//! an access key from email and password and trade it for a token. Other
//! backends use the configured token as-is. Results are cached until the
//! credentials change.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use log::info;
use novelai_contracts::config::{BackendKind, Config};
use novelai_contracts::messages::Message;
use serde_json::{json, Value};

use crate::error::GenerationError;
use crate::transport::{read_json, HttpTransport};

const TOKEN_CHECK_TIMEOUT: Duration = Duration::from_secs(30);
const ACCESS_KEY_DOMAIN: &str = "novelai_data_access_key";
const ACCESS_KEY_LEN: usize = 64;
const SALT_LEN: usize = 16;
const ARGON_T_COST: u32 = 2;
/// 2,000,000 bytes expressed in KiB.
const ARGON_M_COST_KIB: u32 = 2_000_000 / 1024;

/// Derives NovelAI's access key: Argon2id over the password, salted with a
/// 16-byte BLAKE2b digest of the password prefix, email and a fixed domain.
pub fn calc_access_key(email: &str, password: &str) -> anyhow::Result<String> {
    let prefix: String = password.chars().take(6).collect();
    let mut hasher =
        Blake2bVar::new(SALT_LEN).map_err(|err| anyhow!("invalid salt length: {err}"))?;
    hasher.update(format!("{prefix}{email}{ACCESS_KEY_DOMAIN}").as_bytes());
    let mut salt = [0u8; SALT_LEN];
    hasher
        .finalize_variable(&mut salt)
        .map_err(|err| anyhow!("failed to finalize salt: {err}"))?;

    let params = Params::new(ARGON_M_COST_KIB, ARGON_T_COST, 1, Some(ACCESS_KEY_LEN))
        .map_err(|err| anyhow!("invalid argon2 parameters: {err}"))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; ACCESS_KEY_LEN];
    argon
        .hash_password_into(password.as_bytes(), &salt, &mut key)
        .map_err(|err| anyhow!("argon2 hashing failed: {err}"))?;

    Ok(URL_SAFE_NO_PAD.encode(key).chars().take(ACCESS_KEY_LEN).collect())
}

/// Confirms a token against `/user/subscription`.
pub fn check_token(transport: &HttpTransport, token: &str) -> Result<(), GenerationError> {
    let auth = [("authorization", format!("Bearer {token}"))];
    match transport.get_with_timeout("/user/subscription", &auth, TOKEN_CHECK_TIMEOUT) {
        Ok(_) => Ok(()),
        Err(GenerationError::Status(401)) => Err(Message::InvalidToken.into()),
        Err(err) => Err(err),
    }
}

pub fn login(
    transport: &HttpTransport,
    email: &str,
    password: &str,
) -> Result<String, GenerationError> {
    let key = calc_access_key(email, password)?;
    let response = match transport.post_json("/user/login", &json!({ "key": key }), &[]) {
        Ok(response) => response,
        Err(GenerationError::Status(401)) => return Err(Message::InvalidPassword.into()),
        Err(err) => return Err(err),
    };
    let body = read_json(response)?;
    let token = body
        .get("accessToken")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("login response has no accessToken"))?;
    Ok(token.to_string())
}

/// Caches the session token; the host calls `invalidate` when the
/// credentials in the config change.
#[derive(Debug, Default)]
pub struct TokenCache {
    cached: Mutex<Option<String>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate(&self) {
        let mut guard = self
            .cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = None;
    }

    /// Returns the token to send, acquiring it on first use. `None` means the
    /// backend runs without one.
    pub fn get(
        &self,
        config: &Config,
        transport: &HttpTransport,
    ) -> Result<Option<String>, GenerationError> {
        let mut guard = self
            .cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(token) = guard.as_ref() {
            return Ok(Some(token.clone()));
        }
        let token = match config.backend {
            BackendKind::Token => {
                let token = config.token.clone().unwrap_or_default();
                check_token(transport, &token)?;
                info!("verified NovelAI token");
                Some(token)
            }
            BackendKind::Login => {
                let email = config.email.as_deref().unwrap_or_default();
                let password = config.password.as_deref().unwrap_or_default();
                let token = login(transport, email, password)?;
                info!("logged in to NovelAI as {email}");
                Some(token)
            }
            _ => config.token.clone().filter(|token| !token.is_empty()),
        };
        guard.clone_from(&token);
        Ok(token)
    }
}
