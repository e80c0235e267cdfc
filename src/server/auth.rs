//! Bearer-key authentication.
//!
//! Each configured key maps to a [`Principal`]. A presented token is
//! compared against every key, always all of them, through HMAC tags under a
//! per-process random key, so neither the position of a match nor the
//! length of a common prefix shows up in the response time.

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    typed_header::TypedHeader,
};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use transforge_common::{Error, OwnerKey};

use super::error::ApiError;
use super::AppState;
use crate::config::AuthConfig;

type HmacSha256 = Hmac<Sha256>;

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub owner: OwnerKey,
    /// Admins see and cancel every owner's jobs.
    pub admin: bool,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self {
            owner: OwnerKey::anonymous(),
            admin: false,
        }
    }

    /// Whether the caller may see a job owned by `owner`.
    pub fn can_access(&self, owner: &OwnerKey) -> bool {
        self.admin || &self.owner == owner
    }
}

struct KeyEntry {
    tag: Vec<u8>,
    principal: Principal,
}

/// Resolves bearer tokens to principals.
pub struct Authenticator {
    enabled: bool,
    mac_key: [u8; 32],
    keys: Vec<KeyEntry>,
}

impl Authenticator {
    pub fn from_config(config: &AuthConfig) -> Self {
        let mac_key: [u8; 32] = rand::thread_rng().gen();
        let keys = config
            .keys
            .iter()
            .filter_map(|k| {
                let Some(owner) = OwnerKey::new(k.owner.as_str()) else {
                    tracing::warn!(key = %k.name, "Skipping API key with invalid owner");
                    return None;
                };
                Some(KeyEntry {
                    tag: tag(&mac_key, k.key.as_bytes()),
                    principal: Principal {
                        owner,
                        admin: k.admin,
                    },
                })
            })
            .collect();
        Self {
            enabled: config.enabled,
            mac_key,
            keys,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Resolve a presented token. Every key is checked even after a match.
    pub fn authenticate(&self, token: Option<&str>) -> Option<Principal> {
        if !self.enabled {
            return Some(Principal::anonymous());
        }
        let token = token?;

        let mut found = None;
        for entry in &self.keys {
            let mut mac = match HmacSha256::new_from_slice(&self.mac_key) {
                Ok(mac) => mac,
                Err(_) => return None,
            };
            mac.update(token.as_bytes());
            if mac.verify_slice(&entry.tag).is_ok() && found.is_none() {
                found = Some(entry.principal.clone());
            }
        }
        found
    }
}

fn tag(mac_key: &[u8], value: &[u8]) -> Vec<u8> {
    match HmacSha256::new_from_slice(mac_key) {
        Ok(mut mac) => {
            mac.update(value);
            mac.finalize().into_bytes().to_vec()
        }
        // HMAC accepts keys of any length.
        Err(_) => Vec::new(),
    }
}

/// Generate a random API key.
pub fn generate_api_key() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Generate a random secret for signing webhook deliveries.
pub fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    format!("whsec_{}", hex::encode(bytes))
}

/// Attach the caller's [`Principal`] to the request or answer 401.
pub async fn auth_middleware(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer.as_ref().map(|b| b.token());
    let principal = state
        .auth
        .authenticate(token)
        .ok_or(ApiError::from(Error::Unauthorized))?;
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}
