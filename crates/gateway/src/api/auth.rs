//! API authentication: API keys resolve to owner ids, bot tokens guard
//! the internal callback surface.
//!
//! Keys are read from the env var named by `server.api_keys_env`
//! (format `owner1:key1,owner2:key2`) **once at startup**; only SHA-256
//! digests are kept, and lookups compare in constant time. With no keys
//! configured the server logs a warning and resolves every caller to the
//! `dev` owner (dev mode).

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::ControlError;
use crate::state::AppState;

/// Owner lookup table, keyed by API-key digest.
pub struct ApiKeyMap {
    /// `(owner_id, sha256(key))` pairs.
    entries: Vec<(String, Vec<u8>)>,
}

impl ApiKeyMap {
    /// Parse `owner:key,owner2:key2` from the named env var.
    pub fn from_env(env_var: &str) -> Self {
        let mut entries = Vec::new();
        if let Ok(raw) = std::env::var(env_var) {
            for pair in raw.split(',') {
                let pair = pair.trim();
                if pair.is_empty() {
                    continue;
                }
                match pair.split_once(':') {
                    Some((owner, key)) if !owner.is_empty() && !key.is_empty() => {
                        entries.push((
                            owner.trim().to_string(),
                            Sha256::digest(key.trim().as_bytes()).to_vec(),
                        ));
                    }
                    _ => tracing::warn!(env_var, "malformed API key entry skipped"),
                }
            }
        }
        if entries.is_empty() {
            tracing::warn!(
                env_var,
                "no API keys configured; all callers resolve to the `dev` owner"
            );
        } else {
            tracing::info!(owners = entries.len(), "API key auth enabled");
        }
        Self { entries }
    }

    #[cfg(test)]
    pub fn with_keys(pairs: &[(&str, &str)]) -> Self {
        Self {
            entries: pairs
                .iter()
                .map(|(owner, key)| {
                    (owner.to_string(), Sha256::digest(key.as_bytes()).to_vec())
                })
                .collect(),
        }
    }

    /// Resolve an API key to its owner. Scans every entry so timing does
    /// not reveal which key prefix matched.
    pub fn resolve(&self, provided: &str) -> Option<String> {
        if self.entries.is_empty() {
            return Some("dev".to_string());
        }
        let digest = Sha256::digest(provided.as_bytes());
        let mut hit = None;
        for (owner, expected) in &self.entries {
            if bool::from(digest.ct_eq(expected.as_slice())) {
                hit = Some(owner.clone());
            }
        }
        hit
    }
}

/// Extractor resolving the calling owner from `Authorization: Bearer`,
/// `X-API-Key`, or (for WebSocket clients) the `api_key` query param.
pub struct Owner(pub String);

#[axum::async_trait]
impl FromRequestParts<AppState> for Owner {
    type Rejection = ControlError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let from_header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .or_else(|| {
                parts
                    .headers
                    .get("x-api-key")
                    .and_then(|v| v.to_str().ok())
            });

        let from_query = parts.uri.query().and_then(|query| {
            query.split('&').find_map(|kv| {
                kv.strip_prefix("api_key=").filter(|v| !v.is_empty())
            })
        });

        let provided = from_header.or(from_query).unwrap_or("");
        state
            .api_keys
            .resolve(provided)
            .map(Owner)
            .ok_or(ControlError::AuthRequired)
    }
}

/// Bot token for the internal surface: `Authorization: Bearer` or
/// `X-Bot-Token`.
pub fn bot_token_from_headers(parts: &axum::http::HeaderMap) -> Option<String> {
    parts
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| parts.get("x-bot-token").and_then(|v| v.to_str().ok()))
        .map(str::to_string)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_keys() {
        let map = ApiKeyMap::with_keys(&[("u1", "key-one"), ("u2", "key-two")]);
        assert_eq!(map.resolve("key-one").as_deref(), Some("u1"));
        assert_eq!(map.resolve("key-two").as_deref(), Some("u2"));
        assert_eq!(map.resolve("key-three"), None);
        assert_eq!(map.resolve(""), None);
    }

    #[test]
    fn empty_map_is_dev_mode() {
        let map = ApiKeyMap { entries: vec![] };
        assert_eq!(map.resolve("anything").as_deref(), Some("dev"));
    }

    #[test]
    fn bot_token_header_variants() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("authorization", "Bearer abc123".parse().unwrap());
        assert_eq!(bot_token_from_headers(&headers).as_deref(), Some("abc123"));

        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-bot-token", "tok".parse().unwrap());
        assert_eq!(bot_token_from_headers(&headers).as_deref(), Some("tok"));

        let headers = axum::http::HeaderMap::new();
        assert_eq!(bot_token_from_headers(&headers), None);
    }
}
