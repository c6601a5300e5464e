//! Bearer-token authentication and per-model access control.
//!
//! A token is tried, in order, as the master key, as a client token and as an
//! HS256 JWT. Static keys are compared by SHA-256 digest in constant time.

use crate::core::config::{AuthConfig, ClientConfig};
use crate::core::error::{AppError, Result};
use axum::http::HeaderMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use subtle::ConstantTimeEq;

pub const MASTER_IDENTITY: &str = "api_user";
pub const ANONYMOUS_IDENTITY: &str = "anonymous";
pub const CLIENT_PREFIX: &str = "client_";
/// JWT subjects are namespaced so a token cannot claim a master or client identity.
pub const JWT_PREFIX: &str = "jwt:";

/// Claims carried by gateway-issued access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

/// Short hex prefix of a token digest, safe to log.
pub fn key_fingerprint(token: &str) -> String {
    hex::encode(&digest(token)[..4])
}

/// Extract Bearer token from Authorization header.
fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

struct ClientCredential {
    name: String,
    token_digest: [u8; 32],
    allowed_models: Vec<String>,
}

struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
}

pub struct Authenticator {
    master_digest: Option<[u8; 32]>,
    clients: Vec<ClientCredential>,
    client_models: HashMap<String, Vec<String>>,
    jwt: Option<JwtKeys>,
    auth_required: bool,
}

impl Authenticator {
    pub fn new(auth: &AuthConfig, clients: &HashMap<String, ClientConfig>) -> Self {
        let credentials: Vec<ClientCredential> = clients
            .iter()
            .filter_map(|(name, client)| {
                let token = client.bearer_token.as_deref().filter(|t| !t.is_empty())?;
                Some(ClientCredential {
                    name: name.clone(),
                    token_digest: digest(token),
                    allowed_models: client.allowed_models.clone(),
                })
            })
            .collect();

        let client_models = clients
            .iter()
            .map(|(name, client)| (name.clone(), client.allowed_models.clone()))
            .collect();

        let jwt = auth
            .jwt_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|secret| JwtKeys {
                encoding: EncodingKey::from_secret(secret.as_bytes()),
                decoding: DecodingKey::from_secret(secret.as_bytes()),
                issuer: auth.jwt_issuer.clone(),
            });

        if auth.auth_required && auth.api_key.is_none() && credentials.is_empty() && jwt.is_none() {
            tracing::warn!("Authentication is required but no credentials are configured");
        }

        Self {
            master_digest: auth.api_key.as_deref().filter(|k| !k.is_empty()).map(digest),
            clients: credentials,
            client_models,
            jwt,
            auth_required: auth.auth_required,
        }
    }

    pub fn auth_required(&self) -> bool {
        self.auth_required
    }

    /// Resolve the caller identity from the `Authorization: Bearer` header.
    ///
    /// A missing token is anonymous when auth is optional. A token that matches
    /// nothing is rejected either way.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<String> {
        let Some(token) = extract_bearer(headers) else {
            if self.auth_required {
                return Err(AppError::Unauthorized);
            }
            return Ok(ANONYMOUS_IDENTITY.to_string());
        };

        let provided = digest(token);

        if let Some(master) = &self.master_digest {
            if bool::from(provided.ct_eq(master)) {
                return Ok(MASTER_IDENTITY.to_string());
            }
        }

        // Visit every client so timing does not reveal which one matched
        let mut matched: Option<&ClientCredential> = None;
        for client in &self.clients {
            if bool::from(provided.ct_eq(&client.token_digest)) {
                matched = Some(client);
            }
        }
        if let Some(client) = matched {
            tracing::debug!(client = %client.name, "Authenticated client token");
            return Ok(format!("{}{}", CLIENT_PREFIX, client.name));
        }

        if let Some(jwt) = &self.jwt {
            let mut validation = Validation::new(Algorithm::HS256);
            validation.set_issuer(&[&jwt.issuer]);
            match decode::<Claims>(token, &jwt.decoding, &validation) {
                Ok(data) => return Ok(format!("{}{}", JWT_PREFIX, data.claims.sub)),
                Err(e) => tracing::debug!(error = %e, "JWT validation failed"),
            }
        }

        tracing::warn!(key = %key_fingerprint(token), "Rejected bearer token");
        Err(AppError::Unauthorized)
    }

    /// Whether `identity` may call `model`.
    pub fn validate_model_access(&self, identity: &str, model: &str) -> Result<()> {
        if identity == MASTER_IDENTITY {
            return Ok(());
        }

        if let Some(name) = identity.strip_prefix(CLIENT_PREFIX) {
            if let Some(allowed) = self.client_models.get(name) {
                if allowed.iter().any(|m| m == "*" || m == model) {
                    return Ok(());
                }
                return Err(AppError::Forbidden(format!(
                    "client '{}' is not allowed to use model '{}'",
                    name, model
                )));
            }
        }

        if !self.auth_required {
            return Ok(());
        }
        Err(AppError::Forbidden(format!(
            "'{}' is not allowed to use model '{}'",
            identity, model
        )))
    }

    /// Sign an access token for `sub` valid for `ttl`.
    pub fn issue_token(&self, sub: &str, ttl: Duration) -> Result<String> {
        let jwt = self
            .jwt
            .as_ref()
            .ok_or_else(|| AppError::Internal("JWT secret is not configured".into()))?;
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            iss: jwt.issuer.clone(),
            iat: now,
            exp: now + ttl.as_secs() as i64,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &jwt.encoding)
            .map_err(|e| AppError::Internal(format!("failed to sign token: {}", e)))
    }
}
