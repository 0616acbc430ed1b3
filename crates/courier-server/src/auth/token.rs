//! Signed bearer tokens binding a connection identity.
//!
//! Tokens are HS256 JWTs with the claims `{ connectionId, iat, exp }`.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use courier_core::Identity;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::AuthError;

/// JWT claims carried by a courier token.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    /// Identity the bearer connects as
    #[serde(
        rename = "connectionId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    connection_id: Option<String>,
    /// Issued at (Unix timestamp)
    iat: i64,
    /// Expiration (Unix timestamp)
    exp: i64,
}

/// A freshly minted token and the identity it binds.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub connection_id: Identity,
    pub expires_at: DateTime<Utc>,
}

/// Issues and verifies bearer tokens with a shared secret.
#[derive(Clone)]
pub struct TokenAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenAuthority {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
            ttl,
        }
    }

    /// Sign a token for `identity`, valid for the configured lifetime.
    pub fn issue(&self, identity: Identity) -> Result<IssuedToken, AuthError> {
        let now = Utc::now().timestamp();
        let exp = i64::try_from(self.ttl.as_secs())
            .ok()
            .and_then(|ttl| now.checked_add(ttl))
            .ok_or_else(|| AuthError::Signing(format!("token lifetime too large: {:?}", self.ttl)))?;
        let claims = Claims {
            connection_id: Some(identity.as_str().to_string()),
            iat: now,
            exp,
        };

        let token = encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| AuthError::Signing(e.to_string()))?;
        let expires_at = Utc
            .timestamp_opt(exp, 0)
            .single()
            .ok_or_else(|| AuthError::Signing(format!("expiry out of range: {}", exp)))?;

        debug!(identity = %identity, expires_at = %expires_at, "Issued token");
        Ok(IssuedToken {
            token,
            connection_id: identity,
            expires_at,
        })
    }

    /// Verify a token and return the identity it binds.
    ///
    /// Malformed, badly signed and expired tokens are `Invalid`. A valid
    /// token without a usable `connectionId` is `InvalidPayload`.
    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            debug!(error = %e, "Token rejected");
            AuthError::Invalid
        })?;

        match data.claims.connection_id {
            Some(id) if !id.is_empty() => Ok(Identity::new(id)),
            _ => Err(AuthError::InvalidPayload),
        }
    }

    /// Sign arbitrary claims with this authority's key.
    #[cfg(test)]
    pub(crate) fn sign_raw(&self, claims: serde_json::Value) -> String {
        encode(&Header::default(), &claims, &self.encoding).unwrap()
    }
}

impl fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthority")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
