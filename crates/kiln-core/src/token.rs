//! Access-token generation and validation.
//!
//! Tokens are HMAC-SHA256 based and carry the caller's identity:
//! `kiln_tk_<tenant_id>_<user_id>_<role>_<hmac_hex>`. Both the HTTP
//! bearer header and the WebSocket query parameter use this format.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Token prefix used to identify kiln access tokens.
const TOKEN_PREFIX: &str = "kiln_tk_";

/// Errors that can occur during token operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token format: {0}")]
    InvalidFormat(String),

    #[error("invalid tenant ID in token: {0}")]
    InvalidTenantId(String),

    #[error("invalid user ID in token: {0}")]
    InvalidUserId(String),

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
    /// Create a new TokenConfig with the given secret.
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// Create a TokenConfig from the `KILN_TOKEN_SECRET` environment
    /// variable. The value must be hex-encoded (as written by
    /// `kiln token --init`).
    pub fn from_env() -> Result<Self, TokenError> {
        let secret_hex =
            std::env::var("KILN_TOKEN_SECRET").map_err(|_| TokenError::MissingSecret)?;
        let secret = hex::decode(&secret_hex).map_err(|e| {
            TokenError::InvalidFormat(format!("KILN_TOKEN_SECRET is not valid hex: {e}"))
        })?;
        Ok(Self::new(secret))
    }

    /// Generate a random 32-byte secret, hex-encoded for the environment.
    pub fn generate_secret_hex() -> String {
        let bytes: [u8; 32] = rand::random();
        hex::encode(bytes)
    }
}

/// Identity extracted from a validated token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
}

/// Generate an access token for a given identity.
///
/// The HMAC-SHA256 is computed over `<tenant_id>:<user_id>:<role>`.
pub fn generate_token(config: &TokenConfig, tenant_id: Uuid, user_id: Uuid, role: &str) -> String {
    let message = format!("{tenant_id}:{user_id}:{role}");
    let mac = compute_hmac(&config.secret, message.as_bytes());
    let hmac_hex = hex::encode(mac);
    format!("{TOKEN_PREFIX}{tenant_id}_{user_id}_{role}_{hmac_hex}")
}

/// Validate an access token and extract its claims.
///
/// Parses the token, recomputes the HMAC, and verifies it in constant
/// time before returning the identity.
pub fn validate_token(config: &TokenConfig, token: &str) -> Result<Claims, TokenError> {
    let rest = token.strip_prefix(TOKEN_PREFIX).ok_or_else(|| {
        TokenError::InvalidFormat(format!("token must start with {TOKEN_PREFIX:?}"))
    })?;

    // <tenant_uuid>_<user_uuid>_<role>_<hmac_hex>; UUIDs are 36 chars.
    let (tenant_str, rest) = split_uuid_prefix(rest)?;
    let tenant_id =
        Uuid::parse_str(tenant_str).map_err(|e| TokenError::InvalidTenantId(e.to_string()))?;

    let (user_str, rest) = split_uuid_prefix(rest)?;
    let user_id =
        Uuid::parse_str(user_str).map_err(|e| TokenError::InvalidUserId(e.to_string()))?;

    // Roles contain no underscores, so the final underscore splits role
    // from HMAC.
    let (role, hmac_hex) = rest.rsplit_once('_').ok_or_else(|| {
        TokenError::InvalidFormat("expected underscore between role and hmac".to_owned())
    })?;
    if role.is_empty() {
        return Err(TokenError::InvalidFormat("empty role".to_owned()));
    }

    let provided = hex::decode(hmac_hex)
        .map_err(|e| TokenError::InvalidFormat(format!("hmac is not valid hex: {e}")))?;

    let message = format!("{tenant_id}:{user_id}:{role}");
    let mut mac = HmacSha256::new_from_slice(&config.secret)
        .expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    mac.verify_slice(&provided)
        .map_err(|_| TokenError::HmacMismatch)?;

    Ok(Claims {
        tenant_id,
        user_id,
        role: role.to_owned(),
    })
}

/// Split a 36-char UUID off the front of `s`, consuming the trailing
/// underscore.
fn split_uuid_prefix(s: &str) -> Result<(&str, &str), TokenError> {
    if s.len() < 37 {
        return Err(TokenError::InvalidFormat(
            "token too short for identity segment".to_owned(),
        ));
    }
    let (uuid_str, rest) = s.split_at(36);
    let rest = rest
        .strip_prefix('_')
        .ok_or_else(|| TokenError::InvalidFormat("expected underscore after UUID".to_owned()))?;
    Ok((uuid_str, rest))
}

fn compute_hmac(secret: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TokenConfig {
        TokenConfig::new(b"test-secret".to_vec())
    }

    #[test]
    fn generate_then_validate_roundtrip() {
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();

        let token = generate_token(&config(), tenant, user, "member");
        let claims = validate_token(&config(), &token).expect("token should validate");

        assert_eq!(claims.tenant_id, tenant);
        assert_eq!(claims.user_id, user);
        assert_eq!(claims.role, "member");
    }

    #[test]
    fn tampered_token_fails() {
        let token = generate_token(&config(), Uuid::new_v4(), Uuid::new_v4(), "member");
        let mut tampered = token.clone();
        // Flip the last hex digit of the HMAC.
        let last = tampered.pop().unwrap();
        tampered.push(if last == '0' { '1' } else { '0' });

        assert!(matches!(
            validate_token(&config(), &tampered),
            Err(TokenError::HmacMismatch)
        ));
    }

    #[test]
    fn wrong_secret_fails() {
        let token = generate_token(&config(), Uuid::new_v4(), Uuid::new_v4(), "admin");
        let other = TokenConfig::new(b"other-secret".to_vec());
        assert!(matches!(
            validate_token(&other, &token),
            Err(TokenError::HmacMismatch)
        ));
    }

    #[test]
    fn role_change_invalidates() {
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();
        let token = generate_token(&config(), tenant, user, "member");
        let escalated = token.replace("_member_", "_admin_");
        assert!(validate_token(&config(), &escalated).is_err());
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        for bad in [
            "",
            "kiln_tk_",
            "kiln_tk_not-a-uuid",
            "bearer-something-else",
            "kiln_tk_00000000-0000-0000-0000-000000000000",
        ] {
            assert!(validate_token(&config(), bad).is_err(), "accepted {bad:?}");
        }
    }
}
