//! Validation of the long-lived admin API token.
//!
//! The token is a JWT whose payload we inspect for issuer, expiry, and an
//! admin role. Signature verification happens at the boundary that issued
//! the token; here the claims gate configuration only.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use serde::Deserialize;

use crate::types::RuntimeError;

const KNOWN_ISSUERS: &[&str] = &["https://admin.hlx.page/auth", "https://ims-na1.adobelogin.com"];

const ADMIN_ROLES: &[&str] = &["admin", "publish", "author"];

/// Claims carried by the admin token payload.
#[derive(Debug, Clone, Deserialize)]
pub struct AdminTokenClaims {
    #[serde(default)]
    pub iss: String,
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub sub: Option<String>,
}

/// Validate an admin token's claims: known issuer, unexpired, admin role.
pub fn validate_admin_token(token: &str) -> Result<AdminTokenClaims, RuntimeError> {
    let claims = decode_claims(token)?;

    if !KNOWN_ISSUERS.contains(&claims.iss.as_str()) {
        return Err(RuntimeError::Validation(format!(
            "admin token issuer not recognized: {}",
            claims.iss
        )));
    }

    match claims.exp {
        Some(exp) if exp > Utc::now().timestamp() => {}
        Some(_) => {
            return Err(RuntimeError::Validation(
                "admin token is expired".to_string(),
            ))
        }
        None => {
            return Err(RuntimeError::Validation(
                "admin token carries no expiry".to_string(),
            ))
        }
    }

    if !claims
        .roles
        .iter()
        .any(|r| ADMIN_ROLES.contains(&r.to_ascii_lowercase().as_str()))
    {
        return Err(RuntimeError::Validation(
            "admin token lacks an admin role".to_string(),
        ));
    }

    Ok(claims)
}

fn decode_claims(token: &str) -> Result<AdminTokenClaims, RuntimeError> {
    let mut parts = token.split('.');
    let (_header, payload) = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(_sig)) => (h, p),
        _ => {
            return Err(RuntimeError::Validation(
                "admin token is not a JWT".to_string(),
            ))
        }
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| RuntimeError::Validation(format!("admin token payload undecodable: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| RuntimeError::Validation(format!("admin token claims malformed: {e}")))
}
