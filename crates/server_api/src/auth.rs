use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::domain::Identity;

const ID_TOKEN_ISSUER: &str = "design-studio";
/// How long after expiry an ID token can still be exchanged for a new one.
pub const REFRESH_WINDOW_SECONDS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub id_token_secret: String,
    pub custom_token_secret: String,
    pub id_token_ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct IdTokenClaims {
    iss: String,
    sub: String,
    iat: i64,
    exp: i64,
    #[serde(default)]
    anonymous: bool,
}

/// Claims carried by a custom token minted by a trusted backend.
#[derive(Debug, Serialize, Deserialize)]
pub struct CustomTokenClaims {
    pub uid: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct IssuedIdToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub identity: Identity,
    pub anonymous: bool,
}

pub fn mint_id_token(
    cfg: &AuthConfig,
    identity: &Identity,
    anonymous: bool,
) -> Result<IssuedIdToken, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let exp = now + Duration::seconds(cfg.id_token_ttl_seconds);
    let claims = IdTokenClaims {
        iss: ID_TOKEN_ISSUER.to_string(),
        sub: identity.to_string(),
        iat: now.timestamp(),
        exp: exp.timestamp(),
        anonymous,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.id_token_secret.as_bytes()),
    )?;
    Ok(IssuedIdToken {
        token,
        expires_at: Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .unwrap_or(exp),
    })
}

pub fn verify_id_token(
    cfg: &AuthConfig,
    token: &str,
) -> Result<VerifiedIdentity, jsonwebtoken::errors::Error> {
    let mut validation = Validation::default();
    validation.set_issuer(&[ID_TOKEN_ISSUER]);
    let decoded = decode::<IdTokenClaims>(
        token,
        &DecodingKey::from_secret(cfg.id_token_secret.as_bytes()),
        &validation,
    )?;
    Ok(VerifiedIdentity {
        identity: Identity(decoded.claims.sub),
        anonymous: decoded.claims.anonymous,
    })
}

/// Like [`verify_id_token`] but accepts tokens that expired less than
/// [`REFRESH_WINDOW_SECONDS`] ago.
pub fn verify_id_token_for_refresh(
    cfg: &AuthConfig,
    token: &str,
) -> Result<VerifiedIdentity, jsonwebtoken::errors::Error> {
    let mut validation = Validation::default();
    validation.set_issuer(&[ID_TOKEN_ISSUER]);
    validation.validate_exp = false;
    let decoded = decode::<IdTokenClaims>(
        token,
        &DecodingKey::from_secret(cfg.id_token_secret.as_bytes()),
        &validation,
    )?;
    if decoded.claims.exp + REFRESH_WINDOW_SECONDS < Utc::now().timestamp() {
        return Err(jsonwebtoken::errors::ErrorKind::ExpiredSignature.into());
    }
    Ok(VerifiedIdentity {
        identity: Identity(decoded.claims.sub),
        anonymous: decoded.claims.anonymous,
    })
}

pub fn mint_custom_token(
    secret: &str,
    uid: &str,
    ttl_seconds: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let claims = CustomTokenClaims {
        uid: uid.to_string(),
        iat: now.timestamp(),
        exp: (now + Duration::seconds(ttl_seconds)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

pub fn verify_custom_token(
    cfg: &AuthConfig,
    token: &str,
) -> Result<CustomTokenClaims, jsonwebtoken::errors::Error> {
    let decoded = decode::<CustomTokenClaims>(
        token,
        &DecodingKey::from_secret(cfg.custom_token_secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(decoded.claims)
}
