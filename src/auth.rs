//! Password hashing, access tokens, and the bearer-token guard
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use jsonwebtoken::{errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use sqlx::SqlitePool;

use crate::{db, se, LOG};

pub fn hash_password(plain: &str) -> crate::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| se!("error hashing password {}", e))?
        .to_string())
}

pub fn verify_password(plain: &str, target_hash: &str) -> crate::Result<bool> {
    let hash = PasswordHash::new(target_hash).map_err(|e| se!("invalid password hash {}", e))?;
    Ok(Argon2::default()
        .verify_password(plain.as_bytes(), &hash)
        .is_ok())
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Claims {
    pub id: i64,
    pub email: String,
    pub iat: u64,
    pub exp: u64,
}

/// Issue a signed access token for a user, valid for `ttl_seconds`
pub fn issue_token(secret: &str, id: i64, email: &str, ttl_seconds: u64) -> crate::Result<String> {
    let now = crate::utils::now_seconds()? as u64;
    let claims = Claims {
        id,
        email: email.to_string(),
        iat: now,
        exp: now + ttl_seconds,
    };
    Ok(jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| se!("error signing access token {}", e))?)
}

/// Why a request was turned away by the bearer guard
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub status: u16,
    pub message: &'static str,
}

impl Rejection {
    fn new(status: u16, message: &'static str) -> Self {
        Self { status, message }
    }
}

pub fn verify_token(secret: &str, token: &str) -> std::result::Result<Claims, Rejection> {
    jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => Rejection::new(403, "Token expired"),
        _ => Rejection::new(403, "Invalid token"),
    })
}

/// Pull the token out of an `Authorization: Bearer <token>` header value
pub fn bearer_token(header: Option<&str>) -> std::result::Result<&str, Rejection> {
    let header = header.ok_or_else(|| Rejection::new(401, "Authorization header missing"))?;
    match header.split_whitespace().nth(1) {
        Some(token) => Ok(token),
        None => Err(Rejection::new(401, "Access token missing")),
    }
}

/// Resolve the user making a request from its bearer token.
/// The user must still exist, a token outliving its account is rejected.
pub async fn authenticate(
    pool: &SqlitePool,
    secret: &str,
    header: Option<&str>,
) -> std::result::Result<Claims, Rejection> {
    let token = bearer_token(header)?;
    let claims = verify_token(secret, token)?;
    match db::find_user_by_id(pool, claims.id).await {
        Ok(Some(_)) => Ok(claims),
        Ok(None) => Err(Rejection::new(403, "User not found")),
        Err(e) => {
            slog::error!(LOG, "error looking up token user"; "user_id" => claims.id, "error" => e.to_string());
            Err(Rejection::new(403, "User not found"))
        }
    }
}
