//! API session commands.
//!
//! Bearer tokens are printed once and never stored; the database only keeps
//! their SHA-256 hash.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use mercato_api::db::{PgStore, RepositoryError, SessionStore, create_pool};
use mercato_api::middleware::auth::hash_token;
use mercato_core::{Email, Role};
use rand::Rng;
use secrecy::SecretString;
use thiserror::Error;

use super::{MissingDatabaseUrl, database_url};

/// Random bytes per token.
const TOKEN_BYTES: usize = 32;

/// Errors that can occur while creating a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    MissingEnvVar(#[from] MissingDatabaseUrl),

    #[error("Invalid email: {0}")]
    InvalidEmail(String),

    #[error("TTL must be at least one day")]
    InvalidTtl,

    #[error("Database connection error: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("Database error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Generate a URL-safe random bearer token.
fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Upsert the user and print a new bearer token for it.
pub async fn create(email: &str, admin: bool, ttl_days: u32) -> Result<(), SessionError> {
    let email = Email::parse(email).map_err(|e| SessionError::InvalidEmail(e.to_string()))?;
    if ttl_days == 0 {
        return Err(SessionError::InvalidTtl);
    }
    let role = if admin { Role::Admin } else { Role::Customer };

    let pool = create_pool(&SecretString::from(database_url()?)).await?;
    let store = PgStore::new(pool);

    let token = generate_token();
    let expires_at = Utc::now() + Duration::days(i64::from(ttl_days));
    let user = store
        .create_session(&email, role, &hash_token(&token), expires_at)
        .await?;

    tracing::info!(
        user_id = %user.id,
        email = %user.email,
        role = %user.role,
        %expires_at,
        "Session created"
    );

    #[allow(clippy::print_stdout)]
    {
        println!("{token}");
    }
    Ok(())
}
