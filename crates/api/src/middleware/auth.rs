//! Authentication extractors.
//!
//! Two credential kinds are accepted:
//!
//! - `Authorization: Bearer <token>` - an API session issued by
//!   `mercato session create`. Only the SHA-256 hash of the token is stored.
//! - `X-Admin-Token: <secret>` - the deprecated static admin secret. Logged on
//!   every use; to be removed once all admin tooling uses sessions.
//!
//! Both go through [`authorize`], so role checks live in one place.

use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, header, request::Parts},
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use crate::db::{RepositoryError, SessionStore};
use crate::error::{AppError, set_sentry_user};
use crate::models::SessionUser;
use crate::state::AppState;

/// Header carrying the deprecated static admin secret.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Authentication failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication required")]
    MissingCredential,

    #[error("invalid credentials")]
    InvalidCredential,

    #[error("session expired")]
    Expired,

    /// Authenticated, but not allowed.
    #[error("{0}")]
    Forbidden(String),

    #[error("session lookup failed: {0}")]
    Store(#[from] RepositoryError),
}

/// A credential presented by a client.
#[derive(Debug)]
pub enum Credential {
    /// Bearer session token.
    Session(SecretString),
    /// Static shared admin secret (deprecated).
    LegacyAdminSecret(SecretString),
}

impl Credential {
    /// Read a credential from request headers. A bearer token wins over the
    /// legacy header when both are present.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty());
        if let Some(token) = bearer {
            return Some(Self::Session(SecretString::from(token.to_owned())));
        }

        headers
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|secret| !secret.is_empty())
            .map(|secret| Self::LegacyAdminSecret(SecretString::from(secret.to_owned())))
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// A user with an API session.
    User(SessionUser),
    /// A caller holding the legacy admin secret. Has no user account.
    LegacyAdmin,
}

impl Principal {
    #[must_use]
    pub fn is_admin(&self) -> bool {
        match self {
            Self::User(user) => user.is_admin(),
            Self::LegacyAdmin => true,
        }
    }

    #[must_use]
    pub const fn user(&self) -> Option<&SessionUser> {
        match self {
            Self::User(user) => Some(user),
            Self::LegacyAdmin => None,
        }
    }
}

/// SHA-256 hex digest of a session token, as stored.
#[must_use]
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Map a credential to a principal.
///
/// # Errors
///
/// `InvalidCredential` for unknown tokens or a wrong or unconfigured legacy
/// secret, `Expired` for expired sessions, `Store` if the lookup fails.
pub async fn authorize(
    sessions: &dyn SessionStore,
    legacy_admin_token: Option<&SecretString>,
    credential: Credential,
    now: DateTime<Utc>,
) -> Result<Principal, AuthError> {
    match credential {
        Credential::Session(token) => {
            let record = sessions
                .resolve_session(&hash_token(token.expose_secret()))
                .await?
                .ok_or(AuthError::InvalidCredential)?;
            if record.expires_at <= now {
                return Err(AuthError::Expired);
            }
            Ok(Principal::User(record.user))
        }
        Credential::LegacyAdminSecret(secret) => {
            let expected = legacy_admin_token.ok_or(AuthError::InvalidCredential)?;
            if !secrets_match(expected, &secret) {
                return Err(AuthError::InvalidCredential);
            }
            warn!("Deprecated legacy admin secret used; issue an admin session instead");
            Ok(Principal::LegacyAdmin)
        }
    }
}

/// Compare two secrets in constant time.
///
/// Both sides are MACed under a fixed key so the comparison runs over
/// equal-length tags regardless of the secrets' lengths.
fn secrets_match(expected: &SecretString, presented: &SecretString) -> bool {
    const KEY: &[u8] = b"mercato-legacy-admin-secret";
    let tag = |value: &SecretString| {
        let mut mac = Hmac::<Sha256>::new_from_slice(KEY).ok()?;
        Mac::update(&mut mac, value.expose_secret().as_bytes());
        Some(mac)
    };
    let (Some(expected), Some(presented)) = (tag(expected), tag(presented)) else {
        return false;
    };
    presented
        .verify_slice(&Mac::finalize(expected).into_bytes())
        .is_ok()
}

/// Resolve the principal for a request from its headers.
///
/// # Errors
///
/// `MissingCredential` if no credential is present, otherwise as [`authorize`].
pub async fn principal_from_headers(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Principal, AuthError> {
    let credential = Credential::from_headers(headers).ok_or(AuthError::MissingCredential)?;
    let principal = authorize(
        state.stores().sessions.as_ref(),
        state.config().legacy_admin_token.as_ref(),
        credential,
        Utc::now(),
    )
    .await?;

    if let Principal::User(user) = &principal {
        set_sentry_user(&user.id, None);
    }
    Ok(principal)
}

/// Extractor for any authenticated caller.
pub struct Authenticated(pub Principal);

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(Self(principal_from_headers(state, &parts.headers).await?))
    }
}

/// Extractor that requires a user session (customer or admin).
///
/// # Example
///
/// ```rust,ignore
/// async fn my_orders(RequireUser(user): RequireUser) -> impl IntoResponse {
///     format!("Orders for {}", user.email)
/// }
/// ```
pub struct RequireUser(pub SessionUser);

impl FromRequestParts<AppState> for RequireUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        match principal_from_headers(state, &parts.headers).await? {
            Principal::User(user) => Ok(Self(user)),
            Principal::LegacyAdmin => Err(AuthError::Forbidden(
                "this endpoint requires a user session".to_string(),
            )
            .into()),
        }
    }
}

/// Extractor that requires an admin (session or legacy secret).
pub struct RequireAdmin(pub Principal);

impl FromRequestParts<AppState> for RequireAdmin {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let principal = principal_from_headers(state, &parts.headers).await?;
        if !principal.is_admin() {
            return Err(AuthError::Forbidden("admin access required".to_string()).into());
        }
        Ok(Self(principal))
    }
}
