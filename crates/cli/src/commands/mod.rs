//! CLI subcommands.

pub mod migrate;
pub mod reconcile;
pub mod session;

/// Database URL from `MERCATO_DATABASE_URL`, falling back to `DATABASE_URL`.
pub fn database_url() -> Result<String, MissingDatabaseUrl> {
    dotenvy::dotenv().ok();
    std::env::var("MERCATO_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .map_err(|_| MissingDatabaseUrl)
}

/// Neither database URL variable is set.
#[derive(Debug, thiserror::Error)]
#[error("Missing environment variable: MERCATO_DATABASE_URL (or DATABASE_URL)")]
pub struct MissingDatabaseUrl;
