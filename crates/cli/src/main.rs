//! Mercato CLI - migrations, API sessions and payment reconciliation.
//!
//! # Usage
//!
//! ```bash
//! # Run database migrations
//! mercato migrate
//!
//! # Issue an admin API session valid for 7 days
//! mercato session create -e ops@example.com --admin --ttl-days 7
//!
//! # Reconcile every pending gateway order with the provider
//! mercato reconcile
//!
//! # Reconcile one order
//! mercato reconcile --external-order-id 5O190127TN364715T
//! ```
//!
//! # Commands
//!
//! - `migrate` - Run database migrations
//! - `session create` - Upsert a user and print a fresh bearer token
//! - `reconcile` - Apply the provider's view of pending gateway payments

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "mercato")]
#[command(author, version, about = "Mercato operator tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Manage API sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Reconcile pending gateway payments with the provider
    Reconcile {
        /// Only reconcile this provider order
        #[arg(long)]
        external_order_id: Option<String>,

        /// Maximum number of pending orders to check
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Create a session and print its bearer token
    Create {
        /// User email address (created if missing)
        #[arg(short, long)]
        email: String,

        /// Grant the admin role
        #[arg(long)]
        admin: bool,

        /// Days until the session expires
        #[arg(long, default_value_t = 30)]
        ttl_days: u32,
    },
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let result: Result<(), Box<dyn std::error::Error>> = run(cli).await;

    if let Err(e) = result {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Migrate => commands::migrate::run().await?,
        Commands::Session { action } => match action {
            SessionAction::Create {
                email,
                admin,
                ttl_days,
            } => commands::session::create(&email, admin, ttl_days).await?,
        },
        Commands::Reconcile {
            external_order_id,
            limit,
        } => commands::reconcile::run(external_order_id.as_deref(), limit).await?,
    }
    Ok(())
}
