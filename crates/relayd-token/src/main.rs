//! Admin CLI: mints a fresh API token and inserts the corresponding `Client` row.
//! Token issuance policy (expiry, rotation, scoping) is out of scope here — this just
//! gets the first row into an empty database.

use anyhow::{Context, Result};
use clap::Parser;
use relayd_db::entities::client;
use sea_orm::{ActiveModelTrait, Set};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "relayd-token")]
#[command(about = "Mint an API token and register a client", long_about = None)]
struct Cli {
    /// Human-readable client name.
    #[arg(long)]
    name: String,

    /// Maximum number of concurrent tunnels this client may hold.
    #[arg(long, default_value_t = 10)]
    max_tunnels: i32,

    /// Comma-separated subdomain allowlist. Omit to allow any subdomain.
    #[arg(long)]
    allowed_subdomains: Option<String>,

    /// SQLite database URL.
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite::memory:")]
    database_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let cli = Cli::parse();

    let db = relayd_db::connect(&cli.database_url).await.context("failed to connect to database")?;
    relayd_db::migrate(&db).await.context("failed to run database migrations")?;

    let token = Uuid::new_v4().to_string();
    let token_hash = relayd_db::hash_token(&token);

    let client = client::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(cli.name.clone()),
        token_hash: Set(token_hash),
        max_tunnels: Set(cli.max_tunnels),
        allowed_subdomains: Set(cli.allowed_subdomains.clone()),
        status: Set("active".to_string()),
        created_at: Set(chrono::Utc::now()),
    };
    client.insert(&db).await.context("failed to insert client row")?;

    println!("client {:?} created", cli.name);
    println!("token: {token}");
    println!("(the token is shown once; only its hash is stored)");

    Ok(())
}
