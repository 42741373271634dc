//! Operator tool for managing ingestion API keys.

use anyhow::Context;
use clap::{Parser, Subcommand};
use envconfig::Envconfig;

use ingest::keys::{KeyStore, PgKeyStore, Quota};

#[derive(Envconfig)]
struct Config {
    pub database_url: String,
    #[envconfig(default = "2")]
    pub max_pg_connections: u32,
}

#[derive(Parser)]
#[command(version, about = "Manage ingestion API keys", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new API key and print its secret
    Create {
        /// Human-readable owner of the key
        #[arg(long)]
        name: String,

        /// Requests allowed per window
        #[arg(long, default_value_t = 1000)]
        rate_limit_requests: u32,

        /// Window length in seconds
        #[arg(long, default_value_t = 3600)]
        rate_limit_window: u32,

        /// Restrict the key to these client IPs (repeatable)
        #[arg(long)]
        allowed_ips: Vec<String>,
    },

    /// List every key, active and revoked
    List,

    /// Deactivate a key. Takes effect on the next request.
    Revoke {
        #[arg(long)]
        key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::init_from_env().context("invalid configuration")?;

    let store = PgKeyStore::new(&config.database_url, config.max_pg_connections)
        .await
        .context("failed to connect to the key store")?;
    store
        .prepare()
        .await
        .context("failed to prepare key store schema")?;

    match cli.command {
        Commands::Create {
            name,
            rate_limit_requests,
            rate_limit_window,
            allowed_ips,
        } => {
            let quota = Quota {
                requests: rate_limit_requests,
                window_secs: rate_limit_window,
            };
            let allowed_ips = if allowed_ips.is_empty() {
                None
            } else {
                Some(allowed_ips)
            };

            let record = store.create(&name, quota, allowed_ips).await?;

            println!("Created API key for {}", record.name);
            println!("  key:    {}", record.key);
            println!(
                "  quota:  {} requests / {}s",
                record.rate_limit_requests, record.rate_limit_window
            );
            match record.allowed_ips() {
                Some(ips) => println!("  ips:    {}", ips.join(", ")),
                None => println!("  ips:    any"),
            }
        }
        Commands::List => {
            let records = store.list().await?;
            if records.is_empty() {
                println!("No API keys found");
            }
            for record in records {
                println!(
                    "{}  {}  {}  {} requests / {}s  created {}",
                    record.key,
                    record.name,
                    if record.active { "active" } else { "revoked" },
                    record.rate_limit_requests,
                    record.rate_limit_window,
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        Commands::Revoke { key } => {
            store.revoke(&key).await?;
            println!("Revoked {key}");
        }
    }

    Ok(())
}
