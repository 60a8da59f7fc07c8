use clap::{Parser, Subcommand};
use redisrepo_core::{Repository, RepositoryBuilder, RepositoryConfig, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "redisrepo")]
#[command(about = "Inspect and edit a Redis entity collection")]
struct Cli {
    /// Path to configuration file; without it an in-memory repository is used
    #[arg(long = "conf")]
    conf: Option<String>,

    /// Collection prefix when running without a configuration file
    #[arg(long, default_value = "entity:")]
    prefix: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the stored JSON of one entity
    Get { id: String },
    /// Store a JSON document under an id
    Put { id: String, json: String },
    /// Clear one or more entities
    Rm {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// List every id of the collection
    Ls,
    /// Count the entities of the collection
    Count,
    /// Take the lock of an id, hold it, then release it
    Lock {
        id: String,
        /// How long to hold the lock before releasing it
        #[arg(long = "hold-ms", default_value_t = 0)]
        hold_ms: u64,
    },
}

async fn open_repository(cli: &Cli) -> Result<Arc<dyn Repository<Value, String>>> {
    let config = match &cli.conf {
        Some(path) => {
            tracing::info!("Loading repository config from {}", path);
            RepositoryConfig::from_file(path)?
        }
        None => RepositoryConfig::in_memory(cli.prefix.clone()),
    };

    RepositoryBuilder::from_config(&config).build().await
}

async fn run(cli: Cli) -> Result<()> {
    let repo = open_repository(&cli).await?;

    match cli.command {
        Commands::Get { id } => match repo.load(&id).await? {
            Some(entity) => println!("{}", serde_json::to_string_pretty(&entity)?),
            None => {
                tracing::warn!("Entity {} not found", id);
                std::process::exit(3);
            }
        },
        Commands::Put { id, json } => {
            let entity: Value = serde_json::from_str(&json)?;
            let inserts = HashMap::from([(id.clone(), entity)]);
            repo.save_all(&inserts, &HashMap::new()).await?;
            tracing::info!("Stored entity {}", id);
        }
        Commands::Rm { ids } => {
            repo.remove_all(&ids).await?;
            tracing::info!("Removed {} entit(y/ies)", ids.len());
        }
        Commands::Ls => {
            let mut ids = repo.query_all_ids().await?;
            ids.sort();
            for id in ids {
                println!("{}", id);
            }
        }
        Commands::Count => {
            println!("{}", repo.count().await?);
        }
        Commands::Lock { id, hold_ms } => {
            let attempt = repo.lock(&id).await?;
            if !attempt.acquired {
                tracing::warn!("Lock for {} is held elsewhere or unreachable", id);
                std::process::exit(4);
            }

            println!("locked {}", id);
            tokio::time::sleep(Duration::from_millis(hold_ms)).await;
            repo.unlock_all(std::slice::from_ref(&id)).await;
            println!("released {}", id);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "redisrepo=info,redisrepo_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    if let Err(error) = run(cli).await {
        tracing::error!("redisrepo failed: {}", error);
        std::process::exit(1);
    }
}
