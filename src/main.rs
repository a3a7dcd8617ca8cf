//! KBase CLI - serve the conversational KB answering engine

use clap::{Parser, Subcommand};
use std::sync::Arc;

use kbase::clients::chat::GatewayChatClient;
use kbase::clients::embedding::OllamaEmbedder;
use kbase::clients::memory::MemoryCache;
use kbase::clients::sqlite::{
    connect, register_vector_extension, SqliteDurableStore, SqliteVectorIndex,
};
use kbase::config::EngineConfig;
use kbase::pricing::PriceTable;
use kbase::ratelimit::RateLimiter;
use kbase::Engine;

#[derive(Parser)]
#[command(name = "kbase", version, about = "Conversational knowledge-base answering engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API server
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host, port } => {
            let config = EngineConfig::from_env();
            let prices = PriceTable::from_env()?;

            register_vector_extension();
            let database_url = std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://kbase.db?mode=rwc".to_string());
            let pool = Arc::new(connect(&database_url).await?);

            let durable = SqliteDurableStore::new(pool.clone());
            durable.ensure_schema().await?;
            let index = SqliteVectorIndex::new(pool.clone());
            index.ensure_vec_table().await?;

            let chat = Arc::new(GatewayChatClient::from_env()?);
            let embedder = Arc::new(OllamaEmbedder::from_env()?);
            let cache = Arc::new(MemoryCache::new());

            let limiter = Arc::new(RateLimiter::new(
                cache.clone(),
                config.rate_limits.clone(),
                config.timeouts.cache,
            ));
            let engine = Arc::new(Engine::new(
                config,
                prices,
                chat,
                embedder,
                Arc::new(index),
                cache,
                Arc::new(durable),
            ));

            kbase::server::run(engine, limiter, &host, port).await?;
        }
    }

    Ok(())
}
