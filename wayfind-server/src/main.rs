use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};
use wayfind_core::embeddings::{EmbeddingBackend, VoyageConfig, VoyageEmbeddingClient};
use wayfind_core::generation::{AnthropicConfig, AnthropicGenerationClient, GenerationProvider};
use wayfind_core::store::{MessageStore, PgEntityStore, PgMessageStore};
use wayfind_core::WayfindConfig;

use wayfind_server::http::{self, HttpState};
use wayfind_server::subsystems::embedder;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "wayfind.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience — production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Init logging
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    // Load config
    let config = match WayfindConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Connect to DB
    let pool = match wayfind_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match wayfind_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }

        match wayfind_core::db::check_pgvector(&pool).await {
            Ok(v) => println!("✅ pgvector version: {}", v),
            Err(e) => {
                println!("❌ pgvector check failed: {}", e);
                std::process::exit(1);
            }
        }

        match wayfind_core::db::check_embedding_columns(&pool).await {
            Ok(()) => println!(
                "✅ entity embedding columns verified ({} dims)",
                wayfind_core::EMBEDDING_DIMENSIONS
            ),
            Err(e) => {
                println!("❌ schema check failed: {}", e);
                std::process::exit(1);
            }
        }

        println!("✅ Wayfind DB health check passed");
        return Ok(());
    }

    // Shutdown fan-out
    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    // External clients
    let voyage_config = VoyageConfig {
        api_key: std::env::var("VOYAGE_API_KEY").unwrap_or_default(),
        model: config.embedding.model.clone(),
        dimensions: config.embedding.dimensions as usize,
        max_retries: config.embedding.max_retries,
        retry_delay_ms: config.embedding.retry_delay_ms,
    };
    let backend: Arc<dyn EmbeddingBackend> = match VoyageEmbeddingClient::new(voyage_config) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("Failed to create embedding client: {}", e);
            std::process::exit(1);
        }
    };

    let anthropic_config = AnthropicConfig::new(
        None,
        config.generation.model.clone(),
        config.generation.fast_model.clone(),
        config.generation.max_tokens,
    );
    let provider: Arc<dyn GenerationProvider> =
        match AnthropicGenerationClient::new(anthropic_config) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                eprintln!("Failed to create generation client: {}", e);
                std::process::exit(1);
            }
        };

    // Embedding worker
    let (job_tx, job_rx) = embedder::job_channel(config.embedding.queue_capacity as usize);
    let worker_store = Arc::new(PgEntityStore::new(pool.clone()));
    let worker_backend = backend.clone();
    let worker_redeliver = job_tx.clone();
    let worker_shutdown = tx.subscribe();
    tokio::spawn(async move {
        embedder::run_embedding_worker(
            job_rx,
            worker_redeliver,
            worker_store,
            worker_backend,
            worker_shutdown,
        )
        .await;
    });

    // HTTP API
    let messages: Arc<dyn MessageStore> = Arc::new(PgMessageStore::new(pool.clone()));
    let state = Arc::new(HttpState {
        pool,
        config,
        messages,
        embedder: backend,
        provider,
        jobs: job_tx,
    });

    http::start_http_server(state, tx.subscribe()).await?;

    Ok(())
}
