use std::sync::Arc;

use anyhow::Result;
use dotenvy::dotenv;
use tracing::info;

mod config;
mod credits;
mod db;
mod error;
mod http;
mod llm;
mod pipeline;
mod state;
mod storage;
mod utils;

use config::Config;
use credits::CreditLedger;
use db::database::Database;
use llm::embeddings::GeminiEmbedder;
use llm::gemini::GeminiClient;
use state::AppState;
use storage::{HttpObjectStore, MemoryObjectStore, ObjectStore};
use utils::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let config = Arc::new(Config::load()?);
    let _logging_guards = init_logging(&config.log_level);

    let http = reqwest::Client::builder()
        .user_agent(concat!("picstudio/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let model = Arc::new(GeminiClient::new(
        http.clone(),
        &config.gemini_base_url,
        &config.gemini_api_key,
        config.generation_max_attempts,
        config.generation_backoff_base,
    ));
    let embedder = Arc::new(GeminiEmbedder::new(
        http.clone(),
        &config.gemini_base_url,
        &config.gemini_api_key,
        &config.embedding_model,
    ));

    let store: Arc<dyn ObjectStore> = if config.storage_base_url.trim().is_empty() {
        info!("No object storage configured; using in-process store");
        Arc::new(MemoryObjectStore::new())
    } else {
        Arc::new(HttpObjectStore::new(
            http.clone(),
            &config.storage_base_url,
            &config.storage_api_key,
        ))
    };

    let db = Database::init(&config.database_url).await?;
    let ledger = CreditLedger::new(db.clone());

    let state = AppState {
        config: config.clone(),
        db,
        http,
        store,
        model,
        embedder,
        ledger,
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!("Listening on {}", config.bind_address);
    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install shutdown handler: {err}");
        return;
    }
    info!("Shutdown signal received");
}
