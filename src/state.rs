use std::sync::Arc;

use crate::config::Config;
use crate::credits::CreditLedger;
use crate::db::database::Database;
use crate::llm::embeddings::TextEmbedder;
use crate::llm::gemini::ImageModel;
use crate::storage::ObjectStore;

/// Shared handles for request handlers. Every provider sits behind a trait
/// object so tests can substitute scripted implementations.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub http: reqwest::Client,
    pub store: Arc<dyn ObjectStore>,
    pub model: Arc<dyn ImageModel>,
    pub embedder: Arc<dyn TextEmbedder>,
    pub ledger: CreditLedger,
}
