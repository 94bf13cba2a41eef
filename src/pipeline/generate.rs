use std::collections::HashSet;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::database::GeneratedImageInsert;
use crate::db::models::{DatasetRow, GeneratedImageRow};
use crate::error::ApiError;
use crate::llm::gemini::ImageOptions;
use crate::pipeline::assembler::{self, PromptBuilder};
use crate::pipeline::mentions::{EnvironmentRef, FolderRef, MentionResolver};
use crate::pipeline::{ranker, rerank};
use crate::state::AppState;

const DEFAULT_ASPECT_RATIO: &str = "1:1";
const DEFAULT_RESOLUTION: &str = "1K";
const DEFAULT_QUALITY: &str = "standard";
const DEFAULT_FORMAT: &str = "png";

const GROUNDING_INSTRUCTION: &str = "Use the attached reference images as the \
visual ground truth for products, people and places mentioned in the request. \
Match their appearance faithfully; do not invent substitutes.";

#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    pub style: Option<String>,
    pub image_style: Option<String>,
    pub aspect_ratio: Option<String>,
    pub resolution: Option<String>,
    pub quality: Option<String>,
    pub format: Option<String>,
    pub dataset_ids: Vec<String>,
    pub environment_id: Option<String>,
    pub max_reference_images: Option<usize>,
}

/// One reference folder after ranking, ready for prompt assembly.
struct FolderSelection {
    urls: Vec<String>,
    tags: Vec<String>,
    master_prompt: Option<String>,
}

/// Runs one generation request end to end: resolve referenced folders, rank
/// and rerank their images, assemble the multimodal request, generate,
/// upload the result, persist the record, then meter.
///
/// Resolution, ranking and per-image fetch failures degrade internally and
/// never fail the request; provider and storage failures do.
pub async fn run_generation(
    state: &AppState,
    user_id: Option<&str>,
    request: GenerationRequest,
) -> Result<GeneratedImageRow, ApiError> {
    let prompt = request.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(ApiError::BadRequest("prompt must not be empty".to_string()));
    }

    let cost = state.config.generation_credit_cost;
    if let Some(user) = user_id {
        let remaining = state
            .db
            .get_credit_balance(user)
            .await?
            .map(|balance| balance.remaining_credits)
            .unwrap_or(0);
        if remaining < cost {
            return Err(ApiError::InsufficientCredit {
                required: cost,
                remaining,
            });
        }
    }

    let resolved = resolve_folders(state, user_id, &prompt, &request.dataset_ids).await;
    let selections = select_references(state, user_id, &prompt, &resolved).await;
    let reference_cap = request
        .max_reference_images
        .unwrap_or(state.config.max_reference_images)
        .min(state.config.max_reference_images);

    let mut reference_urls: Vec<String> = Vec::new();
    let mut reference_tags: Vec<String> = Vec::new();
    let mut style_guidelines: Vec<String> = Vec::new();
    let mut seen_tags = HashSet::new();
    for selection in selections {
        for url in selection.urls {
            if reference_urls.len() < reference_cap {
                reference_urls.push(url);
            }
        }
        for tag in selection.tags {
            if seen_tags.insert(tag.to_lowercase()) {
                reference_tags.push(tag);
            }
        }
        if let Some(master_prompt) = selection.master_prompt {
            style_guidelines.push(master_prompt);
        }
    }

    let mut builder = PromptBuilder::new().user_request(prompt.clone());
    if !reference_urls.is_empty() {
        builder = builder.grounding(GROUNDING_INSTRUCTION);
    }
    if let Some(user) = user_id {
        if let Some(profile) = state.db.get_business_profile(user).await? {
            let brand: Vec<String> = [
                profile.business_name.map(|name| format!("Brand: {name}")),
                profile.vibes.map(|vibes| format!("Brand vibe: {vibes}")),
                profile.theme.map(|theme| format!("Brand theme: {theme}")),
            ]
            .into_iter()
            .flatten()
            .collect();
            if !brand.is_empty() {
                builder = builder.brand_context(brand.join("\n"));
            }
        }
    }
    if !style_guidelines.is_empty() {
        builder = builder.style_guidelines(style_guidelines.join("\n"));
    }
    if !reference_tags.is_empty() {
        builder = builder.reference_tags(format!(
            "Reference style keywords: {}",
            reference_tags.join(", ")
        ));
    }
    if let Some(style) = request.style.as_deref().or(request.image_style.as_deref()) {
        let style = style.trim();
        if !style.is_empty() {
            builder = builder.style_target(format!("Render in {style} style."));
        }
    }
    let full_prompt = builder.build();

    let timeout = Duration::from_secs(state.config.download_timeout_secs);
    let prepared = assembler::fetch_references(
        &state.http,
        &reference_urls,
        state.config.reference_longest_side,
        timeout,
    )
    .await;
    debug!(
        "Assembled {} of {} references for generation",
        prepared.len(),
        reference_urls.len()
    );
    let reference_parts = assembler::stage_references(state.model.as_ref(), prepared).await;

    let options = ImageOptions {
        aspect_ratio: Some(
            request
                .aspect_ratio
                .clone()
                .unwrap_or_else(|| DEFAULT_ASPECT_RATIO.to_string()),
        ),
        image_size: Some(
            request
                .resolution
                .clone()
                .unwrap_or_else(|| DEFAULT_RESOLUTION.to_string()),
        ),
    };
    let (image_bytes, references_sent) = assembler::submit_generation(
        state.model.as_ref(),
        &state.config.image_model,
        full_prompt.clone(),
        reference_parts,
        &options,
    )
    .await?;

    let owner_segment = user_id.unwrap_or("anonymous");
    let object_path = format!("{owner_segment}/{}.png", Uuid::new_v4());
    state
        .store
        .put(
            &state.config.generated_bucket,
            &object_path,
            image_bytes,
            "image/png",
        )
        .await
        .map_err(|err| ApiError::Storage(err.to_string()))?;
    let image_url = state
        .store
        .public_url(&state.config.generated_bucket, &object_path);

    let row = state
        .db
        .insert_generated_image(GeneratedImageInsert {
            user_id: user_id.map(str::to_string),
            prompt,
            full_prompt,
            image_url,
            dataset_id: resolved.first().cloned(),
            environment_id: request.environment_id.clone(),
            style: request.style.clone(),
            image_style: request
                .image_style
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            aspect_ratio: request
                .aspect_ratio
                .unwrap_or_else(|| DEFAULT_ASPECT_RATIO.to_string()),
            quality: request.quality.unwrap_or_else(|| DEFAULT_QUALITY.to_string()),
            format: request.format.unwrap_or_else(|| DEFAULT_FORMAT.to_string()),
            resolution: request
                .resolution
                .unwrap_or_else(|| DEFAULT_RESOLUTION.to_string()),
            reference_images_count: references_sent as i64,
        })
        .await?;
    info!(
        "Generated image {} with {references_sent} references",
        row.id
    );

    // The expensive work already succeeded; a metering hiccup must not
    // discard the result.
    if let Some(user) = user_id {
        let metadata = json!({ "generated_image_id": row.id }).to_string();
        state
            .ledger
            .debit_or_log(user, cost, "generation", Some(&metadata))
            .await;
    }

    Ok(row)
}

/// Resolves prompt mentions plus explicit identifiers into folder ids.
/// Lookup failures degrade to the explicit list; anonymous users have no
/// folders to match against.
async fn resolve_folders(
    state: &AppState,
    user_id: Option<&str>,
    prompt: &str,
    explicit_ids: &[String],
) -> Vec<String> {
    let (environments, folders) = match user_id {
        Some(user) => {
            let environments = match state.db.list_environments(user).await {
                Ok(rows) => rows
                    .into_iter()
                    .map(|row| EnvironmentRef {
                        id: row.id,
                        name: row.name,
                    })
                    .collect(),
                Err(err) => {
                    debug!("Environment lookup failed, resolving explicit ids only: {err:#}");
                    Vec::new()
                }
            };
            let folders = match state.db.list_datasets_for_user(user).await {
                Ok(rows) => rows
                    .into_iter()
                    .map(|row| FolderRef {
                        id: row.id,
                        name: row.name,
                        environment_id: row.environment_id,
                    })
                    .collect(),
                Err(err) => {
                    debug!("Folder lookup failed, resolving explicit ids only: {err:#}");
                    Vec::new()
                }
            };
            (environments, folders)
        }
        None => (Vec::new(), Vec::new()),
    };

    MentionResolver::default().resolve(prompt, explicit_ids, &environments, &folders)
}

/// Ranks each resolved folder's images against the prompt and keeps a
/// per-folder shortlist. Folders that do not exist or belong to someone
/// else are skipped.
async fn select_references(
    state: &AppState,
    user_id: Option<&str>,
    prompt: &str,
    folder_ids: &[String],
) -> Vec<FolderSelection> {
    let timeout = Duration::from_secs(state.config.download_timeout_secs);
    let mut selections = Vec::with_capacity(folder_ids.len());
    for folder_id in folder_ids {
        let dataset = match state.db.get_dataset(folder_id).await {
            Ok(Some(dataset)) => dataset,
            Ok(None) => {
                debug!("Referenced folder {folder_id} does not exist");
                continue;
            }
            Err(err) => {
                debug!("Skipping folder {folder_id}: {err:#}");
                continue;
            }
        };
        if !accessible(&dataset, user_id) {
            debug!("Referenced folder {folder_id} is not accessible to this user");
            continue;
        }

        let images = match state.db.list_dataset_images(folder_id).await {
            Ok(images) => images,
            Err(err) => {
                debug!("Could not list images of {folder_id}: {err:#}");
                continue;
            }
        };
        if images.is_empty() {
            continue;
        }

        let ranked = ranker::rank_images(
            state.embedder.as_ref(),
            prompt,
            images,
            state.config.rerank_candidate_pool,
            state.config.embedding_batch_size,
        )
        .await;
        let shortlist = rerank::rerank_images(
            state.model.as_ref(),
            &state.http,
            &state.config.rerank_model,
            prompt,
            ranked,
            state.config.references_per_folder,
            state.config.rerank_batch_size,
            timeout,
        )
        .await;

        let mut tags = Vec::new();
        let mut urls = Vec::with_capacity(shortlist.len());
        for image in shortlist {
            if let Some(analysis) = image.analysis() {
                tags.extend(analysis.tags);
            }
            urls.push(image.image_url);
        }
        selections.push(FolderSelection {
            urls,
            tags,
            master_prompt: dataset.master_prompt.clone(),
        });
    }
    selections
}

/// Anonymous folders are open; owned folders only serve their owner.
fn accessible(dataset: &DatasetRow, user_id: Option<&str>) -> bool {
    match dataset.user_id.as_deref() {
        Some(owner) => user_id == Some(owner),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::config::Config;
    use crate::credits::CreditLedger;
    use crate::db::database::Database;
    use crate::llm::embeddings::TextEmbedder;
    use crate::llm::gemini::{GeminiError, ImageModel, RequestPart};
    use crate::storage::{MemoryObjectStore, ObjectStore};

    struct HappyModel {
        generate_calls: Mutex<usize>,
    }

    #[async_trait]
    impl ImageModel for HappyModel {
        async fn generate_image(
            &self,
            _model: &str,
            _parts: &[RequestPart],
            _options: &ImageOptions,
        ) -> Result<Vec<u8>, GeminiError> {
            *self.generate_calls.lock().unwrap() += 1;
            Ok(vec![0x89, 0x50, 0x4E, 0x47])
        }

        async fn generate_json(
            &self,
            _model: &str,
            _parts: &[RequestPart],
        ) -> Result<String, GeminiError> {
            Ok(r#"{"scores":[]}"#.to_string())
        }

        async fn stage_file(
            &self,
            _display_name: &str,
            _mime_type: &str,
            _bytes: &[u8],
        ) -> anyhow::Result<String> {
            Err(anyhow::anyhow!("not staged in tests"))
        }
    }

    struct NoopEmbedder;

    #[async_trait]
    impl TextEmbedder for NoopEmbedder {
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn test_config() -> Config {
        Config {
            bind_address: "127.0.0.1:0".to_string(),
            log_level: "debug".to_string(),
            database_url: "sqlite::memory:".to_string(),
            gemini_api_key: "test-key".to_string(),
            gemini_base_url: "http://127.0.0.1:0".to_string(),
            analysis_model: "analysis".to_string(),
            rerank_model: "rerank".to_string(),
            image_model: "image".to_string(),
            embedding_model: "embedding".to_string(),
            embedding_batch_size: 200,
            rerank_batch_size: 8,
            rerank_candidate_pool: 12,
            references_per_folder: 6,
            max_reference_images: 14,
            reference_longest_side: 1024,
            generation_max_attempts: 1,
            generation_backoff_base: 1.0,
            analysis_concurrency: 2,
            download_timeout_secs: 1,
            storage_base_url: String::new(),
            storage_api_key: String::new(),
            dataset_bucket: "dataset-images".to_string(),
            generated_bucket: "generated-images".to_string(),
            auth_verify_url: String::new(),
            generation_credit_cost: 5,
            analysis_credit_cost: 1,
        }
    }

    async fn test_state(model: Arc<dyn ImageModel>) -> (AppState, Arc<MemoryObjectStore>) {
        let db = Database::init("sqlite::memory:").await.unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let state = AppState {
            config: Arc::new(test_config()),
            db: db.clone(),
            http: reqwest::Client::new(),
            store: store.clone() as Arc<dyn ObjectStore>,
            model,
            embedder: Arc::new(NoopEmbedder),
            ledger: CreditLedger::new(db),
        };
        (state, store)
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected() {
        let model = Arc::new(HappyModel {
            generate_calls: Mutex::new(0),
        });
        let (state, _) = test_state(model.clone()).await;
        let err = run_generation(&state, None, GenerationRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
        assert_eq!(*model.generate_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn insufficient_credit_short_circuits_before_the_model() {
        let model = Arc::new(HappyModel {
            generate_calls: Mutex::new(0),
        });
        let (state, _) = test_state(model.clone()).await;
        state.db.grant_credits("user-1", 3).await.unwrap();

        let request = GenerationRequest {
            prompt: "a red shoe".to_string(),
            ..GenerationRequest::default()
        };
        let err = run_generation(&state, Some("user-1"), request)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApiError::InsufficientCredit {
                required: 5,
                remaining: 3
            }
        ));
        assert_eq!(*model.generate_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn anonymous_generation_is_unmetered_and_persists_a_record() {
        let model = Arc::new(HappyModel {
            generate_calls: Mutex::new(0),
        });
        let (state, store) = test_state(model.clone()).await;

        let request = GenerationRequest {
            prompt: "a red shoe on a beach".to_string(),
            aspect_ratio: Some("16:9".to_string()),
            ..GenerationRequest::default()
        };
        let row = run_generation(&state, None, request).await.unwrap();

        assert_eq!(row.prompt, "a red shoe on a beach");
        assert_eq!(row.aspect_ratio, "16:9");
        assert_eq!(row.reference_images_count, 0);
        assert!(row.image_url.starts_with("memory://generated-images/"));
        assert_eq!(store.len(), 1);
        assert_eq!(*model.generate_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn metered_generation_debits_and_records_usage() {
        let model = Arc::new(HappyModel {
            generate_calls: Mutex::new(0),
        });
        let (state, _) = test_state(model).await;
        state.db.grant_credits("user-1", 10).await.unwrap();

        let request = GenerationRequest {
            prompt: "product shot".to_string(),
            ..GenerationRequest::default()
        };
        let row = run_generation(&state, Some("user-1"), request).await.unwrap();
        assert_eq!(row.user_id.as_deref(), Some("user-1"));

        let balance = state.db.get_credit_balance("user-1").await.unwrap().unwrap();
        assert_eq!(balance.remaining_credits, 5);
        let usage = state.db.list_usage_logs("user-1", 10, 0).await.unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].action, "generation");
    }

    #[tokio::test]
    async fn business_profile_feeds_the_brand_context_section() {
        let model = Arc::new(HappyModel {
            generate_calls: Mutex::new(0),
        });
        let (state, _) = test_state(model).await;
        state.db.grant_credits("user-1", 10).await.unwrap();
        state
            .db
            .upsert_business_profile("user-1", Some("Acme Shoes"), Some("playful"), None)
            .await
            .unwrap();

        let request = GenerationRequest {
            prompt: "a red shoe on a beach".to_string(),
            ..GenerationRequest::default()
        };
        let row = run_generation(&state, Some("user-1"), request).await.unwrap();
        assert!(row.full_prompt.contains("Brand: Acme Shoes"));
        assert!(row.full_prompt.contains("Brand vibe: playful"));
        assert!(!row.full_prompt.contains("Brand theme:"));
    }

    #[tokio::test]
    async fn foreign_folders_are_ignored_during_selection() {
        let model = Arc::new(HappyModel {
            generate_calls: Mutex::new(0),
        });
        let (state, _) = test_state(model).await;
        let foreign = state
            .db
            .create_folder(Some("someone-else"), None, "Secret")
            .await
            .unwrap();
        state
            .db
            .insert_dataset_image(&foreign.id, "memory://x/y.png", None)
            .await
            .unwrap();

        let request = GenerationRequest {
            prompt: "anything".to_string(),
            dataset_ids: vec![foreign.id.clone()],
            ..GenerationRequest::default()
        };
        let row = run_generation(&state, None, request).await.unwrap();
        assert_eq!(row.reference_images_count, 0);
    }
}
