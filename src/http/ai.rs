use std::time::Duration;

use axum::extract::{Multipart, Path, State};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::models::{AnalysisResult, DatasetRow, TrainingStatus};
use crate::error::ApiError;
use crate::http::auth::{AuthUser, MaybeAuthUser};
use crate::llm::media;
use crate::pipeline::analyze;
use crate::pipeline::generate::{run_generation, GenerationRequest};
use crate::state::AppState;

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/ai/generate", post(generate))
        .route("/ai/dataset/analyze", post(analyze_upload))
        .route("/ai/dataset/analyze-fast", post(analyze_fast))
        .route("/ai/dataset/{id}/images", get(dataset_images))
        .route("/ai/dataset/{id}/training-status", patch(training_status))
}

fn dataset_visible(dataset: &DatasetRow, user_id: Option<&str>) -> bool {
    match dataset.user_id.as_deref() {
        Some(owner) => user_id == Some(owner),
        None => true,
    }
}

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        _ => "img",
    }
}

// -- /ai/generate --

#[derive(Debug, Deserialize)]
struct GenerateBody {
    prompt: String,
    #[serde(default)]
    style: Option<String>,
    #[serde(default)]
    image_style: Option<String>,
    #[serde(default)]
    aspect_ratio: Option<String>,
    #[serde(default)]
    resolution: Option<String>,
    #[serde(default)]
    quality: Option<String>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    dataset_id: Option<String>,
    #[serde(default)]
    folder_id: Option<String>,
    #[serde(default)]
    dataset_ids: Vec<String>,
    #[serde(default)]
    environment_id: Option<String>,
    #[serde(default)]
    max_reference_images: Option<usize>,
}

async fn generate(
    State(state): State<AppState>,
    user: MaybeAuthUser,
    Json(body): Json<GenerateBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut dataset_ids = body.dataset_ids;
    for extra in [body.dataset_id, body.folder_id].into_iter().flatten() {
        if !dataset_ids.contains(&extra) {
            dataset_ids.push(extra);
        }
    }

    let request = GenerationRequest {
        prompt: body.prompt,
        style: body.style,
        image_style: body.image_style,
        aspect_ratio: body.aspect_ratio,
        resolution: body.resolution,
        quality: body.quality,
        format: body.format,
        dataset_ids,
        environment_id: body.environment_id,
        max_reference_images: body.max_reference_images,
    };
    let row = run_generation(&state, user.id(), request).await?;
    Ok(Json(json!({
        "id": row.id,
        "image_url": row.image_url,
        "prompt": row.prompt,
        "full_prompt": row.full_prompt,
        "aspect_ratio": row.aspect_ratio,
        "resolution": row.resolution,
        "format": row.format,
        "reference_images_count": row.reference_images_count,
        "created_at": row.created_at,
    })))
}

// -- /ai/dataset/analyze --

#[derive(Debug, Serialize)]
struct AnalyzedImage {
    id: String,
    image_url: String,
    /// `None` means the image was never analyzed, as opposed to an analysis
    /// that produced an empty document.
    analysis: Option<AnalysisResult>,
}

#[derive(Debug, Serialize)]
struct AnalyzeResponse {
    dataset_id: String,
    images: Vec<AnalyzedImage>,
}

/// Multipart upload: any number of image file parts plus an optional
/// `dataset_id` text part. Each image is stored, analyzed and attached to
/// the dataset; a failed analysis still stores the image with an empty
/// document.
async fn analyze_upload(
    State(state): State<AppState>,
    user: MaybeAuthUser,
    mut multipart: Multipart,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let mut dataset_id: Option<String> = None;
    let mut files: Vec<Vec<u8>> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(format!("malformed multipart body: {err}")))?
    {
        match field.name() {
            Some("dataset_id") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| ApiError::BadRequest(err.to_string()))?;
                if !value.trim().is_empty() {
                    dataset_id = Some(value.trim().to_string());
                }
            }
            _ => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::BadRequest(err.to_string()))?;
                if !bytes.is_empty() {
                    files.push(bytes.to_vec());
                }
            }
        }
    }

    if files.is_empty() {
        return Err(ApiError::BadRequest("no image files in upload".to_string()));
    }

    let dataset_id = dataset_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    state.db.ensure_dataset(&dataset_id, user.id()).await?;

    // One broken file must not sink the rest of the batch.
    let mut images = Vec::with_capacity(files.len());
    for bytes in files {
        match store_and_analyze(&state, &dataset_id, bytes).await {
            Ok(image) => images.push(image),
            Err(err) => warn!("Skipping one uploaded file: {err:#}"),
        }
    }

    if let Some(user_id) = user.id() {
        let cost = state.config.analysis_credit_cost * images.len() as i64;
        let metadata = json!({ "dataset_id": dataset_id, "images": images.len() }).to_string();
        state
            .ledger
            .debit_or_log(user_id, cost, "analysis", Some(&metadata))
            .await;
    }
    info!("Analyzed {} uploaded image(s) into dataset {dataset_id}", images.len());

    Ok(Json(AnalyzeResponse { dataset_id, images }))
}

async fn store_and_analyze(
    state: &AppState,
    dataset_id: &str,
    bytes: Vec<u8>,
) -> anyhow::Result<AnalyzedImage> {
    let mime = media::detect_mime_type(&bytes).unwrap_or_else(|| "image/jpeg".to_string());
    let path = format!("{dataset_id}/{}.{}", Uuid::new_v4(), extension_for(&mime));
    state
        .store
        .put(&state.config.dataset_bucket, &path, bytes.clone(), &mime)
        .await?;
    let image_url = state.store.public_url(&state.config.dataset_bucket, &path);

    let analysis =
        analyze::analyze_image_bytes(state.model.as_ref(), &state.config.analysis_model, &bytes)
            .await;
    let analysis_json = serde_json::to_string(&analysis)?;
    let row = state
        .db
        .insert_dataset_image(dataset_id, &image_url, Some(&analysis_json))
        .await?;
    Ok(AnalyzedImage {
        id: row.id,
        image_url: row.image_url,
        analysis: Some(analysis),
    })
}

// -- /ai/dataset/analyze-fast --

#[derive(Debug, Deserialize)]
struct AnalyzeFastBody {
    #[serde(default)]
    dataset_id: Option<String>,
    image_urls: Vec<String>,
}

/// Analyzes already-stored images by URL with bounded concurrency.
async fn analyze_fast(
    State(state): State<AppState>,
    user: MaybeAuthUser,
    Json(body): Json<AnalyzeFastBody>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    if body.image_urls.is_empty() {
        return Err(ApiError::BadRequest("image_urls must not be empty".to_string()));
    }

    let dataset_id = body
        .dataset_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    state.db.ensure_dataset(&dataset_id, user.id()).await?;

    let results = analyze::analyze_urls(
        state.model.clone(),
        state.http.clone(),
        state.config.analysis_model.clone(),
        body.image_urls.clone(),
        state.config.analysis_concurrency,
        Duration::from_secs(state.config.download_timeout_secs),
    )
    .await;

    let mut images = Vec::with_capacity(results.len());
    for (image_url, analysis) in body.image_urls.into_iter().zip(results) {
        let analysis_json = serde_json::to_string(&analysis).map_err(anyhow::Error::from)?;
        let row = state
            .db
            .insert_dataset_image(&dataset_id, &image_url, Some(&analysis_json))
            .await?;
        images.push(AnalyzedImage {
            id: row.id,
            image_url: row.image_url,
            analysis: Some(analysis),
        });
    }

    if let Some(user_id) = user.id() {
        let cost = state.config.analysis_credit_cost * images.len() as i64;
        let metadata = json!({ "dataset_id": dataset_id, "images": images.len() }).to_string();
        state
            .ledger
            .debit_or_log(user_id, cost, "analysis", Some(&metadata))
            .await;
    }

    Ok(Json(AnalyzeResponse { dataset_id, images }))
}

// -- /ai/dataset/{id}/images --

async fn dataset_images(
    State(state): State<AppState>,
    user: MaybeAuthUser,
    Path(dataset_id): Path<String>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let dataset = state
        .db
        .get_dataset(&dataset_id)
        .await?
        .filter(|dataset| dataset_visible(dataset, user.id()))
        .ok_or_else(|| ApiError::NotFound(format!("dataset {dataset_id} not found")))?;

    let images = state
        .db
        .list_dataset_images(&dataset.id)
        .await?
        .into_iter()
        .map(|row| AnalyzedImage {
            analysis: row.analysis(),
            id: row.id,
            image_url: row.image_url,
        })
        .collect();

    Ok(Json(AnalyzeResponse {
        dataset_id: dataset.id,
        images,
    }))
}

// -- /ai/dataset/{id}/training-status --

#[derive(Debug, Deserialize)]
struct TrainingStatusBody {
    training_status: String,
}

async fn training_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(dataset_id): Path<String>,
    Json(body): Json<TrainingStatusBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = TrainingStatus::parse(&body.training_status).ok_or_else(|| {
        ApiError::BadRequest(format!(
            "invalid training status {:?}; expected trained or not_trained",
            body.training_status
        ))
    })?;

    let dataset = state
        .db
        .get_dataset(&dataset_id)
        .await?
        .filter(|dataset| dataset.user_id.as_deref() == Some(user.id.as_str()))
        .ok_or_else(|| ApiError::NotFound(format!("dataset {dataset_id} not found")))?;

    state.db.set_training_status(&dataset.id, status).await?;
    Ok(Json(json!({
        "id": dataset.id,
        "training_status": status.as_str(),
    })))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::extract::FromRequest;
    use axum::http::Request;

    use super::*;
    use crate::config::Config;
    use crate::credits::CreditLedger;
    use crate::db::database::Database;
    use crate::llm::embeddings::TextEmbedder;
    use crate::llm::gemini::{GeminiError, ImageModel, ImageOptions, RequestPart};
    use crate::storage::{MemoryObjectStore, ObjectStore};

    struct ScriptedAnalyzer;

    #[async_trait]
    impl ImageModel for ScriptedAnalyzer {
        async fn generate_image(
            &self,
            _model: &str,
            _parts: &[RequestPart],
            _options: &ImageOptions,
        ) -> Result<Vec<u8>, GeminiError> {
            Err(GeminiError::NoImage)
        }

        async fn generate_json(
            &self,
            _model: &str,
            _parts: &[RequestPart],
        ) -> Result<String, GeminiError> {
            Ok(r#"{"description": "a red shoe"}"#.to_string())
        }

        async fn stage_file(
            &self,
            _display_name: &str,
            _mime_type: &str,
            _bytes: &[u8],
        ) -> anyhow::Result<String> {
            Err(anyhow::anyhow!("unused"))
        }
    }

    struct UnusedEmbedder;

    #[async_trait]
    impl TextEmbedder for UnusedEmbedder {
        async fn embed(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Err(anyhow::anyhow!("unused"))
        }
    }

    /// Rejects the first put and accepts everything after it.
    struct FlakyStore {
        inner: MemoryObjectStore,
        fail_next: Mutex<bool>,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemoryObjectStore::new(),
                fail_next: Mutex::new(true),
            }
        }
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn put(
            &self,
            bucket: &str,
            path: &str,
            bytes: Vec<u8>,
            content_type: &str,
        ) -> anyhow::Result<()> {
            {
                let mut fail_next = self
                    .fail_next
                    .lock()
                    .map_err(|_| anyhow::anyhow!("poisoned"))?;
                if *fail_next {
                    *fail_next = false;
                    return Err(anyhow::anyhow!("storage offline"));
                }
            }
            self.inner.put(bucket, path, bytes, content_type).await
        }

        fn public_url(&self, bucket: &str, path: &str) -> String {
            self.inner.public_url(bucket, path)
        }

        async fn delete(&self, bucket: &str, paths: &[String]) -> anyhow::Result<()> {
            self.inner.delete(bucket, paths).await
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

    async fn test_state(store: Arc<dyn ObjectStore>) -> AppState {
        let db = Database::init("sqlite::memory:").await.unwrap();
        AppState {
            config: Arc::new(test_config()),
            db: db.clone(),
            http: reqwest::Client::new(),
            store,
            model: Arc::new(ScriptedAnalyzer),
            embedder: Arc::new(UnusedEmbedder),
            ledger: CreditLedger::new(db),
        }
    }

    const BOUNDARY: &str = "upload-test-boundary";

    async fn multipart_with_files(files: &[&[u8]]) -> Multipart {
        let mut body = Vec::new();
        for (k, bytes) in files.iter().enumerate() {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; \
                     name=\"file\"; filename=\"{k}.png\"\r\n\
                     Content-Type: image/png\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        let request = Request::builder()
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();
        Multipart::from_request(request, &()).await.unwrap()
    }

    #[tokio::test]
    async fn upload_skips_files_the_store_rejects() {
        let state = test_state(Arc::new(FlakyStore::new())).await;
        let multipart = multipart_with_files(&[b"first", b"second"]).await;

        let Json(response) = analyze_upload(State(state.clone()), MaybeAuthUser(None), multipart)
            .await
            .unwrap();
        assert_eq!(response.images.len(), 1);

        let rows = state
            .db
            .list_dataset_images(&response.dataset_id)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn image_listing_distinguishes_unanalyzed_rows() {
        let state = test_state(Arc::new(MemoryObjectStore::new())).await;
        let folder = state.db.create_folder(None, None, "Open").await.unwrap();
        state
            .db
            .insert_dataset_image(
                &folder.id,
                "https://cdn/analyzed.png",
                Some(r#"{"description": "a red shoe"}"#),
            )
            .await
            .unwrap();
        state
            .db
            .insert_dataset_image(&folder.id, "https://cdn/raw.png", None)
            .await
            .unwrap();

        let Json(response) =
            dataset_images(State(state), MaybeAuthUser(None), Path(folder.id))
                .await
                .unwrap();
        let analyzed: HashMap<&str, bool> = response
            .images
            .iter()
            .map(|image| (image.image_url.as_str(), image.analysis.is_some()))
            .collect();
        assert!(analyzed["https://cdn/analyzed.png"]);
        assert!(!analyzed["https://cdn/raw.png"]);

        let raw = response
            .images
            .iter()
            .find(|image| image.image_url.ends_with("raw.png"))
            .unwrap();
        let value = serde_json::to_value(raw).unwrap();
        assert!(value["analysis"].is_null());
    }

    #[tokio::test]
    async fn training_status_update_uses_the_documented_field() {
        let body: TrainingStatusBody =
            serde_json::from_str(r#"{"training_status": "trained"}"#).unwrap();
        let state = test_state(Arc::new(MemoryObjectStore::new())).await;
        let folder = state
            .db
            .create_folder(Some("user-1"), None, "Mine")
            .await
            .unwrap();

        training_status(
            State(state.clone()),
            AuthUser {
                id: "user-1".to_string(),
            },
            Path(folder.id.clone()),
            Json(body),
        )
        .await
        .unwrap();
        let updated = state.db.get_dataset(&folder.id).await.unwrap().unwrap();
        assert_eq!(updated.training_status, "trained");
    }
}
