use std::env;

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub log_level: String,
    pub database_url: String,
    pub gemini_api_key: String,
    pub gemini_base_url: String,
    pub analysis_model: String,
    pub rerank_model: String,
    pub image_model: String,
    pub embedding_model: String,
    pub embedding_batch_size: usize,
    pub rerank_batch_size: usize,
    pub rerank_candidate_pool: usize,
    pub references_per_folder: usize,
    pub max_reference_images: usize,
    pub reference_longest_side: u32,
    pub generation_max_attempts: usize,
    pub generation_backoff_base: f64,
    pub analysis_concurrency: usize,
    pub download_timeout_secs: u64,
    pub storage_base_url: String,
    pub storage_api_key: String,
    pub dataset_bucket: String,
    pub generated_bucket: String,
    pub auth_verify_url: String,
    pub generation_credit_cost: i64,
    pub analysis_credit_cost: i64,
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .unwrap_or(default)
}

fn normalize_database_url(value: String) -> String {
    if value.starts_with("sqlite+aiosqlite://") {
        return value.replacen("sqlite+aiosqlite://", "sqlite://", 1);
    }
    value
}

impl Config {
    pub fn load() -> Result<Self> {
        let gemini_api_key = env_string("GEMINI_API_KEY", "");
        if gemini_api_key.trim().is_empty() {
            return Err(anyhow::anyhow!("GEMINI_API_KEY is required"));
        }

        Ok(Config {
            bind_address: env_string("BIND_ADDRESS", "0.0.0.0:8080"),
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            database_url: normalize_database_url(env_string(
                "DATABASE_URL",
                "sqlite://picstudio.db?mode=rwc",
            )),
            gemini_api_key,
            gemini_base_url: env_string(
                "GEMINI_BASE_URL",
                "https://generativelanguage.googleapis.com",
            ),
            analysis_model: env_string("ANALYSIS_MODEL", "gemini-3-flash-preview"),
            rerank_model: env_string("RERANK_MODEL", "gemini-3-flash-preview"),
            image_model: env_string("IMAGE_MODEL", "gemini-3-pro-image-preview"),
            embedding_model: env_string("EMBEDDING_MODEL", "gemini-embedding-001"),
            embedding_batch_size: env_usize("EMBEDDING_BATCH_SIZE", 200),
            rerank_batch_size: env_usize("RERANK_BATCH_SIZE", 8),
            rerank_candidate_pool: env_usize("RERANK_CANDIDATE_POOL", 12),
            references_per_folder: env_usize("REFERENCES_PER_FOLDER", 6),
            max_reference_images: env_usize("MAX_REFERENCE_IMAGES", 14),
            reference_longest_side: env_u32("REFERENCE_LONGEST_SIDE", 1024),
            generation_max_attempts: env_usize("GENERATION_MAX_ATTEMPTS", 3),
            generation_backoff_base: env_f64("GENERATION_BACKOFF_BASE", 2.0),
            analysis_concurrency: env_usize("ANALYSIS_CONCURRENCY", 10),
            download_timeout_secs: env_u64("DOWNLOAD_TIMEOUT_SECS", 10),
            storage_base_url: env_string("STORAGE_BASE_URL", ""),
            storage_api_key: env_string("STORAGE_API_KEY", ""),
            dataset_bucket: env_string("DATASET_BUCKET", "dataset-images"),
            generated_bucket: env_string("GENERATED_BUCKET", "generated-images"),
            auth_verify_url: env_string("AUTH_VERIFY_URL", ""),
            generation_credit_cost: env_i64("GENERATION_CREDIT_COST", 5),
            analysis_credit_cost: env_i64("ANALYSIS_CREDIT_COST", 1),
        })
    }
}
