use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use url::Url;

/// Provider errors, classified once at the boundary so callers can decide
/// what is retryable. Invalid-argument rejections are never retried here;
/// the reference assembler owns the shrink-and-retry for those.
#[derive(Debug, thiserror::Error)]
pub enum GeminiError {
    #[error("model temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("model rejected the request: {0}")]
    InvalidArgument(String),
    #[error("model returned no image")]
    NoImage,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One part of a multimodal request, in the order it will be sent.
#[derive(Debug, Clone)]
pub enum RequestPart {
    Text(String),
    InlineImage { mime_type: String, data: Vec<u8> },
    FileRef { uri: String },
}

impl RequestPart {
    fn to_value(&self) -> Value {
        match self {
            RequestPart::Text(text) => json!({ "text": text }),
            RequestPart::InlineImage { mime_type, data } => json!({
                "inlineData": {
                    "mimeType": mime_type,
                    "data": general_purpose::STANDARD.encode(data),
                }
            }),
            RequestPart::FileRef { uri } => json!({ "fileData": { "fileUri": uri } }),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImageOptions {
    pub aspect_ratio: Option<String>,
    pub image_size: Option<String>,
}

impl ImageOptions {
    fn to_image_config(&self) -> Option<Value> {
        let mut map = Map::new();
        if let Some(aspect_ratio) = self.aspect_ratio.as_deref() {
            let trimmed = aspect_ratio.trim();
            if !trimmed.is_empty() {
                map.insert("aspectRatio".to_string(), json!(trimmed));
            }
        }
        if let Some(image_size) = self.image_size.as_deref() {
            let trimmed = image_size.trim();
            if !trimmed.is_empty() {
                map.insert("imageSize".to_string(), json!(trimmed));
            }
        }
        if map.is_empty() {
            None
        } else {
            Some(Value::Object(map))
        }
    }
}

/// Multimodal capability seam. The production impl is [`GeminiClient`];
/// tests substitute scripted providers.
#[async_trait]
pub trait ImageModel: Send + Sync {
    /// Generates image bytes from a multi-part prompt.
    async fn generate_image(
        &self,
        model: &str,
        parts: &[RequestPart],
        options: &ImageOptions,
    ) -> Result<Vec<u8>, GeminiError>;

    /// Runs a multimodal call constrained to a JSON text response.
    async fn generate_json(&self, model: &str, parts: &[RequestPart])
        -> Result<String, GeminiError>;

    /// Stages bytes through the provider's file API, returning a reference
    /// URI. Callers fall back to inline parts when this fails.
    async fn stage_file(
        &self,
        display_name: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiInlineData,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiFileInfo {
    name: String,
    uri: String,
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiFileResponse {
    file: GeminiFileInfo,
}

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn summarize_error_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response body".to_string();
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(message) = value.pointer("/error/message").and_then(|v| v.as_str()) {
            return message.to_string();
        }
        return truncate_for_log(&value.to_string(), 2000);
    }
    truncate_for_log(trimmed, 2000)
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    max_attempts: usize,
    backoff_base: f64,
}

impl GeminiClient {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        api_key: &str,
        max_attempts: usize,
        backoff_base: f64,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            max_attempts: max_attempts.max(1),
            backoff_base,
        }
    }

    fn backoff_delay(&self, attempt: usize) -> Duration {
        Duration::from_secs_f64(self.backoff_base.powi(attempt as i32))
    }

    fn redact_api_key(&self, text: &str) -> String {
        let key = self.api_key.trim();
        if key.is_empty() {
            return text.to_string();
        }
        text.replace(key, "[redacted]")
    }

    async fn call_generate_content(
        &self,
        model: &str,
        payload: Value,
    ) -> Result<GeminiResponse, GeminiError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, model
        );

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let response = match self
                .http
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .timeout(Duration::from_secs(90))
                .json(&payload)
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    let transient = err.is_timeout() || err.is_connect();
                    let err_text = self.redact_api_key(&err.to_string());
                    let should_retry = transient && attempt < self.max_attempts;
                    warn!(
                        "Gemini request failed to send: {err_text} (timeout={}, connect={}, retrying={should_retry})",
                        err.is_timeout(),
                        err.is_connect()
                    );
                    if should_retry {
                        tokio::time::sleep(self.backoff_delay(attempt)).await;
                        continue;
                    }
                    if transient {
                        return Err(GeminiError::Unavailable(err_text));
                    }
                    return Err(GeminiError::Other(anyhow!(
                        "Gemini request failed: {err_text}"
                    )));
                }
            };

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let detail = summarize_error_body(&body);

                if status == StatusCode::BAD_REQUEST {
                    return Err(GeminiError::InvalidArgument(detail));
                }

                let should_retry = is_retryable_status(status) && attempt < self.max_attempts;
                warn!(
                    "Gemini API error: status={status}, detail={}, retrying={should_retry}",
                    truncate_for_log(&detail, 400)
                );
                if should_retry {
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                    continue;
                }
                if is_retryable_status(status) {
                    return Err(GeminiError::Unavailable(detail));
                }
                return Err(GeminiError::Other(anyhow!(
                    "Gemini request failed with status {status}: {detail}"
                )));
            }

            let decoded = response
                .json::<GeminiResponse>()
                .await
                .map_err(|err| GeminiError::Other(anyhow!("undecodable Gemini response: {err}")))?;
            debug!(target: "picstudio.gemini", model = model, attempt = attempt, "generateContent ok");
            return Ok(decoded);
        }
    }

    async fn get_file_metadata(&self, name: &str) -> Result<GeminiFileInfo> {
        let name = name.trim().strip_prefix("files/").unwrap_or(name.trim());
        let response = self
            .http
            .get(format!("{}/v1beta/files/{}", self.base_url, name))
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "file metadata fetch failed with status {status}: {}",
                summarize_error_body(&body)
            ));
        }
        Ok(response.json::<GeminiFileResponse>().await?.file)
    }

    async fn wait_for_file_active(&self, file: GeminiFileInfo) -> Result<GeminiFileInfo> {
        let name = file.name.clone();
        let mut latest = file;
        for _ in 0..15 {
            match latest.state.as_deref().unwrap_or("PROCESSING") {
                "ACTIVE" => return Ok(latest),
                "FAILED" => return Err(anyhow!("file processing failed for {}", latest.uri)),
                _ => {}
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
            latest = self.get_file_metadata(&name).await?;
        }
        Err(anyhow!("timed out waiting for file processing for {name}"))
    }
}

fn extract_text(response: GeminiResponse) -> String {
    let mut text_parts = Vec::new();
    for candidate in response.candidates.unwrap_or_default() {
        if let Some(content) = candidate.content {
            if let Some(parts) = content.parts {
                for part in parts {
                    if let GeminiPart::Text { text } = part {
                        if !text.trim().is_empty() {
                            text_parts.push(text);
                        }
                    }
                }
            }
        }
    }
    text_parts.join("\n")
}

fn extract_first_image(response: GeminiResponse) -> Option<Vec<u8>> {
    for candidate in response.candidates.unwrap_or_default() {
        if let Some(content) = candidate.content {
            if let Some(parts) = content.parts {
                for part in parts {
                    if let GeminiPart::InlineData { inline_data } = part {
                        if inline_data.mime_type.starts_with("image/") {
                            if let Ok(bytes) = general_purpose::STANDARD.decode(inline_data.data) {
                                return Some(bytes);
                            }
                        }
                    }
                }
            }
        }
    }
    None
}

#[async_trait]
impl ImageModel for GeminiClient {
    async fn generate_image(
        &self,
        model: &str,
        parts: &[RequestPart],
        options: &ImageOptions,
    ) -> Result<Vec<u8>, GeminiError> {
        let mut generation_config = json!({ "responseModalities": ["TEXT", "IMAGE"] });
        if let Some(image_config) = options.to_image_config() {
            if let Some(object) = generation_config.as_object_mut() {
                object.insert("imageConfig".to_string(), image_config);
            }
        }

        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": parts.iter().map(RequestPart::to_value).collect::<Vec<_>>(),
            }],
            "generationConfig": generation_config,
        });

        let response = self.call_generate_content(model, payload).await?;
        extract_first_image(response).ok_or(GeminiError::NoImage)
    }

    async fn generate_json(
        &self,
        model: &str,
        parts: &[RequestPart],
    ) -> Result<String, GeminiError> {
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": parts.iter().map(RequestPart::to_value).collect::<Vec<_>>(),
            }],
            "generationConfig": { "responseMimeType": "application/json" },
        });

        let response = self.call_generate_content(model, payload).await?;
        let text = extract_text(response);
        if text.trim().is_empty() {
            return Err(GeminiError::Other(anyhow!(
                "model returned no text for a JSON request"
            )));
        }
        Ok(text)
    }

    async fn stage_file(
        &self,
        display_name: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<String> {
        let start_response = self
            .http
            .post(format!("{}/upload/v1beta/files", self.base_url))
            .header("x-goog-api-key", &self.api_key)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", bytes.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&json!({ "file": { "display_name": display_name } }))
            .send()
            .await?;

        if !start_response.status().is_success() {
            let status = start_response.status();
            let body = start_response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "file upload start failed with status {status}: {}",
                summarize_error_body(&body)
            ));
        }

        let upload_url = start_response
            .headers()
            .get("x-goog-upload-url")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| anyhow!("file upload did not return an upload URL"))
            .and_then(|raw| {
                Url::parse(raw).map_err(|err| anyhow!("malformed upload URL from provider: {err}"))
            })?;

        let finalize_response = self
            .http
            .post(upload_url)
            .header("X-Goog-Upload-Command", "upload, finalize")
            .header("X-Goog-Upload-Offset", "0")
            .header("Content-Length", bytes.len().to_string())
            .body(bytes.to_vec())
            .send()
            .await?;

        if !finalize_response.status().is_success() {
            let status = finalize_response.status();
            let body = finalize_response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "file upload failed with status {status}: {}",
                summarize_error_body(&body)
            ));
        }

        let info = finalize_response.json::<GeminiFileResponse>().await?.file;
        let info = self.wait_for_file_active(info).await?;
        if !info.uri.trim().is_empty() {
            return Ok(info.uri);
        }
        if !info.name.trim().is_empty() {
            return Ok(format!(
                "{}/files/{}",
                self.base_url,
                info.name.trim_start_matches("files/")
            ));
        }
        Err(anyhow!("file upload response missing uri and name"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_summary_prefers_nested_message() {
        let body = r#"{"error":{"code":400,"message":"Invalid argument: too many images"}}"#;
        assert_eq!(
            summarize_error_body(body),
            "Invalid argument: too many images"
        );
        assert_eq!(summarize_error_body("   "), "empty response body");
    }

    #[test]
    fn image_options_serialize_only_set_fields() {
        let options = ImageOptions {
            aspect_ratio: Some("16:9".to_string()),
            image_size: None,
        };
        let config = options.to_image_config().unwrap();
        assert_eq!(config, json!({ "aspectRatio": "16:9" }));
        assert!(ImageOptions::default().to_image_config().is_none());
    }

    #[test]
    fn decodes_inline_image_parts() {
        let encoded = general_purpose::STANDARD.encode([1u8, 2, 3]);
        let raw = format!(
            r#"{{"candidates":[{{"content":{{"parts":[
                {{"text":"ok"}},
                {{"inlineData":{{"mimeType":"image/png","data":"{encoded}"}}}}
            ]}}}}]}}"#
        );
        let response: GeminiResponse = serde_json::from_str(&raw).unwrap();
        assert_eq!(extract_first_image(response), Some(vec![1, 2, 3]));
    }

    #[test]
    fn text_extraction_joins_non_empty_parts() {
        let raw = r#"{"candidates":[{"content":{"parts":[
            {"text":"a"}, {"text":"  "}, {"text":"b"}
        ]}}]}"#;
        let response: GeminiResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(extract_text(response), "a\nb");
    }
}
