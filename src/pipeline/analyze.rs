use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::warn;

use crate::db::models::AnalysisResult;
use crate::llm::gemini::{ImageModel, RequestPart};
use crate::llm::media;

const ANALYSIS_INSTRUCTION: &str = "Analyze this reference image for an image \
generation catalog. Respond with JSON only, exactly this shape (every key \
optional, omit what you cannot tell):\n\
{\"description\": \"one sentence\", \"tags\": [\"short keyword\"], \
\"lighting\": \"...\", \"colors\": \"...\", \"vibe\": \"...\", \
\"theme\": \"...\", \"image_style\": \"photo|illustration|render|other\", \
\"key_elements\": [\"notable object\"]}";

/// Runs vision analysis over one image. Never fails: an undecodable or
/// refused response yields an empty document, which callers persist so the
/// upload itself still succeeds.
pub async fn analyze_image_bytes(
    model: &dyn ImageModel,
    analysis_model: &str,
    bytes: &[u8],
) -> AnalysisResult {
    let mime_type = media::detect_mime_type(bytes).unwrap_or_else(|| "image/jpeg".to_string());
    let parts = [
        RequestPart::Text(ANALYSIS_INSTRUCTION.to_string()),
        RequestPart::InlineImage {
            mime_type,
            data: bytes.to_vec(),
        },
    ];

    match model.generate_json(analysis_model, &parts).await {
        Ok(raw) => parse_analysis(&raw),
        Err(err) => {
            warn!("Image analysis failed, storing empty document: {err}");
            AnalysisResult::default()
        }
    }
}

/// Analyzes a batch of already-stored images by URL with bounded
/// concurrency. Results come back in input order; an image that cannot be
/// downloaded gets an empty document.
pub async fn analyze_urls(
    model: Arc<dyn ImageModel>,
    http: reqwest::Client,
    analysis_model: String,
    urls: Vec<String>,
    concurrency: usize,
    download_timeout: Duration,
) -> Vec<AnalysisResult> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut handles = Vec::with_capacity(urls.len());
    for url in urls {
        let model = Arc::clone(&model);
        let http = http.clone();
        let analysis_model = analysis_model.clone();
        let semaphore = Arc::clone(&semaphore);
        handles.push(tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return AnalysisResult::default();
            };
            match media::download_image(&http, &url, download_timeout).await {
                Some(bytes) => analyze_image_bytes(model.as_ref(), &analysis_model, &bytes).await,
                None => {
                    warn!("Could not fetch {url} for analysis");
                    AnalysisResult::default()
                }
            }
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(result) => results.push(result),
            Err(err) => {
                warn!("Analysis task panicked: {err}");
                results.push(AnalysisResult::default());
            }
        }
    }
    results
}

/// Strict JSON first, then one pass of markdown-fence stripping; anything
/// else becomes an empty document.
fn parse_analysis(raw: &str) -> AnalysisResult {
    let stripped = super::strip_json_fences(raw);
    match serde_json::from_str::<AnalysisResult>(stripped) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!("Undecodable analysis response ({err}); storing empty document");
            AnalysisResult::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_strict_json() {
        let parsed = parse_analysis(
            r#"{"description":"a red shoe","tags":["shoe","red"],"image_style":"photo"}"#,
        );
        assert_eq!(parsed.description.as_deref(), Some("a red shoe"));
        assert_eq!(parsed.tags, vec!["shoe", "red"]);
        assert_eq!(parsed.image_style.as_deref(), Some("photo"));
    }

    #[test]
    fn strips_markdown_fences() {
        let parsed = parse_analysis("```json\n{\"tags\":[\"hat\"]}\n```");
        assert_eq!(parsed.tags, vec!["hat"]);
    }

    #[test]
    fn garbage_becomes_empty_document() {
        let parsed = parse_analysis("I can't analyze that image, sorry.");
        assert!(parsed.is_empty());
    }
}
