use std::io::Cursor;
use std::time::Duration;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use tracing::{debug, warn};

use crate::llm::gemini::{GeminiError, ImageModel, ImageOptions, RequestPart};
use crate::llm::media;

/// On an invalid-argument rejection with more references than this, the
/// request is resent once with only the top references.
const SHRINK_TO: usize = 3;

/// Assembles the generation prompt from named sections in a fixed order,
/// regardless of the order setters are called in. Empty sections are
/// skipped.
#[derive(Debug, Default)]
pub struct PromptBuilder {
    grounding: Option<String>,
    brand_context: Option<String>,
    style_guidelines: Option<String>,
    reference_tags: Option<String>,
    user_request: Option<String>,
    style_target: Option<String>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grounding(mut self, text: impl Into<String>) -> Self {
        self.grounding = Some(text.into());
        self
    }

    pub fn brand_context(mut self, text: impl Into<String>) -> Self {
        self.brand_context = Some(text.into());
        self
    }

    pub fn style_guidelines(mut self, text: impl Into<String>) -> Self {
        self.style_guidelines = Some(text.into());
        self
    }

    pub fn reference_tags(mut self, text: impl Into<String>) -> Self {
        self.reference_tags = Some(text.into());
        self
    }

    pub fn user_request(mut self, text: impl Into<String>) -> Self {
        self.user_request = Some(text.into());
        self
    }

    pub fn style_target(mut self, text: impl Into<String>) -> Self {
        self.style_target = Some(text.into());
        self
    }

    pub fn build(self) -> String {
        [
            self.grounding,
            self.brand_context,
            self.style_guidelines,
            self.reference_tags,
            self.user_request,
            self.style_target,
        ]
        .into_iter()
        .flatten()
        .map(|section| section.trim().to_string())
        .filter(|section| !section.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
    }
}

/// Normalizes one reference image for the provider: longest side capped at
/// `longest_side` (aspect preserved, Lanczos3), 3-channel RGB, PNG bytes.
pub fn prepare_reference(bytes: &[u8], longest_side: u32) -> anyhow::Result<Vec<u8>> {
    let decoded = image::load_from_memory(bytes)?;
    let resized = if decoded.width().max(decoded.height()) > longest_side {
        decoded.resize(longest_side, longest_side, FilterType::Lanczos3)
    } else {
        decoded
    };
    let normalized = DynamicImage::ImageRgb8(resized.to_rgb8());
    let mut out = Cursor::new(Vec::new());
    normalized.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// Downloads and normalizes reference images. An image that fails to
/// download or decode is dropped; the pipeline continues with fewer
/// references.
pub async fn fetch_references(
    http: &reqwest::Client,
    urls: &[String],
    longest_side: u32,
    timeout: Duration,
) -> Vec<Vec<u8>> {
    let mut prepared = Vec::with_capacity(urls.len());
    for url in urls {
        let Some(bytes) = media::download_image(http, url, timeout).await else {
            continue;
        };
        match prepare_reference(&bytes, longest_side) {
            Ok(normalized) => prepared.push(normalized),
            Err(err) => warn!("Dropping undecodable reference image {url}: {err}"),
        }
    }
    prepared
}

/// Turns prepared reference bytes into request parts, staging each through
/// the provider's file API and falling back to inline bytes when staging
/// fails.
pub async fn stage_references(
    model: &dyn ImageModel,
    prepared: Vec<Vec<u8>>,
) -> Vec<RequestPart> {
    let mut parts = Vec::with_capacity(prepared.len());
    for (index, bytes) in prepared.into_iter().enumerate() {
        let display_name = format!("reference-{}", index + 1);
        match model.stage_file(&display_name, "image/png", &bytes).await {
            Ok(uri) => parts.push(RequestPart::FileRef { uri }),
            Err(err) => {
                debug!("Staging {display_name} failed, inlining bytes: {err:#}");
                parts.push(RequestPart::InlineImage {
                    mime_type: "image/png".to_string(),
                    data: bytes,
                });
            }
        }
    }
    parts
}

/// Submits the assembled request. If the provider rejects the payload and
/// more than [`SHRINK_TO`] references were sent, retries exactly once with
/// only the top [`SHRINK_TO`]; any other error propagates unchanged.
///
/// Returns the generated bytes and the reference count actually sent. Zero
/// references is valid and behaves as pure text-to-image.
pub async fn submit_generation(
    model: &dyn ImageModel,
    model_name: &str,
    prompt: String,
    reference_parts: Vec<RequestPart>,
    options: &ImageOptions,
) -> Result<(Vec<u8>, usize), GeminiError> {
    let mut parts = Vec::with_capacity(reference_parts.len() + 1);
    parts.push(RequestPart::Text(prompt));
    parts.extend(reference_parts);
    let sent = parts.len() - 1;

    match model.generate_image(model_name, &parts, options).await {
        Ok(bytes) => Ok((bytes, sent)),
        Err(GeminiError::InvalidArgument(reason)) if sent > SHRINK_TO => {
            warn!(
                "Provider rejected {sent} references ({reason}), retrying with {SHRINK_TO}"
            );
            parts.truncate(1 + SHRINK_TO);
            let bytes = model.generate_image(model_name, &parts, options).await?;
            Ok((bytes, SHRINK_TO))
        }
        Err(err) => Err(err),
    }
}
