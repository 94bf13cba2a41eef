use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::db::models::DatasetImageRow;
use crate::llm::gemini::{GeminiError, ImageModel, RequestPart};
use crate::llm::media;

const BATCH_MAX_ATTEMPTS: u32 = 3;
const BATCH_BASE_DELAY_MS: u64 = 500;

/// Re-orders semantically ranked candidates by showing them to a vision
/// model alongside the prompt. Downloads every candidate first; an image
/// that cannot be fetched keeps a score of 0.0 and sinks to the back.
///
/// Any hard batch failure abandons the rerank wholesale and returns the
/// incoming order, never a partial mix of scored and unscored batches.
pub async fn rerank_images(
    model: &dyn ImageModel,
    http: &reqwest::Client,
    rerank_model: &str,
    prompt: &str,
    candidates: Vec<DatasetImageRow>,
    max_results: usize,
    batch_size: usize,
    download_timeout: Duration,
) -> Vec<DatasetImageRow> {
    if candidates.len() <= max_results {
        return candidates;
    }

    let mut downloaded = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let bytes = media::download_image(http, &candidate.image_url, download_timeout).await;
        downloaded.push((candidate, bytes));
    }

    rerank_downloaded(model, rerank_model, prompt, downloaded, max_results, batch_size).await
}

/// Core of the rerank over candidates whose bytes are already in hand.
pub async fn rerank_downloaded(
    model: &dyn ImageModel,
    rerank_model: &str,
    prompt: &str,
    candidates: Vec<(DatasetImageRow, Option<Vec<u8>>)>,
    max_results: usize,
    batch_size: usize,
) -> Vec<DatasetImageRow> {
    if candidates.len() <= max_results {
        return candidates.into_iter().map(|(row, _)| row).collect();
    }

    let mut scores = vec![0.0f64; candidates.len()];
    let batch_size = batch_size.max(1);

    // Score inside a scope so the borrows end before candidates move.
    let outcome = {
        let visible: Vec<(usize, &[u8])> = candidates
            .iter()
            .enumerate()
            .filter_map(|(index, (_, bytes))| bytes.as_deref().map(|bytes| (index, bytes)))
            .collect();

        let mut outcome = Ok(());
        for batch in visible.chunks(batch_size) {
            match score_batch(model, rerank_model, prompt, batch).await {
                Ok(batch_scores) => {
                    for (index, score) in batch_scores {
                        scores[index] = score;
                    }
                }
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }
        outcome
    };

    if let Err(err) = outcome {
        warn!("Vision rerank abandoned, keeping semantic order: {err}");
        return candidates
            .into_iter()
            .map(|(row, _)| row)
            .take(max_results)
            .collect();
    }

    let mut order: Vec<(usize, f64)> = scores.into_iter().enumerate().collect();
    order.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut slots: Vec<Option<DatasetImageRow>> =
        candidates.into_iter().map(|(row, _)| Some(row)).collect();
    order
        .into_iter()
        .take(max_results)
        .filter_map(|(index, _)| slots[index].take())
        .collect()
}

/// Scores one batch of candidates, retrying transient provider failures.
/// Returned pairs are (global candidate index, clamped score).
async fn score_batch(
    model: &dyn ImageModel,
    rerank_model: &str,
    prompt: &str,
    batch: &[(usize, &[u8])],
) -> Result<Vec<(usize, f64)>, GeminiError> {
    let mut parts = Vec::with_capacity(batch.len() * 2 + 1);
    parts.push(RequestPart::Text(rerank_instruction(prompt, batch.len())));
    for (position, (_, bytes)) in batch.iter().enumerate() {
        parts.push(RequestPart::Text(format!("Candidate {}", position + 1)));
        let mime_type = media::detect_mime_type(bytes)
            .unwrap_or_else(|| "image/jpeg".to_string());
        parts.push(RequestPart::InlineImage {
            mime_type,
            data: bytes.to_vec(),
        });
    }

    let mut last_err = GeminiError::Other(anyhow::anyhow!("rerank batch never attempted"));
    for attempt in 0..BATCH_MAX_ATTEMPTS {
        match model.generate_json(rerank_model, &parts).await {
            Ok(raw) => {
                let batch_scores = parse_scores(&raw, batch.len())?;
                let mapped = batch_scores
                    .into_iter()
                    .map(|(position, score)| (batch[position].0, score))
                    .collect();
                return Ok(mapped);
            }
            // A rejected payload will not improve by resending it.
            Err(err @ GeminiError::InvalidArgument(_)) => return Err(err),
            Err(err) => {
                debug!(
                    "Rerank batch attempt {}/{} failed: {err}",
                    attempt + 1,
                    BATCH_MAX_ATTEMPTS
                );
                last_err = err;
                if attempt + 1 < BATCH_MAX_ATTEMPTS {
                    let delay = Duration::from_millis(BATCH_BASE_DELAY_MS << attempt);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(last_err)
}

fn rerank_instruction(prompt: &str, batch_len: usize) -> String {
    format!(
        "You are ranking reference images for an image generation request.\n\
         Request: {prompt}\n\
         You will see {batch_len} candidate images, each preceded by a label \
         \"Candidate k\". Score how useful each candidate is as a visual \
         reference for the request, from 0.0 (irrelevant) to 1.0 (ideal).\n\
         Respond with JSON only, exactly this shape:\n\
         {{\"scores\": [{{\"candidate\": 1, \"score\": 0.8}}]}}"
    )
}

#[derive(Debug, Deserialize)]
struct ScorePayload {
    scores: Vec<ScoreEntry>,
}

#[derive(Debug, Deserialize)]
struct ScoreEntry {
    candidate: usize,
    score: f64,
}

/// Parses the model's score payload. Entries outside the batch are dropped,
/// scores are clamped to [0,1], and unmentioned candidates stay at 0.0.
fn parse_scores(raw: &str, batch_len: usize) -> Result<Vec<(usize, f64)>, GeminiError> {
    let stripped = super::strip_json_fences(raw);
    let payload: ScorePayload = serde_json::from_str(stripped).map_err(|err| {
        GeminiError::Other(anyhow::anyhow!("undecodable rerank response: {err}"))
    })?;

    let mut scores = Vec::with_capacity(payload.scores.len());
    for entry in payload.scores {
        if entry.candidate == 0 || entry.candidate > batch_len {
            warn!("Rerank response names unknown candidate {}", entry.candidate);
            continue;
        }
        let score = if entry.score.is_nan() {
            0.0
        } else {
            entry.score.clamp(0.0, 1.0)
        };
        scores.push((entry.candidate - 1, score));
    }
    Ok(scores)
}
