use tracing::warn;

use crate::db::models::{AnalysisResult, DatasetImageRow};
use crate::llm::embeddings::TextEmbedder;

/// Builds the embedding search string for one image from its analysis
/// metadata. Field order is fixed, densest signal first, so truncation by
/// the embedding model drops the least informative fields; the output is
/// fully determined by the analysis document.
pub fn search_text(analysis: &AnalysisResult) -> Option<String> {
    let mut sections: Vec<String> = Vec::new();

    if !analysis.tags.is_empty() {
        sections.push(analysis.tags.join(", "));
    }
    if !analysis.key_elements.is_empty() {
        sections.push(analysis.key_elements.join(", "));
    }
    for field in [
        analysis.theme.as_deref(),
        analysis.image_style.as_deref(),
        analysis.vibe.as_deref(),
        analysis.colors.as_deref(),
        analysis.lighting.as_deref(),
        analysis.description.as_deref(),
    ]
    .into_iter()
    .flatten()
    {
        let trimmed = field.trim();
        if !trimmed.is_empty() {
            sections.push(trimmed.to_string());
        }
    }

    if sections.is_empty() {
        None
    } else {
        Some(sections.join(". "))
    }
}

/// `dot(a,b) / (|a| * |b|)`, defined as 0.0 when either vector has zero
/// magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

/// Ranks candidate images by embedding similarity to the prompt.
///
/// Images with no derivable search text are never ranked above analyzed
/// ones; they only fill remaining slots. Any embedding failure degrades to
/// the first `max_results` images in input order; this function never
/// errors.
pub async fn rank_images(
    embedder: &dyn TextEmbedder,
    prompt: &str,
    images: Vec<DatasetImageRow>,
    max_results: usize,
    batch_size: usize,
) -> Vec<DatasetImageRow> {
    if images.len() <= max_results {
        return images;
    }

    let mut analyzed: Vec<(usize, String)> = Vec::new();
    let mut filler: Vec<usize> = Vec::new();
    for (index, image) in images.iter().enumerate() {
        match image.analysis().as_ref().and_then(search_text) {
            Some(text) => analyzed.push((index, text)),
            None => filler.push(index),
        }
    }

    if analyzed.is_empty() {
        return images.into_iter().take(max_results).collect();
    }

    let scored = match score_candidates(embedder, prompt, &analyzed, batch_size).await {
        Ok(scored) => scored,
        Err(err) => {
            warn!("Semantic ranking degraded to positional order: {err:#}");
            return images.into_iter().take(max_results).collect();
        }
    };

    // Stable sort keeps input order on ties.
    let mut order: Vec<(usize, f32)> = analyzed
        .iter()
        .map(|(index, _)| *index)
        .zip(scored)
        .collect();
    order.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut picked: Vec<usize> = order
        .into_iter()
        .map(|(index, _)| index)
        .take(max_results)
        .collect();
    for index in filler {
        if picked.len() == max_results {
            break;
        }
        picked.push(index);
    }

    let mut slots: Vec<Option<DatasetImageRow>> = images.into_iter().map(Some).collect();
    picked
        .into_iter()
        .filter_map(|index| slots[index].take())
        .collect()
}

async fn score_candidates(
    embedder: &dyn TextEmbedder,
    prompt: &str,
    analyzed: &[(usize, String)],
    batch_size: usize,
) -> anyhow::Result<Vec<f32>> {
    let prompt_embedding = embedder
        .embed(&[prompt.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("embedder returned no vector for the prompt"))?;

    let batch_size = batch_size.max(1);
    let mut scores = Vec::with_capacity(analyzed.len());
    for chunk in analyzed.chunks(batch_size) {
        let texts: Vec<String> = chunk.iter().map(|(_, text)| text.clone()).collect();
        let embeddings = embedder.embed(&texts).await?;
        if embeddings.len() != texts.len() {
            return Err(anyhow::anyhow!(
                "embedder returned {} vectors for {} texts",
                embeddings.len(),
                texts.len()
            ));
        }
        for embedding in embeddings {
            let score = cosine_similarity(&prompt_embedding, &embedding);
            scores.push(if score.is_nan() { 0.0 } else { score });
        }
    }
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;

    fn image(id: &str, tags: &[&str]) -> DatasetImageRow {
        let analysis = if tags.is_empty() {
            None
        } else {
            let doc = AnalysisResult {
                tags: tags.iter().map(|t| t.to_string()).collect(),
                ..AnalysisResult::default()
            };
            Some(serde_json::to_string(&doc).unwrap())
        };
        DatasetImageRow {
            id: id.to_string(),
            dataset_id: "ds".to_string(),
            image_url: format!("https://cdn/{id}.png"),
            analysis_result: analysis,
            created_at: Utc::now(),
        }
    }

    /// Maps any text containing a key substring to a fixed vector.
    struct FixedEmbedder {
        rules: Vec<(&'static str, Vec<f32>)>,
        default: Vec<f32>,
    }

    #[async_trait]
    impl TextEmbedder for FixedEmbedder {
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|text| {
                    self.rules
                        .iter()
                        .find(|(needle, _)| text.contains(needle))
                        .map(|(_, vector)| vector.clone())
                        .unwrap_or_else(|| self.default.clone())
                })
                .collect())
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl TextEmbedder for FailingEmbedder {
        async fn embed(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Err(anyhow::anyhow!("quota exhausted"))
        }
    }

    #[test]
    fn cosine_is_symmetric_and_bounded() {
        let a = [1.0f32, 2.0, -3.0];
        let b = [-0.5f32, 1.5, 2.0];
        let ab = cosine_similarity(&a, &b);
        let ba = cosine_similarity(&b, &a);
        assert_eq!(ab, ba);
        assert!((-1.0..=1.0).contains(&ab));
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn search_text_follows_fixed_priority_order() {
        let analysis = AnalysisResult {
            description: Some("long description".to_string()),
            tags: vec!["red shoe".to_string(), "studio".to_string()],
            lighting: Some("soft".to_string()),
            theme: Some("retail".to_string()),
            ..AnalysisResult::default()
        };
        let text = search_text(&analysis).unwrap();
        assert_eq!(text, "red shoe, studio. retail. soft. long description");
        // deterministic
        assert_eq!(search_text(&analysis).unwrap(), text);
    }

    #[test]
    fn empty_analysis_yields_no_search_text() {
        assert_eq!(search_text(&AnalysisResult::default()), None);
    }

    #[tokio::test]
    async fn ranks_red_shoes_above_blue_hats() {
        let embedder = FixedEmbedder {
            rules: vec![
                ("red shoe", vec![0.9, 0.1]),
                ("blue hat", vec![0.1, 0.9]),
                ("show the red shoe outdoors", vec![1.0, 0.0]),
            ],
            default: vec![0.0, 0.0],
        };
        let images = vec![
            image("shoe-1", &["red shoe", "studio light"]),
            image("hat-1", &["blue hat", "outdoor"]),
            image("shoe-2", &["red shoe", "studio light"]),
            image("hat-2", &["blue hat", "outdoor"]),
            image("shoe-3", &["red shoe", "studio light"]),
        ];

        let ranked = rank_images(&embedder, "show the red shoe outdoors", images, 2, 200).await;
        let ids: Vec<&str> = ranked.iter().map(|image| image.id.as_str()).collect();
        assert_eq!(ids, vec!["shoe-1", "shoe-2"]);
    }

    #[tokio::test]
    async fn ranking_is_deterministic_across_calls() {
        let make_embedder = || FixedEmbedder {
            rules: vec![("red shoe", vec![0.9, 0.1]), ("blue hat", vec![0.1, 0.9])],
            default: vec![1.0, 0.0],
        };
        let make_images = || {
            vec![
                image("a", &["blue hat"]),
                image("b", &["red shoe"]),
                image("c", &["blue hat"]),
                image("d", &["red shoe"]),
            ]
        };

        let first = rank_images(&make_embedder(), "red shoe", make_images(), 3, 200).await;
        let second = rank_images(&make_embedder(), "red shoe", make_images(), 3, 200).await;
        let ids = |rows: &[DatasetImageRow]| {
            rows.iter().map(|row| row.id.clone()).collect::<Vec<_>>()
        };
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(ids(&first), vec!["b", "d", "a"]);
    }

    #[tokio::test]
    async fn embedding_failure_degrades_to_positional_order() {
        let images = vec![
            image("a", &["x"]),
            image("b", &["y"]),
            image("c", &["z"]),
        ];
        let ranked = rank_images(&FailingEmbedder, "anything", images, 2, 200).await;
        let ids: Vec<&str> = ranked.iter().map(|image| image.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn unanalyzed_images_only_fill_remaining_slots() {
        let embedder = FixedEmbedder {
            rules: vec![("red shoe", vec![1.0, 0.0])],
            default: vec![0.0, 1.0],
        };
        let images = vec![
            image("blank-1", &[]),
            image("shoe", &["red shoe"]),
            image("blank-2", &[]),
            image("other", &["green sock"]),
        ];
        let ranked = rank_images(&embedder, "red shoe", images, 3, 200).await;
        let ids: Vec<&str> = ranked.iter().map(|image| image.id.as_str()).collect();
        assert_eq!(ids, vec!["shoe", "other", "blank-1"]);
    }
}
