use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::warn;

/// Semi-structured visual metadata extracted from an image by the vision
/// model. Every field is optional; an empty document means analysis failed
/// or was skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lighting: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colors: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vibe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_style: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_elements: Vec<String>,
}

impl AnalysisResult {
    pub fn is_empty(&self) -> bool {
        self == &AnalysisResult::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingStatus {
    Trained,
    NotTrained,
}

impl TrainingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainingStatus::Trained => "trained",
            TrainingStatus::NotTrained => "not_trained",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "trained" => Some(TrainingStatus::Trained),
            "not_trained" => Some(TrainingStatus::NotTrained),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct EnvironmentRow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DatasetRow {
    pub id: String,
    pub user_id: Option<String>,
    pub environment_id: Option<String>,
    pub name: String,
    pub master_prompt: Option<String>,
    pub training_status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct DatasetImageRow {
    pub id: String,
    pub dataset_id: String,
    pub image_url: String,
    pub analysis_result: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DatasetImageRow {
    /// Decodes the stored analysis document. A row with a malformed or
    /// missing document behaves as "never analyzed".
    pub fn analysis(&self) -> Option<AnalysisResult> {
        let raw = self.analysis_result.as_deref()?;
        match serde_json::from_str::<AnalysisResult>(raw) {
            Ok(parsed) if !parsed.is_empty() => Some(parsed),
            Ok(_) => None,
            Err(err) => {
                warn!("Undecodable analysis_result on image {}: {err}", self.id);
                None
            }
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct GeneratedImageRow {
    pub id: String,
    pub user_id: Option<String>,
    pub prompt: String,
    pub full_prompt: String,
    pub image_url: String,
    pub dataset_id: Option<String>,
    pub environment_id: Option<String>,
    pub style: Option<String>,
    pub image_style: String,
    pub aspect_ratio: String,
    pub quality: String,
    pub format: String,
    pub resolution: String,
    pub reference_images_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BusinessProfileRow {
    pub id: String,
    pub business_name: Option<String>,
    pub vibes: Option<String>,
    pub theme: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UserProfileRow {
    pub id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub creative_type: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PlanRow {
    pub id: String,
    pub name: String,
    pub price_monthly: i64,
    pub monthly_credits: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CreditBalanceRow {
    pub user_id: String,
    pub total_credits: i64,
    pub used_credits: i64,
    pub remaining_credits: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CreditTransactionRow {
    pub id: String,
    pub user_id: String,
    pub amount: i64,
    pub kind: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UsageLogRow {
    pub id: String,
    pub user_id: String,
    pub action: String,
    pub credits_spent: i64,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
}
