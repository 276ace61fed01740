use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use serde_with::{DisplayFromStr, PickFirst, serde_as};
use std::collections::BTreeMap;

pub const CUSTOM_NAMESPACE: &str = "custom";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Active,
    #[default]
    Draft,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CatalogItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description_html: String,
    #[serde(default)]
    pub product_type: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default)]
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub images: Vec<ItemImage>,
    #[serde(default)]
    pub seo: Seo,
    #[serde(default)]
    pub metafields: Vec<Metafield>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Variant {
    pub id: String,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub barcode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ItemImage {
    pub url: String,
    #[serde(default)]
    pub alt_text: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Seo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metafield {
    pub namespace: String,
    pub key: String,
    pub value: String,
}

impl CatalogItem {
    pub fn is_active(&self) -> bool {
        self.status == ItemStatus::Active
    }

    pub fn first_sku(&self) -> Option<&str> {
        self.variants
            .first()
            .and_then(|v| v.sku.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn first_barcode(&self) -> Option<&str> {
        self.variants
            .first()
            .and_then(|v| v.barcode.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn custom_metafields(&self) -> impl Iterator<Item = &Metafield> {
        self.metafields
            .iter()
            .filter(|m| m.namespace == CUSTOM_NAMESPACE)
    }

    /// Compact view stored on every log so reviewers can diff against the
    /// proposal without refetching the item.
    pub fn snapshot(&self) -> Value {
        let metafields: BTreeMap<&str, &str> = self
            .custom_metafields()
            .map(|m| (m.key.as_str(), m.value.as_str()))
            .collect();
        serde_json::json!({
            "id": self.id,
            "title": self.title,
            "descriptionHtml": self.description_html,
            "productType": self.product_type,
            "vendor": self.vendor,
            "tags": self.tags,
            "category": self.category,
            "seo": self.seo,
            "imageCount": self.images.len(),
            "metafields": metafields,
        })
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EnrichmentProposal {
    /// `None` when the model left it out; the validator rejects that.
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    pub confidence_score: Option<f64>,
    #[serde(default)]
    pub description_html: String,
    #[serde(default)]
    pub product_type: String,
    #[serde(default)]
    pub category_suggestion: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub seo_title: String,
    #[serde(default)]
    pub seo_description: String,
    #[serde(default, deserialize_with = "metafield_values")]
    pub metafields: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub image_analysis: ImageAnalysis,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ImageAnalysis {
    #[serde(default)]
    pub current_quality: ImageQuality,
    #[serde(default)]
    pub needs_more_images: bool,
    #[serde(default)]
    pub suggested_alt_texts: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageQuality {
    Buena,
    Regular,
    Mala,
    #[default]
    #[serde(other)]
    Unknown,
}

// The model is asked for strings but regularly answers numbers or booleans
// for things like weight or "has bluetooth".
fn metafield_values<'de, D>(deserializer: D) -> Result<BTreeMap<String, Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::Null => None,
                Value::String(s) if s.trim().is_empty() || s.trim() == "null" => None,
                Value::String(s) => Some(s),
                other => Some(other.to_string()),
            };
            (key, value)
        })
        .collect())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled,
    Manual,
    Webhook,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Scheduled => "scheduled",
            TriggerKind::Manual => "manual",
            TriggerKind::Webhook => "webhook",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "scheduled" | "cron" => Some(TriggerKind::Scheduled),
            "manual" => Some(TriggerKind::Manual),
            "webhook" => Some(TriggerKind::Webhook),
            _ => None,
        }
    }

    pub fn is_automated(&self) -> bool {
        !matches!(self, TriggerKind::Manual)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Pending,
    Approved,
    Applied,
    Rejected,
    Failed,
    Skipped,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Pending => "pending",
            LogStatus::Approved => "approved",
            LogStatus::Applied => "applied",
            LogStatus::Rejected => "rejected",
            LogStatus::Failed => "failed",
            LogStatus::Skipped => "skipped",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "pending" => Some(LogStatus::Pending),
            "approved" => Some(LogStatus::Approved),
            "applied" => Some(LogStatus::Applied),
            "rejected" => Some(LogStatus::Rejected),
            "failed" => Some(LogStatus::Failed),
            "skipped" => Some(LogStatus::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentRun {
    pub id: String,
    pub shop: String,
    pub triggered_by: TriggerKind,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_products: i64,
    pub enriched_count: i64,
    pub failed_count: i64,
    pub skipped_count: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentLog {
    pub id: String,
    pub run_id: Option<String>,
    pub shop: String,
    pub product_id: String,
    pub product_title: String,
    pub score_before: i64,
    pub score_after: Option<i64>,
    pub confidence: Option<f64>,
    pub status: LogStatus,
    pub original_data: Value,
    pub proposed_changes: Option<Value>,
    pub applied_changes: Option<Value>,
    pub ai_model: Option<String>,
    pub ai_response_raw: Option<String>,
    pub search_data: Option<Value>,
    pub image_data: Option<Value>,
    pub error_message: Option<String>,
    pub processed_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub applied_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TenantSettings {
    pub shop: String,
    pub cron_schedule: String,
    pub cron_enabled: bool,
    pub auto_apply: bool,
    pub max_products_per_run: u32,
    pub min_confidence: f64,
}

impl TenantSettings {
    pub const MAX_PRODUCTS_LIMIT: u32 = 200;

    pub fn defaults_for(shop: &str) -> Self {
        Self {
            shop: shop.to_string(),
            cron_schedule: "0 2 * * *".into(),
            cron_enabled: true,
            auto_apply: false,
            max_products_per_run: 50,
            min_confidence: 0.7,
        }
    }

    pub fn normalized(mut self) -> Self {
        self.max_products_per_run = self.max_products_per_run.clamp(1, Self::MAX_PRODUCTS_LIMIT);
        if !self.min_confidence.is_finite() {
            self.min_confidence = 0.7;
        }
        self.min_confidence = self.min_confidence.clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
