pub mod config;
pub mod shopify;

use crate::models::CatalogItem;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("HTTP {0}")]
    Http(u16),
    #[error("graphql error: {0}")]
    GraphQl(String),
    #[error("unexpected payload: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Default)]
pub struct CatalogPage {
    pub items: Vec<CatalogItem>,
    /// `None` once the listing is exhausted.
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeoInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Content update for one item. Pricing and variants are never part of it.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemUpdate {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description_html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_type: Option<String>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seo: Option<SeoInput>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetafieldInput {
    pub owner_id: String,
    pub namespace: String,
    pub key: String,
    pub value: String,
    #[serde(rename = "type")]
    pub value_type: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaInput {
    pub original_source: String,
    pub alt: String,
    pub media_content_type: &'static str,
}

impl MediaInput {
    pub fn image(url: impl Into<String>, alt: impl Into<String>) -> Self {
        Self {
            original_source: url.into(),
            alt: alt.into(),
            media_content_type: "IMAGE",
        }
    }
}

/// Result of a write. User errors are data, not failures of the call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationOutcome {
    pub user_errors: Vec<String>,
}

impl MutationOutcome {
    pub fn is_ok(&self) -> bool {
        self.user_errors.is_empty()
    }
}

#[async_trait]
pub trait CatalogApi: Send + Sync {
    /// Active items, newest first.
    async fn list_active(&self, cursor: Option<&str>, page_size: u32) -> Result<CatalogPage, CatalogError>;
    async fn fetch_item(&self, id: &str) -> Result<Option<CatalogItem>, CatalogError>;
    async fn update_item(&self, update: &ItemUpdate) -> Result<MutationOutcome, CatalogError>;
    async fn set_metafields(&self, inputs: &[MetafieldInput]) -> Result<MutationOutcome, CatalogError>;
    async fn create_media(&self, item_id: &str, media: &[MediaInput]) -> Result<MutationOutcome, CatalogError>;
}

pub type SharedCatalog = Arc<dyn CatalogApi>;

const PRODUCT_GID_PREFIX: &str = "gid://shopify/Product/";

/// Accepts either a bare numeric id or a full product gid.
pub fn normalize_product_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Some(format!("{PRODUCT_GID_PREFIX}{trimmed}"));
    }
    trimmed.starts_with("gid://").then(|| trimmed.to_string())
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::models::{ItemImage, Metafield, Seo};
    use std::{collections::HashSet, sync::Mutex};

    /// In-memory catalog. Items are kept newest first.
    #[derive(Default)]
    pub struct MemoryCatalog {
        pub items: Mutex<Vec<CatalogItem>>,
        pub bad_metafield_keys: HashSet<String>,
        pub bad_media_urls: HashSet<String>,
        pub reject_updates: bool,
        pub fail_listing: bool,
        pub calls: Mutex<Vec<String>>,
    }

    impl MemoryCatalog {
        pub fn with_items(items: Vec<CatalogItem>) -> Self {
            Self {
                items: Mutex::new(items),
                ..Default::default()
            }
        }

        pub fn item(&self, id: &str) -> Option<CatalogItem> {
            self.items.lock().expect("items").iter().find(|i| i.id == id).cloned()
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls").clone()
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().expect("calls").push(call.into());
        }
    }

    #[async_trait]
    impl CatalogApi for MemoryCatalog {
        async fn list_active(&self, cursor: Option<&str>, page_size: u32) -> Result<CatalogPage, CatalogError> {
            self.record(format!("list:{}", cursor.unwrap_or("")));
            if self.fail_listing {
                return Err(CatalogError::Http(502));
            }
            let active: Vec<CatalogItem> = self
                .items
                .lock()
                .expect("items")
                .iter()
                .filter(|i| i.is_active())
                .cloned()
                .collect();
            let start: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
            let end = (start + page_size as usize).min(active.len());
            Ok(CatalogPage {
                items: active.get(start..end).map(<[CatalogItem]>::to_vec).unwrap_or_default(),
                next_cursor: (end < active.len()).then(|| end.to_string()),
            })
        }

        async fn fetch_item(&self, id: &str) -> Result<Option<CatalogItem>, CatalogError> {
            self.record(format!("fetch:{id}"));
            Ok(self.item(id))
        }

        async fn update_item(&self, update: &ItemUpdate) -> Result<MutationOutcome, CatalogError> {
            self.record(format!("update:{}", update.id));
            if self.reject_updates {
                return Ok(MutationOutcome {
                    user_errors: vec!["descriptionHtml: is invalid".into()],
                });
            }
            let mut items = self.items.lock().expect("items");
            let Some(item) = items.iter_mut().find(|i| i.id == update.id) else {
                return Ok(MutationOutcome {
                    user_errors: vec!["id: Product does not exist".into()],
                });
            };
            if let Some(d) = &update.description_html {
                item.description_html = d.clone();
            }
            if let Some(t) = &update.product_type {
                item.product_type = t.clone();
            }
            item.tags = update.tags.clone();
            if let Some(seo) = &update.seo {
                item.seo = Seo {
                    title: seo.title.clone().or(item.seo.title.clone()),
                    description: seo.description.clone().or(item.seo.description.clone()),
                };
            }
            Ok(MutationOutcome::default())
        }

        async fn set_metafields(&self, inputs: &[MetafieldInput]) -> Result<MutationOutcome, CatalogError> {
            self.record(format!("metafields:{}", inputs.len()));
            let bad: Vec<String> = inputs
                .iter()
                .filter(|m| self.bad_metafield_keys.contains(&m.key))
                .map(|m| format!("{}: value is invalid", m.key))
                .collect();
            if !bad.is_empty() {
                return Ok(MutationOutcome { user_errors: bad });
            }
            let mut items = self.items.lock().expect("items");
            for input in inputs {
                if let Some(item) = items.iter_mut().find(|i| i.id == input.owner_id) {
                    item.metafields.retain(|m| !(m.namespace == input.namespace && m.key == input.key));
                    item.metafields.push(Metafield {
                        namespace: input.namespace.clone(),
                        key: input.key.clone(),
                        value: input.value.clone(),
                    });
                }
            }
            Ok(MutationOutcome::default())
        }

        async fn create_media(&self, item_id: &str, media: &[MediaInput]) -> Result<MutationOutcome, CatalogError> {
            self.record(format!("media:{}", media.len()));
            let bad: Vec<String> = media
                .iter()
                .filter(|m| self.bad_media_urls.contains(&m.original_source))
                .map(|m| format!("originalSource: {} could not be fetched", m.original_source))
                .collect();
            if !bad.is_empty() {
                return Ok(MutationOutcome { user_errors: bad });
            }
            let mut items = self.items.lock().expect("items");
            if let Some(item) = items.iter_mut().find(|i| i.id == item_id) {
                item.images.extend(media.iter().map(|m| ItemImage {
                    url: m.original_source.clone(),
                    alt_text: Some(m.alt.clone()),
                    width: None,
                    height: None,
                }));
            }
            Ok(MutationOutcome::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ids_become_product_gids() {
        assert_eq!(
            normalize_product_id(" 8123 ").as_deref(),
            Some("gid://shopify/Product/8123")
        );
        assert_eq!(
            normalize_product_id("gid://shopify/Product/9").as_deref(),
            Some("gid://shopify/Product/9")
        );
        assert_eq!(normalize_product_id("abc"), None);
        assert_eq!(normalize_product_id(""), None);
    }
}
