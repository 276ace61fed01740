use crate::http::build_client;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::BTreeMap, env, sync::Arc};
use thiserror::Error;

const GOOGLE_CSE_URL: &str = "https://www.googleapis.com/customsearch/v1";
const SERPER_URL: &str = "https://google.serper.dev/search";
const RESULTS_PER_QUERY: u32 = 5;
const GO_UPC_URL: &str = "https://go-upc.com/api/v1/code";
const UPCITEMDB_URL: &str = "https://api.upcitemdb.com/prod/trial/lookup";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub title: String,
    pub snippet: String,
    pub link: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageResult {
    pub url: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub title: String,
}

/// Manufacturer data for a barcode, from whichever database knew it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BarcodeData {
    pub name: String,
    pub description: String,
    pub brand: String,
    pub category: String,
    pub image_url: Option<String>,
    #[serde(default)]
    pub specs: BTreeMap<String, String>,
    pub source: String,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider not configured")]
    NotConfigured,
    #[error("quota exhausted (status {0})")]
    QuotaExhausted(u16),
    #[error("http status {0}")]
    Http(u16),
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
}

impl ProviderError {
    pub fn outcome(&self) -> &'static str {
        match self {
            ProviderError::NotConfigured => "not_configured",
            ProviderError::QuotaExhausted(_) => "quota",
            ProviderError::Http(_) => "http_error",
            ProviderError::Transport(_) => "transport_error",
            ProviderError::Decode(_) => "decode_error",
        }
    }
}

fn classify_status(status: StatusCode) -> ProviderError {
    match status.as_u16() {
        403 | 429 => ProviderError::QuotaExhausted(status.as_u16()),
        other => ProviderError::Http(other),
    }
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Breaker family; providers sharing a quota share a family.
    fn family(&self) -> &'static str;
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, ProviderError>;
}

#[async_trait]
pub trait ImageSearchProvider: Send + Sync {
    fn family(&self) -> &'static str;
    async fn search_images(&self, query: &str) -> Result<Vec<ImageResult>, ProviderError>;
}

/// `Ok(None)` means the database answered but does not know the code.
#[async_trait]
pub trait BarcodeProvider: Send + Sync {
    fn family(&self) -> &'static str;
    async fn lookup(&self, code: &str) -> Result<Option<BarcodeData>, ProviderError>;
}

#[derive(Clone)]
pub struct GoogleSearch {
    http: Client,
    api_key: Option<String>,
    cx: Option<String>,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct CseResponse {
    #[serde(default)]
    items: Vec<CseItem>,
}

#[derive(Debug, Deserialize)]
struct CseItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    image: Option<CseImage>,
}

#[derive(Debug, Deserialize)]
struct CseImage {
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
}

impl GoogleSearch {
    pub fn from_env() -> Self {
        Self {
            http: build_client(),
            api_key: env::var("GOOGLE_SEARCH_API_KEY").ok().filter(|v| !v.is_empty()),
            cx: env::var("GOOGLE_SEARCH_CX").ok().filter(|v| !v.is_empty()),
            endpoint: GOOGLE_CSE_URL.into(),
        }
    }

    async fn query(&self, params: &[(&str, &str)]) -> Result<CseResponse, ProviderError> {
        let (Some(key), Some(cx)) = (self.api_key.as_deref(), self.cx.as_deref()) else {
            return Err(ProviderError::NotConfigured);
        };
        let num = RESULTS_PER_QUERY.to_string();
        let mut query: Vec<(&str, &str)> = vec![("key", key), ("cx", cx), ("num", &num)];
        query.extend_from_slice(params);
        let resp = self
            .http
            .get(&self.endpoint)
            .query(&query)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(classify_status(resp.status()));
        }
        resp.json::<CseResponse>()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

#[async_trait]
impl SearchProvider for GoogleSearch {
    fn family(&self) -> &'static str {
        "google"
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, ProviderError> {
        let body = self.query(&[("q", query)]).await?;
        Ok(body
            .items
            .into_iter()
            .map(|item| SearchResult {
                title: item.title,
                snippet: item.snippet,
                link: item.link,
            })
            .collect())
    }
}

#[async_trait]
impl ImageSearchProvider for GoogleSearch {
    fn family(&self) -> &'static str {
        "google"
    }

    async fn search_images(&self, query: &str) -> Result<Vec<ImageResult>, ProviderError> {
        let body = self
            .query(&[("q", query), ("searchType", "image"), ("imgSize", "xlarge")])
            .await?;
        Ok(body
            .items
            .into_iter()
            .filter(|item| !item.link.is_empty())
            .map(|item| {
                let (width, height) = item
                    .image
                    .map(|img| (img.width, img.height))
                    .unwrap_or((0, 0));
                ImageResult {
                    url: item.link,
                    width,
                    height,
                    title: item.title,
                }
            })
            .collect())
    }
}

#[derive(Clone)]
pub struct SerperSearch {
    http: Client,
    api_key: Option<String>,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<SerperOrganic>,
}

#[derive(Debug, Deserialize)]
struct SerperOrganic {
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    link: String,
}

impl SerperSearch {
    pub fn from_env() -> Self {
        Self {
            http: build_client(),
            api_key: env::var("SERPER_API_KEY").ok().filter(|v| !v.is_empty()),
            endpoint: SERPER_URL.into(),
        }
    }
}

#[async_trait]
impl SearchProvider for SerperSearch {
    fn family(&self) -> &'static str {
        "serper"
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, ProviderError> {
        let Some(key) = self.api_key.as_deref() else {
            return Err(ProviderError::NotConfigured);
        };
        let resp = self
            .http
            .post(&self.endpoint)
            .header("X-API-KEY", key)
            .json(&json!({ "q": query, "num": RESULTS_PER_QUERY }))
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(classify_status(resp.status()));
        }
        let body: SerperResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(body
            .organic
            .into_iter()
            .map(|o| SearchResult {
                title: o.title,
                snippet: o.snippet,
                link: o.link,
            })
            .collect())
    }
}

pub struct GoUpc {
    http: Client,
    api_key: Option<String>,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct GoUpcResponse {
    product: Option<GoUpcProduct>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoUpcProduct {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    brand: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    specs: BTreeMap<String, serde_json::Value>,
}

impl GoUpcProduct {
    fn into_data(self) -> BarcodeData {
        BarcodeData {
            name: self.name.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
            brand: self.brand.unwrap_or_default(),
            category: self.category.unwrap_or_default(),
            image_url: self.image_url.filter(|u| !u.is_empty()),
            specs: self
                .specs
                .into_iter()
                .map(|(k, v)| match v {
                    serde_json::Value::String(s) => (k, s),
                    other => (k, other.to_string()),
                })
                .collect(),
            source: "go-upc".into(),
        }
    }
}

impl GoUpc {
    pub fn from_env() -> Self {
        Self {
            http: build_client(),
            api_key: env::var("GO_UPC_API_KEY").ok().filter(|v| !v.is_empty()),
            endpoint: GO_UPC_URL.into(),
        }
    }
}

#[async_trait]
impl BarcodeProvider for GoUpc {
    fn family(&self) -> &'static str {
        "go-upc"
    }

    async fn lookup(&self, code: &str) -> Result<Option<BarcodeData>, ProviderError> {
        let Some(key) = self.api_key.as_deref() else {
            return Err(ProviderError::NotConfigured);
        };
        let mut url = reqwest::Url::parse(&self.endpoint).map_err(|e| ProviderError::Transport(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ProviderError::Transport("endpoint cannot take a path".into()))?
            .push(code);
        let resp = self
            .http
            .get(url)
            .bearer_auth(key)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(classify_status(resp.status()));
        }
        let body: GoUpcResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(body.product.map(GoUpcProduct::into_data))
    }
}

/// Keyless trial tier; tight daily quota.
pub struct UpcItemDb {
    http: Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct UpcItemDbResponse {
    #[serde(default)]
    items: Vec<UpcItem>,
}

#[derive(Debug, Deserialize)]
struct UpcItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    brand: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    dimension: String,
    #[serde(default)]
    weight: String,
    #[serde(default)]
    model: String,
}

impl UpcItem {
    fn into_data(self) -> BarcodeData {
        let specs = [("dimensions", self.dimension), ("weight", self.weight), ("model", self.model)]
            .into_iter()
            .filter(|(_, v)| !v.trim().is_empty())
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        BarcodeData {
            name: self.title,
            description: self.description,
            brand: self.brand,
            category: self.category,
            image_url: self.images.into_iter().find(|u| !u.is_empty()),
            specs,
            source: "upcitemdb".into(),
        }
    }
}

impl UpcItemDb {
    pub fn from_env() -> Self {
        Self {
            http: build_client(),
            endpoint: UPCITEMDB_URL.into(),
        }
    }
}

#[async_trait]
impl BarcodeProvider for UpcItemDb {
    fn family(&self) -> &'static str {
        "upcitemdb"
    }

    async fn lookup(&self, code: &str) -> Result<Option<BarcodeData>, ProviderError> {
        let resp = self
            .http
            .get(&self.endpoint)
            .query(&[("upc", code)])
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        // Unknown codes come back as 400/404 depending on format.
        if matches!(resp.status(), StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST) {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(classify_status(resp.status()));
        }
        let body: UpcItemDbResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(body.items.into_iter().next().map(UpcItem::into_data))
    }
}

/// Go-UPC first, UPCitemdb as the fallback.
pub fn barcode_providers() -> Vec<Arc<dyn BarcodeProvider>> {
    vec![Arc::new(GoUpc::from_env()), Arc::new(UpcItemDb::from_env())]
}

/// Text providers in the order named by `SEARCH_PROVIDERS`; unknown names
/// are ignored.
pub fn text_providers(names: &[String], google: &GoogleSearch) -> Vec<Arc<dyn SearchProvider>> {
    names
        .iter()
        .filter_map(|name| -> Option<Arc<dyn SearchProvider>> {
            match name.as_str() {
                "google" => Some(Arc::new(google.clone())),
                "serper" => Some(Arc::new(SerperSearch::from_env())),
                other => {
                    tracing::warn!(target = "smartenrich.search", provider = other, "unknown_search_provider");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_statuses_are_distinguished() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            ProviderError::QuotaExhausted(429)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN),
            ProviderError::QuotaExhausted(403)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY),
            ProviderError::Http(502)
        ));
    }

    #[test]
    fn provider_order_follows_configuration() {
        let google = GoogleSearch::from_env();
        let names = vec!["serper".to_string(), "bing".to_string(), "google".to_string()];
        let providers = text_providers(&names, &google);
        let families: Vec<_> = providers.iter().map(|p| p.family()).collect();
        assert_eq!(families, vec!["serper", "google"]);
    }

    #[test]
    fn upcitemdb_item_keeps_only_known_specs() {
        let body: UpcItemDbResponse = serde_json::from_str(
            r#"{"code":"OK","items":[{"title":"TP-Link Archer C6","brand":"TP-Link","category":"Routers",
                "images":["https://img/c6.jpg"],"weight":"0.5 lb","dimension":"","ean":"0840030701191"}]}"#,
        )
        .expect("decode");
        let data = body.items.into_iter().next().map(UpcItem::into_data).expect("item");
        assert_eq!(data.name, "TP-Link Archer C6");
        assert_eq!(data.image_url.as_deref(), Some("https://img/c6.jpg"));
        assert_eq!(data.specs, BTreeMap::from([("weight".to_string(), "0.5 lb".to_string())]));
        assert_eq!(data.source, "upcitemdb");
    }

    #[test]
    fn go_upc_product_flattens_specs() {
        let body: GoUpcResponse = serde_json::from_str(
            r#"{"code":"0840030701191","product":{"name":"Archer C6","brand":"TP-Link","imageUrl":"",
                "specs":{"Bands":"Dual","Ports":4}}}"#,
        )
        .expect("decode");
        let data = body.product.map(GoUpcProduct::into_data).expect("product");
        assert_eq!(data.brand, "TP-Link");
        assert_eq!(data.image_url, None);
        assert_eq!(data.specs["Bands"], "Dual");
        assert_eq!(data.specs["Ports"], "4");
        assert_eq!(data.source, "go-upc");
    }

    #[tokio::test]
    async fn go_upc_without_key_reports_not_configured() {
        let go_upc = GoUpc {
            http: Client::new(),
            api_key: None,
            endpoint: GO_UPC_URL.into(),
        };
        assert!(matches!(go_upc.lookup("0840030701191").await, Err(ProviderError::NotConfigured)));
    }

    #[tokio::test]
    async fn unconfigured_google_reports_not_configured() {
        let google = GoogleSearch {
            http: Client::new(),
            api_key: None,
            cx: None,
            endpoint: GOOGLE_CSE_URL.into(),
        };
        let err = SearchProvider::search(&google, "anything").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured));
    }
}
