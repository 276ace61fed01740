use super::{
    breaker::CircuitBreakers,
    cache::{self, BARCODE_TTL, IMAGE_TTL, SEARCH_TTL, SharedCache},
    search::{
        BarcodeData, BarcodeProvider, ImageResult, ImageSearchProvider, ProviderError, SearchProvider, SearchResult,
    },
};
use crate::{metrics, models::CatalogItem};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Items with fewer images than this get an image search.
pub const IMAGE_SEARCH_BELOW: usize = 3;
pub const MAX_NEW_IMAGES: usize = 5;
pub const IMAGE_QUALITY_FLOOR: u32 = 1024;

const NOISE_PREFIXES: &[&str] = &["open box", "reacondicionado", "refurbished", "usado", "outlet"];

static BRACKETED_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:\[[^\]]*\]|\([^)]*\)|\{[^}]*\})\s*").expect("valid prefix regex"));

#[derive(Debug, Clone, Default, Serialize)]
pub struct GatheredData {
    pub query: String,
    pub results: Vec<SearchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_query: Option<String>,
    pub images: Vec<ImageResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barcode: Option<BarcodeData>,
}

impl GatheredData {
    pub fn image_urls(&self) -> Vec<String> {
        self.images
            .iter()
            .take(MAX_NEW_IMAGES)
            .map(|img| img.url.clone())
            .collect()
    }
}

pub fn clean_title(title: &str) -> String {
    let mut rest = title.trim().to_string();
    loop {
        let stripped = BRACKETED_PREFIX.replace(&rest, "").to_string();
        let lowered = stripped.to_lowercase();
        let stripped = match NOISE_PREFIXES.iter().find(|p| lowered.starts_with(*p)) {
            Some(prefix) => stripped
                .get(prefix.len()..)
                .unwrap_or_default()
                .trim_start_matches([' ', '-', ':', '|', '–'])
                .to_string(),
            None => stripped,
        };
        if stripped == rest {
            break;
        }
        rest = stripped;
    }
    rest.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn build_text_query(title: &str, vendor: &str, sku: Option<&str>, barcode: Option<&str>) -> String {
    let mut terms: Vec<String> = Vec::new();
    let cleaned = clean_title(title);
    if !cleaned.is_empty() {
        terms.push(cleaned.clone());
    }
    let codes: Vec<&str> = [sku, barcode]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|c| !c.is_empty() && !cleaned.contains(*c))
        .collect();
    if !codes.is_empty() {
        terms.extend(codes.into_iter().map(String::from));
    } else {
        let vendor = vendor.trim();
        if !vendor.is_empty() && !cleaned.to_lowercase().contains(&vendor.to_lowercase()) {
            terms.push(vendor.to_string());
        }
    }
    if terms.is_empty() {
        return String::new();
    }
    terms.push("ficha tecnica especificaciones".into());
    terms.join(" ")
}

pub fn build_image_query(title: &str, vendor: &str, sku: Option<&str>) -> String {
    let cleaned = clean_title(title);
    let mut terms = vec![cleaned.clone()];
    let vendor = vendor.trim();
    if !vendor.is_empty() && !cleaned.to_lowercase().contains(&vendor.to_lowercase()) {
        terms.push(vendor.to_string());
    }
    if let Some(sku) = sku.map(str::trim).filter(|s| !s.is_empty()) {
        terms.push(sku.to_string());
    }
    terms.push("product photo official".into());
    terms.retain(|t| !t.is_empty());
    terms.join(" ")
}

pub fn passes_quality(img: &ImageResult) -> bool {
    (img.width == 0 && img.height == 0) || img.width.max(img.height) >= IMAGE_QUALITY_FLOOR
}

/// External lookups for one item. Never fails; every provider problem
/// degrades to an empty result.
#[derive(Clone)]
pub struct Gatherer {
    text: Vec<Arc<dyn SearchProvider>>,
    image: Option<Arc<dyn ImageSearchProvider>>,
    barcode: Vec<Arc<dyn BarcodeProvider>>,
    cache: SharedCache,
    breakers: CircuitBreakers,
}

impl Gatherer {
    pub fn new(
        text: Vec<Arc<dyn SearchProvider>>,
        image: Option<Arc<dyn ImageSearchProvider>>,
        cache: SharedCache,
        breakers: CircuitBreakers,
    ) -> Self {
        Self {
            text,
            image,
            barcode: Vec::new(),
            cache,
            breakers,
        }
    }

    /// Barcode databases, consulted in order.
    pub fn with_barcode_providers(mut self, providers: Vec<Arc<dyn BarcodeProvider>>) -> Self {
        self.barcode = providers;
        self
    }

    pub async fn gather(&self, item: &CatalogItem) -> GatheredData {
        let query = build_text_query(&item.title, &item.vendor, item.first_sku(), item.first_barcode());
        let results = self.search_text(&query).await;
        let barcode = match item.first_barcode() {
            Some(code) => self.lookup_barcode(code).await,
            None => None,
        };
        let mut data = GatheredData {
            query,
            results,
            barcode,
            ..Default::default()
        };
        if item.images.len() < IMAGE_SEARCH_BELOW {
            let image_query = build_image_query(&item.title, &item.vendor, item.first_sku());
            data.images = self.search_images(&image_query).await;
            data.image_query = Some(image_query);
        }
        data
    }

    pub async fn search_text(&self, query: &str) -> Vec<SearchResult> {
        if query.is_empty() {
            return Vec::new();
        }
        let key = cache::cache_key("search", query);
        if let Some(hit) = cache::get_json::<Vec<SearchResult>>(self.cache.as_ref(), &key).await
            && !hit.is_empty()
        {
            debug!(target = "smartenrich.search", query = query, "search_cache_hit");
            return hit;
        }
        for provider in &self.text {
            let family = provider.family();
            if self.breakers.is_open(family) {
                info!(target = "smartenrich.search", family = family, "circuit_open_skip");
                metrics::provider_call(family, "circuit_open");
                continue;
            }
            match provider.search(query).await {
                Ok(results) if !results.is_empty() => {
                    metrics::provider_call(family, "ok");
                    cache::set_json(self.cache.as_ref(), &key, &results, SEARCH_TTL).await;
                    return results;
                }
                Ok(_) => metrics::provider_call(family, "empty"),
                Err(err) => self.absorb(family, &err),
            }
        }
        Vec::new()
    }

    pub async fn search_images(&self, query: &str) -> Vec<ImageResult> {
        let Some(provider) = &self.image else {
            return Vec::new();
        };
        let key = cache::cache_key("images", query);
        if let Some(hit) = cache::get_json::<Vec<ImageResult>>(self.cache.as_ref(), &key).await {
            return hit;
        }
        let family = provider.family();
        if self.breakers.is_open(family) {
            info!(target = "smartenrich.images", family = family, "circuit_open_skip");
            metrics::provider_call(family, "circuit_open");
            return Vec::new();
        }
        match provider.search_images(query).await {
            Ok(images) => {
                metrics::provider_call(family, "ok");
                let filtered: Vec<ImageResult> = images.into_iter().filter(passes_quality).collect();
                if !filtered.is_empty() {
                    cache::set_json(self.cache.as_ref(), &key, &filtered, IMAGE_TTL).await;
                }
                filtered
            }
            Err(err) => {
                self.absorb(family, &err);
                Vec::new()
            }
        }
    }

    pub async fn lookup_barcode(&self, code: &str) -> Option<BarcodeData> {
        let code = code.trim();
        if code.is_empty() || self.barcode.is_empty() {
            return None;
        }
        let key = cache::cache_key("barcode", code);
        if let Some(hit) = cache::get_json::<BarcodeData>(self.cache.as_ref(), &key).await {
            debug!(target = "smartenrich.barcode", code = code, "barcode_cache_hit");
            return Some(hit);
        }
        for provider in &self.barcode {
            let family = provider.family();
            if self.breakers.is_open(family) {
                info!(target = "smartenrich.barcode", family = family, "circuit_open_skip");
                metrics::provider_call(family, "circuit_open");
                continue;
            }
            match provider.lookup(code).await {
                Ok(Some(data)) => {
                    metrics::provider_call(family, "ok");
                    cache::set_json(self.cache.as_ref(), &key, &data, BARCODE_TTL).await;
                    return Some(data);
                }
                Ok(None) => metrics::provider_call(family, "empty"),
                Err(err) => self.absorb(family, &err),
            }
        }
        None
    }

    fn absorb(&self, family: &'static str, err: &ProviderError) {
        metrics::provider_call(family, err.outcome());
        match err {
            ProviderError::NotConfigured => {}
            ProviderError::QuotaExhausted(_) => self.breakers.trip(family),
            other => warn!(target = "smartenrich.search", family = family, error = %other, "provider_failed"),
        }
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub struct ScriptedSearch {
        pub family: &'static str,
        pub calls: AtomicUsize,
        pub respond: Box<dyn Fn() -> Result<Vec<SearchResult>, ProviderError> + Send + Sync>,
    }

    impl ScriptedSearch {
        pub fn ok(family: &'static str, titles: &[&str]) -> Arc<Self> {
            let results: Vec<SearchResult> = titles
                .iter()
                .map(|t| SearchResult {
                    title: t.to_string(),
                    snippet: format!("{t} snippet"),
                    link: format!("https://example.com/{t}"),
                })
                .collect();
            Arc::new(Self {
                family,
                calls: AtomicUsize::new(0),
                respond: Box::new(move || Ok(results.clone())),
            })
        }

        pub fn failing(family: &'static str, make: fn() -> ProviderError) -> Arc<Self> {
            Arc::new(Self {
                family,
                calls: AtomicUsize::new(0),
                respond: Box::new(move || Err(make())),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SearchProvider for ScriptedSearch {
        fn family(&self) -> &'static str {
            self.family
        }

        async fn search(&self, _query: &str) -> Result<Vec<SearchResult>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.respond)()
        }
    }

    pub struct ScriptedBarcode {
        pub family: &'static str,
        pub calls: AtomicUsize,
        pub respond: Box<dyn Fn() -> Result<Option<BarcodeData>, ProviderError> + Send + Sync>,
    }

    impl ScriptedBarcode {
        pub fn knows(family: &'static str, name: &str) -> Arc<Self> {
            let data = BarcodeData {
                name: name.to_string(),
                brand: "TP-Link".into(),
                source: family.to_string(),
                ..Default::default()
            };
            Arc::new(Self {
                family,
                calls: AtomicUsize::new(0),
                respond: Box::new(move || Ok(Some(data.clone()))),
            })
        }

        pub fn unknown(family: &'static str) -> Arc<Self> {
            Arc::new(Self {
                family,
                calls: AtomicUsize::new(0),
                respond: Box::new(|| Ok(None)),
            })
        }

        pub fn failing(family: &'static str, make: fn() -> ProviderError) -> Arc<Self> {
            Arc::new(Self {
                family,
                calls: AtomicUsize::new(0),
                respond: Box::new(move || Err(make())),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BarcodeProvider for ScriptedBarcode {
        fn family(&self) -> &'static str {
            self.family
        }

        async fn lookup(&self, _code: &str) -> Result<Option<BarcodeData>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.respond)()
        }
    }

    pub struct ScriptedImages {
        pub images: Vec<ImageResult>,
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageSearchProvider for ScriptedImages {
        fn family(&self) -> &'static str {
            "google"
        }

        async fn search_images(&self, _query: &str) -> Result<Vec<ImageResult>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.images.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;
    use crate::{
        clock::manual::ManualClock,
        enrichment::cache::MemoryCache,
        models::{ItemImage, ItemStatus, Variant},
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gatherer(
        text: Vec<Arc<dyn SearchProvider>>,
        image: Option<Arc<dyn ImageSearchProvider>>,
        clock: &ManualClock,
    ) -> Gatherer {
        Gatherer::new(
            text,
            image,
            Arc::new(MemoryCache::new()),
            CircuitBreakers::new(Arc::new(clock.clone())),
        )
    }

    #[test]
    fn title_cleanup_strips_brackets_and_noise_prefix() {
        assert_eq!(clean_title("[OPEN BOX] Monitor LG 27\""), "Monitor LG 27\"");
        assert_eq!(clean_title("(Demo) Open Box - Teclado  Logitech K380"), "Teclado Logitech K380");
        assert_eq!(clean_title("Reacondicionado: iPhone 12"), "iPhone 12");
        assert_eq!(clean_title("Mouse Razer"), "Mouse Razer");
    }

    #[test]
    fn query_prefers_codes_and_falls_back_to_vendor() {
        assert_eq!(
            build_text_query("[NEW] Laptop IdeaPad 3", "Lenovo", Some("82H801"), None),
            "Laptop IdeaPad 3 82H801 ficha tecnica especificaciones"
        );
        assert_eq!(
            build_text_query("Laptop IdeaPad 3", "Lenovo", None, Some("PRV-9")),
            "Laptop IdeaPad 3 PRV-9 ficha tecnica especificaciones"
        );
        assert_eq!(
            build_text_query("Laptop IdeaPad 3", "Lenovo", None, None),
            "Laptop IdeaPad 3 Lenovo ficha tecnica especificaciones"
        );
        assert_eq!(build_text_query("  ", "", None, None), "");
    }

    #[tokio::test]
    async fn first_non_empty_provider_wins_and_is_cached() {
        let clock = ManualClock::at(0);
        let empty = ScriptedSearch::ok("google", &[]);
        let serper = ScriptedSearch::ok("serper", &["hit"]);
        let g = gatherer(
            vec![empty.clone() as Arc<dyn SearchProvider>, serper.clone()],
            None,
            &clock,
        );

        let first = g.search_text("query").await;
        assert_eq!(first.len(), 1);
        let second = g.search_text("query").await;
        assert_eq!(second, first);
        assert_eq!(empty.calls(), 1);
        assert_eq!(serper.calls(), 1);
    }

    #[tokio::test]
    async fn failures_degrade_to_empty() {
        let clock = ManualClock::at(0);
        let broken = ScriptedSearch::failing("google", || ProviderError::Transport("reset".into()));
        let g = gatherer(vec![broken.clone() as Arc<dyn SearchProvider>], None, &clock);
        assert!(g.search_text("q").await.is_empty());
        assert!(g.search_text("q").await.is_empty());
        assert_eq!(broken.calls(), 2);
    }

    #[tokio::test]
    async fn quota_response_disables_provider_for_an_hour() {
        let clock = ManualClock::at(50_000);
        let limited = ScriptedSearch::failing("google", || ProviderError::QuotaExhausted(429));
        let g = gatherer(vec![limited.clone() as Arc<dyn SearchProvider>], None, &clock);

        assert!(g.search_text("q1").await.is_empty());
        assert_eq!(limited.calls(), 1);

        clock.advance(1_800);
        assert!(g.search_text("q2").await.is_empty());
        clock.advance(1_799);
        assert!(g.search_text("q3").await.is_empty());
        assert_eq!(limited.calls(), 1);

        clock.advance(1);
        assert!(g.search_text("q4").await.is_empty());
        assert_eq!(limited.calls(), 2);
    }

    #[tokio::test]
    async fn barcode_falls_back_to_second_database_and_is_cached() {
        let clock = ManualClock::at(0);
        let go_upc = ScriptedBarcode::unknown("go-upc");
        let upcitemdb = ScriptedBarcode::knows("upcitemdb", "Archer C6");
        let g = gatherer(vec![], None, &clock)
            .with_barcode_providers(vec![go_upc.clone() as Arc<dyn BarcodeProvider>, upcitemdb.clone()]);

        let found = g.lookup_barcode(" 0840030701191 ").await.expect("found");
        assert_eq!(found.name, "Archer C6");
        assert_eq!(found.source, "upcitemdb");
        assert_eq!(g.lookup_barcode("0840030701191").await, Some(found));
        assert_eq!((go_upc.calls(), upcitemdb.calls()), (1, 1));
    }

    #[tokio::test]
    async fn barcode_quota_trips_only_that_database() {
        let clock = ManualClock::at(0);
        let go_upc = ScriptedBarcode::failing("go-upc", || ProviderError::QuotaExhausted(429));
        let upcitemdb = ScriptedBarcode::unknown("upcitemdb");
        let g = gatherer(vec![], None, &clock)
            .with_barcode_providers(vec![go_upc.clone() as Arc<dyn BarcodeProvider>, upcitemdb.clone()]);

        assert_eq!(g.lookup_barcode("111").await, None);
        assert_eq!(g.lookup_barcode("222").await, None);
        assert_eq!((go_upc.calls(), upcitemdb.calls()), (1, 2));
    }

    #[tokio::test]
    async fn gather_looks_up_the_first_variant_barcode() {
        let clock = ManualClock::at(0);
        let go_upc = ScriptedBarcode::knows("go-upc", "Archer C6");
        let g = gatherer(vec![], None, &clock).with_barcode_providers(vec![go_upc.clone() as Arc<dyn BarcodeProvider>]);
        let mut item = CatalogItem {
            id: "1".into(),
            title: "Router".into(),
            images: (0..3).map(|i| ItemImage { url: format!("https://cdn/{i}.jpg"), ..Default::default() }).collect(),
            variants: vec![Variant { id: "v".into(), sku: None, barcode: Some("0840030701191".into()) }],
            ..Default::default()
        };
        let data = g.gather(&item).await;
        assert_eq!(data.barcode.map(|b| b.name).as_deref(), Some("Archer C6"));

        item.variants[0].barcode = None;
        assert!(g.gather(&item).await.barcode.is_none());
        assert_eq!(go_upc.calls(), 1);
    }

    #[tokio::test]
    async fn image_search_only_for_sparse_items_and_filters_quality() {
        let clock = ManualClock::at(0);
        let images = Arc::new(ScriptedImages {
            images: vec![
                ImageResult { url: "https://a/big.jpg".into(), width: 1600, height: 900, title: String::new() },
                ImageResult { url: "https://a/small.jpg".into(), width: 400, height: 400, title: String::new() },
                ImageResult { url: "https://a/unknown.jpg".into(), width: 0, height: 0, title: String::new() },
            ],
            calls: AtomicUsize::new(0),
        });
        let g = gatherer(vec![], Some(images.clone() as Arc<dyn ImageSearchProvider>), &clock);

        let mut item = CatalogItem {
            id: "1".into(),
            title: "Router TP-Link Archer C6".into(),
            vendor: "TP-Link".into(),
            status: ItemStatus::Active,
            variants: vec![Variant { id: "v".into(), sku: Some("C6".into()), barcode: None }],
            ..Default::default()
        };
        let data = g.gather(&item).await;
        let urls: Vec<_> = data.images.iter().map(|i| i.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a/big.jpg", "https://a/unknown.jpg"]);
        assert_eq!(images.calls.load(Ordering::SeqCst), 1);

        item.images = (0..3)
            .map(|i| ItemImage { url: format!("https://cdn/{i}.jpg"), ..Default::default() })
            .collect();
        let data = g.gather(&item).await;
        assert!(data.images.is_empty());
        assert!(data.image_query.is_none());
        assert_eq!(images.calls.load(Ordering::SeqCst), 1);
    }
}
