use once_cell::sync::Lazy;
use std::env;

pub static API_VERSION: Lazy<String> =
    Lazy::new(|| env::var("SHOPIFY_API_VERSION").unwrap_or_else(|_| "2025-01".to_string()));

/// Page size for the active-item listing.
pub static PAGE_SIZE: Lazy<u32> = Lazy::new(|| {
    env::var("SHOPIFY_PAGE_SIZE")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| (1..=250).contains(v))
        .unwrap_or(50)
});

pub fn graphql_endpoint(shop: &str) -> String {
    let host = shop
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    format!("https://{host}/admin/api/{}/graphql.json", *API_VERSION)
}
