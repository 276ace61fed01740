use crate::config::env_parse;
use reqwest::Client;
use std::time::Duration;

const USER_AGENT: &str = concat!("smartenrich-rs/", env!("CARGO_PKG_VERSION"));

fn client_with(timeout_secs: u64, connect_secs: u64) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(connect_secs))
        .user_agent(USER_AGENT)
        .gzip(true)
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn connect_secs() -> u64 {
    env_parse::<u64>("HTTP_CONNECT_TIMEOUT_SECS")
        .filter(|v| *v > 0)
        .unwrap_or(5)
}

/// Catalog and search calls.
pub fn build_client() -> Client {
    let timeout = env_parse::<u64>("HTTP_TIMEOUT_SECS")
        .filter(|v| *v > 0)
        .unwrap_or(15);
    client_with(timeout, connect_secs())
}

/// Generative calls; a full proposal can take well over the catalog deadline.
pub fn build_llm_client() -> Client {
    let timeout = env_parse::<u64>("LLM_TIMEOUT_SECS")
        .filter(|v| *v > 0)
        .unwrap_or(30);
    client_with(timeout, connect_secs())
}
