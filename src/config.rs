use once_cell::sync::Lazy;
use serde::Deserialize;
use std::{env, time::Duration};

#[derive(Debug, Clone, Deserialize)]
pub struct MetafieldChecklist {
    pub namespace: String,
    pub fields: Vec<MetafieldSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetafieldSpec {
    pub key: String,
    #[serde(default)]
    pub label: String,
    #[serde(default = "default_metafield_type", rename = "type")]
    pub value_type: String,
}

fn default_metafield_type() -> String {
    "single_line_text_field".into()
}

impl MetafieldChecklist {
    /// Fully qualified `namespace.key` names the model is allowed to emit.
    pub fn qualified_keys(&self) -> impl Iterator<Item = String> + '_ {
        self.fields
            .iter()
            .map(|f| format!("{}.{}", self.namespace, f.key))
    }

    pub fn lookup(&self, key: &str) -> Option<&MetafieldSpec> {
        self.fields.iter().find(|f| f.key == key)
    }

    pub fn is_allowed(&self, qualified: &str) -> bool {
        match qualified.split_once('.') {
            Some((ns, key)) => ns == self.namespace && self.lookup(key).is_some(),
            None => false,
        }
    }
}

pub static METAFIELDS: Lazy<MetafieldChecklist> = Lazy::new(|| {
    serde_yaml::from_str(include_str!("../config/metafields.yaml")).unwrap_or_else(|err| {
        tracing::error!(target = "smartenrich.config", error = %err, "metafield_checklist_invalid");
        MetafieldChecklist {
            namespace: crate::models::CUSTOM_NAMESPACE.into(),
            fields: Vec::new(),
        }
    })
});

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub port: u16,
    pub request_max_bytes: usize,
    pub worker: WorkerConfig,
    pub queue: QueueConfig,
    pub ai_calls_per_minute: u32,
    pub trigger_limit_max: usize,
    pub trigger_limit_window: Duration,
    pub cron_enabled: bool,
    pub cron_schedule: String,
    pub default_shop: Option<String>,
    pub search_providers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub force_auto_apply_automated: bool,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub lock_secs: i64,
    pub max_attempts: i64,
    pub backoff_ms: u64,
    pub poll: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lock_secs: 600,
            max_attempts: 3,
            backoff_ms: 5000,
            poll: Duration::from_millis(1000),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "sqlite://smartenrich.db?mode=rwc".into()),
            redis_url: env::var("REDIS_URL").ok().filter(|v| !v.trim().is_empty()),
            port: env_parse("PORT").unwrap_or(8000),
            request_max_bytes: env_parse::<usize>("REQUEST_MAX_BYTES")
                .filter(|v| *v > 0)
                .unwrap_or(256 * 1024),
            worker: WorkerConfig {
                concurrency: env_parse::<usize>("WORKER_CONCURRENCY")
                    .filter(|v| *v > 0)
                    .unwrap_or(3),
                force_auto_apply_automated: env_bool_or("FORCE_AUTO_APPLY_AUTOMATED", true),
            },
            queue: QueueConfig {
                lock_secs: env_parse::<i64>("JOB_LOCK_SECS")
                    .filter(|v| *v > 0)
                    .unwrap_or(600),
                max_attempts: env_parse::<i64>("JOB_MAX_ATTEMPTS")
                    .filter(|v| *v > 0)
                    .unwrap_or(3),
                backoff_ms: env_parse("JOB_BACKOFF_MS").unwrap_or(5000),
                poll: Duration::from_millis(
                    env_parse::<u64>("QUEUE_POLL_MS")
                        .filter(|v| *v > 0)
                        .unwrap_or(1000),
                ),
            },
            ai_calls_per_minute: env_parse::<u32>("AI_CALLS_PER_MINUTE")
                .filter(|v| *v > 0)
                .unwrap_or(10),
            trigger_limit_max: env_parse::<usize>("TRIGGER_LIMIT_MAX")
                .filter(|v| *v > 0)
                .unwrap_or(2),
            trigger_limit_window: Duration::from_secs(
                env_parse::<u64>("TRIGGER_LIMIT_WINDOW_SECS")
                    .filter(|v| *v > 0)
                    .unwrap_or(300),
            ),
            cron_enabled: env_bool_or("CRON_ENABLED", true),
            cron_schedule: env::var("CRON_SCHEDULE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "0 2 * * *".into()),
            default_shop: env::var("DEFAULT_SHOP").ok().filter(|v| !v.trim().is_empty()),
            search_providers: env::var("SEARCH_PROVIDERS")
                .ok()
                .map(|v| parse_list(&v))
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| vec!["google".into(), "serper".into()]),
        }
    }
}

pub fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

pub fn env_bool_or(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => parse_bool(&value).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checklist_has_fifteen_custom_keys() {
        assert_eq!(METAFIELDS.namespace, "custom");
        assert_eq!(METAFIELDS.fields.len(), 15);
        assert!(METAFIELDS.is_allowed("custom.peso"));
        assert!(!METAFIELDS.is_allowed("custom.precio"));
        assert!(!METAFIELDS.is_allowed("specs.peso"));
        assert_eq!(
            METAFIELDS.lookup("peso").map(|f| f.value_type.as_str()),
            Some("number_decimal")
        );
        assert_eq!(
            METAFIELDS.lookup("color").map(|f| f.value_type.as_str()),
            Some("single_line_text_field")
        );
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn provider_list_is_normalized() {
        assert_eq!(parse_list(" Serper, ,google "), vec!["serper", "google"]);
    }
}
