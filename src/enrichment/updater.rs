use crate::{
    catalog::{CatalogApi, CatalogError, ItemUpdate, MediaInput, MetafieldInput, MutationOutcome, SeoInput},
    config::{METAFIELDS, MetafieldChecklist},
    models::{CUSTOM_NAMESPACE, EnrichmentProposal},
};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashSet;
use tracing::{info, warn};

const ALLOWED_TAGS: &[&str] = &[
    "p", "br", "strong", "em", "ul", "ol", "li", "h2", "h3", "h4", "span", "div", "table", "tr", "td",
    "th", "thead", "tbody",
];

const DECIMAL_TYPE: &str = "number_decimal";

static DROPPED_BLOCKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<!--.*?-->|<\s*(script|style)\b[^>]*>.*?<\s*/\s*(?:script|style)\s*>")
        .expect("valid dropped-block regex")
});

static TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<\s*(/?)\s*([a-zA-Z][a-zA-Z0-9]*)([^>]*)>").expect("valid tag regex"));

static CLASS_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bclass\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid class regex")
});

static DECIMAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-?\d+(?:[.,]\d+)?").expect("valid decimal regex"));

/// Reduces markup to the tag allowlist. Only `class` survives, and only on
/// `span` and `div`; text inside dropped tags is kept.
pub fn sanitize_html(html: &str) -> String {
    let without_blocks = DROPPED_BLOCKS.replace_all(html, "");
    TAG.replace_all(&without_blocks, |caps: &Captures| {
        let closing = !caps[1].is_empty();
        let name = caps[2].to_ascii_lowercase();
        if !ALLOWED_TAGS.contains(&name.as_str()) {
            return String::new();
        }
        if closing {
            return format!("</{name}>");
        }
        let class = (name == "span" || name == "div")
            .then(|| CLASS_ATTR.captures(&caps[3]))
            .flatten()
            .and_then(|c| c.get(1).or_else(|| c.get(2)))
            .map(|m| m.as_str().replace('"', ""));
        match class {
            Some(class) => format!("<{name} class=\"{class}\">"),
            None => format!("<{name}>"),
        }
    })
    .into_owned()
}

/// Existing tags are kept verbatim; proposed tags are appended only when no
/// case-insensitive match exists yet.
pub fn merge_tags(existing: &[String], proposed: &[String]) -> Vec<String> {
    let mut seen: HashSet<String> = existing.iter().map(|t| t.to_lowercase()).collect();
    let mut merged = existing.to_vec();
    for tag in proposed {
        let trimmed = tag.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_lowercase()) {
            merged.push(trimmed.to_string());
        }
    }
    merged
}

pub fn alt_text_for(proposal: &EnrichmentProposal, index: usize) -> String {
    proposal
        .image_analysis
        .suggested_alt_texts
        .get(index)
        .map(|alt| alt.trim())
        .filter(|alt| !alt.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            let kind = proposal.product_type.trim();
            let kind = if kind.is_empty() { "Producto" } else { kind };
            format!("{kind} - imagen {}", index + 1)
        })
}

/// Pulls the first decimal out of values like `"1,5 kg"` or `"aprox. 2.3"`.
pub fn parse_decimal(raw: &str) -> Option<String> {
    let found = DECIMAL.find(raw)?;
    let normalized = found.as_str().replace(',', ".");
    normalized.parse::<f64>().ok().filter(|v| v.is_finite())?;
    Some(normalized)
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct UpdateResult {
    pub product_updated: bool,
    pub metafields_updated: usize,
    pub images_added: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl UpdateResult {
    pub fn succeeded(&self) -> bool {
        self.product_updated && self.errors.is_empty()
    }
}

/// Outcome of a batch write that may have fallen back to one call per entry.
struct BatchOutcome {
    written: usize,
    failures: Vec<String>,
}

fn describe(result: Result<MutationOutcome, CatalogError>) -> Result<(), Vec<String>> {
    match result {
        Ok(outcome) if outcome.is_ok() => Ok(()),
        Ok(outcome) => Err(outcome.user_errors),
        Err(err) => Err(vec![err.to_string()]),
    }
}

pub fn metafield_inputs(
    item_id: &str,
    proposal: &EnrichmentProposal,
    checklist: &MetafieldChecklist,
    warnings: &mut Vec<String>,
) -> Vec<MetafieldInput> {
    let mut inputs = Vec::new();
    for (qualified, value) in &proposal.metafields {
        let Some(value) = value else { continue };
        let (namespace, key) = qualified
            .split_once('.')
            .unwrap_or((CUSTOM_NAMESPACE, qualified.as_str()));
        let value_type = checklist
            .lookup(key)
            .map(|spec| spec.value_type.clone())
            .unwrap_or_else(|| "single_line_text_field".to_string());
        let value = if value_type == DECIMAL_TYPE {
            match parse_decimal(value) {
                Some(v) => v,
                None => {
                    warn!(
                        target = "smartenrich.updater",
                        item_id = item_id,
                        key = key,
                        value = value.as_str(),
                        "metafield_decimal_dropped"
                    );
                    warnings.push(format!("{qualified}: \"{value}\" is not a number, skipped"));
                    continue;
                }
            }
        } else {
            value.clone()
        };
        inputs.push(MetafieldInput {
            owner_id: item_id.to_string(),
            namespace: namespace.to_string(),
            key: key.to_string(),
            value,
            value_type,
        });
    }
    inputs
}

/// Writes a validated proposal to the catalog.
pub async fn apply(
    catalog: &dyn CatalogApi,
    item_id: &str,
    proposal: &EnrichmentProposal,
    existing_tags: &[String],
    image_urls: &[String],
) -> UpdateResult {
    let mut result = UpdateResult::default();

    let update = product_update(item_id, proposal, existing_tags);
    match describe(catalog.update_item(&update).await) {
        Ok(()) => result.product_updated = true,
        Err(errors) => result.errors.extend(errors),
    }

    let inputs = metafield_inputs(item_id, proposal, &METAFIELDS, &mut result.warnings);
    if !inputs.is_empty() {
        let outcome = write_metafields(catalog, &inputs).await;
        result.metafields_updated = outcome.written;
        settle("metafields", outcome, &mut result);
    }

    if !image_urls.is_empty() {
        let media: Vec<MediaInput> = image_urls
            .iter()
            .enumerate()
            .map(|(i, url)| MediaInput::image(url.clone(), alt_text_for(proposal, i)))
            .collect();
        let outcome = write_media(catalog, item_id, &media).await;
        result.images_added = outcome.written;
        settle("images", outcome, &mut result);
    }

    info!(
        target = "smartenrich.updater",
        item_id = item_id,
        product_updated = result.product_updated,
        metafields = result.metafields_updated,
        images = result.images_added,
        errors = result.errors.len(),
        "enrichment_applied"
    );
    result
}

// A stage that wrote at least one entry counts as a success; the rejected
// entries become warnings.
fn settle(stage: &str, outcome: BatchOutcome, result: &mut UpdateResult) {
    if outcome.failures.is_empty() {
        return;
    }
    if outcome.written > 0 {
        result
            .warnings
            .extend(outcome.failures.into_iter().map(|f| format!("{stage}: {f}")));
    } else {
        result.errors.extend(outcome.failures);
    }
}

fn product_update(item_id: &str, proposal: &EnrichmentProposal, existing_tags: &[String]) -> ItemUpdate {
    let non_empty = |value: &str| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    };
    let description = sanitize_html(&proposal.description_html);
    let seo_title = non_empty(&proposal.seo_title);
    let seo_description = non_empty(&proposal.seo_description);
    ItemUpdate {
        id: item_id.to_string(),
        description_html: non_empty(&description),
        product_type: non_empty(&proposal.product_type),
        tags: merge_tags(existing_tags, &proposal.tags),
        seo: (seo_title.is_some() || seo_description.is_some()).then_some(SeoInput {
            title: seo_title,
            description: seo_description,
        }),
    }
}

async fn write_metafields(catalog: &dyn CatalogApi, inputs: &[MetafieldInput]) -> BatchOutcome {
    let batch_errors = match describe(catalog.set_metafields(inputs).await) {
        Ok(()) => {
            return BatchOutcome {
                written: inputs.len(),
                failures: Vec::new(),
            };
        }
        Err(errors) => errors,
    };
    if inputs.len() == 1 {
        return BatchOutcome {
            written: 0,
            failures: batch_errors,
        };
    }
    warn!(
        target = "smartenrich.updater",
        count = inputs.len(),
        errors = ?batch_errors,
        "metafield_batch_failed_retrying_individually"
    );
    let mut outcome = BatchOutcome {
        written: 0,
        failures: Vec::new(),
    };
    for input in inputs {
        match describe(catalog.set_metafields(std::slice::from_ref(input)).await) {
            Ok(()) => outcome.written += 1,
            Err(errors) => outcome
                .failures
                .extend(errors.into_iter().map(|e| format!("{}.{}: {e}", input.namespace, input.key))),
        }
    }
    outcome
}

async fn write_media(catalog: &dyn CatalogApi, item_id: &str, media: &[MediaInput]) -> BatchOutcome {
    let batch_errors = match describe(catalog.create_media(item_id, media).await) {
        Ok(()) => {
            return BatchOutcome {
                written: media.len(),
                failures: Vec::new(),
            };
        }
        Err(errors) => errors,
    };
    if media.len() == 1 {
        return BatchOutcome {
            written: 0,
            failures: batch_errors,
        };
    }
    warn!(
        target = "smartenrich.updater",
        count = media.len(),
        errors = ?batch_errors,
        "media_batch_failed_retrying_individually"
    );
    let mut outcome = BatchOutcome {
        written: 0,
        failures: Vec::new(),
    };
    for entry in media {
        match describe(catalog.create_media(item_id, std::slice::from_ref(entry)).await) {
            Ok(()) => outcome.written += 1,
            Err(errors) => outcome.failures.extend(errors),
        }
    }
    outcome
}

/// What was written, for the log's `applied_changes`.
pub fn applied_changes(
    proposal: &EnrichmentProposal,
    existing_tags: &[String],
    image_urls: &[String],
    result: &UpdateResult,
) -> Value {
    json!({
        "description_html": sanitize_html(&proposal.description_html),
        "product_type": proposal.product_type,
        "tags": merge_tags(existing_tags, &proposal.tags),
        "seo_title": proposal.seo_title,
        "seo_description": proposal.seo_description,
        "metafields": proposal.metafields,
        "images": image_urls,
        "result": result,
    })
}
