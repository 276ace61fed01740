use crate::{
    config::{METAFIELDS, MetafieldChecklist},
    models::{CatalogItem, EnrichmentProposal, Metafield},
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

pub const DEFAULT_ENRICH_THRESHOLD: i64 = 80;

const W_DESCRIPTION: i64 = 20;
const W_IMAGES: i64 = 15;
const W_PRODUCT_TYPE: i64 = 5;
const W_CATEGORY: i64 = 5;
const W_VENDOR: i64 = 3;
const W_TAGS: i64 = 7;
const W_SKU: i64 = 5;
const W_SEO_TITLE: i64 = 8;
const W_SEO_DESCRIPTION: i64 = 7;
const W_METAFIELDS: i64 = 25;

const DESCRIPTION_MIN_CHARS: usize = 50;
const DESCRIPTION_FULL_CHARS: usize = 300;
const MIN_TAGS: usize = 3;
const MAX_SCORED_IMAGES: usize = 5;

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid tag regex"));

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CompletenessAnalysis {
    pub has_description: bool,
    pub description_length: usize,
    pub image_count: usize,
    pub images_have_alt_text: bool,
    pub has_product_type: bool,
    pub has_category: bool,
    pub has_vendor: bool,
    pub has_tags: bool,
    pub has_sku: bool,
    pub has_barcode: bool,
    pub has_seo_title: bool,
    pub has_seo_description: bool,
    pub metafields_filled: usize,
    pub metafields_total: usize,
    pub score: i64,
    pub fields_to_enrich: Vec<&'static str>,
}

impl CompletenessAnalysis {
    pub fn needs(&self, field: &str) -> bool {
        self.fields_to_enrich.contains(&field)
    }
}

pub fn strip_html(html: &str) -> String {
    TAG_RE.replace_all(html, "").trim().to_string()
}

fn present(value: Option<&str>) -> bool {
    value.map(str::trim).is_some_and(|v| !v.is_empty())
}

pub fn analyze(item: &CatalogItem) -> CompletenessAnalysis {
    analyze_with(item, &METAFIELDS)
}

pub fn analyze_with(item: &CatalogItem, checklist: &MetafieldChecklist) -> CompletenessAnalysis {
    let mut fields_to_enrich = Vec::new();
    let mut score = 0i64;

    let description_length = strip_html(&item.description_html).chars().count();
    let has_description = description_length > DESCRIPTION_MIN_CHARS;
    if has_description {
        score += if description_length >= DESCRIPTION_FULL_CHARS {
            W_DESCRIPTION
        } else {
            ((description_length as f64 / DESCRIPTION_FULL_CHARS as f64) * W_DESCRIPTION as f64)
                .round() as i64
        };
    } else {
        fields_to_enrich.push("description");
    }

    let image_count = item.images.len();
    let images_have_alt_text =
        image_count > 0 && item.images.iter().all(|img| present(img.alt_text.as_deref()));
    if image_count > 0 {
        let quantity = image_count.min(MAX_SCORED_IMAGES) as i64 * 2;
        let alt = if images_have_alt_text { 5 } else { 0 };
        score += (quantity + alt).min(W_IMAGES);
        if !images_have_alt_text {
            fields_to_enrich.push("imageAltText");
        }
    } else {
        fields_to_enrich.push("images");
    }

    let has_product_type = present(Some(&item.product_type));
    if has_product_type {
        score += W_PRODUCT_TYPE;
    } else {
        fields_to_enrich.push("productType");
    }

    let has_category = present(item.category.as_deref());
    if has_category {
        score += W_CATEGORY;
    } else {
        fields_to_enrich.push("category");
    }

    let has_vendor = present(Some(&item.vendor));
    if has_vendor {
        score += W_VENDOR;
    } else {
        fields_to_enrich.push("vendor");
    }

    let has_tags = item.tags.len() >= MIN_TAGS;
    if has_tags {
        score += W_TAGS;
    } else {
        fields_to_enrich.push("tags");
    }

    // SKU is scored, barcode only feeds the search query.
    let has_sku = item.first_sku().is_some();
    if has_sku {
        score += W_SKU;
    }
    let has_barcode = item.first_barcode().is_some();

    let has_seo_title = present(item.seo.title.as_deref());
    if has_seo_title {
        score += W_SEO_TITLE;
    } else {
        fields_to_enrich.push("seoTitle");
    }

    let has_seo_description = present(item.seo.description.as_deref());
    if has_seo_description {
        score += W_SEO_DESCRIPTION;
    } else {
        fields_to_enrich.push("seoDescription");
    }

    let metafields_total = checklist.fields.len();
    let metafields_filled = checklist
        .fields
        .iter()
        .filter(|spec| {
            item.metafields.iter().any(|m| {
                m.namespace == checklist.namespace && m.key == spec.key && present(Some(&m.value))
            })
        })
        .count();
    if metafields_total > 0 {
        score += ((metafields_filled as f64 / metafields_total as f64) * W_METAFIELDS as f64)
            .round() as i64;
    }
    if metafields_filled < metafields_total {
        fields_to_enrich.push("metafields");
    }

    CompletenessAnalysis {
        has_description,
        description_length,
        image_count,
        images_have_alt_text,
        has_product_type,
        has_category,
        has_vendor,
        has_tags,
        has_sku,
        has_barcode,
        has_seo_title,
        has_seo_description,
        metafields_filled,
        metafields_total,
        score: score.clamp(0, 100),
        fields_to_enrich,
    }
}

pub fn should_enrich(analysis: &CompletenessAnalysis, threshold: i64) -> bool {
    analysis.score < threshold
}

/// Item as it would look after `proposal` is written, used for `score_after`.
/// Mirrors what the updater sends: tags are merged, never replaced.
pub fn project(
    item: &CatalogItem,
    proposal: &EnrichmentProposal,
    new_images: &[String],
) -> CatalogItem {
    let mut next = item.clone();
    if !proposal.description_html.trim().is_empty() {
        next.description_html = proposal.description_html.clone();
    }
    if !proposal.product_type.trim().is_empty() {
        next.product_type = proposal.product_type.clone();
    }
    next.tags = crate::enrichment::updater::merge_tags(&item.tags, &proposal.tags);
    if !proposal.seo_title.trim().is_empty() {
        next.seo.title = Some(proposal.seo_title.clone());
    }
    if !proposal.seo_description.trim().is_empty() {
        next.seo.description = Some(proposal.seo_description.clone());
    }
    for (qualified, value) in &proposal.metafields {
        let Some(value) = value else { continue };
        let (namespace, key) = qualified
            .split_once('.')
            .unwrap_or((crate::models::CUSTOM_NAMESPACE, qualified.as_str()));
        match next
            .metafields
            .iter_mut()
            .find(|m| m.namespace == namespace && m.key == key)
        {
            Some(existing) => existing.value = value.clone(),
            None => next.metafields.push(Metafield {
                namespace: namespace.to_string(),
                key: key.to_string(),
                value: value.clone(),
            }),
        }
    }
    for (i, url) in new_images.iter().enumerate() {
        next.images.push(crate::models::ItemImage {
            url: url.clone(),
            alt_text: Some(crate::enrichment::updater::alt_text_for(proposal, i)),
            width: None,
            height: None,
        });
    }
    next
}
