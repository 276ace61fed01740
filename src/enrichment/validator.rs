use crate::{config::METAFIELDS, models::EnrichmentProposal};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

pub const SEO_TITLE_MAX: usize = 70;
pub const SEO_DESCRIPTION_MAX: usize = 160;

// Word boundaries keep "Costa Rica" and "costumbre" out of the net.
static FORBIDDEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bprecios?\b|\bcostos?\b|\bcolones\b|\bd[oó]lares\b|\busd\b|\bcost\b|\bprices?\b|[$€£₡]\s*\d",
    )
    .expect("valid forbidden-term regex")
});

static SCRIPT_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<\s*script\b").expect("valid script regex"));

static UNSAFE_MARKUP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<\s*(?:style|iframe|object|embed)\b|\bon[a-z]+\s*=|javascript\s*:"#)
        .expect("valid unsafe markup regex")
});

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ValidationReport {
    pub valid: bool,
    pub critical: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn summary(&self) -> String {
        format!("Validation failed: {}", self.errors.join("; "))
    }
}

fn truncate_chars(value: &mut String, max: usize) {
    if let Some((idx, _)) = value.char_indices().nth(max) {
        value.truncate(idx);
    }
}

/// Checks a proposal before it can be applied. The only mutation is trimming
/// over-long SEO fields.
pub fn validate(proposal: &mut EnrichmentProposal) -> ValidationReport {
    let mut errors = Vec::new();
    let mut critical = false;

    match proposal.confidence_score {
        Some(score) if score.is_finite() && (0.0..=1.0).contains(&score) => {}
        Some(_) => errors.push("confidence_score must be a number between 0 and 1".to_string()),
        None => errors.push("confidence_score is missing".to_string()),
    }

    let description = proposal.description_html.trim();
    if description.is_empty() {
        errors.push("description_html is empty".to_string());
    } else if SCRIPT_TAG.is_match(description) {
        errors.push("description_html contains script tags".to_string());
    } else if UNSAFE_MARKUP.is_match(description) {
        errors.push("description_html contains unsafe content".to_string());
    }

    if proposal.tags.iter().all(|t| t.trim().is_empty()) {
        errors.push("tags must be a non-empty array".to_string());
    }

    for key in proposal.metafields.keys() {
        if !METAFIELDS.is_allowed(key) {
            errors.push(format!("Invalid metafield key: {key}"));
        }
    }

    truncate_chars(&mut proposal.seo_title, SEO_TITLE_MAX);
    truncate_chars(&mut proposal.seo_description, SEO_DESCRIPTION_MAX);

    let serialized = serde_json::to_string(&*proposal).unwrap_or_default();
    if FORBIDDEN.is_match(&serialized) {
        critical = true;
        errors.push("CRITICAL: Response contains price/cost information".to_string());
    }

    ValidationReport {
        valid: errors.is_empty(),
        critical,
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn good() -> EnrichmentProposal {
        EnrichmentProposal {
            confidence_score: Some(0.82),
            description_html: "<p>Router <strong>TP-Link</strong> disponible en Costa Rica.</p>".into(),
            product_type: "Routers".into(),
            category_suggestion: "Electronics > Networking > Routers".into(),
            tags: vec!["router".into(), "wifi".into()],
            seo_title: "Router TP-Link Archer C6".into(),
            seo_description: "Router doble banda".into(),
            metafields: BTreeMap::from([
                ("custom.conectividad".to_string(), Some("Wi-Fi 5".to_string())),
                ("custom.bateria".to_string(), None),
            ]),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_clean_proposal_mentioning_costa_rica() {
        let mut proposal = good();
        let report = validate(&mut proposal);
        assert!(report.valid, "{:?}", report.errors);
        assert!(!report.critical);
    }

    #[test]
    fn currency_followed_by_digit_is_critical() {
        for text in ["Solo $5 de envío", "Ahorre ₡ 15000", "Desde €20"] {
            let mut proposal = good();
            proposal.seo_description = text.into();
            let report = validate(&mut proposal);
            assert!(!report.valid, "{text}");
            assert!(report.critical, "{text}");
        }
    }

    #[test]
    fn price_words_are_critical_in_any_field() {
        let mut proposal = good();
        proposal.metafields.insert("custom.modelo".into(), Some("Mejor precio".into()));
        let report = validate(&mut proposal);
        assert!(report.critical);

        let mut proposal = good();
        proposal.tags.push("USD".into());
        assert!(validate(&mut proposal).critical);
    }

    #[test]
    fn structural_errors_are_reported_individually() {
        let mut proposal = good();
        proposal.confidence_score = Some(1.3);
        proposal.tags.clear();
        proposal.metafields.insert("custom.precio_oferta".into(), None);
        proposal.metafields.insert("specs.peso".into(), Some("1".into()));
        let report = validate(&mut proposal);
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 4, "{:?}", report.errors);
    }

    #[test]
    fn missing_confidence_is_rejected() {
        let mut proposal = good();
        proposal.confidence_score = None;
        let report = validate(&mut proposal);
        assert!(!report.valid);
        assert_eq!(report.errors, vec!["confidence_score is missing".to_string()]);
    }

    #[test]
    fn rejects_script_and_event_handlers() {
        let mut proposal = good();
        proposal.description_html = "<p>x</p><SCRIPT>alert(1)</SCRIPT>".into();
        assert!(!validate(&mut proposal).valid);

        let mut proposal = good();
        proposal.description_html = r#"<img src=x onerror="alert(1)">"#.into();
        assert!(!validate(&mut proposal).valid);

        let mut proposal = good();
        proposal.description_html = "   ".into();
        assert!(!validate(&mut proposal).valid);
    }

    #[test]
    fn truncates_long_seo_fields_without_failing() {
        let mut proposal = good();
        proposal.seo_title = "á".repeat(90);
        proposal.seo_description = "b".repeat(400);
        let report = validate(&mut proposal);
        assert!(report.valid);
        assert_eq!(proposal.seo_title.chars().count(), SEO_TITLE_MAX);
        assert_eq!(proposal.seo_description.chars().count(), SEO_DESCRIPTION_MAX);
    }
}
