use super::{
    prompt::{SYSTEM_PROMPT, build_user_prompt},
    repair::{repair_truncated_json, strip_markdown_fence},
    search::{BarcodeData, SearchResult},
};
use crate::{
    llm::{CompletionRequest, LlmError, SharedCompletion},
    models::{CatalogItem, EnrichmentProposal},
    ratelimit::AiCallBudget,
};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays: [2, 4, 8, 16].into_iter().map(Duration::from_secs).collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("model returned invalid JSON ({len} chars): {tail}", len = .raw.len(), tail = tail(.raw))]
    InvalidJson { raw: String },
    #[error(transparent)]
    Llm(#[from] LlmError),
}

impl GeneratorError {
    pub fn raw(&self) -> Option<&str> {
        match self {
            GeneratorError::InvalidJson { raw } => Some(raw),
            GeneratorError::Llm(_) => None,
        }
    }
}

fn tail(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    chars[chars.len().saturating_sub(100)..].iter().collect()
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub proposal: EnrichmentProposal,
    pub raw: String,
    pub model: String,
    pub repaired: bool,
}

pub fn parse_proposal(raw: &str) -> Result<(EnrichmentProposal, bool), GeneratorError> {
    let cleaned = strip_markdown_fence(raw);
    if let Ok(proposal) = serde_json::from_str::<EnrichmentProposal>(&cleaned) {
        return Ok((proposal, false));
    }
    let repaired = repair_truncated_json(&cleaned);
    serde_json::from_str::<EnrichmentProposal>(&repaired)
        .map(|proposal| (proposal, true))
        .map_err(|_| GeneratorError::InvalidJson {
            raw: raw.to_string(),
        })
}

#[derive(Clone)]
pub struct Generator {
    llm: SharedCompletion,
    budget: AiCallBudget,
    retry: RetryPolicy,
}

impl Generator {
    pub fn new(llm: SharedCompletion, budget: AiCallBudget, retry: RetryPolicy) -> Self {
        Self { llm, budget, retry }
    }

    pub fn model(&self) -> String {
        self.llm.model()
    }

    pub async fn generate(
        &self,
        item: &CatalogItem,
        results: &[SearchResult],
        barcode: Option<&BarcodeData>,
    ) -> Result<Generation, GeneratorError> {
        let request = CompletionRequest::enrichment(SYSTEM_PROMPT, build_user_prompt(item, results, barcode));
        let mut attempt = 0usize;
        loop {
            self.budget.acquire().await;
            match self.llm.complete(&request).await {
                Ok(raw) => {
                    // Parse failures are repaired once, never retried.
                    let (proposal, repaired) = parse_proposal(&raw)?;
                    if repaired {
                        warn!(
                            target = "smartenrich.llm",
                            item_id = %item.id,
                            raw_len = raw.len(),
                            "repaired_truncated_json"
                        );
                    }
                    info!(
                        target = "smartenrich.llm",
                        item_id = %item.id,
                        attempt = attempt + 1,
                        confidence = ?proposal.confidence_score,
                        "proposal_generated"
                    );
                    return Ok(Generation {
                        proposal,
                        raw,
                        model: self.llm.model(),
                        repaired,
                    });
                }
                Err(err) if err.is_retryable() && attempt < self.retry.delays.len() => {
                    let delay = self.retry.delays[attempt];
                    warn!(
                        target = "smartenrich.llm",
                        item_id = %item.id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "completion_retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::ScriptedCompletion;
    use super::*;
    use crate::clock::system;
    use std::sync::Arc;

    const ANSWER: &str = r#"{"confidence_score": 0.8, "description_html": "<p>ok</p>", "tags": ["a"]}"#;

    fn generator(llm: Arc<ScriptedCompletion>) -> Generator {
        Generator::new(
            llm,
            AiCallBudget::per_minute(1_000, system()),
            RetryPolicy {
                delays: vec![Duration::ZERO; 4],
            },
        )
    }

    fn item() -> CatalogItem {
        CatalogItem {
            id: "gid://shopify/Product/7".into(),
            title: "Mouse Logitech M185".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn retries_rate_limits_and_server_errors() {
        let llm = Arc::new(ScriptedCompletion::new(vec![
            Err(LlmError::RateLimited),
            Err(LlmError::Server(503)),
            Err(LlmError::Transport("reset".into())),
            Ok(ANSWER.into()),
        ]));
        let out = generator(llm.clone()).generate(&item(), &[], None).await.expect("generated");
        assert_eq!(llm.calls(), 4);
        assert!(!out.repaired);
        assert_eq!(out.model, "scripted-model");
        assert_eq!(out.proposal.tags, vec!["a"]);
    }

    #[tokio::test]
    async fn gives_up_after_five_attempts_with_last_error() {
        let llm = Arc::new(ScriptedCompletion::new(
            (0..6).map(|_| Err(LlmError::Server(500))).collect(),
        ));
        let err = generator(llm.clone()).generate(&item(), &[], None).await.unwrap_err();
        assert!(matches!(err, GeneratorError::Llm(LlmError::Server(500))));
        assert_eq!(llm.calls(), 5);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let llm = Arc::new(ScriptedCompletion::new(vec![Err(LlmError::Api(400, "bad".into()))]));
        let err = generator(llm.clone()).generate(&item(), &[], None).await.unwrap_err();
        assert!(matches!(err, GeneratorError::Llm(LlmError::Api(400, _))));
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn truncated_output_is_repaired_once() {
        let llm = Arc::new(ScriptedCompletion::new(vec![Ok(
            r#"{"confidence_score": 0.7, "description_html": "<p>Corte"#.into(),
        )]));
        let out = generator(llm.clone()).generate(&item(), &[], None).await.expect("repaired");
        assert!(out.repaired);
        assert_eq!(out.proposal.description_html, "<p>Corte");
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn unrepairable_output_is_fatal_and_keeps_raw() {
        let llm = Arc::new(ScriptedCompletion::new(vec![
            Ok("Lo siento, no puedo ayudar".into()),
            Ok(ANSWER.into()),
        ]));
        let err = generator(llm.clone()).generate(&item(), &[], None).await.unwrap_err();
        assert_eq!(err.raw(), Some("Lo siento, no puedo ayudar"));
        assert_eq!(llm.calls(), 1);
    }

    #[test]
    fn fenced_output_parses_without_repair() {
        let (proposal, repaired) = parse_proposal(&format!("```json\n{ANSWER}\n```")).expect("parse");
        assert!(!repaired);
        assert_eq!(proposal.confidence_score, Some(0.8));
    }
}
