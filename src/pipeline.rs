use crate::{
    catalog::{CatalogApi, config::PAGE_SIZE},
    clock::SharedClock,
    enrichment::{
        analyzer::{self, CompletenessAnalysis, DEFAULT_ENRICH_THRESHOLD},
        gatherer::{GatheredData, Gatherer},
        generator::{Generation, Generator},
        updater, validator,
    },
    models::{CatalogItem, EnrichmentProposal, LogStatus, RunStatus, TriggerKind},
    store::{LogInsert, LogTransition, NewLog, RunCounters, Store, StoreError},
};
use serde::Serialize;
use serde_json::{Value, json};
use std::{collections::HashSet, future::Future, time::Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Listing pages scanned for candidates before giving up on filling a batch.
pub const MAX_CANDIDATE_PAGES: usize = 20;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub shop: String,
    pub trigger: TriggerKind,
    pub max_products: u32,
    pub auto_apply: bool,
    pub min_confidence: f64,
    /// Single-item mode.
    pub product_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub total_products: i64,
    pub enriched_count: i64,
    pub failed_count: i64,
    pub skipped_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Applied,
    /// Waiting for manual approval; counted as skipped.
    Pending,
    Skipped,
    Failed,
}

impl ItemOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemOutcome::Applied => "applied",
            ItemOutcome::Pending => "pending",
            ItemOutcome::Skipped => "skipped",
            ItemOutcome::Failed => "failed",
        }
    }

    fn count(self, counters: &mut RunCounters) {
        match self {
            ItemOutcome::Applied => counters.enriched += 1,
            ItemOutcome::Pending | ItemOutcome::Skipped => counters.skipped += 1,
            ItemOutcome::Failed => counters.failed += 1,
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    store: Store,
    gatherer: Gatherer,
    generator: Generator,
    clock: SharedClock,
    threshold: i64,
}

impl Pipeline {
    pub fn new(store: Store, gatherer: Gatherer, generator: Generator, clock: SharedClock) -> Self {
        Self {
            store,
            gatherer,
            generator,
            clock,
            threshold: DEFAULT_ENRICH_THRESHOLD,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn run(&self, catalog: &dyn CatalogApi, opts: &RunOptions) -> Result<RunSummary, PipelineError> {
        let run = self
            .store
            .create_run(&opts.shop, opts.trigger, self.clock.now())
            .await
            .map_err(|err| PipelineError::store("create_run", err))?;
        info!(
            target = "smartenrich.pipeline",
            run_id = %run.id,
            shop = %opts.shop,
            trigger = opts.trigger.as_str(),
            max_products = opts.max_products,
            auto_apply = opts.auto_apply,
            single_item = opts.product_id.is_some(),
            "run_started"
        );

        let mut counters = RunCounters::default();
        let candidates = match timed("fetch_candidates", self.fetch_candidates(catalog, opts)).await {
            Ok(items) => items,
            Err(err) => {
                warn!(target = "smartenrich.pipeline", run_id = %run.id, error = %err, "candidate_fetch_failed");
                self.store
                    .finalize_run(&run.id, RunStatus::Failed, counters, Some(&err.to_string()), self.clock.now())
                    .await
                    .map_err(|e| PipelineError::store("finalize_run", e))?;
                return Err(err);
            }
        };

        counters.total = candidates.len() as i64;
        self.progress(&run.id, counters).await;

        for item in &candidates {
            let outcome = match self.process_item(catalog, &run.id, opts, item).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(
                        target = "smartenrich.pipeline",
                        run_id = %run.id,
                        item_id = %item.id,
                        error = %err,
                        "item_failed_unexpectedly"
                    );
                    let mut log = NewLog::for_item(Some(&run.id), &opts.shop, item, LogStatus::Failed);
                    log.error_message = Some(err.to_string());
                    if let Err(store_err) = self.store.insert_log(&log, self.clock.now()).await {
                        warn!(target = "smartenrich.pipeline", item_id = %item.id, error = %store_err, "failure_log_not_written");
                    }
                    ItemOutcome::Failed
                }
            };
            crate::metrics::item_outcome(outcome.as_str());
            outcome.count(&mut counters);
            self.progress(&run.id, counters).await;
        }

        self.store
            .finalize_run(&run.id, RunStatus::Completed, counters, None, self.clock.now())
            .await
            .map_err(|err| PipelineError::store("finalize_run", err))?;
        info!(
            target = "smartenrich.pipeline",
            run_id = %run.id,
            total = counters.total,
            enriched = counters.enriched,
            failed = counters.failed,
            skipped = counters.skipped,
            "run_completed"
        );
        Ok(RunSummary {
            run_id: run.id,
            status: RunStatus::Completed,
            total_products: counters.total,
            enriched_count: counters.enriched,
            failed_count: counters.failed,
            skipped_count: counters.skipped,
        })
    }

    async fn progress(&self, run_id: &str, counters: RunCounters) {
        if let Err(err) = self.store.update_run_progress(run_id, counters).await {
            warn!(target = "smartenrich.pipeline", run_id = run_id, error = %err, "run_progress_not_saved");
        }
    }

    /// Newest-first active items without a blocking log, up to `max_products`.
    async fn fetch_candidates(
        &self,
        catalog: &dyn CatalogApi,
        opts: &RunOptions,
    ) -> Result<Vec<CatalogItem>, PipelineError> {
        if let Some(id) = &opts.product_id {
            let item = catalog
                .fetch_item(id)
                .await
                .map_err(|err| PipelineError::internal("fetch_candidates", err.to_string()))?;
            return Ok(item.into_iter().collect());
        }

        let wanted = opts.max_products.max(1) as usize;
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        let mut cursor: Option<String> = None;
        let mut skipped = 0usize;
        for _ in 0..MAX_CANDIDATE_PAGES {
            let page = catalog
                .list_active(cursor.as_deref(), *PAGE_SIZE)
                .await
                .map_err(|err| PipelineError::internal("fetch_candidates", err.to_string()))?;
            let ids: Vec<String> = page.items.iter().map(|i| i.id.clone()).collect();
            let blocking = self
                .store
                .blocking_item_ids(&opts.shop, &ids)
                .await
                .map_err(|err| PipelineError::store("fetch_candidates", err))?;
            for item in page.items {
                if blocking.contains(&item.id) || !seen.insert(item.id.clone()) {
                    skipped += 1;
                    continue;
                }
                candidates.push(item);
                if candidates.len() >= wanted {
                    break;
                }
            }
            if candidates.len() >= wanted {
                break;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        info!(
            target = "smartenrich.pipeline",
            shop = %opts.shop,
            candidates = candidates.len(),
            already_enriched = skipped,
            "candidates_selected"
        );
        Ok(candidates)
    }

    pub async fn process_item(
        &self,
        catalog: &dyn CatalogApi,
        run_id: &str,
        opts: &RunOptions,
        item: &CatalogItem,
    ) -> Result<ItemOutcome, PipelineError> {
        if !item.is_active() {
            info!(target = "smartenrich.pipeline", item_id = %item.id, status = ?item.status, "item_not_active");
            return Ok(ItemOutcome::Skipped);
        }

        // Redelivered jobs land here again; re-check against committed state.
        if self
            .store
            .has_blocking_log(&opts.shop, &item.id)
            .await
            .map_err(|err| PipelineError::store("dedup", err))?
        {
            info!(target = "smartenrich.pipeline", item_id = %item.id, "item_already_enriched");
            return Ok(ItemOutcome::Skipped);
        }

        let analysis = analyzer::analyze(item);
        if !analyzer::should_enrich(&analysis, self.threshold) {
            let mut log = NewLog::for_item(Some(run_id), &opts.shop, item, LogStatus::Skipped);
            log.score_before = analysis.score;
            self.insert(&log).await?;
            return Ok(ItemOutcome::Skipped);
        }

        let gathered = timed("gather", async { Ok(self.gatherer.gather(item).await) }).await?;

        let generation = match timed("generate", async { Ok(self.generator.generate(item, &gathered.results, gathered.barcode.as_ref()).await) })
            .await?
        {
            Ok(generation) => generation,
            Err(err) => {
                let mut log = self.base_log(run_id, opts, item, &analysis, &gathered);
                log.status = LogStatus::Failed;
                log.ai_model = Some(self.generator.model());
                log.ai_response_raw = err.raw().map(str::to_string);
                log.error_message = Some(err.to_string());
                self.insert(&log).await?;
                return Ok(ItemOutcome::Failed);
            }
        };
        let Generation { mut proposal, raw, model, .. } = generation;

        let report = validator::validate(&mut proposal);
        let proposed = serde_json::to_value(&proposal).unwrap_or(Value::Null);
        let mut log = self.base_log(run_id, opts, item, &analysis, &gathered);
        log.confidence = proposal.confidence_score;
        log.proposed_changes = Some(proposed);
        log.ai_model = Some(model);
        log.ai_response_raw = Some(raw);

        if !report.valid {
            info!(
                target = "smartenrich.pipeline",
                item_id = %item.id,
                critical = report.critical,
                errors = ?report.errors,
                "proposal_rejected_by_validation"
            );
            log.status = LogStatus::Failed;
            log.error_message = Some(report.summary());
            self.insert(&log).await?;
            return Ok(ItemOutcome::Failed);
        }

        let auto_apply = opts.auto_apply && proposal.confidence_score.is_some_and(|c| c >= opts.min_confidence);
        info!(
            target = "smartenrich.pipeline",
            item_id = %item.id,
            confidence = ?proposal.confidence_score,
            threshold = opts.min_confidence,
            auto_apply = auto_apply,
            "apply_decision"
        );

        // The pending insert is the claim on the item.
        log.status = LogStatus::Pending;
        log.pre_approved = auto_apply;
        let log_id = match self
            .store
            .insert_log(&log, self.clock.now())
            .await
            .map_err(|err| PipelineError::store("insert_log", err))?
        {
            LogInsert::Inserted(id) => id,
            LogInsert::Duplicate => {
                info!(target = "smartenrich.pipeline", item_id = %item.id, "item_claimed_elsewhere");
                return Ok(ItemOutcome::Skipped);
            }
        };
        if !auto_apply {
            return Ok(ItemOutcome::Pending);
        }

        let image_urls = gathered.image_urls();
        let transition = timed("apply", async {
            Ok(apply_proposal(catalog, item, &proposal, &image_urls).await)
        })
        .await?;
        let outcome = if transition.status == LogStatus::Applied {
            ItemOutcome::Applied
        } else {
            ItemOutcome::Failed
        };
        // The pending log already stands for this item; a failed settle leaves
        // it for stale-claim recovery instead of writing a second log.
        if let Err(err) = self.store.finish_log(&log_id, &transition, self.clock.now()).await {
            warn!(
                target = "smartenrich.pipeline",
                item_id = %item.id,
                log_id = %log_id,
                error = %err,
                "apply_result_not_recorded"
            );
        }
        Ok(outcome)
    }

    fn base_log(
        &self,
        run_id: &str,
        opts: &RunOptions,
        item: &CatalogItem,
        analysis: &CompletenessAnalysis,
        gathered: &GatheredData,
    ) -> NewLog {
        let mut log = NewLog::for_item(Some(run_id), &opts.shop, item, LogStatus::Pending);
        log.score_before = analysis.score;
        log.search_data = Some(json!({
            "query": gathered.query,
            "results": gathered.results,
            "barcode": gathered.barcode,
        }));
        if let Some(query) = &gathered.image_query {
            log.image_data = Some(json!({ "query": query, "urls": gathered.image_urls() }));
        }
        log
    }

    async fn insert(&self, log: &NewLog) -> Result<(), PipelineError> {
        self.store
            .insert_log(log, self.clock.now())
            .await
            .map(|_| ())
            .map_err(|err| PipelineError::store("insert_log", err))
    }
}

/// Writes the proposal and describes the resulting log transition.
pub async fn apply_proposal(
    catalog: &dyn CatalogApi,
    item: &CatalogItem,
    proposal: &EnrichmentProposal,
    image_urls: &[String],
) -> LogTransition {
    let result = updater::apply(catalog, &item.id, proposal, &item.tags, image_urls).await;
    let applied_changes = Some(updater::applied_changes(proposal, &item.tags, image_urls, &result));
    if result.succeeded() {
        let projected = analyzer::project(item, proposal, image_urls);
        LogTransition {
            status: LogStatus::Applied,
            score_after: Some(analyzer::analyze(&projected).score),
            applied_changes,
            error_message: None,
        }
    } else {
        warn!(
            target = "smartenrich.pipeline",
            item_id = %item.id,
            errors = ?result.errors,
            "apply_failed"
        );
        LogTransition {
            status: LogStatus::Failed,
            score_after: None,
            applied_changes,
            error_message: Some(result.errors.join("; ")),
        }
    }
}

async fn timed<T, Fut>(stage: &'static str, fut: Fut) -> Result<T, PipelineError>
where
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let started = Instant::now();
    let out = fut.await;
    crate::metrics::stage_elapsed(stage, started.elapsed().as_millis());
    out
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Internal,
        }
    }

    fn store(stage: &'static str, err: StoreError) -> Self {
        Self::internal(stage, err.to_string())
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::{
        catalog::fake::MemoryCatalog, enrichment::generator::fakes::ScriptedCompletion, models::ItemStatus,
    };
    use std::sync::Arc;

    #[test]
    fn error_exposes_stage_and_kind() {
        let err = PipelineError::invalid_input("trigger", "max must be between 1 and 200");
        assert_eq!(err.stage(), "trigger");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        assert_eq!(err.detail(), "max must be between 1 and 200");
        assert_eq!(err.to_string(), "stage `trigger` failed: max must be between 1 and 200");
    }

    #[tokio::test]
    async fn auto_apply_writes_catalog_and_logs_applied() {
        let llm = Arc::new(ScriptedCompletion::always(GOOD_ANSWER));
        let pipeline = pipeline(llm).await;
        let catalog = MemoryCatalog::with_items(vec![sparse_item(1)]);
        let before = analyzer::analyze(&sparse_item(1)).score;

        let summary = pipeline.run(&catalog, &options(true)).await.expect("run");
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!((summary.total_products, summary.enriched_count), (1, 1));

        let item = catalog.item("gid://shopify/Product/1").expect("item");
        assert_eq!(item.tags, vec!["Accesorios", "mouse", "inalambrico", "logitech"]);
        assert!(item.description_html.contains("Logitech M185"));

        let logs = pipeline.store().logs_for_run(&summary.run_id, 20).await.expect("logs");
        assert_eq!(logs.len(), 1);
        let log = &logs[0];
        assert_eq!(log.status, LogStatus::Applied);
        assert_eq!(log.score_before, before);
        assert!(log.score_after.expect("score after") > before);
        assert!(log.applied_at.is_some());
        assert_eq!(log.ai_model.as_deref(), Some("scripted-model"));
    }

    #[tokio::test]
    async fn without_auto_apply_the_item_is_left_untouched() {
        let llm = Arc::new(ScriptedCompletion::always(GOOD_ANSWER));
        let pipeline = pipeline(llm).await;
        let catalog = MemoryCatalog::with_items(vec![sparse_item(1)]);

        let summary = pipeline.run(&catalog, &options(false)).await.expect("run");
        assert_eq!((summary.enriched_count, summary.skipped_count), (0, 1));
        assert_eq!(catalog.item("gid://shopify/Product/1"), Some(sparse_item(1)));

        let logs = pipeline.store().logs_for_run(&summary.run_id, 20).await.expect("logs");
        assert_eq!(logs[0].status, LogStatus::Pending);
        assert_eq!(logs[0].confidence, Some(0.9));
        assert!(logs[0].proposed_changes.is_some());
    }

    #[tokio::test]
    async fn low_confidence_waits_for_approval_even_with_auto_apply() {
        let answer = GOOD_ANSWER.replace("0.9", "0.3");
        let pipeline = pipeline(Arc::new(ScriptedCompletion::always(answer))).await;
        let catalog = MemoryCatalog::with_items(vec![sparse_item(1)]);
        let summary = pipeline.run(&catalog, &options(true)).await.expect("run");
        let logs = pipeline.store().logs_for_run(&summary.run_id, 20).await.expect("logs");
        assert_eq!(logs[0].status, LogStatus::Pending);
        assert!(catalog.calls().iter().all(|c| !c.starts_with("update:")));
    }

    #[tokio::test]
    async fn rerun_creates_no_new_logs_for_enriched_items() {
        let llm = Arc::new(ScriptedCompletion::always(GOOD_ANSWER));
        let pipeline = pipeline(llm.clone()).await;
        let catalog = MemoryCatalog::with_items(vec![sparse_item(1), sparse_item(2)]);

        let first = pipeline.run(&catalog, &options(false)).await.expect("first run");
        assert_eq!(first.total_products, 2);
        assert_eq!(llm.calls(), 2);

        let second = pipeline.run(&catalog, &options(false)).await.expect("second run");
        assert_eq!(second.total_products, 0);
        assert!(pipeline.store().logs_for_run(&second.run_id, 20).await.expect("logs").is_empty());
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn single_item_rerun_is_skipped_without_a_log() {
        let llm = Arc::new(ScriptedCompletion::always(GOOD_ANSWER));
        let pipeline = pipeline(llm.clone()).await;
        let catalog = MemoryCatalog::with_items(vec![sparse_item(1)]);
        let opts = RunOptions {
            product_id: Some("gid://shopify/Product/1".into()),
            ..options(false)
        };
        pipeline.run(&catalog, &opts).await.expect("first");
        let second = pipeline.run(&catalog, &opts).await.expect("second");
        assert_eq!((second.total_products, second.skipped_count), (1, 1));
        assert!(pipeline.store().logs_for_run(&second.run_id, 20).await.expect("logs").is_empty());
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn inactive_items_are_skipped_without_changes() {
        let pipeline = pipeline(Arc::new(ScriptedCompletion::always(GOOD_ANSWER))).await;
        let mut draft = sparse_item(2);
        draft.status = ItemStatus::Draft;
        let catalog = MemoryCatalog::with_items(vec![draft]);
        let opts = RunOptions {
            product_id: Some("gid://shopify/Product/2".into()),
            ..options(true)
        };
        let summary = pipeline.run(&catalog, &opts).await.expect("run");
        assert_eq!(summary.skipped_count, 1);
        assert_eq!(catalog.item("gid://shopify/Product/2").expect("item").tags, vec!["Accesorios"]);
    }

    #[tokio::test]
    async fn invalid_proposals_fail_the_item_not_the_run() {
        let answer = GOOD_ANSWER.replace("con receptor USB", "por solo $19");
        let pipeline = pipeline(Arc::new(ScriptedCompletion::always(answer))).await;
        let catalog = MemoryCatalog::with_items(vec![sparse_item(1), sparse_item(2)]);
        let summary = pipeline.run(&catalog, &options(true)).await.expect("run");
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.failed_count, 2);
        let logs = pipeline.store().logs_for_run(&summary.run_id, 20).await.expect("logs");
        assert!(logs.iter().all(|l| l.status == LogStatus::Failed));
        assert!(logs[0].error_message.as_deref().expect("message").contains("CRITICAL"));
        // Failed items remain eligible.
        assert!(!pipeline.store().has_blocking_log(SHOP, "gid://shopify/Product/1").await.expect("check"));
    }

    #[tokio::test]
    async fn answer_without_confidence_fails_validation() {
        let answer = GOOD_ANSWER.replace(r#""confidence_score": 0.9,"#, "");
        let pipeline = pipeline(Arc::new(ScriptedCompletion::always(answer))).await;
        let catalog = MemoryCatalog::with_items(vec![sparse_item(1)]);
        let summary = pipeline.run(&catalog, &options(true)).await.expect("run");
        assert_eq!(summary.failed_count, 1);
        let logs = pipeline.store().logs_for_run(&summary.run_id, 20).await.expect("logs");
        assert_eq!(logs[0].confidence, None);
        assert!(logs[0].error_message.as_deref().expect("message").contains("confidence_score is missing"));
        assert!(catalog.calls().iter().all(|c| !c.starts_with("update:")));
    }

    #[tokio::test]
    async fn barcode_record_reaches_prompt_and_log() {
        use crate::enrichment::{gatherer::fakes::ScriptedBarcode, search::BarcodeProvider};

        let llm = Arc::new(ScriptedCompletion::always(GOOD_ANSWER));
        let gatherer = quiet_gatherer()
            .with_barcode_providers(vec![ScriptedBarcode::knows("go-upc", "Logitech M185") as Arc<dyn BarcodeProvider>]);
        let pipeline = pipeline_with(llm.clone(), gatherer).await;
        let mut item = sparse_item(1);
        item.variants[0].barcode = Some("097855066527".into());
        let catalog = MemoryCatalog::with_items(vec![item]);

        let summary = pipeline.run(&catalog, &options(false)).await.expect("run");
        let logs = pipeline.store().logs_for_run(&summary.run_id, 20).await.expect("logs");
        let search = logs[0].search_data.as_ref().expect("search data");
        assert_eq!(search["barcode"]["name"], "Logitech M185");
        assert_eq!(search["barcode"]["source"], "go-upc");
        assert!(llm.last_user_prompt().expect("prompt").contains("- Nombre: Logitech M185"));
    }

    #[tokio::test]
    async fn model_failure_is_logged_with_raw_output() {
        let pipeline = pipeline(Arc::new(ScriptedCompletion::always("no es json"))).await;
        let catalog = MemoryCatalog::with_items(vec![sparse_item(1)]);
        let summary = pipeline.run(&catalog, &options(true)).await.expect("run");
        assert_eq!(summary.failed_count, 1);
        let logs = pipeline.store().logs_for_run(&summary.run_id, 20).await.expect("logs");
        assert_eq!(logs[0].ai_response_raw.as_deref(), Some("no es json"));
    }

    #[tokio::test]
    async fn rejected_catalog_write_marks_log_failed() {
        let pipeline = pipeline(Arc::new(ScriptedCompletion::always(GOOD_ANSWER))).await;
        let mut catalog = MemoryCatalog::with_items(vec![sparse_item(1)]);
        catalog.reject_updates = true;
        let summary = pipeline.run(&catalog, &options(true)).await.expect("run");
        assert_eq!(summary.failed_count, 1);
        let logs = pipeline.store().logs_for_run(&summary.run_id, 20).await.expect("logs");
        assert_eq!(logs[0].status, LogStatus::Failed);
        assert_eq!(logs[0].error_message.as_deref(), Some("descriptionHtml: is invalid"));
    }

    #[tokio::test]
    async fn unrecorded_apply_result_does_not_add_a_second_log() {
        let pipeline = pipeline(Arc::new(ScriptedCompletion::always(GOOD_ANSWER))).await;
        sqlx::query(
            "CREATE TRIGGER settle_fails BEFORE UPDATE OF status ON enrichment_logs \
             BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END",
        )
        .execute(pipeline.store().pool())
        .await
        .expect("trigger");
        let catalog = MemoryCatalog::with_items(vec![sparse_item(1)]);

        let summary = pipeline.run(&catalog, &options(true)).await.expect("run");
        assert_eq!((summary.enriched_count, summary.failed_count), (1, 0));

        let logs = pipeline.store().logs_for_run(&summary.run_id, 20).await.expect("logs");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Pending);
        assert!(logs[0].approved_at.is_some());
    }

    #[tokio::test]
    async fn listing_failure_fails_the_run() {
        let pipeline = pipeline(Arc::new(ScriptedCompletion::always(GOOD_ANSWER))).await;
        let catalog = MemoryCatalog {
            fail_listing: true,
            ..Default::default()
        };
        let err = pipeline.run(&catalog, &options(true)).await.unwrap_err();
        assert_eq!(err.stage(), "fetch_candidates");
        let run = pipeline.store().latest_run(SHOP).await.expect("query").expect("run");
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error_message.is_some());
    }

    #[tokio::test]
    async fn candidate_search_pages_past_enriched_items() {
        let pipeline = pipeline(Arc::new(ScriptedCompletion::always(GOOD_ANSWER))).await;
        let items: Vec<CatalogItem> = (1..=5).map(sparse_item).collect();
        let catalog = MemoryCatalog::with_items(items);
        let one = RunOptions {
            max_products: 2,
            ..options(false)
        };
        let first = pipeline.run(&catalog, &one).await.expect("first");
        assert_eq!(first.total_products, 2);
        let second = pipeline.run(&catalog, &one).await.expect("second");
        assert_eq!(second.total_products, 2);
        let ids: HashSet<String> = pipeline
            .store()
            .logs_for_run(&second.run_id, 20)
            .await
            .expect("logs")
            .into_iter()
            .map(|l| l.product_id)
            .collect();
        assert_eq!(
            ids,
            HashSet::from(["gid://shopify/Product/3".to_string(), "gid://shopify/Product/4".to_string()])
        );
    }
}
