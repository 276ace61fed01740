use crate::{
    catalog::{SharedCatalog, shopify::ShopifyClient},
    config::WorkerConfig,
    jobs::{ClaimedJob, JobQueue, JobRequest, QueueError},
    models::TenantSettings,
    pipeline::{Pipeline, PipelineError, RunOptions, RunSummary},
    store::StoreError,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Builds a catalog client for `(shop, access_token)`.
pub type CatalogConnector = Arc<dyn Fn(&str, &str) -> SharedCatalog + Send + Sync>;

pub fn shopify_connector() -> CatalogConnector {
    Arc::new(|shop: &str, token: &str| -> SharedCatalog { Arc::new(ShopifyClient::new(shop, token)) })
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("no access token stored for {0}")]
    MissingCredential(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl JobError {
    /// Retrying cannot help these.
    pub fn is_permanent(&self) -> bool {
        matches!(self, JobError::MissingCredential(_))
    }
}

/// Effective run options for a job under the tenant's settings.
pub fn options_for(request: &JobRequest, settings: &TenantSettings, config: &WorkerConfig) -> RunOptions {
    let max_products = request
        .max_products
        .unwrap_or(settings.max_products_per_run)
        .clamp(1, TenantSettings::MAX_PRODUCTS_LIMIT);
    let auto_apply = settings.auto_apply || (config.force_auto_apply_automated && request.trigger.is_automated());
    RunOptions {
        shop: request.shop.clone(),
        trigger: request.trigger,
        max_products,
        auto_apply,
        min_confidence: settings.min_confidence,
        product_id: request.product_id.clone(),
    }
}

#[derive(Clone)]
pub struct Worker {
    queue: JobQueue,
    pipeline: Pipeline,
    connect: CatalogConnector,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(queue: JobQueue, pipeline: Pipeline, connect: CatalogConnector, config: WorkerConfig) -> Self {
        Self {
            queue,
            pipeline,
            connect,
            config,
        }
    }

    pub fn spawn_pool(self) -> Vec<JoinHandle<()>> {
        (0..self.config.concurrency.max(1))
            .map(|slot| {
                let worker = self.clone();
                tokio::spawn(async move { worker.run_loop(slot).await })
            })
            .collect()
    }

    async fn run_loop(self, slot: usize) {
        info!(target = "smartenrich.worker", slot = slot, "worker_started");
        loop {
            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => self.queue.wait().await,
                Err(err) => {
                    error!(target = "smartenrich.worker", slot = slot, error = %err, "queue_unavailable");
                    self.queue.wait().await;
                }
            }
        }
    }

    /// Claims and processes one job. Returns false when the queue was empty.
    pub async fn run_once(&self) -> Result<bool, QueueError> {
        let Some(job) = self.queue.claim().await? else {
            return Ok(false);
        };
        self.handle(job).await?;
        Ok(true)
    }

    async fn handle(&self, job: ClaimedJob) -> Result<(), QueueError> {
        info!(
            target = "smartenrich.worker",
            job_id = %job.id,
            shop = %job.request.shop,
            trigger = job.request.trigger.as_str(),
            attempt = job.attempts,
            "job_started"
        );
        match self.execute(&job.request).await {
            Ok(summary) => {
                info!(
                    target = "smartenrich.worker",
                    job_id = %job.id,
                    run_id = %summary.run_id,
                    enriched = summary.enriched_count,
                    failed = summary.failed_count,
                    skipped = summary.skipped_count,
                    "job_completed"
                );
                let result = serde_json::to_value(&summary).unwrap_or_default();
                self.queue.complete(&job.id, &result).await
            }
            Err(err) if err.is_permanent() => {
                warn!(target = "smartenrich.worker", job_id = %job.id, error = %err, "job_failed_permanently");
                self.queue.fail_permanently(&job.id, &err.to_string()).await
            }
            Err(err) => self.queue.fail(&job, &err.to_string()).await.map(|_| ()),
        }
    }

    pub async fn execute(&self, request: &JobRequest) -> Result<RunSummary, JobError> {
        let store = self.pipeline.store();
        let settings = store.tenant_settings(&request.shop).await?;
        let token = store
            .access_token(&request.shop)
            .await?
            .ok_or_else(|| JobError::MissingCredential(request.shop.clone()))?;
        let catalog = (self.connect)(&request.shop, &token);
        let opts = options_for(request, &settings, &self.config);
        Ok(self.pipeline.run(catalog.as_ref(), &opts).await?)
    }
}
