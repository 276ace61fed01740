use crate::{
    config::AppConfig,
    jobs::{JobQueue, JobRequest},
    models::{TenantSettings, TriggerKind},
    store::{Store, StoreError},
};
use std::{collections::HashMap, future::Future, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression `{0}`")]
    InvalidExpression(String),
    #[error("scheduler error: {0}")]
    Scheduler(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn scheduler_error(err: JobSchedulerError) -> ScheduleError {
    ScheduleError::Scheduler(format!("{err:?}"))
}

/// Five-field expressions get a leading seconds field.
pub fn normalize_cron(expr: &str) -> Result<String, ScheduleError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 | 7 => Ok(fields.join(" ")),
        _ => Err(ScheduleError::InvalidExpression(expr.to_string())),
    }
}

/// Forgets the tenant's job only after `unschedule` succeeded, so a failed
/// removal leaves the live job tracked.
async fn unschedule_entry<F, Fut>(
    entries: &mut HashMap<String, Uuid>,
    shop: &str,
    unschedule: F,
) -> Result<Option<Uuid>, ScheduleError>
where
    F: FnOnce(Uuid) -> Fut,
    Fut: Future<Output = Result<(), ScheduleError>>,
{
    let Some(previous) = entries.get(shop).copied() else {
        return Ok(None);
    };
    unschedule(previous).await?;
    entries.remove(shop);
    Ok(Some(previous))
}

/// One recurring batch trigger per tenant.
#[derive(Clone)]
pub struct ScheduleRegistry {
    scheduler: JobScheduler,
    entries: Arc<Mutex<HashMap<String, Uuid>>>,
    queue: JobQueue,
}

impl ScheduleRegistry {
    pub async fn new(queue: JobQueue) -> Result<Self, ScheduleError> {
        Ok(Self {
            scheduler: JobScheduler::new().await.map_err(scheduler_error)?,
            entries: Arc::new(Mutex::new(HashMap::new())),
            queue,
        })
    }

    pub async fn start(&self) -> Result<(), ScheduleError> {
        self.scheduler.start().await.map_err(scheduler_error)
    }

    fn build_job(&self, shop: &str, cron: &str) -> Result<Job, ScheduleError> {
        let queue = self.queue.clone();
        let shop = shop.to_string();
        Job::new_async(cron, move |_uuid, _scheduler| {
            let queue = queue.clone();
            let shop = shop.clone();
            Box::pin(async move {
                match queue
                    .enqueue(JobRequest::batch(&shop, TriggerKind::Scheduled, None))
                    .await
                {
                    Ok(job_id) => info!(target = "smartenrich.cron", shop = %shop, job_id = %job_id, "scheduled_run_enqueued"),
                    Err(err) => warn!(target = "smartenrich.cron", shop = %shop, error = %err, "scheduled_run_enqueue_failed"),
                }
            })
        })
        .map_err(|_| ScheduleError::InvalidExpression(cron.to_string()))
    }

    /// Replaces the tenant's registration. The old one is only removed once
    /// the new expression has been accepted.
    pub async fn register(&self, shop: &str, cron: &str) -> Result<Uuid, ScheduleError> {
        let normalized = normalize_cron(cron)?;
        let job = self.build_job(shop, &normalized)?;
        let mut entries = self.entries.lock().await;
        unschedule_entry(&mut entries, shop, |previous| self.unschedule(previous)).await?;
        let id = self.scheduler.add(job).await.map_err(scheduler_error)?;
        entries.insert(shop.to_string(), id);
        info!(target = "smartenrich.cron", shop = shop, cron = %normalized, "schedule_registered");
        Ok(id)
    }

    pub async fn remove(&self, shop: &str) -> Result<bool, ScheduleError> {
        let mut entries = self.entries.lock().await;
        if unschedule_entry(&mut entries, shop, |previous| self.unschedule(previous))
            .await?
            .is_none()
        {
            return Ok(false);
        }
        info!(target = "smartenrich.cron", shop = shop, "schedule_removed");
        Ok(true)
    }

    async fn unschedule(&self, id: Uuid) -> Result<(), ScheduleError> {
        self.scheduler.remove(&id).await.map_err(scheduler_error)
    }

    pub async fn registration(&self, shop: &str) -> Option<Uuid> {
        self.entries.lock().await.get(shop).copied()
    }

    pub async fn apply_settings(&self, settings: &TenantSettings) -> Result<(), ScheduleError> {
        if settings.cron_enabled {
            self.register(&settings.shop, &settings.cron_schedule).await?;
        } else {
            self.remove(&settings.shop).await?;
        }
        Ok(())
    }

    /// Registers every tenant with cron enabled, or the default shop when
    /// no tenant has settings yet.
    pub async fn bootstrap(&self, store: &Store, config: &AppConfig) -> Result<usize, ScheduleError> {
        if !config.cron_enabled {
            info!(target = "smartenrich.cron", "cron_disabled");
            return Ok(0);
        }
        let tenants = store.cron_tenants().await?;
        if tenants.is_empty() {
            if let Some(shop) = &config.default_shop {
                self.register(shop, &config.cron_schedule).await?;
                return Ok(1);
            }
            return Ok(0);
        }
        let mut registered = 0;
        for settings in &tenants {
            match self.register(&settings.shop, &settings.cron_schedule).await {
                Ok(_) => registered += 1,
                Err(err) => warn!(
                    target = "smartenrich.cron",
                    shop = %settings.shop,
                    error = %err,
                    "schedule_registration_failed"
                ),
            }
        }
        Ok(registered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::system, config::QueueConfig};

    #[test]
    fn five_field_expressions_gain_seconds() {
        assert_eq!(normalize_cron("0 2 * * *").expect("cron"), "0 0 2 * * *");
        assert_eq!(normalize_cron(" 30  0 2 * * * ").expect("cron"), "30 0 2 * * *");
        assert!(normalize_cron("daily").is_err());
        assert!(normalize_cron("").is_err());
    }

    async fn registry() -> ScheduleRegistry {
        let store = Store::in_memory().await.expect("store");
        let queue = JobQueue::new(&store, system(), QueueConfig::default());
        ScheduleRegistry::new(queue).await.expect("scheduler")
    }

    #[tokio::test]
    async fn registering_again_replaces_the_previous_entry() {
        let registry = registry().await;
        let first = registry.register("a.myshopify.com", "0 2 * * *").await.expect("first");
        let second = registry.register("a.myshopify.com", "0 4 * * *").await.expect("second");
        assert_ne!(first, second);
        assert_eq!(registry.registration("a.myshopify.com").await, Some(second));

        assert!(registry.remove("a.myshopify.com").await.expect("remove"));
        assert!(!registry.remove("a.myshopify.com").await.expect("remove again"));
        assert_eq!(registry.registration("a.myshopify.com").await, None);
    }

    #[tokio::test]
    async fn invalid_expression_keeps_existing_registration() {
        let registry = registry().await;
        let id = registry.register("a.myshopify.com", "0 2 * * *").await.expect("register");
        assert!(registry.register("a.myshopify.com", "every night").await.is_err());
        assert_eq!(registry.registration("a.myshopify.com").await, Some(id));
    }

    #[tokio::test]
    async fn failed_unschedule_keeps_the_entry() {
        let id = Uuid::new_v4();
        let mut entries = HashMap::from([("a.myshopify.com".to_string(), id)]);
        let result = unschedule_entry(&mut entries, "a.myshopify.com", |_| async {
            Err(ScheduleError::Scheduler("channel closed".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(entries.get("a.myshopify.com"), Some(&id));

        let removed = unschedule_entry(&mut entries, "a.myshopify.com", |_| async { Ok::<(), ScheduleError>(()) })
            .await
            .expect("unschedule");
        assert_eq!(removed, Some(id));
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn disabled_settings_unregister() {
        let registry = registry().await;
        let mut settings = TenantSettings::defaults_for("a.myshopify.com");
        registry.apply_settings(&settings).await.expect("enable");
        assert!(registry.registration("a.myshopify.com").await.is_some());
        settings.cron_enabled = false;
        registry.apply_settings(&settings).await.expect("disable");
        assert!(registry.registration("a.myshopify.com").await.is_none());
    }
}
