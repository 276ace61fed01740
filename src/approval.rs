use crate::{
    catalog::CatalogApi,
    clock::SharedClock,
    models::{EnrichmentLog, EnrichmentProposal, LogStatus},
    pipeline::apply_proposal,
    store::{LogTransition, Store, StoreError},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("enrichment log {0} not found")]
    NotFound(String),
    #[error("enrichment log {id} is {status}; only pending logs can be approved or rejected")]
    NotPending { id: String, status: &'static str },
    #[error("stored proposal for log {0} cannot be read")]
    CorruptProposal(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalAction {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ApprovalOutcome {
    pub log_id: String,
    pub status: LogStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

async fn pending_log(store: &Store, shop: &str, log_id: &str) -> Result<EnrichmentLog, ApprovalError> {
    let log = store
        .get_log(log_id)
        .await?
        .filter(|log| log.shop == shop)
        .ok_or_else(|| ApprovalError::NotFound(log_id.to_string()))?;
    if log.status != LogStatus::Pending {
        return Err(ApprovalError::NotPending {
            id: log.id,
            status: log.status.as_str(),
        });
    }
    Ok(log)
}

fn stored_image_urls(log: &EnrichmentLog) -> Vec<String> {
    log.image_data
        .as_ref()
        .and_then(|data| data.get("urls"))
        .and_then(|urls| urls.as_array())
        .map(|urls| urls.iter().filter_map(|u| u.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

/// Applies a pending proposal and settles the log as applied or failed.
pub async fn approve(
    store: &Store,
    catalog: &dyn CatalogApi,
    clock: &SharedClock,
    shop: &str,
    log_id: &str,
) -> Result<ApprovalOutcome, ApprovalError> {
    let log = pending_log(store, shop, log_id).await?;
    let proposal: EnrichmentProposal = log
        .proposed_changes
        .clone()
        .and_then(|value| serde_json::from_value(value).ok())
        .ok_or_else(|| ApprovalError::CorruptProposal(log.id.clone()))?;

    if !store.claim_approval(&log.id, clock.now()).await? {
        return Err(ApprovalError::NotPending {
            id: log.id,
            status: "already being approved",
        });
    }

    let transition = match catalog.fetch_item(&log.product_id).await {
        Ok(Some(item)) => apply_proposal(catalog, &item, &proposal, &stored_image_urls(&log)).await,
        Ok(None) => LogTransition {
            status: LogStatus::Failed,
            score_after: None,
            applied_changes: None,
            error_message: Some(format!("item {} no longer exists", log.product_id)),
        },
        Err(err) => LogTransition {
            status: LogStatus::Failed,
            score_after: None,
            applied_changes: None,
            error_message: Some(format!("catalog fetch failed: {err}")),
        },
    };

    if !store.finish_log(&log.id, &transition, clock.now()).await? {
        warn!(target = "smartenrich.pipeline", log_id = %log.id, "approval_settled_elsewhere");
    }
    info!(
        target = "smartenrich.pipeline",
        log_id = %log.id,
        item_id = %log.product_id,
        status = transition.status.as_str(),
        "proposal_approved"
    );
    Ok(ApprovalOutcome {
        log_id: log.id,
        status: transition.status,
        error: transition.error_message,
    })
}

pub async fn reject(
    store: &Store,
    clock: &SharedClock,
    shop: &str,
    log_id: &str,
) -> Result<ApprovalOutcome, ApprovalError> {
    let log = pending_log(store, shop, log_id).await?;
    if !store.mark_rejected(&log.id, clock.now()).await? {
        return Err(ApprovalError::NotPending {
            id: log.id,
            status: "already being approved",
        });
    }
    info!(target = "smartenrich.pipeline", log_id = %log.id, item_id = %log.product_id, "proposal_rejected");
    Ok(ApprovalOutcome {
        log_id: log.id,
        status: LogStatus::Rejected,
        error: None,
    })
}
