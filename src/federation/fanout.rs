//! Fan-out of local activities
//!
//! Turns one activity into one pending delivery job per follower. Followers
//! whose profile cannot be resolved are reported and skipped; they never
//! block the others.

use std::sync::Arc;

use futures::future::join_all;

use super::activity::Activity;
use super::resolver::ActorResolver;
use super::scheduler::JobScheduler;
use crate::data::{Database, NewDeliveryJob};
use crate::error::AppError;

/// A follower that did not get a job
#[derive(Debug, Clone)]
pub struct RecipientFailure {
    pub actor_uri: String,
    pub error: String,
}

/// Outcome of one fan-out
#[derive(Debug, Clone, Default)]
pub struct FanoutReport {
    /// Job ids, one per resolved follower
    pub job_ids: Vec<String>,
    /// Inbox URLs the jobs target, in the same order
    pub inboxes: Vec<String>,
    pub failures: Vec<RecipientFailure>,
}

#[derive(Clone)]
pub struct FanoutEngine {
    db: Arc<Database>,
    resolver: ActorResolver,
    scheduler: JobScheduler,
    local_actor_uri: String,
}

impl FanoutEngine {
    pub fn new(
        db: Arc<Database>,
        resolver: ActorResolver,
        scheduler: JobScheduler,
        local_actor_uri: String,
    ) -> Self {
        Self {
            db,
            resolver,
            scheduler,
            local_actor_uri,
        }
    }

    /// Enqueue `activity` for every current follower of the local actor.
    ///
    /// Jobs for the snapshot are inserted in one transaction.
    pub async fn fanout(&self, activity: &Activity) -> Result<FanoutReport, AppError> {
        let followers = self.db.followers_of(&self.local_actor_uri).await?;
        let payload = serialize(activity)?;

        let resolutions = join_all(followers.iter().map(|follower| {
            let resolver = self.resolver.clone();
            let actor_uri = follower.follower_uri.clone();
            async move {
                let result = resolver.resolve(&actor_uri).await;
                (actor_uri, result)
            }
        }))
        .await;

        let mut report = FanoutReport::default();
        let mut jobs = Vec::with_capacity(resolutions.len());

        for (actor_uri, result) in resolutions {
            match result {
                Ok(actor) => {
                    report.inboxes.push(actor.inbox_url.clone());
                    jobs.push(NewDeliveryJob {
                        activity_id: activity.id.clone(),
                        recipient_inbox: actor.inbox_url,
                        payload: payload.clone(),
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        activity_id = %activity.id,
                        actor = %actor_uri,
                        error = %e,
                        "Skipping follower that could not be resolved"
                    );
                    report.failures.push(RecipientFailure {
                        actor_uri,
                        error: e.to_string(),
                    });
                }
            }
        }

        report.job_ids = self.scheduler.enqueue(&jobs).await?;

        tracing::info!(
            activity_id = %activity.id,
            activity_type = activity.type_name(),
            followers = followers.len(),
            enqueued = report.job_ids.len(),
            failed = report.failures.len(),
            "Fan-out complete"
        );

        Ok(report)
    }

    /// Enqueue `activity` for a single recipient actor.
    ///
    /// # Errors
    /// `ActorResolution` if the recipient cannot be resolved.
    pub async fn deliver_to(&self, activity: &Activity, actor_uri: &str) -> Result<String, AppError> {
        let actor = self.resolver.resolve(actor_uri).await?;
        let job = NewDeliveryJob {
            activity_id: activity.id.clone(),
            recipient_inbox: actor.inbox_url,
            payload: serialize(activity)?,
        };

        let ids = self.scheduler.enqueue(std::slice::from_ref(&job)).await?;
        ids.into_iter().next().ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!("enqueue returned no job id"))
        })
    }
}

fn serialize(activity: &Activity) -> Result<String, AppError> {
    serde_json::to_string(&activity.to_json())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to serialize activity: {}", e)))
}
