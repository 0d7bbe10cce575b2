//! Inbound activity ingestion
//!
//! Order of checks:
//! 1. Check the Date window and body digest, which need no key
//! 2. Resolve the signing actor and verify the HTTP signature, refetching
//!    the actor once if the cached key does not verify
//! 3. Parse the activity and bind its actor to the signature keyId
//! 4. Reserve the activity id in the dedup ledger; replays stop here
//! 5. Dispatch by type; on failure the reservation is released

use std::sync::Arc;

use chrono::Utc;

use super::activity::{Activity, ActivityKind, Inbound, UndoTarget};
use super::fanout::FanoutEngine;
use super::resolver::ActorResolver;
use super::signature::{
    check_signed_headers, extract_signature_key_id, key_id_actor, key_id_matches_actor,
    verify_signature,
};
use crate::data::{Database, FollowRelation, InboxItem, RemoteActor, Share};
use crate::error::AppError;
use crate::metrics::{ACTIVITYPUB_ACTIVITIES_RECEIVED, FOLLOWERS_TOTAL};

/// The parts of an HTTP request ingestion needs
#[derive(Debug, Clone, Copy)]
pub struct InboundRequest<'a> {
    pub method: &'a str,
    /// Path and query as received
    pub path: &'a str,
    pub headers: &'a http::HeaderMap,
    pub body: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// New activity, dispatched
    Processed,
    /// Activity id already in the ledger; nothing changed
    Duplicate,
    /// Understood but has no effect here
    Ignored,
}

impl IngestOutcome {
    fn label(&self) -> &'static str {
        match self {
            IngestOutcome::Processed => "processed",
            IngestOutcome::Duplicate => "duplicate",
            IngestOutcome::Ignored => "ignored",
        }
    }
}

#[derive(Clone)]
pub struct InboxIngestion {
    db: Arc<Database>,
    resolver: ActorResolver,
    fanout: FanoutEngine,
    local_actor_uri: String,
    max_skew_secs: i64,
}

impl InboxIngestion {
    pub fn new(
        db: Arc<Database>,
        resolver: ActorResolver,
        fanout: FanoutEngine,
        local_actor_uri: String,
        max_skew_secs: i64,
    ) -> Self {
        Self {
            db,
            resolver,
            fanout,
            local_actor_uri,
            max_skew_secs,
        }
    }

    /// Process one inbound request
    ///
    /// # Errors
    /// - `InvalidSignature` when the signature is missing or does not verify
    /// - `ActorResolution` when the signing actor cannot be resolved
    /// - `Validation` for malformed or unrecognized activities
    pub async fn ingest(&self, request: InboundRequest<'_>) -> Result<IngestOutcome, AppError> {
        let key_id = extract_signature_key_id(request.headers)?;
        self.authenticate(&request, &key_id).await?;

        let value: serde_json::Value = serde_json::from_slice(request.body)
            .map_err(|e| AppError::Validation(format!("Invalid activity JSON: {}", e)))?;
        let inbound = Activity::parse(&value)?;

        if !key_id_matches_actor(&key_id, inbound.actor()) {
            return Err(AppError::InvalidSignature(
                "Signature keyId does not match activity actor".to_string(),
            ));
        }

        let activity_type = inbound.type_name().to_string();
        let result = self.process(inbound).await;

        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(e) => e.kind(),
        };
        ACTIVITYPUB_ACTIVITIES_RECEIVED
            .with_label_values(&[activity_type.as_str(), label])
            .inc();

        result
    }

    async fn authenticate(&self, request: &InboundRequest<'_>, key_id: &str) -> Result<(), AppError> {
        let signer = key_id_actor(key_id);

        // Stale or tampered requests fail here without any outbound fetch
        check_signed_headers(request.headers, Some(request.body), self.max_skew_secs, Utc::now())
            .inspect_err(|e| {
                tracing::info!(actor = %signer, error = %e, "Rejected inbound signature");
            })?;

        let actor = self.resolver.resolve(signer).await?;
        if self.verify_with(&actor, request, key_id).is_ok() {
            return Ok(());
        }

        // The key may have rotated since it was cached
        tracing::debug!(actor = %signer, "Signature did not verify with cached key, refetching");
        let actor = self.resolver.refresh(signer).await?;
        self.verify_with(&actor, request, key_id).inspect_err(|e| {
            tracing::info!(actor = %signer, error = %e, "Rejected inbound signature");
        })
    }

    fn verify_with(
        &self,
        actor: &RemoteActor,
        request: &InboundRequest<'_>,
        key_id: &str,
    ) -> Result<(), AppError> {
        let public_key_pem = actor.public_key_pem.as_deref().ok_or_else(|| {
            AppError::InvalidSignature(format!("{} publishes no public key", actor.uri))
        })?;

        if let Some(advertised) = actor.public_key_id.as_deref() {
            if advertised != key_id {
                return Err(AppError::InvalidSignature(
                    "Signature keyId does not match actor public key id".to_string(),
                ));
            }
        }

        verify_signature(
            request.method,
            request.path,
            request.headers,
            Some(request.body),
            public_key_pem,
            self.max_skew_secs,
            Utc::now(),
        )
    }

    async fn process(&self, inbound: Inbound) -> Result<IngestOutcome, AppError> {
        let item = InboxItem {
            activity_id: inbound.id().to_string(),
            activity_type: inbound.type_name().to_string(),
            actor_uri: inbound.actor().to_string(),
            received_at: Utc::now(),
        };

        if !self.db.reserve_inbox_item(&item).await? {
            tracing::debug!(activity_id = %item.activity_id, "Duplicate activity ignored");
            return Ok(IngestOutcome::Duplicate);
        }

        let activity = match inbound {
            Inbound::Activity(activity) => activity,
            Inbound::Ignored { activity_type, .. } => {
                tracing::debug!(activity_id = %item.activity_id, activity_type = %activity_type, "Ignoring activity");
                return Ok(IngestOutcome::Ignored);
            }
        };

        match self.dispatch(&activity).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Err(release_error) = self.db.release_inbox_item(&item.activity_id).await {
                    tracing::error!(
                        activity_id = %item.activity_id,
                        error = %release_error,
                        "Failed to release inbox reservation"
                    );
                }
                Err(e)
            }
        }
    }

    async fn dispatch(&self, activity: &Activity) -> Result<IngestOutcome, AppError> {
        match &activity.kind {
            ActivityKind::Follow { object } => self.handle_follow(activity, object).await,
            ActivityKind::Undo(target) => self.handle_undo(activity, target).await,
            ActivityKind::Announce { object } => self.handle_announce(activity, object).await,
            ActivityKind::Create(note) => {
                tracing::debug!(activity_id = %activity.id, note = %note.id, "Create received, not stored");
                Ok(IngestOutcome::Ignored)
            }
            ActivityKind::Accept { .. } => {
                tracing::info!(activity_id = %activity.id, actor = %activity.actor, "Accept received");
                Ok(IngestOutcome::Ignored)
            }
        }
    }

    async fn handle_follow(&self, activity: &Activity, object: &str) -> Result<IngestOutcome, AppError> {
        if object != self.local_actor_uri {
            return Err(AppError::Validation(
                "Follow target is not the local actor".to_string(),
            ));
        }

        let relation = FollowRelation {
            follower_uri: activity.actor.clone(),
            target_uri: self.local_actor_uri.clone(),
            follow_activity_id: Some(activity.id.clone()),
            created_at: Utc::now(),
        };
        let inserted = self.db.insert_follow_relation(&relation).await?;

        let accept = Activity::accept_follow(&self.local_actor_uri, activity);
        let job_id = self.fanout.deliver_to(&accept, &activity.actor).await?;

        tracing::info!(
            actor = %activity.actor,
            new_follower = inserted,
            job_id = %job_id,
            "Follow accepted"
        );
        self.refresh_follower_gauge().await;
        Ok(IngestOutcome::Processed)
    }

    async fn handle_undo(&self, activity: &Activity, target: &UndoTarget) -> Result<IngestOutcome, AppError> {
        let follow_id = match target {
            UndoTarget::Follow { id, object } => {
                if object.as_deref().is_some_and(|o| o != self.local_actor_uri) {
                    tracing::debug!(activity_id = %activity.id, "Undo Follow of another actor ignored");
                    return Ok(IngestOutcome::Ignored);
                }
                id.as_deref()
            }
            UndoTarget::Reference(id) => Some(id.as_str()),
            UndoTarget::Other(kind) => {
                tracing::debug!(activity_id = %activity.id, undone = %kind, "Undo ignored");
                return Ok(IngestOutcome::Ignored);
            }
        };

        let removed = self
            .db
            .delete_follow_relation(&activity.actor, &self.local_actor_uri, follow_id)
            .await?;

        if removed {
            tracing::info!(actor = %activity.actor, "Unfollowed");
            self.refresh_follower_gauge().await;
        } else {
            tracing::debug!(actor = %activity.actor, follow_id = ?follow_id, "Undo matched no follow relation");
        }
        Ok(IngestOutcome::Processed)
    }

    async fn handle_announce(&self, activity: &Activity, object: &str) -> Result<IngestOutcome, AppError> {
        let local_prefix = format!("{}/s/", self.local_actor_uri);
        if !object.starts_with(&local_prefix) {
            tracing::debug!(activity_id = %activity.id, object = %object, "Announce of a remote object ignored");
            return Ok(IngestOutcome::Ignored);
        }

        let share = Share {
            activity_id: activity.id.clone(),
            sharer_uri: activity.actor.clone(),
            object_uri: object.to_string(),
            created_at: Utc::now(),
        };
        self.db.insert_share(&share).await?;

        tracing::info!(actor = %activity.actor, object = %object, "Note shared");
        Ok(IngestOutcome::Processed)
    }

    async fn refresh_follower_gauge(&self) {
        if let Ok(count) = self.db.count_followers(&self.local_actor_uri).await {
            FOLLOWERS_TOTAL.set(count);
        }
    }
}
