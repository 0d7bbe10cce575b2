//! Remote actor resolution
//!
//! Fetches actor documents over signed GET and caches them in the
//! `actors` table. Entries never expire on their own; `refresh` forces
//! a refetch when a cached key stops verifying.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use super::signature::{LocalKey, sign_request};
use super::transport::{OutboundFetch, OutboundRequest};
use crate::data::{Database, RemoteActor};
use crate::error::AppError;
use crate::metrics::ACTOR_RESOLUTIONS_TOTAL;

const ACTIVITY_JSON_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

#[derive(Clone)]
pub struct ActorResolver {
    db: Arc<Database>,
    fetcher: Arc<dyn OutboundFetch>,
    key: Arc<LocalKey>,
}

impl ActorResolver {
    pub fn new(db: Arc<Database>, fetcher: Arc<dyn OutboundFetch>, key: Arc<LocalKey>) -> Self {
        Self { db, fetcher, key }
    }

    /// Return the cached actor, fetching it on a miss.
    ///
    /// # Errors
    /// `ActorResolution` if the document cannot be fetched or lacks a
    /// name or inbox.
    pub async fn resolve(&self, actor_uri: &str) -> Result<RemoteActor, AppError> {
        if let Some(actor) = self.db.get_actor(actor_uri).await? {
            ACTOR_RESOLUTIONS_TOTAL.with_label_values(&["cache"]).inc();
            return Ok(actor);
        }

        self.refresh(actor_uri).await
    }

    /// Fetch the actor document regardless of the cache and store it.
    pub async fn refresh(&self, actor_uri: &str) -> Result<RemoteActor, AppError> {
        let result = self.fetch(actor_uri).await;
        match &result {
            Ok(_) => ACTOR_RESOLUTIONS_TOTAL.with_label_values(&["network"]).inc(),
            Err(e) => {
                ACTOR_RESOLUTIONS_TOTAL.with_label_values(&["failed"]).inc();
                tracing::warn!(actor = %actor_uri, error = %e, "Actor resolution failed");
            }
        }
        let actor = result?;

        self.db.upsert_actor(&actor).await?;
        tracing::debug!(actor = %actor.uri, inbox = %actor.inbox_url, "Actor cached");
        Ok(actor)
    }

    async fn fetch(&self, actor_uri: &str) -> Result<RemoteActor, AppError> {
        let signed = sign_request("GET", actor_uri, None, Utc::now(), &self.key)
            .map_err(|e| AppError::ActorResolution(format!("{}: {}", actor_uri, e)))?;

        let request = OutboundRequest {
            method: http::Method::GET,
            url: actor_uri.to_string(),
            headers: vec![
                ("Accept".to_string(), ACTIVITY_JSON_ACCEPT.to_string()),
                ("Date".to_string(), signed.date),
                ("Signature".to_string(), signed.signature),
            ],
            body: None,
        };

        let response = self
            .fetcher
            .send(request)
            .await
            .map_err(|e| AppError::ActorResolution(format!("{}: {}", actor_uri, e)))?;

        if !response.is_success() {
            return Err(AppError::ActorResolution(format!(
                "{}: HTTP {}",
                actor_uri, response.status
            )));
        }

        let document: Value = serde_json::from_slice(&response.body).map_err(|e| {
            AppError::ActorResolution(format!("{}: invalid JSON: {}", actor_uri, e))
        })?;

        parse_actor_document(actor_uri, &document)
    }
}

/// Build a cache entry from an actor document.
///
/// Missing name or inbox is a failure, not a partial actor.
pub fn parse_actor_document(actor_uri: &str, document: &Value) -> Result<RemoteActor, AppError> {
    let fail = |msg: &str| AppError::ActorResolution(format!("{}: {}", actor_uri, msg));
    let str_field = |field: &str| {
        document
            .get(field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    if let Some(id) = str_field("id") {
        if id != actor_uri {
            return Err(fail("document id does not match requested actor"));
        }
    }

    let preferred_username = str_field("preferredUsername");
    let display_name = str_field("name")
        .or_else(|| preferred_username.clone())
        .ok_or_else(|| fail("missing name"))?;
    let inbox_url = str_field("inbox").ok_or_else(|| fail("missing inbox"))?;

    let host = url::Url::parse(actor_uri)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .ok_or_else(|| fail("invalid actor URL"))?;
    let handle = format!(
        "{}@{}",
        preferred_username.as_deref().unwrap_or(&display_name),
        host
    );

    let public_key = document.get("publicKey");
    let public_key_id = public_key
        .and_then(|key| key.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let public_key_pem = public_key
        .and_then(|key| key.get("publicKeyPem"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let shared_inbox_url = document
        .get("endpoints")
        .and_then(|endpoints| endpoints.get("sharedInbox"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let icon_url = match document.get("icon") {
        Some(Value::String(url)) => Some(url.clone()),
        Some(icon) => icon.get("url").and_then(Value::as_str).map(str::to_string),
        None => None,
    };

    Ok(RemoteActor {
        uri: actor_uri.to_string(),
        handle,
        display_name,
        inbox_url,
        shared_inbox_url,
        public_key_id,
        public_key_pem,
        summary: str_field("summary"),
        icon_url,
        profile_url: str_field("url"),
        raw_json: document.to_string(),
        fetched_at: Utc::now(),
    })
}
