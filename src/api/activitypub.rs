//! ActivityPub endpoints
//!
//! - Actor profile
//! - Inbox (activity receiving)
//! - Note objects
//! - Followers collection

use axum::body::Bytes;
use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};

use crate::AppState;
use crate::error::AppError;
use crate::federation::{InboundRequest, IngestOutcome};
use crate::metrics::{
    FEDERATION_REQUEST_DURATION_SECONDS, HTTP_REQUEST_DURATION_SECONDS, HTTP_REQUESTS_TOTAL,
};
use crate::service::note_object;

const ACTIVITY_JSON: &str = "application/activity+json";

/// Create ActivityPub router
///
/// Routes:
/// - GET /u/:username - Actor profile
/// - POST /u/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
/// - GET /u/:username/followers - Followers collection
/// - GET /u/:username/s/:id - Note object
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/u/:username", get(actor))
        .route("/u/:username/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
        .route("/u/:username/followers", get(followers))
        .route("/u/:username/s/:id", get(note))
}

fn activity_json(value: serde_json::Value) -> Response {
    ([(header::CONTENT_TYPE, ACTIVITY_JSON)], value.to_string()).into_response()
}

fn ensure_local_user(state: &AppState, username: &str) -> Result<(), AppError> {
    if state.config.actor.username == username {
        Ok(())
    } else {
        Err(AppError::NotFound)
    }
}

/// GET /u/:username
///
/// Returns the ActivityPub Person document of the local actor.
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/u/:username"])
        .start_timer();

    ensure_local_user(&state, &username)?;

    let actor_config = &state.config.actor;
    let base_url = state.config.server.base_url();
    let actor_url = state.config.actor_url();

    let document = serde_json::json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "type": "Person",
        "id": actor_url.clone(),
        "preferredUsername": actor_config.username,
        "name": actor_config.display_name,
        "summary": actor_config.summary,
        "inbox": format!("{}/inbox", actor_url),
        "followers": format!("{}/followers", actor_url),
        "url": actor_url.clone(),
        "endpoints": {
            "sharedInbox": format!("{}/inbox", base_url)
        },
        "publicKey": {
            "id": state.key.key_id(),
            "owner": actor_url,
            "publicKeyPem": state.key.public_key_pem()
        },
        "icon": actor_config.icon_url.as_ref().map(|url| serde_json::json!({
            "type": "Image",
            "url": url
        }))
    });

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/u/:username", "200"])
        .inc();

    Ok(activity_json(document))
}

/// POST /u/:username/inbox
///
/// Receives activities addressed to the local actor.
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    ensure_local_user(&state, &username)?;
    receive(&state, "/u/:username/inbox", &uri, &headers, &body).await
}

/// POST /inbox
///
/// Shared inbox; the single local actor makes it equivalent to the personal one.
async fn shared_inbox(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    receive(&state, "/inbox", &uri, &headers, &body).await
}

async fn receive(
    state: &AppState,
    endpoint: &str,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<StatusCode, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", endpoint])
        .start_timer();
    let _fed_timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    // Signatures cover the path exactly as sent, query included
    let path = uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or_else(|| uri.path());

    let request = InboundRequest {
        method: "POST",
        path,
        headers,
        body,
    };

    let outcome = state.inbox.ingest(request).await?;
    if outcome == IngestOutcome::Duplicate {
        tracing::debug!(endpoint = %endpoint, "Replayed activity acknowledged");
    }

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", endpoint, "202"])
        .inc();

    Ok(StatusCode::ACCEPTED)
}

/// GET /u/:username/followers
///
/// Returns the size of the followers collection; members are not listed.
async fn followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    ensure_local_user(&state, &username)?;

    let actor_url = state.config.actor_url();
    let total = state.db.count_followers(&actor_url).await?;

    Ok(activity_json(serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollection",
        "id": format!("{}/followers", actor_url),
        "totalItems": total
    })))
}

/// GET /u/:username/s/:id
///
/// Returns a local note as an ActivityPub Note object.
async fn note(
    State(state): State<AppState>,
    Path((username, id)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/u/:username/s/:id"])
        .start_timer();

    ensure_local_user(&state, &username)?;

    let note = state.notes.get(&id).await?;
    let mut object = note_object(&state.config.actor_url(), &note).to_json();
    if let Some(map) = object.as_object_mut() {
        map.insert(
            "@context".to_string(),
            serde_json::Value::String("https://www.w3.org/ns/activitystreams".to_string()),
        );
    }

    Ok(activity_json(object))
}
