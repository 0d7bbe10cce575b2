//! Well-known endpoints
//!
//! - /.well-known/webfinger
//! - /.well-known/nodeinfo
//! - /nodeinfo/2.1

use axum::{
    Router,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;

const NODEINFO_SCHEMA: &str = "http://nodeinfo.diaspora.software/ns/schema/2.1";

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
/// - GET /.well-known/nodeinfo
/// - GET /nodeinfo/2.1
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/.well-known/nodeinfo", get(nodeinfo_links))
        .route("/nodeinfo/2.1", get(nodeinfo))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger
///
/// Query: ?resource=acct:user@domain, or the actor URL itself
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Response, AppError> {
    let resource = query.resource.trim();
    let actor_url = state.config.actor_url();

    let is_local = if let Some(acct) = resource.strip_prefix("acct:") {
        let (username, domain) = acct
            .split_once('@')
            .ok_or_else(|| AppError::Validation("Invalid acct format".to_string()))?;
        username == state.config.actor.username
            && domain.eq_ignore_ascii_case(&state.config.server.domain)
    } else {
        resource == actor_url
    };

    if !is_local {
        return Err(AppError::NotFound);
    }

    let subject = format!(
        "acct:{}@{}",
        state.config.actor.username, state.config.server.domain
    );
    let body = serde_json::json!({
        "subject": subject,
        "aliases": [actor_url.clone()],
        "links": [
            {
                "rel": "self",
                "type": "application/activity+json",
                "href": actor_url
            }
        ]
    });

    Ok(([(header::CONTENT_TYPE, "application/jrd+json")], body.to_string()).into_response())
}

/// GET /.well-known/nodeinfo
///
/// Returns the link to the nodeinfo document.
async fn nodeinfo_links(State(state): State<AppState>) -> Json<serde_json::Value> {
    let base_url = state.config.server.base_url();
    Json(serde_json::json!({
        "links": [
            {
                "rel": NODEINFO_SCHEMA,
                "href": format!("{}/nodeinfo/2.1", base_url)
            }
        ]
    }))
}

/// GET /nodeinfo/2.1
async fn nodeinfo(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let local_posts = state.db.count_notes().await?;

    Ok(Json(serde_json::json!({
        "version": "2.1",
        "software": {
            "name": "fedinote",
            "version": env!("CARGO_PKG_VERSION")
        },
        "protocols": ["activitypub"],
        "services": {
            "inbound": [],
            "outbound": []
        },
        "openRegistrations": false,
        "usage": {
            "users": {
                "total": 1
            },
            "localPosts": local_posts
        },
        "metadata": {
            "nodeName": state.config.actor.display_name
        }
    })))
}
