//! Common test utilities for E2E tests
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, Utc};
use fedinote::data::{Database, DeliveryJob, FollowRelation};
use fedinote::federation::{
    FetchError, LocalKey, OutboundFetch, OutboundRequest, OutboundResponse, sign_request,
};
use fedinote::{AppState, config};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

pub const DOMAIN: &str = "test.example.com";
pub const USERNAME: &str = "alice";
pub const OWNER_TOKEN: &str = "test-owner-token-0123456789abcdef";
pub const LOCAL_ACTOR: &str = "https://test.example.com/u/alice";

// =============================================================================
// Scripted outbound transport
// =============================================================================

/// In-memory stand-in for the network
///
/// GETs are answered from registered documents (404 otherwise). POSTs are
/// answered from per-URL scripted statuses, then the URL's default status,
/// then 202.
#[derive(Default)]
pub struct MockFetcher {
    documents: Mutex<HashMap<String, Value>>,
    scripted: Mutex<HashMap<String, VecDeque<u16>>>,
    defaults: Mutex<HashMap<String, u16>>,
    unreachable: Mutex<HashSet<String>>,
    requests: Mutex<Vec<OutboundRequest>>,
}

impl MockFetcher {
    pub fn serve_document(&self, url: &str, document: Value) {
        self.documents
            .lock()
            .unwrap()
            .insert(url.to_string(), document);
    }

    pub fn remove_document(&self, url: &str) {
        self.documents.lock().unwrap().remove(url);
    }

    /// Queue statuses returned by successive POSTs to `url`
    pub fn script_statuses(&self, url: &str, statuses: &[u16]) {
        self.scripted
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .extend(statuses.iter().copied());
    }

    pub fn set_status(&self, url: &str, status: u16) {
        self.defaults
            .lock()
            .unwrap()
            .insert(url.to_string(), status);
    }

    /// Requests to `url` fail before any response
    pub fn set_unreachable(&self, url: &str) {
        self.unreachable.lock().unwrap().insert(url.to_string());
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// POSTs sent to `url`, oldest first
    pub fn posts_to(&self, url: &str) -> Vec<OutboundRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == http::Method::POST && r.url == url)
            .collect()
    }

    pub fn gets_of(&self, url: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == http::Method::GET && r.url == url)
            .count()
    }
}

#[async_trait]
impl OutboundFetch for MockFetcher {
    async fn send(&self, request: OutboundRequest) -> Result<OutboundResponse, FetchError> {
        self.requests.lock().unwrap().push(request.clone());

        if self.unreachable.lock().unwrap().contains(&request.url) {
            return Err(FetchError::Connect("connection refused".to_string()));
        }

        if request.method == http::Method::GET {
            return Ok(match self.documents.lock().unwrap().get(&request.url) {
                Some(document) => OutboundResponse {
                    status: 200,
                    body: serde_json::to_vec(document).unwrap(),
                },
                None => OutboundResponse {
                    status: 404,
                    body: Vec::new(),
                },
            });
        }

        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&request.url)
            .and_then(VecDeque::pop_front);
        let status = scripted
            .or_else(|| self.defaults.lock().unwrap().get(&request.url).copied())
            .unwrap_or(202);

        Ok(OutboundResponse {
            status,
            body: Vec::new(),
        })
    }
}

// =============================================================================
// Remote actors
// =============================================================================

/// A remote actor with its own signing key
pub struct RemoteActor {
    pub uri: String,
    pub inbox: String,
    pub key: LocalKey,
}

impl RemoteActor {
    pub fn new(uri: &str, inbox: &str) -> Self {
        let key = LocalKey::generate(1024, format!("{}#main-key", uri)).unwrap();
        Self {
            uri: uri.to_string(),
            inbox: inbox.to_string(),
            key,
        }
    }

    pub fn document(&self) -> Value {
        let username = self.uri.rsplit('/').next().unwrap_or("someone");
        serde_json::json!({
            "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
            "id": self.uri,
            "type": "Person",
            "preferredUsername": username,
            "name": format!("Remote {}", username),
            "inbox": self.inbox,
            "publicKey": {
                "id": self.key.key_id(),
                "owner": self.uri,
                "publicKeyPem": self.key.public_key_pem()
            }
        })
    }

    /// Signed inbox POST of `activity` to `path` on the local server
    pub fn signed_post(&self, path: &str, activity: &Value) -> Request<Body> {
        self.signed_post_at(path, activity, Utc::now())
    }

    /// Signed inbox POST carrying `date` in its Date header
    pub fn signed_post_at(&self, path: &str, activity: &Value, date: DateTime<Utc>) -> Request<Body> {
        let body = serde_json::to_vec(activity).unwrap();
        let url = format!("https://{}{}", DOMAIN, path);
        let signed = sign_request("POST", &url, Some(&body), date, &self.key).unwrap();

        Request::builder()
            .method("POST")
            .uri(path)
            .header("host", signed.host)
            .header("date", signed.date)
            .header("digest", signed.digest.unwrap())
            .header("signature", signed.signature)
            .header("content-type", "application/activity+json")
            .body(Body::from(body))
            .unwrap()
    }
}

// =============================================================================
// Test server
// =============================================================================

pub fn test_config(db_path: std::path::PathBuf, key_path: std::path::PathBuf) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: DOMAIN.to_string(),
            protocol: "https".to_string(),
        },
        database: config::DatabaseConfig { path: db_path },
        actor: config::ActorConfig {
            username: USERNAME.to_string(),
            display_name: "Alice".to_string(),
            summary: "Test actor".to_string(),
            icon_url: None,
            private_key_path: key_path,
        },
        auth: config::AuthConfig {
            owner_token: OWNER_TOKEN.to_string(),
        },
        federation: config::FederationConfig {
            request_timeout_secs: 5,
            signature_max_skew_secs: 300,
            allow_private_networks: true,
            user_agent: "fedinote-test".to_string(),
        },
        delivery: config::DeliveryConfig::default(),
        logging: config::LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// Test server instance over a temporary database and a mock network
pub struct TestServer {
    pub state: AppState,
    pub mock: Arc<MockFetcher>,
    pub _temp_dir: TempDir,
}

impl TestServer {
    pub async fn new() -> Self {
        Self::with_delivery(config::DeliveryConfig::default()).await
    }

    pub async fn with_delivery(delivery: config::DeliveryConfig) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(
            temp_dir.path().join("test.db"),
            temp_dir.path().join("actor.pem"),
        );
        config.delivery = delivery;

        let db = Database::connect(&config.database.path).await.unwrap();
        let key = LocalKey::generate(1024, format!("{}#main-key", LOCAL_ACTOR)).unwrap();
        let mock = Arc::new(MockFetcher::default());

        let state = AppState::with_parts(config, Arc::new(db), Arc::new(key), mock.clone());

        Self {
            state,
            mock,
            _temp_dir: temp_dir,
        }
    }

    /// Register a remote actor with the mock network
    pub fn remote_actor(&self, uri: &str, inbox: &str) -> RemoteActor {
        let actor = RemoteActor::new(uri, inbox);
        self.mock.serve_document(uri, actor.document());
        actor
    }

    /// Drive one request through the full router
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = fedinote::build_router(self.state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    pub async fn get_json(&self, path: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(path).body(Body::empty()).unwrap();
        let (status, body) = self.send(request).await;
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    /// Owner API request with the bearer token
    pub async fn owner_request(&self, method: &str, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(path)
            .header("authorization", format!("Bearer {}", OWNER_TOKEN));
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let (status, body) = self.send(request).await;
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    /// Remote follow of the local actor through the shared inbox
    pub async fn follow_from(&self, actor: &RemoteActor) -> StatusCode {
        let follow = fedinote::federation::builder::follow(
            &format!("{}/follows/{}", actor.uri, ulid::Ulid::new()),
            &actor.uri,
            LOCAL_ACTOR,
        );
        self.send(actor.signed_post("/inbox", &follow)).await.0
    }

    /// Record `actor` as a follower without going through the inbox
    pub async fn add_follower(&self, actor: &RemoteActor) {
        let relation = FollowRelation {
            follower_uri: actor.uri.clone(),
            target_uri: LOCAL_ACTOR.to_string(),
            follow_activity_id: Some(format!("{}/follows/seed", actor.uri)),
            created_at: Utc::now(),
        };
        self.state.db.insert_follow_relation(&relation).await.unwrap();
    }

    /// Publish a note through the owner API, returning the Create activity id
    pub async fn publish(&self, content: &str) -> Value {
        let (status, body) = self
            .owner_request("POST", "/api/note", Some(serde_json::json!({ "content": content })))
            .await;
        assert_eq!(status, StatusCode::CREATED, "publish failed: {body}");
        body
    }

    pub async fn jobs_for(&self, activity_id: &str) -> Vec<DeliveryJob> {
        self.state.db.jobs_for_activity(activity_id).await.unwrap()
    }

    pub async fn job(&self, id: &str) -> DeliveryJob {
        self.state.db.get_job(id).await.unwrap().unwrap()
    }
}

/// Decode the JSON body of a recorded outbound request
pub fn request_json(request: &OutboundRequest) -> Value {
    serde_json::from_slice(request.body.as_deref().unwrap_or_default()).unwrap()
}
