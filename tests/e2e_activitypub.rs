//! E2E tests for ActivityPub GET endpoints

mod common;

use axum::http::StatusCode;
use common::{LOCAL_ACTOR, TestServer};

#[tokio::test]
async fn test_actor_document() {
    let server = TestServer::new().await;

    let (status, body) = server.get_json("/u/alice").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], "Person");
    assert_eq!(body["id"], LOCAL_ACTOR);
    assert_eq!(body["preferredUsername"], "alice");
    assert_eq!(body["name"], "Alice");
    assert_eq!(body["inbox"], "https://test.example.com/u/alice/inbox");
    assert_eq!(body["endpoints"]["sharedInbox"], "https://test.example.com/inbox");
    assert_eq!(body["publicKey"]["id"], "https://test.example.com/u/alice#main-key");
    assert_eq!(body["publicKey"]["owner"], LOCAL_ACTOR);
    assert_eq!(
        body["publicKey"]["publicKeyPem"],
        server.state.key.public_key_pem()
    );
}

#[tokio::test]
async fn test_actor_document_parses_as_remote_actor() {
    let server = TestServer::new().await;

    let (_, body) = server.get_json("/u/alice").await;
    let parsed = fedinote::federation::parse_actor_document(LOCAL_ACTOR, &body).unwrap();
    assert_eq!(parsed.inbox_url, "https://test.example.com/u/alice/inbox");
    assert_eq!(parsed.handle, "alice@test.example.com");
    assert_eq!(
        parsed.shared_inbox_url.as_deref(),
        Some("https://test.example.com/inbox")
    );
}

#[tokio::test]
async fn test_unknown_actor_is_not_found() {
    let server = TestServer::new().await;

    let (status, _) = server.get_json("/u/bob").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_note_object() {
    let server = TestServer::new().await;
    let published = server.publish("line one\nline <two>").await;
    let note_id = published["note"]["id"].as_str().unwrap();

    let (status, body) = server.get_json(&format!("/u/alice/s/{}", note_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], "Note");
    assert_eq!(body["id"], published["note"]["uri"]);
    assert_eq!(body["attributedTo"], LOCAL_ACTOR);
    assert_eq!(body["content"], "<p>line one<br>line &lt;two&gt;</p>");
    assert_eq!(
        body["to"],
        serde_json::json!(["https://www.w3.org/ns/activitystreams#Public"])
    );
    assert_eq!(
        body["cc"],
        serde_json::json!(["https://test.example.com/u/alice/followers"])
    );
}

#[tokio::test]
async fn test_missing_note_is_not_found() {
    let server = TestServer::new().await;

    let (status, _) = server.get_json("/u/alice/s/01NOSUCHNOTE").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_followers_collection_counts() {
    let server = TestServer::new().await;
    let bob = server.remote_actor(
        "https://remote.example/users/bob",
        "https://remote.example/inbox",
    );
    server.add_follower(&bob).await;

    let (status, body) = server.get_json("/u/alice/followers").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], "OrderedCollection");
    assert_eq!(body["totalItems"], 1);
}

#[tokio::test]
async fn test_health_and_metrics() {
    let server = TestServer::new().await;
    fedinote::metrics::init_metrics();

    let request = axum::http::Request::builder()
        .uri("/health")
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, body) = server.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");

    let request = axum::http::Request::builder()
        .uri("/metrics")
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, body) = server.send(request).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("fedinote_delivery_jobs"));
}
