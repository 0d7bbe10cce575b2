//! E2E tests for .well-known endpoints (WebFinger, NodeInfo)

mod common;

use axum::http::StatusCode;
use common::TestServer;
use serde_json::json;

#[tokio::test]
async fn test_nodeinfo_discovery_document_is_exact() {
    let server = TestServer::new().await;

    let (status, body) = server.get_json("/.well-known/nodeinfo").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "links": [
                {
                    "rel": "http://nodeinfo.diaspora.software/ns/schema/2.1",
                    "href": "https://test.example.com/nodeinfo/2.1"
                }
            ]
        })
    );
}

#[tokio::test]
async fn test_nodeinfo_document() {
    let server = TestServer::new().await;
    server.publish("one").await;
    server.publish("two").await;

    let (status, body) = server.get_json("/nodeinfo/2.1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], "2.1");
    assert_eq!(body["software"]["name"], "fedinote");
    assert_eq!(body["protocols"], json!(["activitypub"]));
    assert_eq!(body["openRegistrations"], false);
    assert_eq!(body["usage"]["users"]["total"], 1);
    assert_eq!(body["usage"]["localPosts"], 2);
}

#[tokio::test]
async fn test_webfinger_resolves_local_actor() {
    let server = TestServer::new().await;

    let (status, body) = server
        .get_json("/.well-known/webfinger?resource=acct:alice@test.example.com")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subject"], "acct:alice@test.example.com");
    assert_eq!(body["links"][0]["rel"], "self");
    assert_eq!(body["links"][0]["type"], "application/activity+json");
    assert_eq!(body["links"][0]["href"], common::LOCAL_ACTOR);
}

#[tokio::test]
async fn test_webfinger_accepts_actor_url() {
    let server = TestServer::new().await;

    let (status, body) = server
        .get_json("/.well-known/webfinger?resource=https://test.example.com/u/alice")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subject"], "acct:alice@test.example.com");
}

#[tokio::test]
async fn test_webfinger_unknown_account() {
    let server = TestServer::new().await;

    let (status, _) = server
        .get_json("/.well-known/webfinger?resource=acct:bob@test.example.com")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = server
        .get_json("/.well-known/webfinger?resource=acct:alice@other.example")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = server
        .get_json("/.well-known/webfinger?resource=acct:alice")
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
