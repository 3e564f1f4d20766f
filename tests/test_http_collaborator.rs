//! Integration tests for the HTTP collaborator
//!
//! Runs `ReqwestCollaborator` against a local mock server and checks the
//! contract shared with `MockHttpCollaborator`.

use bytes::Bytes;
use devlink::config::HttpSection;
use devlink::http::{HttpCollaborator, HttpError, HttpMethod, HttpResponse, ReqwestCollaborator};
use devlink::testing::MockHttpCollaborator;
use serde::Deserialize;
use wiremock::matchers::{body_string, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn collaborator(base_url: &str) -> ReqwestCollaborator {
    ReqwestCollaborator::new(&HttpSection {
        base_url: base_url.to_string(),
        timeout_secs: 5,
    })
    .unwrap()
}

#[derive(Debug, Deserialize)]
struct ContentInfo {
    content_id: String,
    url: String,
}

#[tokio::test]
async fn test_get_returns_status_and_body() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/content/welcome"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "content_id": "welcome",
            "url": "https://cdn.example.com/welcome.png"
        })))
        .mount(&mock_server)
        .await;

    let http = collaborator(&format!("{}/api", mock_server.uri()));
    let response = http
        .request(HttpMethod::Get, "/content/welcome", None)
        .await
        .unwrap();

    assert!(response.is_success());
    let info: ContentInfo = response.json().unwrap();
    assert_eq!(info.content_id, "welcome");
    assert_eq!(info.url, "https://cdn.example.com/welcome.png");
}

#[tokio::test]
async fn test_post_sends_body() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/devices/frame-01/screenshot"))
        .and(body_string("png"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&mock_server)
        .await;

    let http = collaborator(&mock_server.uri());
    let response = http
        .request(
            HttpMethod::Post,
            "devices/frame-01/screenshot",
            Some(Bytes::from_static(b"png")),
        )
        .await
        .unwrap();
    assert_eq!(response.status, 201);
}

#[tokio::test]
async fn test_error_status_is_a_response_not_an_error() {
    let mock_server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/content/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .mount(&mock_server)
        .await;

    let http = collaborator(&mock_server.uri());
    let response = http
        .request(HttpMethod::Delete, "content/missing", None)
        .await
        .unwrap();
    assert_eq!(response.status, 404);
    assert!(!response.is_success());
    assert_eq!(&response.body[..], b"not found");
}

#[tokio::test]
async fn test_unreachable_server_is_request_error() {
    let http = collaborator("http://127.0.0.1:1");
    let result = http.request(HttpMethod::Get, "content", None).await;
    assert!(matches!(result, Err(HttpError::Request(_))));
}

#[tokio::test]
async fn test_mock_collaborator_serves_canned_responses() {
    let mock = MockHttpCollaborator::new();
    mock.respond(
        HttpMethod::Get,
        "content/welcome",
        HttpResponse::new(200, Bytes::from_static(b"{}")),
    )
    .await;

    let http: Box<dyn HttpCollaborator> = Box::new(mock.clone());
    assert_eq!(
        http.request(HttpMethod::Get, "content/welcome", None)
            .await
            .unwrap()
            .status,
        200
    );
    assert_eq!(
        http.request(HttpMethod::Put, "content/welcome", None)
            .await
            .unwrap()
            .status,
        404
    );
    assert_eq!(mock.requests().await.len(), 2);
}
