//! HTTP contract tests for the legal service client.

use metastore_core::{Error, LegalService, RequestContext};
use metastore_jobs::{HttpLegalService, LegalConfig};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> HttpLegalService {
    HttpLegalService::new(LegalConfig::default().with_base_url(server.uri()))
        .expect("Failed to build legal client")
}

#[tokio::test]
async fn test_validate_sends_tenant_headers() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/legaltags:validate"))
        .and(header("data-partition-id", "opendes"))
        .and(header("correlation-id", "corr-9"))
        .and(header("user", "alice@example.com"))
        .and(body_json(json!({ "names": ["T1", "T2"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "invalidLegalTags": [{ "name": "T2", "reason": "expired" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let ctx = RequestContext::new("opendes")
        .with_correlation_id("corr-9")
        .with_user("alice@example.com");
    let invalid = client(&server)
        .invalid_tags(&ctx, &["T1".to_string(), "T2".to_string()])
        .await
        .unwrap();

    assert_eq!(invalid.len(), 1);
    assert_eq!(invalid[0].name, "T2");
    assert_eq!(invalid[0].reason, "expired");
}

#[tokio::test]
async fn test_validate_chunks_large_name_lists() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/legaltags:validate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "invalidLegalTags": [] })))
        .expect(2)
        .mount(&server)
        .await;

    let names: Vec<String> = (0..30).map(|i| format!("tag-{}", i)).collect();
    let invalid = client(&server)
        .invalid_tags(&RequestContext::new("opendes"), &names)
        .await
        .unwrap();

    assert!(invalid.is_empty());
    let requests = server.received_requests().await.unwrap();
    let sizes: Vec<usize> = requests
        .iter()
        .map(|r| {
            let body: serde_json::Value = serde_json::from_slice(&r.body).unwrap();
            body["names"].as_array().unwrap().len()
        })
        .collect();
    assert_eq!(sizes, vec![25, 5]);
}

#[tokio::test]
async fn test_validate_surfaces_server_errors() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/legaltags:validate"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let err = client(&server)
        .invalid_tags(&RequestContext::new("opendes"), &["T1".to_string()])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::LegalService(_)));
}

#[tokio::test]
async fn test_validate_unreachable_service_is_request_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let legal = HttpLegalService::new(
        LegalConfig::default().with_base_url(format!("http://{}", addr)),
    )
    .unwrap();
    let err = legal
        .invalid_tags(&RequestContext::new("opendes"), &["T1".to_string()])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Request(_)));
}

#[tokio::test]
async fn test_validate_unparseable_body_is_request_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/legaltags:validate"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let err = client(&server)
        .invalid_tags(&RequestContext::new("opendes"), &["T1".to_string()])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Request(_)));
}

#[tokio::test]
async fn test_missing_invalid_list_means_all_valid() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/legaltags:validate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let invalid = client(&server)
        .invalid_tags(&RequestContext::new("opendes"), &["T1".to_string()])
        .await
        .unwrap();
    assert!(invalid.is_empty());
}
