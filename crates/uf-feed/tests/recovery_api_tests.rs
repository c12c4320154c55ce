//! HTTP recovery issuer against a mock API

use chrono::{DateTime, Utc};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use uf_common::default_producer_catalog;
use uf_config::ApiSettings;
use uf_feed::{FeedError, HttpRecoveryIssuer, RecoveryIssuer};

fn settings(base_url: String) -> ApiSettings {
    ApiSettings {
        base_url,
        access_token: "secret-token".to_string(),
        timeout_secs: 5,
    }
}

fn live_odds() -> uf_common::ProducerInfo {
    default_producer_catalog()
        .into_iter()
        .find(|p| p.id == 1)
        .unwrap()
}

#[tokio::test]
async fn test_recovery_request_carries_after_and_node_id() {
    let server = MockServer::start().await;
    let after = DateTime::from_timestamp_millis(1_760_000_000_000).unwrap();

    Mock::given(method("POST"))
        .and(path("/v1/liveodds/recovery/initiate_request"))
        .and(query_param("after", "1760000000000"))
        .and(query_param("node_id", "7"))
        .and(header("x-access-token", "secret-token"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let issuer = HttpRecoveryIssuer::new(&settings(server.uri()), Some(7)).unwrap();
    let request_id = issuer.next_request_id();
    issuer.issue_recovery(&live_odds(), request_id, after).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let query = requests[0].url.query().unwrap_or_default().to_string();
    assert!(query.contains(&format!("request_id={}", request_id)));
}

#[tokio::test]
async fn test_full_snapshot_has_no_after() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/liveodds/recovery/initiate_request"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let issuer = HttpRecoveryIssuer::new(&settings(format!("{}/", server.uri())), None).unwrap();
    let first = issuer.next_request_id();
    let second = issuer.next_request_id();
    assert!(second > first);
    issuer.issue_full_snapshot(&live_odds(), first).await.unwrap();
    issuer.issue_full_snapshot(&live_odds(), second).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    for (request, id) in requests.iter().zip([first, second]) {
        let query = request.url.query().unwrap_or_default().to_string();
        assert!(query.contains(&format!("request_id={}", id)));
        assert!(!query.contains("after="));
        assert!(!query.contains("node_id="));
    }
}

#[tokio::test]
async fn test_rejected_request_is_an_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/liveodds/recovery/initiate_request"))
        .respond_with(ResponseTemplate::new(403).set_body_string("Forbidden"))
        .mount(&server)
        .await;

    let issuer = HttpRecoveryIssuer::new(&settings(server.uri()), None).unwrap();
    let result = issuer.issue_recovery(&live_odds(), 1, Utc::now()).await;

    match result {
        Err(FeedError::Recovery(message)) => {
            assert!(message.contains("403"));
            assert!(message.contains("Forbidden"));
        }
        Ok(()) => panic!("expected a recovery error"),
        Err(other) => panic!("expected a recovery error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_api_is_an_error() {
    // Nothing listens here once the server is dropped
    let uri = {
        let server = MockServer::start().await;
        server.uri()
    };

    let issuer = HttpRecoveryIssuer::new(&settings(uri), None).unwrap();
    let result = issuer.issue_full_snapshot(&live_odds(), 1).await;
    assert!(matches!(result, Err(FeedError::Http(_))));
}
