//! HTTP-level tests for the Firestore client and repositories.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

use motion_models::{ImageId, ImageRecord, Outcome, RecordStatus};
use motion_queue::{ClaimContext, QueueError, ResultStore, WorkQueue};

use crate::client::{FirestoreClient, FirestoreConfig};
use crate::error::FirestoreError;
use crate::image_repo::ImageRepository;
use crate::result_repo::DetectionResultRepository;
use crate::retry::RetryConfig;
use crate::token_cache::StaticTokenSource;

const DOCS: &str = "/v1/projects/test-project/databases/test-db/documents";
const UPDATE_TIME: &str = "2024-05-01T12:00:00.123456Z";

fn test_config(server: &MockServer) -> FirestoreConfig {
    FirestoreConfig {
        project_id: "test-project".to_string(),
        database_id: "test-db".to_string(),
        api_root: format!("{}/v1", server.uri()),
        emulator: false,
        timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(2),
        retry: RetryConfig {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 10,
        },
    }
}

fn test_client(server: &MockServer) -> FirestoreClient {
    FirestoreClient::with_token_source(
        test_config(server),
        Arc::new(StaticTokenSource::new("test-token")),
    )
    .unwrap()
}

fn ctx(worker: &str) -> ClaimContext {
    ClaimContext::new(worker, Duration::from_secs(600), 3)
}

fn image_doc(id: &str, status: &str, extra: serde_json::Value) -> serde_json::Value {
    let mut fields = json!({
        "captured_at": {"timestampValue": "2024-05-01T11:59:00Z"},
        "storage_ref": {"stringValue": format!("raw/{}.jpg", id)},
        "status": {"stringValue": status},
        "attempts": {"integerValue": "0"}
    });
    if let (Some(base), Some(more)) = (fields.as_object_mut(), extra.as_object()) {
        for (k, v) in more {
            base.insert(k.clone(), v.clone());
        }
    }
    json!({
        "name": format!("projects/test-project/databases/test-db/documents/images/{}", id),
        "fields": fields,
        "updateTime": UPDATE_TIME
    })
}

/// Matches requests whose body contains a substring.
struct BodyContains(&'static str);

impl Match for BodyContains {
    fn matches(&self, request: &Request) -> bool {
        String::from_utf8_lossy(&request.body).contains(self.0)
    }
}

// =============================================================================
// Error mapping
// =============================================================================

#[test]
fn test_error_from_http_status() {
    assert!(matches!(
        FirestoreError::from_http_status(429, "rate limited"),
        FirestoreError::RateLimited(_)
    ));
    assert!(matches!(
        FirestoreError::from_http_status(503, "unavailable"),
        FirestoreError::ServerError(503, _)
    ));
    assert!(matches!(
        FirestoreError::from_http_status(404, "missing"),
        FirestoreError::NotFound(_)
    ));
    assert!(matches!(
        FirestoreError::from_http_status(400, "bad request"),
        FirestoreError::RequestFailed(_)
    ));
    assert!(FirestoreError::from_http_status(412, "stale").is_precondition_failed());
    assert!(FirestoreError::from_http_status(
        400,
        r#"{"error":{"status":"FAILED_PRECONDITION"}}"#
    )
    .is_precondition_failed());
}

#[test]
fn test_error_retry_classification() {
    assert!(FirestoreError::from_http_status(500, "boom").is_retryable());
    assert!(FirestoreError::from_http_status(429, "slow down").is_retryable());
    assert!(!FirestoreError::from_http_status(400, "bad").is_retryable());
    assert!(!FirestoreError::from_http_status(412, "stale").is_retryable());
    assert_eq!(FirestoreError::RateLimited(5000).retry_after_ms(), Some(5000));
    assert_eq!(
        FirestoreError::ServerError(502, "bad gateway".into()).http_status(),
        Some(502)
    );
}

// =============================================================================
// Client
// =============================================================================

#[tokio::test]
async fn test_get_document_sends_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/images/img-1", DOCS)))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(image_doc("img-1", "pending", json!({}))))
        .mount(&server)
        .await;

    let doc = test_client(&server)
        .get_document("images", "img-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.id(), Some("img-1"));
    assert_eq!(doc.update_time.as_deref(), Some(UPDATE_TIME));
}

#[tokio::test]
async fn test_get_missing_document_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/images/nope", DOCS)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let doc = test_client(&server).get_document("images", "nope").await.unwrap();
    assert!(doc.is_none());
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/images/img-1", DOCS)))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{}/images/img-1", DOCS)))
        .respond_with(ResponseTemplate::new(200).set_body_json(image_doc("img-1", "pending", json!({}))))
        .mount(&server)
        .await;

    let client = test_client(&server);
    let doc = client
        .with_retry("get_image", || client.get_document("images", "img-1"))
        .await
        .unwrap();
    assert!(doc.is_some());
}

// =============================================================================
// ImageRepository
// =============================================================================

#[tokio::test]
async fn test_claim_writes_with_update_time_precondition() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/images/img-1", DOCS)))
        .respond_with(ResponseTemplate::new(200).set_body_json(image_doc("img-1", "pending", json!({}))))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(format!("{}/images/img-1", DOCS)))
        .and(query_param("currentDocument.updateTime", UPDATE_TIME))
        .and(query_param("updateMask.fieldPaths", "status"))
        .and(BodyContains("\"processing\""))
        .and(BodyContains("worker-a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(image_doc(
            "img-1",
            "processing",
            json!({}),
        )))
        .expect(1)
        .mount(&server)
        .await;

    let repo = ImageRepository::new(test_client(&server), "images");
    let claimed = repo.claim(&ImageId::from("img-1"), &ctx("worker-a")).await.unwrap();

    assert_eq!(claimed.status, RecordStatus::Processing);
    assert_eq!(claimed.claimed_by.as_deref(), Some("worker-a"));
    assert_eq!(claimed.attempts, 1);
}

#[tokio::test]
async fn test_claim_precondition_failure_is_already_claimed() {
    for response in [
        ResponseTemplate::new(412),
        ResponseTemplate::new(400).set_body_json(json!({
            "error": {"code": 400, "status": "FAILED_PRECONDITION", "message": "stale"}
        })),
    ] {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{}/images/img-1", DOCS)))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(image_doc("img-1", "pending", json!({}))),
            )
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path(format!("{}/images/img-1", DOCS)))
            .respond_with(response)
            .expect(1)
            .mount(&server)
            .await;

        let repo = ImageRepository::new(test_client(&server), "images");
        let err = repo
            .claim(&ImageId::from("img-1"), &ctx("worker-b"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::AlreadyClaimed(_)), "got {:?}", err);
    }
}

#[tokio::test]
async fn test_claim_of_live_claim_makes_no_write() {
    let server = MockServer::start().await;
    let claimed_at = Utc::now().to_rfc3339();
    Mock::given(method("GET"))
        .and(path(format!("{}/images/img-1", DOCS)))
        .respond_with(ResponseTemplate::new(200).set_body_json(image_doc(
            "img-1",
            "processing",
            json!({
                "claimed_at": {"timestampValue": claimed_at},
                "claimed_by": {"stringValue": "worker-a"},
                "attempts": {"integerValue": "1"}
            }),
        )))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let repo = ImageRepository::new(test_client(&server), "images");
    let err = repo
        .claim(&ImageId::from("img-1"), &ctx("worker-b"))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::AlreadyClaimed(_)));
}

#[tokio::test]
async fn test_finalize_by_other_worker_is_claim_lost() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/images/img-1", DOCS)))
        .respond_with(ResponseTemplate::new(200).set_body_json(image_doc(
            "img-1",
            "processing",
            json!({
                "claimed_at": {"timestampValue": Utc::now().to_rfc3339()},
                "claimed_by": {"stringValue": "worker-b"},
                "attempts": {"integerValue": "2"}
            }),
        )))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let repo = ImageRepository::new(test_client(&server), "images");
    let err = repo
        .finalize(&ImageId::from("img-1"), &ctx("worker-a"), Outcome::done("img-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::ClaimLost { .. }));
}

#[tokio::test]
async fn test_finalize_done_writes_terminal_state() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/images/img-1", DOCS)))
        .respond_with(ResponseTemplate::new(200).set_body_json(image_doc(
            "img-1",
            "processing",
            json!({
                "claimed_at": {"timestampValue": Utc::now().to_rfc3339()},
                "claimed_by": {"stringValue": "worker-a"},
                "attempts": {"integerValue": "1"}
            }),
        )))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(format!("{}/images/img-1", DOCS)))
        .and(query_param("currentDocument.updateTime", UPDATE_TIME))
        .and(BodyContains("\"done\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(image_doc("img-1", "done", json!({}))))
        .expect(1)
        .mount(&server)
        .await;

    let repo = ImageRepository::new(test_client(&server), "images");
    let status = repo
        .finalize(&ImageId::from("img-1"), &ctx("worker-a"), Outcome::done("img-1"))
        .await
        .unwrap();
    assert_eq!(status, RecordStatus::Done);
}

#[tokio::test]
async fn test_list_claimable_merges_pending_and_stale() {
    let server = MockServer::start().await;
    let stale_claim = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();

    let mut late_pending = image_doc("late", "pending", json!({}));
    late_pending["fields"]["captured_at"] = json!({"timestampValue": "2024-05-01T12:05:00Z"});
    let mut stale = image_doc(
        "stale",
        "processing",
        json!({
            "claimed_at": {"timestampValue": stale_claim},
            "claimed_by": {"stringValue": "crashed"},
            "attempts": {"integerValue": "1"}
        }),
    );
    stale["fields"]["captured_at"] = json!({"timestampValue": "2024-05-01T12:00:00Z"});

    Mock::given(method("POST"))
        .and(path(format!("{}:runQuery", DOCS)))
        .and(BodyContains("\"pending\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"document": late_pending, "readTime": UPDATE_TIME}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{}:runQuery", DOCS)))
        .and(BodyContains("LESS_THAN"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"document": stale, "readTime": UPDATE_TIME}
        ])))
        .mount(&server)
        .await;

    let repo = ImageRepository::new(test_client(&server), "images");
    let listed = repo
        .list_claimable(10, Duration::from_secs(600))
        .await
        .unwrap();

    let ids: Vec<&str> = listed.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["stale", "late"]);
}

#[tokio::test]
async fn test_list_claimable_orders_stale_claims_by_capture_time() {
    let server = MockServer::start().await;
    let claim = |minutes: i64| (Utc::now() - chrono::Duration::minutes(minutes)).to_rfc3339();

    // Claimed first, captured last.
    let mut young = image_doc(
        "young",
        "processing",
        json!({
            "claimed_at": {"timestampValue": claim(90)},
            "claimed_by": {"stringValue": "crashed"},
            "attempts": {"integerValue": "1"}
        }),
    );
    young["fields"]["captured_at"] = json!({"timestampValue": "2024-05-01T12:30:00Z"});
    let mut old = image_doc(
        "old",
        "processing",
        json!({
            "claimed_at": {"timestampValue": claim(60)},
            "claimed_by": {"stringValue": "crashed"},
            "attempts": {"integerValue": "1"}
        }),
    );
    old["fields"]["captured_at"] = json!({"timestampValue": "2024-05-01T12:00:00Z"});

    Mock::given(method("POST"))
        .and(path(format!("{}:runQuery", DOCS)))
        .and(BodyContains("\"pending\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"readTime": UPDATE_TIME}])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{}:runQuery", DOCS)))
        .and(BodyContains("LESS_THAN"))
        .and(BodyContains("\"limit\":200"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"document": young, "readTime": UPDATE_TIME},
            {"document": old, "readTime": UPDATE_TIME}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let repo = ImageRepository::new(test_client(&server), "images");
    let listed = repo
        .list_claimable(1, Duration::from_secs(600))
        .await
        .unwrap();

    let ids: Vec<&str> = listed.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["old"]);
}

#[tokio::test]
async fn test_list_claimable_failure_is_store_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{}:runQuery", DOCS)))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let repo = ImageRepository::new(test_client(&server), "images");
    let err = repo
        .list_claimable(10, Duration::from_secs(600))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Store(_)));
}

#[tokio::test]
async fn test_reconcile_writes_done_with_precondition() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/images/img-1", DOCS)))
        .respond_with(ResponseTemplate::new(200).set_body_json(image_doc(
            "img-1",
            "processing",
            json!({
                "claimed_at": {"timestampValue": (Utc::now() - chrono::Duration::hours(1)).to_rfc3339()},
                "claimed_by": {"stringValue": "crashed"},
                "attempts": {"integerValue": "3"}
            }),
        )))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(format!("{}/images/img-1", DOCS)))
        .and(query_param("currentDocument.updateTime", UPDATE_TIME))
        .and(query_param("updateMask.fieldPaths", "result_ref"))
        .and(BodyContains("\"done\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(image_doc("img-1", "done", json!({}))))
        .expect(1)
        .mount(&server)
        .await;

    let repo = ImageRepository::new(test_client(&server), "images");
    let status = repo
        .reconcile(&ImageId::from("img-1"), &ctx("worker-b"), "img-1")
        .await
        .unwrap();
    assert_eq!(status, RecordStatus::Done);
}

#[tokio::test]
async fn test_reconcile_of_live_claim_makes_no_write() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/images/img-1", DOCS)))
        .respond_with(ResponseTemplate::new(200).set_body_json(image_doc(
            "img-1",
            "processing",
            json!({
                "claimed_at": {"timestampValue": Utc::now().to_rfc3339()},
                "claimed_by": {"stringValue": "worker-a"},
                "attempts": {"integerValue": "1"}
            }),
        )))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let repo = ImageRepository::new(test_client(&server), "images");
    let err = repo
        .reconcile(&ImageId::from("img-1"), &ctx("worker-b"), "img-1")
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::AlreadyClaimed(_)));
}

#[tokio::test]
async fn test_create_writes_pending_record() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path(format!("{}/images/img-9", DOCS)))
        .and(BodyContains("\"pending\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(image_doc("img-9", "pending", json!({}))))
        .expect(1)
        .mount(&server)
        .await;

    let repo = ImageRepository::new(test_client(&server), "images");
    let record = ImageRecord::new_pending(ImageId::from("img-9"), "raw/img-9.jpg", Utc::now());
    repo.create(&record).await.unwrap();
}

// =============================================================================
// DetectionResultRepository
// =============================================================================

#[tokio::test]
async fn test_result_upsert_has_no_precondition() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path(format!("{}/detection_results/img-1", DOCS)))
        .and(BodyContains("yolov8n"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "projects/test-project/databases/test-db/documents/detection_results/img-1",
            "updateTime": UPDATE_TIME
        })))
        .expect(2)
        .mount(&server)
        .await;

    let repo = DetectionResultRepository::new(test_client(&server), "detection_results");
    let result =
        motion_models::DetectionResult::new(ImageId::from("img-1"), vec![], "yolov8n", 640, 480);

    assert_eq!(repo.upsert(&result).await.unwrap(), "img-1");
    assert_eq!(repo.upsert(&result).await.unwrap(), "img-1");

    let requests = server.received_requests().await.unwrap_or_default();
    assert!(requests
        .iter()
        .all(|r| !r.url.query().unwrap_or_default().contains("currentDocument")));
}
