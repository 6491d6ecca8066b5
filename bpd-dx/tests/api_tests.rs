//! Integration tests for bpd-dx API endpoints

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;
use uuid::Uuid;

use helpers::{test_state, MockGateway, Script};

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn start_request() -> Value {
    json!({
        "subject_brand": "Acme Widgets",
        "competitor_brands": ["Initech"],
        "providers": ["openai"],
        "questions": ["How is {brand} perceived?", "Is {brand} reliable?"]
    })
}

async fn wait_for_stage(app: &Router, execution_id: &str, stage: &str) -> Value {
    let uri = format!("/diagnosis/status/{}", execution_id);
    for _ in 0..100 {
        let (status, body) = get_json(app, &uri).await;
        assert_eq!(status, StatusCode::OK);
        if body["stage"] == stage {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("execution never reached stage {}", stage);
}

#[tokio::test]
async fn test_start_rejects_invalid_requests() {
    let state = test_state(Arc::new(MockGateway::new()), &["openai"]).await;
    let app = bpd_dx::build_router(state);

    let mut empty_brand = start_request();
    empty_brand["subject_brand"] = json!("   ");
    let (status, body) = post_json(&app, "/diagnosis/start", empty_brand).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");

    let mut no_questions = start_request();
    no_questions["questions"] = json!([]);
    let (status, _) = post_json(&app, "/diagnosis/start", no_questions).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut unknown_provider = start_request();
    unknown_provider["providers"] = json!(["openai", "nonesuch"]);
    let (status, body) = post_json(&app, "/diagnosis/start", unknown_provider).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("nonesuch"));

    // An explicit zero is a client mistake, not something to clamp
    let mut zero_concurrency = start_request();
    zero_concurrency["concurrency_limit"] = json!(0);
    let (status, body) = post_json(&app, "/diagnosis/start", zero_concurrency).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("concurrency_limit"));
}

#[tokio::test]
async fn test_start_status_result_happy_path() {
    let gateway = Arc::new(MockGateway::new().script("openai", Script::Ok("answer".to_string())));
    let state = test_state(gateway, &["openai"]).await;
    let app = bpd_dx::build_router(state);

    let (status, body) = post_json(&app, "/diagnosis/start", start_request()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["total_cells"], 2);
    assert_eq!(body["stage"], "initializing");
    let execution_id = body["execution_id"].as_str().unwrap().to_string();

    let final_status = wait_for_stage(&app, &execution_id, "completed").await;
    assert_eq!(final_status["progress_percent"], 100.0);
    assert_eq!(final_status["completed_count"], 2);
    // Terminal executions carry no polling hint
    assert!(final_status.get("suggested_poll_interval_ms").is_none());

    let (status, body) = get_json(&app, &format!("/diagnosis/result/{}", execution_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stage"], "completed");
    assert_eq!(body["result"]["final_status"], "completed");
    assert_eq!(body["result"]["cells"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_unknown_execution_is_404() {
    let state = test_state(Arc::new(MockGateway::new()), &["openai"]).await;
    let app = bpd_dx::build_router(state);
    let id = Uuid::new_v4();

    let (status, body) = get_json(&app, &format!("/diagnosis/status/{}", id)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let (status, _) = get_json(&app, &format!("/diagnosis/result/{}", id)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = post_json(&app, &format!("/diagnosis/cancel/{}", id), Value::Null).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_result_before_terminal_is_still_running() {
    let gateway = Arc::new(MockGateway::new().script("openai", Script::Hang));
    let state = test_state(gateway, &["openai"]).await;
    let app = bpd_dx::build_router(state);

    let (status, body) = post_json(&app, "/diagnosis/start", start_request()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let execution_id = body["execution_id"].as_str().unwrap().to_string();

    // Running, not missing: 409 with a distinct code, never 404
    let (status, body) = get_json(&app, &format!("/diagnosis/result/{}", execution_id)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "STILL_RUNNING");

    let (status, body) = get_json(&app, &format!("/diagnosis/status/{}", execution_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["suggested_poll_interval_ms"].as_u64().is_some());
}

#[tokio::test]
async fn test_cancel_flow() {
    let gateway = Arc::new(MockGateway::new().script("openai", Script::Hang));
    let state = test_state(gateway, &["openai"]).await;
    let app = bpd_dx::build_router(state);

    // Cancellation lets in-flight calls finish on their own, so keep
    // the hung calls on a short per-cell leash
    let mut request = start_request();
    request["per_cell_timeout_seconds"] = json!(1);
    let (status, body) = post_json(&app, "/diagnosis/start", request).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let execution_id = body["execution_id"].as_str().unwrap().to_string();
    let cancel_uri = format!("/diagnosis/cancel/{}", execution_id);

    // The background task registers its token asynchronously
    let mut cancelled = false;
    for _ in 0..100 {
        let (status, body) = post_json(&app, &cancel_uri, Value::Null).await;
        if status == StatusCode::ACCEPTED {
            assert_eq!(body["status"], "cancelling");
            cancelled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(cancelled);

    let final_status = wait_for_stage(&app, &execution_id, "failed").await;
    assert_eq!(final_status["fail_reason"], "cancelled");

    // Cancelling a finished execution conflicts
    let (status, body) = post_json(&app, &cancel_uri, Value::Null).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CONFLICT");
}

#[tokio::test]
async fn test_health_endpoint() {
    let state = test_state(Arc::new(MockGateway::new()), &["openai"]).await;
    let app = bpd_dx::build_router(state);

    let (status, body) = get_json(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "bpd-dx");
    assert_eq!(body["open_circuits"].as_array().unwrap().len(), 0);
    assert_eq!(body["ledger_write_failures"], 0);
}
