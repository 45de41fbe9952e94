// tests/webhook_http.rs
//
// Webhook receiver exercised through the full router via tower::ServiceExt::oneshot.

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt as _;

use newsflow::adapters::webhook::sign_body;
use newsflow::config::Settings;
use newsflow::{AppState, EventBus, RAW_CHANNEL};

const BODY_LIMIT: usize = 1024 * 1024;
const SECRET: &str = "hook-secret";

fn app(secret: &str) -> (Router, Arc<EventBus>) {
    let mut settings = Settings::default();
    settings.webhook.secret = secret.to_string();
    let dir = std::env::temp_dir().join("newsflow-webhook-tests-missing.json");
    settings.scheduler.snapshot_path = dir;
    let bus = Arc::new(EventBus::new(settings.bus.clone()));
    let state = AppState::new(&settings, Arc::clone(&bus), CancellationToken::new());
    (newsflow::router(state, None), bus)
}

fn payload() -> String {
    json!({
        "title": "Treasury yields climb",
        "url": "https://acme.test/news/1",
        "published": "2024-03-01T14:05:00Z",
    })
    .to_string()
}

fn inbound(body: &str, signature: Option<&str>) -> Request<Body> {
    let mut b = Request::builder()
        .method("POST")
        .uri("/push/inbound")
        .header("content-type", "application/json")
        .header("x-vendor", "acme");
    if let Some(sig) = signature {
        b = b.header("x-signature", sig);
    }
    b.body(Body::from(body.to_string())).expect("build request")
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

async fn wait_for_len(bus: &EventBus, n: usize) {
    for _ in 0..200 {
        if bus.len(RAW_CHANNEL) >= n {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn correct_signature_is_accepted_and_published() {
    let (app, bus) = app(SECRET);
    let body = payload();
    let sig = sign_body(SECRET, body.as_bytes());

    let resp = app.oneshot(inbound(&body, Some(&sig))).await.expect("oneshot");
    assert_eq!(resp.status(), StatusCode::OK);
    let v = json_body(resp).await;
    assert_eq!(v["status"], "accepted");

    wait_for_len(&bus, 1).await;
    let recent = bus.recent(RAW_CHANNEL, 1);
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].source, "webhook:acme");
    assert_eq!(recent[0].item.title, "Treasury yields climb");
}

#[tokio::test]
async fn wrong_or_missing_signature_is_unauthorized() {
    let (app, bus) = app(SECRET);
    let body = payload();
    let wrong = sign_body("not-the-secret", body.as_bytes());

    let resp = app
        .clone()
        .oneshot(inbound(&body, Some(&wrong)))
        .await
        .expect("oneshot");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app.clone().oneshot(inbound(&body, None)).await.expect("oneshot");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app
        .oneshot(Request::get("/push/stats").body(Body::empty()).unwrap())
        .await
        .expect("oneshot");
    let v = json_body(resp).await;
    assert_eq!(v["webhook_stats"]["invalid_signatures"], 2);
    assert_eq!(bus.len(RAW_CHANNEL), 0);
}

#[tokio::test]
async fn unparsable_json_is_bad_request() {
    let (app, _bus) = app("");
    let resp = app.oneshot(inbound("{nope", None)).await.expect("oneshot");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unsigned_requests_pass_without_secret() {
    let (app, bus) = app("");
    let resp = app.oneshot(inbound(&payload(), None)).await.expect("oneshot");
    assert_eq!(resp.status(), StatusCode::OK);
    wait_for_len(&bus, 1).await;
    assert_eq!(bus.len(RAW_CHANNEL), 1);
}

#[tokio::test]
async fn test_endpoint_processes_synchronously_or_is_forbidden() {
    let (open, bus) = app("");
    let resp = open
        .clone()
        .oneshot(
            Request::post("/push/test")
                .header("x-vendor", "reuters")
                .body(Body::from(payload()))
                .unwrap(),
        )
        .await
        .expect("oneshot");
    assert_eq!(resp.status(), StatusCode::OK);
    let v = json_body(resp).await;
    assert_eq!(v["status"], "success");
    assert!(v["item_id"].is_string());
    assert_eq!(bus.len(RAW_CHANNEL), 1);

    let resp = open
        .oneshot(Request::get("/push/health").body(Body::empty()).unwrap())
        .await
        .expect("oneshot");
    let v = json_body(resp).await;
    assert_eq!(v["status"], "healthy");
    assert_eq!(v["signature_required"], false);

    let (locked, _) = app(SECRET);
    let resp = locked
        .oneshot(Request::post("/push/test").body(Body::from(payload())).unwrap())
        .await
        .expect("oneshot");
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn rotating_vendor_header_does_not_grow_limiter_table() {
    let mut settings = Settings::default();
    settings.scheduler.snapshot_path = std::env::temp_dir().join("newsflow-webhook-tests-missing.json");
    settings.bus.max_limiters = 8;
    let bus = Arc::new(EventBus::new(settings.bus.clone()));
    let state = AppState::new(&settings, Arc::clone(&bus), CancellationToken::new());
    let app = newsflow::router(state, None);

    for i in 0..40 {
        let body = json!({
            "title": format!("Rotating {i}"),
            "url": format!("https://acme.test/rot/{i}"),
            "published": "2024-03-01T14:05:00Z",
        })
        .to_string();
        let req = Request::post("/push/inbound")
            .header("content-type", "application/json")
            .header("x-vendor", format!("vendor{i}"))
            .body(Body::from(body))
            .unwrap();
        let resp = app.clone().oneshot(req).await.expect("oneshot");
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let settled = |s: &newsflow::bus::BusStats| s.accepted + s.rejected.values().sum::<u64>() == 40;
    for _ in 0..200 {
        if settled(&bus.stats()) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    let stats = bus.stats();
    assert!(settled(&stats));
    assert!(stats.rate_limiters.len() <= 9, "limiters: {}", stats.rate_limiters.len());
}
