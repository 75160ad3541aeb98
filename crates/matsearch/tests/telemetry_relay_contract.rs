use axum::{body::Bytes, http::HeaderMap, routing::post, Json, Router};
use matsearch::server::{build_router, AppState};
use matsearch_local::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

type Captured = (Option<String>, serde_json::Value);

/// Apps Script-shaped sink: records content type and parsed body, then replies like GAS does.
async fn sink_stub() -> (String, mpsc::UnboundedReceiver<Captured>) {
    let (tx, rx) = mpsc::unbounded_channel::<Captured>();
    let app = Router::new().route(
        "/exec",
        post(move |headers: HeaderMap, body: Bytes| {
            let tx = tx.clone();
            async move {
                let ct = headers
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let v: serde_json::Value =
                    serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
                let _ = tx.send((ct, v));
                Json(serde_json::json!({ "result": "success" }))
            }
        }),
    );
    let addr = serve(app).await;
    (format!("http://{addr}/exec"), rx)
}

fn completion_stub() -> Router {
    Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            Json(serde_json::json!({
                "choices": [{ "message": { "role": "assistant", "content": "SUS304 不鏽鋼" } }]
            }))
        }),
    )
}

async fn app_with(pairs: Vec<(String, String)>) -> String {
    let cfg = Config::from_lookup(move |k| {
        pairs
            .iter()
            .find(|(pk, _)| pk == k)
            .map(|(_, v)| v.clone())
    });
    let orchestrator = cfg.build_orchestrator(reqwest::Client::new());
    let addr = serve(build_router(Arc::new(AppState { orchestrator }))).await;
    format!("http://{addr}")
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Captured>) -> Captured {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("sink was not called in time")
        .expect("sink channel closed")
}

#[tokio::test]
async fn log_endpoint_relays_record_as_text_plain() {
    let (sink_url, mut rx) = sink_stub().await;
    let base = app_with(vec![("GAS_LOG_URL".into(), sink_url)]).await;

    let record = serde_json::json!({
        "userId": "P07",
        "interfaceType": "Template",
        "inputText": "耐蝕 輕量",
        "thoughtTime": 3.2,
        "inputDuration": 11.5,
        "clickPath": ["chip:耐蝕", "chip:輕量", "submit"],
        "timestamp": "2026-03-01T08:00:00.000Z",
        "responseStatus": "success",
        "responseLength": 42
    });
    let resp = reqwest::Client::new()
        .post(format!("{base}/api/log"))
        .json(&record)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 202);
    let v: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(v["ok"].as_bool(), Some(true));

    let (ct, body) = next(&mut rx).await;
    assert_eq!(ct.as_deref(), Some("text/plain;charset=UTF-8"));
    assert_eq!(body["userId"].as_str(), Some("P07"));
    assert_eq!(body["interfaceType"].as_str(), Some("Template"));
    assert_eq!(body["clickPath"].as_array().map(|a| a.len()), Some(3));
    assert_eq!(body["responseLength"].as_u64(), Some(42));
}

#[tokio::test]
async fn log_endpoint_rejects_bad_input() {
    let base = app_with(vec![]).await;
    let http = reqwest::Client::new();

    let resp = http.get(format!("{base}/api/log")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 405);

    let resp = http
        .post(format!("{base}/api/log"))
        .body(r#"{"userId":"P01","interfaceType":"Voice"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
}

#[tokio::test]
async fn log_endpoint_without_sink_accepts_and_drops() {
    let base = app_with(vec![]).await;
    let resp = reqwest::Client::new()
        .post(format!("{base}/api/log"))
        .json(&serde_json::json!({
            "userId": "P02",
            "interfaceType": "Free-form",
            "inputText": "x",
            "thoughtTime": 0.0,
            "inputDuration": 0.0,
            "timestamp": "2026-03-01T08:00:00.000Z"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 202);
    let v: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(v["ok"].as_bool(), Some(false));
}

#[tokio::test]
async fn chat_with_experiment_context_records_the_round() {
    let (sink_url, mut rx) = sink_stub().await;
    let openai = format!("http://{}", serve(completion_stub()).await);
    let base = app_with(vec![
        ("GAS_LOG_URL".into(), sink_url),
        ("MATSEARCH_OPENAI_BASE_URL".into(), openai),
        ("OPENAI_API_KEY".into(), "sk-test".into()),
    ])
    .await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/api/chat"))
        .json(&serde_json::json!({
            "message": "需要耐酸鹼的金屬",
            "experiment": {
                "userId": "P11",
                "interfaceType": "Free-form",
                "thoughtTime": 1.5,
                "inputDuration": 4.0,
                "clickPath": ["input", "submit"]
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let v: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(v["text"].as_str(), Some("SUS304 不鏽鋼"));

    let (_, body) = next(&mut rx).await;
    assert_eq!(body["userId"].as_str(), Some("P11"));
    assert_eq!(body["interfaceType"].as_str(), Some("Free-form"));
    assert_eq!(body["inputText"].as_str(), Some("需要耐酸鹼的金屬"));
    assert_eq!(body["inputLength"].as_u64(), Some(8));
    assert_eq!(body["responseStatus"].as_str(), Some("success"));
    assert_eq!(body["responseLength"].as_u64(), Some("SUS304 不鏽鋼".chars().count() as u64));
    assert!(body["timestamp"].as_str().is_some_and(|s| !s.is_empty()));
}
