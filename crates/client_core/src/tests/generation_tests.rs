use super::*;
use async_trait::async_trait;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};
use tokio::net::TcpListener;

#[derive(Clone, Copy)]
enum Reply {
    Image,
    ServerError,
    MissingImage,
}

#[derive(Clone)]
struct FakeApiState {
    calls: Arc<AtomicUsize>,
    failing_calls: usize,
    failure: Reply,
    requests: Arc<Mutex<Vec<(String, Value)>>>,
    keys: Arc<Mutex<Vec<String>>>,
}

#[derive(Default)]
struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().expect("lock").push(duration);
    }
}

impl RecordingSleeper {
    fn slept(&self) -> Vec<Duration> {
        self.slept.lock().expect("lock").clone()
    }
}

async fn handle_model_call(
    State(state): State<FakeApiState>,
    Path(call): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let call_index = state.calls.fetch_add(1, Ordering::SeqCst);
    state
        .requests
        .lock()
        .expect("lock")
        .push((call.clone(), body));
    state
        .keys
        .lock()
        .expect("lock")
        .push(query.get("key").cloned().unwrap_or_default());

    let reply = if call_index < state.failing_calls {
        state.failure
    } else {
        Reply::Image
    };

    match reply {
        Reply::ServerError => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": { "message": "overloaded" } })),
        ),
        Reply::MissingImage if call.ends_with(":predict") => {
            (StatusCode::OK, Json(json!({ "predictions": [{}] })))
        }
        Reply::MissingImage => (
            StatusCode::OK,
            Json(json!({ "candidates": [{ "content": { "parts": [{ "text": "no image" }] } }] })),
        ),
        Reply::Image if call.ends_with(":predict") => (
            StatusCode::OK,
            Json(json!({
                "predictions": [{ "bytesBase64Encoded": "UFJFRA==", "mimeType": "image/png" }]
            })),
        ),
        Reply::Image => (
            StatusCode::OK,
            Json(json!({
                "candidates": [{
                    "content": {
                        "parts": [
                            { "text": "here you go" },
                            { "inlineData": { "mimeType": "image/jpeg", "data": "RURJVA==" } }
                        ]
                    }
                }]
            })),
        ),
    }
}

async fn spawn_fake_api(failing_calls: usize, failure: Reply) -> (String, FakeApiState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = FakeApiState {
        calls: Arc::new(AtomicUsize::new(0)),
        failing_calls,
        failure,
        requests: Arc::new(Mutex::new(Vec::new())),
        keys: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/models/:call", post(handle_model_call))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

fn client_for(api_base: String, sleeper: Arc<RecordingSleeper>) -> ImageClient {
    ImageClient::new(
        Some("test-key".to_string()),
        GenerationSettings {
            api_base,
            text_model: "imagen-test".to_string(),
            image_model: "gemini-test".to_string(),
            sample_count: 1,
            request_timeout_secs: 5,
        },
        RetryPolicy::default(),
    )
    .expect("client")
    .with_sleeper(sleeper)
}

fn sketch() -> ReferenceImage {
    ReferenceImage::from_bytes("image/png", b"sketch-bytes")
}

#[test]
fn target_follows_reference_presence() {
    assert_eq!(
        GenerationTarget::for_reference(None),
        GenerationTarget::TextToImage
    );
    assert_eq!(
        GenerationTarget::for_reference(Some(&sketch())),
        GenerationTarget::ImageToImage
    );
}

#[tokio::test]
async fn text_prompt_uses_predict_endpoint() {
    let (api_base, state) = spawn_fake_api(0, Reply::ServerError).await;
    let sleeper = Arc::new(RecordingSleeper::default());
    let client = client_for(api_base, Arc::clone(&sleeper));

    let image = client.generate("red gown", None).await.expect("image");
    assert_eq!(image.data_uri, "data:image/png;base64,UFJFRA==");

    let requests = state.requests.lock().expect("lock").clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "imagen-test:predict");
    assert_eq!(requests[0].1["instances"][0]["prompt"], "red gown");
    assert_eq!(requests[0].1["parameters"]["sampleCount"], 1);
    assert_eq!(state.keys.lock().expect("lock")[0], "test-key");
    assert!(sleeper.slept().is_empty());
}

#[tokio::test]
async fn reference_image_uses_generate_content_endpoint() {
    let (api_base, state) = spawn_fake_api(0, Reply::ServerError).await;
    let client = client_for(api_base, Arc::new(RecordingSleeper::default()));
    let reference = sketch();

    let image = client
        .generate("finish this sketch", Some(&reference))
        .await
        .expect("image");
    assert_eq!(image.data_uri, "data:image/jpeg;base64,RURJVA==");

    let requests = state.requests.lock().expect("lock").clone();
    assert_eq!(requests[0].0, "gemini-test:generateContent");
    let parts = &requests[0].1["contents"][0]["parts"];
    assert_eq!(parts[0]["text"], "finish this sketch");
    assert_eq!(parts[1]["inlineData"]["mimeType"], "image/png");
    assert_eq!(parts[1]["inlineData"]["data"], reference.data_b64.as_str());
}

#[tokio::test]
async fn recovers_after_transient_failures_with_backoff() {
    let (api_base, state) = spawn_fake_api(3, Reply::ServerError).await;
    let sleeper = Arc::new(RecordingSleeper::default());
    let client = client_for(api_base, Arc::clone(&sleeper));

    client.generate("trench coat", None).await.expect("image");

    assert_eq!(state.calls.load(Ordering::SeqCst), 4);
    assert_eq!(
        sleeper.slept(),
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );
}

#[tokio::test]
async fn recovers_on_the_final_attempt() {
    let (api_base, state) = spawn_fake_api(5, Reply::ServerError).await;
    let sleeper = Arc::new(RecordingSleeper::default());
    let client = client_for(api_base, Arc::clone(&sleeper));

    client.generate("trench coat", None).await.expect("image");

    assert_eq!(state.calls.load(Ordering::SeqCst), 6);
    assert_eq!(
        sleeper.slept(),
        [1, 2, 4, 8, 16]
            .into_iter()
            .map(Duration::from_secs)
            .collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn gives_up_after_six_failed_attempts() {
    let (api_base, state) = spawn_fake_api(usize::MAX, Reply::ServerError).await;
    let sleeper = Arc::new(RecordingSleeper::default());
    let client = client_for(api_base, Arc::clone(&sleeper));

    let err = client
        .generate("trench coat", None)
        .await
        .expect_err("should fail");

    match err {
        GenerationError::Exhausted { attempts, last } => {
            assert_eq!(attempts, 6);
            assert!(matches!(*last, GenerationError::Status { status: 503, .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(state.calls.load(Ordering::SeqCst), 6);
    assert_eq!(sleeper.slept().len(), 5);
}

#[tokio::test]
async fn missing_image_field_is_retried_like_a_transport_failure() {
    let (api_base, state) = spawn_fake_api(2, Reply::MissingImage).await;
    let sleeper = Arc::new(RecordingSleeper::default());
    let client = client_for(api_base, Arc::clone(&sleeper));

    client
        .generate("courtyard", Some(&sketch()))
        .await
        .expect("image");
    assert_eq!(state.calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        sleeper.slept(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
}

#[tokio::test]
async fn missing_api_key_fails_without_network_calls() {
    let (api_base, state) = spawn_fake_api(0, Reply::ServerError).await;
    let client = ImageClient::new(
        None,
        GenerationSettings {
            api_base,
            ..GenerationSettings::default()
        },
        RetryPolicy::default(),
    )
    .expect("client");

    let err = client.generate("coat", None).await.expect_err("should fail");
    assert!(matches!(err, GenerationError::MissingApiKey));
    assert_eq!(state.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn inline_image_accepts_snake_case_fields() {
    let payload = json!({
        "candidates": [{
            "content": { "parts": [{ "inline_data": { "mime_type": "image/webp", "data": "QUJD" } }] }
        }]
    });
    let image = extract_inline_image(&payload).expect("image");
    assert_eq!(image.data_uri, "data:image/webp;base64,QUJD");
}

#[test]
fn empty_predictions_are_a_payload_failure() {
    let err = extract_prediction_image(&json!({ "predictions": [] })).expect_err("should fail");
    assert!(matches!(err, GenerationError::MissingImage));
}

#[tokio::test]
async fn configured_request_timeout_bounds_each_attempt() {
    let app = Router::new().route(
        "/models/:call",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Json(json!({ "predictions": [] }))
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let client = ImageClient::new(
        Some("test-key".to_string()),
        GenerationSettings {
            api_base: format!("http://{addr}"),
            request_timeout_secs: 1,
            ..GenerationSettings::default()
        },
        RetryPolicy::no_retries(),
    )
    .expect("client");

    let started = std::time::Instant::now();
    let err = client.generate("coat", None).await.expect_err("should time out");
    assert!(started.elapsed() < Duration::from_secs(4));
    match err {
        GenerationError::Exhausted { attempts, last } => {
            assert_eq!(attempts, 1);
            assert!(matches!(*last, GenerationError::Transport(ref source) if source.is_timeout()));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
