//! Backend contract tests against a mock conversational endpoint

use std::time::Duration;

use base64::Engine as _;
use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use kitchen_voice::{Backend, BackendError, HttpBackend};

fn backend_for(server: &MockServer) -> HttpBackend {
    HttpBackend::with_timeout(&format!("{}/kitchen_converse", server.uri()), Duration::from_secs(5))
        .unwrap()
}

#[tokio::test]
async fn posts_query_and_decodes_audio() {
    let server = MockServer::start().await;
    let audio = vec![0xFF, 0xFB, 0x90, 0x44, 0x00];

    Mock::given(method("POST"))
        .and(path("/kitchen_converse"))
        .and(body_json(json!({ "user_query": "what can I cook with chicken and rice" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "text": "How about **chicken fried rice**?",
            "audio_base64": base64::engine::general_purpose::STANDARD.encode(&audio),
        })))
        .expect(1)
        .mount(&server)
        .await;

    let reply = backend_for(&server)
        .send("what can I cook with chicken and rice")
        .await
        .unwrap();

    assert_eq!(reply.text, "How about **chicken fried rice**?");
    assert_eq!(reply.audio, Some(audio));
}

#[tokio::test]
async fn reply_without_audio_is_text_only() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/kitchen_converse"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": "Preheat the oven to 200C."
        })))
        .mount(&server)
        .await;

    let reply = backend_for(&server).send("oven").await.unwrap();

    assert_eq!(reply.text, "Preheat the oven to 200C.");
    assert!(reply.audio.is_none());
}

#[tokio::test]
async fn server_error_carries_status_and_message() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(500).set_body_json(json!({ "error": "model unavailable" })),
        )
        .mount(&server)
        .await;

    let err = backend_for(&server).send("hello").await.unwrap_err();

    assert_eq!(
        err,
        BackendError::Status {
            status: 500,
            message: "model unavailable".into()
        }
    );
}

#[tokio::test]
async fn error_without_body_uses_reason_phrase() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = backend_for(&server).send("hello").await.unwrap_err();

    assert_eq!(
        err,
        BackendError::Status {
            status: 503,
            message: "Service Unavailable".into()
        }
    );
}

#[tokio::test]
async fn non_json_success_is_malformed() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let err = backend_for(&server).send("hello").await.unwrap_err();

    assert!(matches!(err, BackendError::Malformed(_)));
}

#[tokio::test]
async fn slow_backend_times_out_as_transport_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "text": "too late" }))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let backend = HttpBackend::with_timeout(&server.uri(), Duration::from_millis(200)).unwrap();
    let err = backend.send("hello").await.unwrap_err();

    assert!(matches!(err, BackendError::Transport(_)));
}

#[tokio::test]
async fn unreachable_backend_is_transport_error() {
    // Grab a free port and release it so nothing is listening there
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/kitchen_converse", listener.local_addr().unwrap());
    drop(listener);

    let backend = HttpBackend::with_timeout(&url, Duration::from_secs(2)).unwrap();
    let err = backend.send("hello").await.unwrap_err();

    assert!(matches!(err, BackendError::Transport(_)));
}
