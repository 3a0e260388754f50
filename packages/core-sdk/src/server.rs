use std::{convert::Infallible, sync::Arc};

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, get_service, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::services::ServeDir;

use crate::config::ServerConfig;
use crate::dispatch::{ChatRequest, Dispatcher};
use crate::error::ChatError;
use crate::keys::{self, KeyCheck};
use crate::llm::ProviderStream;
use crate::models::{ProviderId, ProviderResult, GEMINI_MODELS, OPENAI_MODELS};

type SharedDispatcher = Arc<Dispatcher>;

/**
 * \brief 启动本地 HTTP 服务，提供静态前端与 API。
 */
pub async fn run(config: ServerConfig) -> Result<()> {
    let static_handler = if std::path::Path::new(&config.ui_dir).exists() {
        ServeDir::new(&config.ui_dir)
    } else {
        ServeDir::new(&config.ui_fallback_dir)
    }
    .append_index_html_on_directories(true);

    let app = router(Arc::new(Dispatcher::new(config.endpoints)))
        .fallback_service(get_service(static_handler));

    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    tracing::info!(addr = %config.addr, "server listening on http://{}", config.addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief API 路由（不含静态资源）。
 */
pub fn router(dispatcher: SharedDispatcher) -> Router {
    Router::new()
        .route("/api/validate-key", post(validate_key))
        .route("/api/chat", post(chat))
        .route("/api/chat/stream", post(chat_stream))
        .route("/api/gemini", post(gemini))
        .route("/api/models", get(list_models))
        .route("/api/health", get(health_check))
        .with_state(dispatcher)
}

/** \brief 错误响应，统一为 `{error}` 正文。 */
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        Self {
            status: e.status_code(),
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct ValidateKeyRequest {
    provider: Option<String>,
    api_key: Option<String>,
}

/**
 * \brief 密钥格式校验，不访问远端。
 */
async fn validate_key(body: Bytes) -> (StatusCode, Json<KeyCheck>) {
    let req: ValidateKeyRequest = serde_json::from_slice(&body).unwrap_or_default();
    let (status, check) = keys::validate(req.provider.as_deref(), req.api_key.as_deref());
    (status, Json(check))
}

/**
 * \brief Primary 非流式对话。
 */
async fn chat(
    State(dispatcher): State<SharedDispatcher>,
    body: Bytes,
) -> Result<Json<ProviderResult>, ApiError> {
    let request = ChatRequest::from_slice(&body);
    Ok(Json(dispatcher.generate_with(ProviderId::Primary, &request).await?))
}

/**
 * \brief Secondary 非流式对话。
 */
async fn gemini(
    State(dispatcher): State<SharedDispatcher>,
    body: Bytes,
) -> Result<Json<ProviderResult>, ApiError> {
    let request = ChatRequest::from_slice(&body);
    Ok(Json(dispatcher.generate_with(ProviderId::Secondary, &request).await?))
}

/**
 * \brief 流式对话（SSE）：先推送 meta 事件，再逐片段推送 `{text}`，中途失败推送 error 事件。
 */
async fn chat_stream(
    State(dispatcher): State<SharedDispatcher>,
    body: Bytes,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let request = ChatRequest::from_slice(&body);
    let stream = dispatcher.stream(&request).await?;

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(1);
    tokio::spawn(forward_fragments(stream, tx));

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::new()))
}

/**
 * \brief 把上游片段转发给 SSE 客户端；客户端断开时立即丢弃上游流。
 */
async fn forward_fragments(
    stream: ProviderStream,
    tx: mpsc::Sender<Result<Event, Infallible>>,
) {
    let ProviderStream {
        id,
        provider,
        model,
        mut fragments,
    } = stream;

    let meta = json!({ "id": id, "provider": provider, "model": model });
    if tx
        .send(Ok(Event::default().event("meta").data(meta.to_string())))
        .await
        .is_err()
    {
        return;
    }

    let mut forwarded = 0usize;
    loop {
        let item = tokio::select! {
            biased;
            _ = tx.closed() => {
                tracing::info!(id = %id, forwarded, "client disconnected, cancelling stream");
                return;
            }
            item = fragments.next() => item,
        };
        match item {
            Some(Ok(text)) => {
                let event = Event::default().data(json!({ "text": text }).to_string());
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
                forwarded += 1;
            }
            Some(Err(e)) => {
                tracing::error!(id = %id, provider = %provider, error = %e, "stream interrupted");
                let event = Event::default()
                    .event("error")
                    .data(json!({ "error": e.to_string() }).to_string());
                let _ = tx.send(Ok(event)).await;
                return;
            }
            None => break,
        }
    }
    tracing::debug!(id = %id, forwarded, "stream finished");
}

async fn list_models() -> Json<serde_json::Value> {
    Json(json!({
        "openai": OPENAI_MODELS,
        "gemini": GEMINI_MODELS,
        "defaults": {
            "openai": ProviderId::Primary.default_model(),
            "gemini": ProviderId::Secondary.default_model(),
        }
    }))
}

/**
 * \brief 存活检查。
 */
async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "version": env!("CARGO_PKG_VERSION") }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoints;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use futures_util::stream;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn app(server: Option<&MockServer>) -> Router {
        let endpoints = match server {
            Some(s) => Endpoints {
                openai_base: s.uri(),
                gemini_base: s.uri(),
                ..Endpoints::default()
            },
            None => Endpoints::default(),
        };
        router(Arc::new(Dispatcher::new(endpoints)))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn read_json(resp: Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn test_chat_single_user_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-abc",
                "choices": [{"message": {"role": "assistant", "content": "Hi there"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let resp = app(Some(&server))
            .oneshot(post_json(
                "/api/chat",
                json!({
                    "apiKey": "sk-test-key-0123456789",
                    "messages": [{"role": "user", "content": "hello"}]
                }),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = read_json(resp).await;
        assert_eq!(body["text"], "Hi there");
        assert_eq!(body["id"], "chatcmpl-abc");
    }

    #[tokio::test]
    async fn test_chat_empty_messages() {
        let resp = app(None)
            .oneshot(post_json(
                "/api/chat",
                json!({"apiKey": "sk-test-key-0123456789", "messages": []}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            read_json(resp).await,
            json!({"error": "Valid messages array is required"})
        );
    }

    #[tokio::test]
    async fn test_chat_missing_key() {
        let resp = app(None)
            .oneshot(post_json(
                "/api/chat",
                json!({"messages": [{"role": "user", "content": "hello"}]}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            read_json(resp).await,
            json!({"error": "OpenAI API key is required"})
        );
    }

    #[tokio::test]
    async fn test_gemini_remote_failure_is_500() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": {"message": "API key not valid"}
            })))
            .mount(&server)
            .await;

        let resp = app(Some(&server))
            .oneshot(post_json(
                "/api/gemini",
                json!({
                    "apiKey": "AIza-invalid-key",
                    "messages": [{"role": "user", "content": "hello"}]
                }),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            read_json(resp).await["error"],
            "Invalid Gemini API key. Please check your API key and try again."
        );
    }

    #[tokio::test]
    async fn test_validate_key_route() {
        let resp = app(None)
            .oneshot(post_json(
                "/api/validate-key",
                json!({"provider": "openai", "apiKey": "sk-abcdefghijklmnopqrstuv"}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(read_json(resp).await, json!({"valid": true, "error": null}));

        let resp = app(None)
            .oneshot(post_json("/api/validate-key", json!({"provider": "openai"})))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            read_json(resp).await,
            json!({"valid": false, "error": "No API key provided"})
        );
    }

    #[tokio::test]
    async fn test_models_and_health() {
        let resp = app(None)
            .oneshot(Request::builder().uri("/api/models").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let body = read_json(resp).await;
        assert_eq!(body["defaults"]["openai"], "gpt-3.5-turbo");
        assert_eq!(body["defaults"]["gemini"], "gemini-2.0-flash");
        assert_eq!(body["openai"].as_array().map(Vec::len), Some(OPENAI_MODELS.len()));

        let resp = app(None)
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(read_json(resp).await["ok"], true);
    }

    #[tokio::test]
    async fn test_stream_emits_meta_then_fragments() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string(concat!(
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"lo\\n\"}}]}\n\n",
                "data: [DONE]\n\n",
            )))
            .mount(&server)
            .await;

        let resp = app(Some(&server))
            .oneshot(post_json(
                "/api/chat/stream",
                json!({
                    "apiKey": "sk-test-key-0123456789",
                    "messages": [{"role": "user", "content": "hello"}]
                }),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let text = String::from_utf8_lossy(&bytes);

        let meta = text.find("event: meta").expect("meta event");
        let first = text.find(r#"data: {"text":"Hel"}"#).expect("first fragment");
        let second = text.find(r#"data: {"text":"lo\n"}"#).expect("second fragment");
        assert!(meta < first && first < second);
        assert!(text.contains(r#""provider":"openai""#));
        assert!(!text.contains("event: error"));
    }

    /** \brief 被释放时置位，用于确认上游流已被丢弃。 */
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_client_disconnect_drops_upstream() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(dropped.clone());
        let fragments = stream::once(async { Ok::<_, ChatError>("first".to_string()) })
            .chain(stream::pending())
            .map(move |item| {
                let _keep = &flag;
                item
            });
        let upstream = ProviderStream {
            id: "chatcmpl-test".to_string(),
            provider: ProviderId::Primary,
            model: "gpt-4o-mini".to_string(),
            fragments: Box::pin(fragments),
        };

        let (tx, mut rx) = mpsc::channel(1);
        let task = tokio::spawn(forward_fragments(upstream, tx));
        assert!(rx.recv().await.is_some(), "meta event");
        assert!(rx.recv().await.is_some(), "first fragment");
        assert!(!dropped.load(Ordering::SeqCst));

        drop(rx);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("forwarding stops after disconnect")
            .expect("task joins");
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stream_validation_error_is_json() {
        let resp = app(None)
            .oneshot(post_json(
                "/api/chat/stream",
                json!({"provider": "gemini", "messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            read_json(resp).await,
            json!({"error": "Gemini API key is required"})
        );
    }
}
