use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use secrecy::ExposeSecret;
use serde_json::{json, Value};

use super::{once_stream, sse, ChatProvider, TextStream};
use crate::convert::{self, SecondaryContent};
use crate::error::{sanitize_detail, ChatError};
use crate::models::{synthesize_id, ChatMessage, ProviderConfig, ProviderId, ProviderResult};

const API_KEY_HEADER: &str = "x-goog-api-key";
const SESSION_MAX_OUTPUT_TOKENS: u32 = 1000;

/**
 * \brief Secondary 适配器：Gemini generateContent。
 *
 * 调用分三级：单轮调用、携带历史的会话调用、会话失败后仅用当前轮次重试一次。
 * 第三级会吞掉会话错误（只记录 warn），以可用性换取对上游故障的可见性。
 */
#[derive(Debug)]
pub struct GeminiProvider {
    client: reqwest::Client,
    config: ProviderConfig,
}

/** \brief 一次调用的执行计划：当前轮次与可选的历史。 */
struct TurnPlan {
    turn: String,
    history: Option<Vec<SecondaryContent>>,
}

impl TurnPlan {
    fn contents(&self) -> Vec<SecondaryContent> {
        let mut contents = self.history.clone().unwrap_or_default();
        contents.push(convert::secondary_turn_content(&self.turn));
        contents
    }
}

impl GeminiProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ChatError> {
        if !config.has_api_key() {
            return Err(ChatError::MissingCredential {
                provider: ProviderId::Secondary,
            });
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ChatError::transport(ProviderId::Secondary, &config.model, e))?;
        Ok(Self { client, config })
    }

    fn plan(&self, messages: &[ChatMessage]) -> Result<TurnPlan, ChatError> {
        let messages = convert::transmittable(messages)?;
        let turn = convert::secondary_turn(&messages, self.config.custom_system_prompt())?;
        if messages.len() == 1 {
            return Ok(TurnPlan { turn, history: None });
        }
        match convert::secondary_history(&messages) {
            Ok(history) => Ok(TurnPlan {
                turn,
                history: Some(history),
            }),
            Err(ChatError::NoUsableHistory) => {
                tracing::debug!(
                    messages = messages.len(),
                    "no usable history, using single-turn mode"
                );
                Ok(TurnPlan { turn, history: None })
            }
            Err(e) => Err(e),
        }
    }

    fn request_body(contents: &[SecondaryContent], session: bool) -> Value {
        let mut body = json!({ "contents": contents });
        if session {
            body["generationConfig"] = json!({ "maxOutputTokens": SESSION_MAX_OUTPUT_TOKENS });
        }
        body
    }

    async fn post(
        &self,
        method: &str,
        body: &Value,
        streaming: bool,
    ) -> Result<reqwest::Response, ChatError> {
        let url = format!(
            "{}/v1beta/models/{}:{}",
            self.config.base_url(),
            self.config.model,
            method
        );
        let mut req = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(API_KEY_HEADER, self.config.api_key.expose_secret())
            .json(body);
        if streaming {
            req = req.query(&[("alt", "sse")]);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ChatError::transport(ProviderId::Secondary, &self.config.model, e))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(ChatError::from_status(
                ProviderId::Secondary,
                &self.config.model,
                status,
                &text,
            ));
        }
        Ok(resp)
    }

    async fn generate(
        &self,
        contents: &[SecondaryContent],
        session: bool,
    ) -> Result<ProviderResult, ChatError> {
        tracing::debug!(
            model = %self.config.model,
            contents = contents.len(),
            session,
            "gemini generateContent"
        );
        let body = Self::request_body(contents, session);
        let resp = self.post("generateContent", &body, false).await?;
        let v: Value = resp
            .json()
            .await
            .map_err(|e| ChatError::transport(ProviderId::Secondary, &self.config.model, e))?;
        let text = response_text(&v, &self.config.model)?;
        Ok(ProviderResult {
            text,
            id: synthesize_id(),
        })
    }

    /** \brief 第一级：只发送当前轮次。 */
    async fn generate_once(&self, turn: &str) -> Result<ProviderResult, ChatError> {
        self.generate(&[convert::secondary_turn_content(turn)], false)
            .await
    }

    /** \brief 第二级：携带历史发送当前轮次。 */
    async fn generate_in_session(&self, plan: &TurnPlan) -> Result<ProviderResult, ChatError> {
        self.generate(&plan.contents(), true).await
    }
}

#[async_trait]
impl ChatProvider for GeminiProvider {
    fn provider(&self) -> ProviderId {
        ProviderId::Secondary
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn send(&self, messages: &[ChatMessage]) -> Result<ProviderResult, ChatError> {
        let plan = self.plan(messages)?;
        if plan.history.is_none() {
            return self.generate_once(&plan.turn).await;
        }
        match self.generate_in_session(&plan).await {
            Ok(result) => Ok(result),
            Err(err) => {
                // 第三级：仅重试一次，丢弃历史；原始错误只进日志。
                tracing::warn!(
                    model = %self.config.model,
                    error = %err,
                    "gemini chat session failed, retrying once with the current turn only"
                );
                self.generate_once(&plan.turn).await
            }
        }
    }

    async fn send_streaming(&self, messages: &[ChatMessage]) -> Result<TextStream, ChatError> {
        let plan = self.plan(messages)?;
        let contents = plan.contents();
        let session = plan.history.is_some();
        let body = Self::request_body(&contents, session);

        let resp = match self.post("streamGenerateContent", &body, true).await {
            Ok(resp) => resp,
            Err(err) => {
                // 同一份 contents 改走一次非流式调用，不再进入分级回退。
                tracing::warn!(
                    model = %self.config.model,
                    error = %err,
                    "gemini stream failed to start, falling back to a buffered reply"
                );
                let result = self.generate(&contents, session).await?;
                return Ok(once_stream(result.text));
            }
        };

        let model = self.config.model.clone();
        let mut events = sse::data_events(resp, ProviderId::Secondary, model.clone());
        Ok(Box::pin(try_stream! {
            while let Some(data) = events.next().await {
                let data = data?;
                let chunk: Value = match serde_json::from_str(&data) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let text = response_text(&chunk, &model)?;
                if !text.is_empty() {
                    yield text;
                }
            }
        }))
    }
}

/**
 * \brief 取出响应文本；错误体或被拦截的空回复转为 Provider 错误。
 */
fn response_text(v: &Value, model: &str) -> Result<String, ChatError> {
    if v.get("error").is_some() {
        return Err(ChatError::unexpected(
            ProviderId::Secondary,
            model,
            sanitize_detail(&v.to_string()),
        ));
    }
    let text = extract_gemini_content(v);
    if text.is_empty() {
        if let Some(reason) = v
            .get("promptFeedback")
            .and_then(|f| f.get("blockReason"))
            .and_then(|r| r.as_str())
        {
            return Err(ChatError::unexpected(
                ProviderId::Secondary,
                model,
                format!("response blocked: {}", reason),
            ));
        }
    }
    Ok(text)
}

fn extract_gemini_content(v: &Value) -> String {
    if let Some(candidates) = v.get("candidates").and_then(|c| c.as_array()) {
        if let Some(first) = candidates.first() {
            if let Some(content) = first.get("content") {
                if let Some(parts) = content.get("parts").and_then(|p| p.as_array()) {
                    return parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                        .collect::<Vec<_>>()
                        .join("");
                }
            }
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::models::Role;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

    const GENERATE_PATH: &str = "/v1beta/models/gemini-2.0-flash:generateContent";
    const STREAM_PATH: &str = "/v1beta/models/gemini-2.0-flash:streamGenerateContent";

    /** \brief 按请求中 contents 的条数匹配。 */
    struct ContentsLen(usize);

    impl Match for ContentsLen {
        fn matches(&self, request: &Request) -> bool {
            serde_json::from_slice::<Value>(&request.body)
                .ok()
                .and_then(|v| v.get("contents").and_then(|c| c.as_array()).map(|c| c.len()))
                == Some(self.0)
        }
    }

    fn reply(text: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": text}]}}]
        }))
    }

    fn provider(server: &MockServer, prompt: Option<&str>) -> GeminiProvider {
        let config = ProviderConfig::new(ProviderId::Secondary, "AIza-test-key")
            .with_model(None)
            .with_system_prompt(prompt.map(|p| p.to_string()))
            .with_api_base(server.uri());
        GeminiProvider::new(config).expect("provider")
    }

    fn conv(pairs: &[(Role, &str)]) -> Vec<ChatMessage> {
        pairs
            .iter()
            .map(|(role, content)| ChatMessage::new(*role, *content))
            .collect()
    }

    #[tokio::test]
    async fn test_single_message_uses_single_turn() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .and(header("x-goog-api-key", "AIza-test-key"))
            .and(body_json(json!({
                "contents": [{"role": "user", "parts": [{"text": "[System: be terse]\n\nhi"}]}]
            })))
            .respond_with(reply("hello"))
            .expect(1)
            .mount(&server)
            .await;

        let result = provider(&server, Some("be terse"))
            .send(&conv(&[(Role::User, "hi")]))
            .await
            .expect("send");
        assert_eq!(result.text, "hello");
        assert!(!result.id.is_empty());
    }

    #[tokio::test]
    async fn test_history_uses_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .and(body_json(json!({
                "contents": [
                    {"role": "user", "parts": [{"text": "a"}]},
                    {"role": "model", "parts": [{"text": "b"}]},
                    {"role": "user", "parts": [{"text": "c"}]}
                ],
                "generationConfig": {"maxOutputTokens": 1000}
            })))
            .respond_with(reply("session reply"))
            .expect(1)
            .mount(&server)
            .await;

        let result = provider(&server, None)
            .send(&conv(&[(Role::User, "a"), (Role::Assistant, "b"), (Role::User, "c")]))
            .await
            .expect("send");
        assert_eq!(result.text, "session reply");
    }

    #[tokio::test]
    async fn test_unusable_history_falls_back_to_single_turn() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .and(body_json(json!({
                "contents": [{"role": "user", "parts": [{"text": "z"}]}]
            })))
            .respond_with(reply("single"))
            .expect(1)
            .mount(&server)
            .await;

        let result = provider(&server, None)
            .send(&conv(&[
                (Role::System, "x"),
                (Role::Assistant, "y"),
                (Role::User, "z"),
            ]))
            .await
            .expect("send");
        assert_eq!(result.text, "single");
    }

    #[tokio::test]
    async fn test_session_failure_retries_exactly_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .and(ContentsLen(3))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"message": "Please ensure that multiturn requests alternate"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .and(ContentsLen(1))
            .respond_with(reply("recovered"))
            .expect(1)
            .mount(&server)
            .await;

        let result = provider(&server, None)
            .send(&conv(&[(Role::User, "a"), (Role::Assistant, "b"), (Role::User, "c")]))
            .await
            .expect("fallback succeeds");
        assert_eq!(result.text, "recovered");
    }

    #[tokio::test]
    async fn test_fallback_failure_is_surfaced_without_second_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .and(ContentsLen(3))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .and(ContentsLen(1))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"message": "Resource has been exhausted (e.g. check quota)."}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = provider(&server, None)
            .send(&conv(&[(Role::User, "a"), (Role::Assistant, "b"), (Role::User, "c")]))
            .await
            .expect_err("both tiers fail");
        assert_eq!(err.class(), Some(ErrorClass::Quota));
        assert!(err.to_string().starts_with("Gemini API quota exceeded"));
    }

    #[tokio::test]
    async fn test_last_message_must_be_user() {
        let server = MockServer::start().await;
        let err = provider(&server, None)
            .send(&conv(&[(Role::User, "a"), (Role::Assistant, "b")]))
            .await
            .expect_err("invalid order");
        assert!(matches!(err, ChatError::InvalidTurnOrder));
    }

    #[tokio::test]
    async fn test_streaming_yields_chunks() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hi \"}]}}]}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"there\"}]}}]}\r\n\r\n",
        );
        Mock::given(method("POST"))
            .and(path(STREAM_PATH))
            .and(query_param("alt", "sse"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(1)
            .mount(&server)
            .await;

        let stream = provider(&server, None)
            .send_streaming(&conv(&[(Role::User, "hello")]))
            .await
            .expect("stream");
        let fragments: Vec<String> = stream.map(|r| r.expect("fragment")).collect().await;
        assert_eq!(fragments, vec!["Hi ", "there"]);
    }

    #[tokio::test]
    async fn test_streaming_start_failure_falls_back_to_buffered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(STREAM_PATH))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .respond_with(reply("buffered answer"))
            .expect(1)
            .mount(&server)
            .await;

        let stream = provider(&server, None)
            .send_streaming(&conv(&[(Role::User, "hello")]))
            .await
            .expect("fallback stream");
        let fragments: Vec<String> = stream.map(|r| r.expect("fragment")).collect().await;
        assert_eq!(fragments, vec!["buffered answer"]);
    }

    #[tokio::test]
    async fn test_streaming_with_history_sends_session_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(STREAM_PATH))
            .and(query_param("alt", "sse"))
            .and(body_json(json!({
                "contents": [
                    {"role": "user", "parts": [{"text": "a"}]},
                    {"role": "model", "parts": [{"text": "b"}]},
                    {"role": "user", "parts": [{"text": "c"}]}
                ],
                "generationConfig": {"maxOutputTokens": 1000}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"d\"}]}}]}\n\n",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let stream = provider(&server, None)
            .send_streaming(&conv(&[(Role::User, "a"), (Role::Assistant, "b"), (Role::User, "c")]))
            .await
            .expect("stream");
        let fragments: Vec<String> = stream.map(|r| r.expect("fragment")).collect().await;
        assert_eq!(fragments, vec!["d"]);
    }

    #[tokio::test]
    async fn test_streaming_start_failure_makes_one_buffered_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(STREAM_PATH))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .and(ContentsLen(3))
            .respond_with(reply("buffered session answer"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .and(ContentsLen(1))
            .respond_with(reply("unexpected"))
            .expect(0)
            .mount(&server)
            .await;

        let stream = provider(&server, None)
            .send_streaming(&conv(&[(Role::User, "a"), (Role::Assistant, "b"), (Role::User, "c")]))
            .await
            .expect("fallback stream");
        let fragments: Vec<String> = stream.map(|r| r.expect("fragment")).collect().await;
        assert_eq!(fragments, vec!["buffered session answer"]);
    }

    #[tokio::test]
    async fn test_streaming_start_and_buffered_failure_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(STREAM_PATH))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let err = provider(&server, None)
            .send_streaming(&conv(&[(Role::User, "a"), (Role::Assistant, "b"), (Role::User, "c")]))
            .await
            .err()
            .expect("both calls fail");
        assert_eq!(err.class(), Some(ErrorClass::Transient));
    }

    #[tokio::test]
    async fn test_streaming_mid_flight_error_propagates() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"start\"}]}}]}\n\n",
            "data: {\"error\":{\"code\":500,\"message\":\"internal\"}}\n\n",
        );
        Mock::given(method("POST"))
            .and(path(STREAM_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let mut stream = provider(&server, None)
            .send_streaming(&conv(&[(Role::User, "hello")]))
            .await
            .expect("stream");
        assert_eq!(stream.next().await.expect("first").expect("ok"), "start");
        assert!(stream.next().await.expect("second").is_err());
    }

    #[test]
    fn test_blocked_response_is_error() {
        let v = json!({"promptFeedback": {"blockReason": "SAFETY"}});
        let err = response_text(&v, "gemini-2.0-flash").expect_err("blocked");
        assert!(err.to_string().contains("response blocked: SAFETY"));
        assert_eq!(response_text(&json!({}), "m").expect("empty ok"), "");
    }
}
