use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use secrecy::ExposeSecret;
use serde_json::{json, Value};

use super::{sse, ChatProvider, TextStream};
use crate::convert;
use crate::error::ChatError;
use crate::models::{synthesize_id, ChatMessage, ProviderConfig, ProviderId, ProviderResult};

/**
 * \brief Primary 适配器：OpenAI Chat Completions，原生支持流式。
 */
#[derive(Debug)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ChatError> {
        if !config.has_api_key() {
            return Err(ChatError::MissingCredential {
                provider: ProviderId::Primary,
            });
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ChatError::transport(ProviderId::Primary, &config.model, e))?;
        Ok(Self { client, config })
    }

    async fn post(
        &self,
        messages: &[ChatMessage],
        stream: bool,
    ) -> Result<reqwest::Response, ChatError> {
        let messages = convert::transmittable(messages)?;
        let url = format!("{}/v1/chat/completions", self.config.base_url());
        let body = json!({
            "model": self.config.model,
            "messages": convert::to_primary(&messages, self.config.effective_system_prompt()),
            "stream": stream
        });
        tracing::debug!(
            model = %self.config.model,
            messages = messages.len(),
            stream,
            "openai request"
        );

        let resp = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(
                AUTHORIZATION,
                format!("Bearer {}", self.config.api_key.expose_secret()),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::transport(ProviderId::Primary, &self.config.model, e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(ChatError::from_status(
                ProviderId::Primary,
                &self.config.model,
                status,
                &text,
            ));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn provider(&self) -> ProviderId {
        ProviderId::Primary
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn send(&self, messages: &[ChatMessage]) -> Result<ProviderResult, ChatError> {
        let resp = self.post(messages, false).await?;
        let v: Value = resp
            .json()
            .await
            .map_err(|e| ChatError::transport(ProviderId::Primary, &self.config.model, e))?;
        if v.get("error").is_some() {
            return Err(ChatError::unexpected(
                ProviderId::Primary,
                &self.config.model,
                crate::error::sanitize_detail(&v.to_string()),
            ));
        }
        let id = v
            .get("id")
            .and_then(|id| id.as_str())
            .filter(|id| !id.is_empty())
            .map(|id| id.to_string())
            .unwrap_or_else(synthesize_id);
        Ok(ProviderResult {
            text: extract_openai_content(&v),
            id,
        })
    }

    async fn send_streaming(&self, messages: &[ChatMessage]) -> Result<TextStream, ChatError> {
        let resp = self.post(messages, true).await?;
        let model = self.config.model.clone();
        let mut events = sse::data_events(resp, ProviderId::Primary, model.clone());

        Ok(Box::pin(try_stream! {
            while let Some(data) = events.next().await {
                let data = data?;
                if let Some(delta) = parse_openai_delta(&data, &model)? {
                    yield delta;
                }
            }
        }))
    }
}

/**
 * \brief 解析一个流式事件中的增量文本；错误事件转为 Provider 错误，无法解析的事件忽略。
 */
fn parse_openai_delta(line: &str, model: &str) -> Result<Option<String>, ChatError> {
    let v: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    if v.get("error").is_some() {
        return Err(ChatError::unexpected(
            ProviderId::Primary,
            model,
            crate::error::sanitize_detail(line),
        ));
    }
    Ok(v.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string()))
}

fn extract_openai_content(v: &Value) -> String {
    v.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string()
}
