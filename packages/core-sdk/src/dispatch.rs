use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::Value;
use std::time::Instant;

use crate::config::Endpoints;
use crate::error::ChatError;
use crate::llm::{self, ChatProvider, ProviderStream};
use crate::models::{synthesize_id, ChatMessage, ProviderConfig, ProviderId, ProviderResult};

/**
 * \brief 调用方请求体（camelCase JSON）。
 *
 * 字段均可缺省，由 Dispatcher 统一校验。
 */
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub messages: Option<Value>,
    pub provider: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
}

impl ChatRequest {
    /**
     * \brief 宽松解析。
     *
     * 无法解析的请求体视为空请求，随后在消息校验处失败。
     */
    pub fn from_slice(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "unparseable request body");
            Self::default()
        })
    }

    /** \brief 由已类型化的历史构造请求（终端客户端使用）。 */
    pub fn from_history(messages: &[ChatMessage]) -> Self {
        Self {
            messages: serde_json::to_value(messages).ok(),
            ..Self::default()
        }
    }

    pub fn with_provider(mut self, provider: ProviderId) -> Self {
        self.provider = Some(provider.as_str().to_string());
        self
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }
}

/**
 * \brief 校验调用方消息数组；格式错误的条目被静默跳过。
 */
pub fn parse_messages(raw: Option<&Value>) -> Result<Vec<ChatMessage>, ChatError> {
    let entries = raw
        .and_then(Value::as_array)
        .ok_or_else(|| ChatError::invalid_payload("Invalid or missing messages array"))?;
    let messages: Vec<ChatMessage> = entries
        .iter()
        .filter_map(ChatMessage::from_value)
        .collect();
    if messages.len() < entries.len() {
        tracing::debug!(
            skipped = entries.len() - messages.len(),
            "skipped malformed messages"
        );
    }
    if messages.is_empty() {
        return Err(ChatError::invalid_payload("Valid messages array is required"));
    }
    Ok(messages)
}

/**
 * \brief 请求分发：选择适配器、校验输入并施加总时长上限。
 *
 * 不持有任何会话状态。
 */
#[derive(Debug, Default)]
pub struct Dispatcher {
    endpoints: Endpoints,
}

impl Dispatcher {
    pub fn new(endpoints: Endpoints) -> Self {
        Self { endpoints }
    }

    fn resolve_key(
        &self,
        provider: ProviderId,
        request: &ChatRequest,
    ) -> Result<String, ChatError> {
        let supplied = request.api_key.as_deref().map(str::trim);
        if let Some(key) = supplied.filter(|k| !k.is_empty()) {
            return Ok(key.to_string());
        }
        match (provider, &self.endpoints.openai_key_fallback) {
            (ProviderId::Primary, Some(key)) => Ok(key.expose_secret().to_string()),
            _ => Err(ChatError::MissingCredential { provider }),
        }
    }

    /**
     * \brief 校验顺序：消息，密钥，适配器构造。
     *
     * 适配器按 `Endpoints::timeout` 构造，由 `llm::connect` 施加总时长上限。
     */
    fn prepare(
        &self,
        provider: ProviderId,
        request: &ChatRequest,
    ) -> Result<(Vec<ChatMessage>, Box<dyn ChatProvider>), ChatError> {
        let messages = parse_messages(request.messages.as_ref())?;
        let api_key = self.resolve_key(provider, request)?;
        let config = ProviderConfig::new(provider, api_key)
            .with_model(request.model.as_deref())
            .with_system_prompt(request.system_prompt.clone())
            .with_api_base(self.endpoints.api_base(provider))
            .with_timeout(self.endpoints.timeout);
        Ok((messages, llm::connect(config)?))
    }

    /**
     * \brief 按请求中的 provider 选择器分发，缺省为 Primary。
     */
    pub async fn generate(&self, request: &ChatRequest) -> Result<ProviderResult, ChatError> {
        let provider = ProviderId::from_selector(request.provider.as_deref());
        self.generate_with(provider, request).await
    }

    /**
     * \brief 固定 provider 的非流式调用。
     */
    pub async fn generate_with(
        &self,
        provider: ProviderId,
        request: &ChatRequest,
    ) -> Result<ProviderResult, ChatError> {
        let (messages, adapter) = self.prepare(provider, request)?;
        let started = Instant::now();
        let result = adapter.send(&messages).await;

        match &result {
            Ok(reply) => tracing::info!(
                provider = %adapter.provider(),
                model = adapter.model(),
                messages = messages.len(),
                chars = reply.text.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "exchange completed"
            ),
            Err(e) => tracing::error!(
                provider = %adapter.provider(),
                model = adapter.model(),
                error = %e,
                "exchange failed"
            ),
        }
        result
    }

    /**
     * \brief 流式调用；建立连接与后续消费共用同一个截止时间。
     */
    pub async fn stream(&self, request: &ChatRequest) -> Result<ProviderStream, ChatError> {
        let provider = ProviderId::from_selector(request.provider.as_deref());
        let (messages, adapter) = self.prepare(provider, request)?;

        let fragments = match adapter.send_streaming(&messages).await {
            Ok(fragments) => fragments,
            Err(e) => {
                tracing::error!(
                    provider = %adapter.provider(),
                    model = adapter.model(),
                    error = %e,
                    "stream failed to start"
                );
                return Err(e);
            }
        };

        let id = synthesize_id();
        tracing::info!(
            provider = %adapter.provider(),
            model = adapter.model(),
            id = %id,
            "stream started"
        );
        Ok(ProviderStream {
            id,
            provider: adapter.provider(),
            model: adapter.model().to_string(),
            fragments,
        })
    }
}
