use std::{pin::Pin, time::Duration};

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use tokio::time::Instant;

use crate::error::ChatError;
use crate::models::{ChatMessage, ProviderConfig, ProviderId, ProviderResult};

mod gemini;
mod openai;
mod sse;

pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;

/** \brief 增量文本流：有限、不可重启、单消费者。 */
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send>>;

/**
 * \brief 两个后端共同实现的统一接口。
 */
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn provider(&self) -> ProviderId;

    fn model(&self) -> &str;

    /**
     * \brief 非流式调用，返回完整回复。
     */
    async fn send(&self, messages: &[ChatMessage]) -> Result<ProviderResult, ChatError>;

    /**
     * \brief 流式调用；每个片段解析出来后立即交给调用方。
     */
    async fn send_streaming(&self, messages: &[ChatMessage]) -> Result<TextStream, ChatError>;
}

/**
 * \brief 流式交换：ID 在首个片段之前即已确定。
 */
pub struct ProviderStream {
    pub id: String,
    pub provider: ProviderId,
    pub model: String,
    pub fragments: TextStream,
}

/**
 * \brief 按配置中的 provider 构造对应适配器，每次调用各自持有 HTTP 客户端。
 *
 * 返回的适配器按 `config.timeout` 限制总时长：非流式调用整体计时，
 * 流式调用的建立与消费共用同一个截止时间。
 */
pub fn connect(config: ProviderConfig) -> Result<Box<dyn ChatProvider>, ChatError> {
    let limit = config.timeout;
    let inner: Box<dyn ChatProvider> = match config.provider {
        ProviderId::Primary => Box::new(OpenAiProvider::new(config)?),
        ProviderId::Secondary => Box::new(GeminiProvider::new(config)?),
    };
    Ok(Box::new(Bounded { inner, limit }))
}

/** \brief 为适配器加上总时长上限。 */
struct Bounded {
    inner: Box<dyn ChatProvider>,
    limit: Duration,
}

#[async_trait]
impl ChatProvider for Bounded {
    fn provider(&self) -> ProviderId {
        self.inner.provider()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn send(&self, messages: &[ChatMessage]) -> Result<ProviderResult, ChatError> {
        match tokio::time::timeout(self.limit, self.inner.send(messages)).await {
            Ok(result) => result,
            Err(_) => Err(ChatError::timeout(self.provider(), self.limit)),
        }
    }

    async fn send_streaming(&self, messages: &[ChatMessage]) -> Result<TextStream, ChatError> {
        let deadline = Instant::now() + self.limit;
        let fragments =
            match tokio::time::timeout_at(deadline, self.inner.send_streaming(messages)).await {
                Ok(result) => result?,
                Err(_) => return Err(ChatError::timeout(self.provider(), self.limit)),
            };
        Ok(with_deadline(fragments, deadline, self.provider(), self.limit))
    }
}

/**
 * \brief 为文本流加上总时长截止；超时后产出 Timeout 并结束，丢弃上游连接。
 */
pub fn with_deadline(
    stream: TextStream,
    deadline: Instant,
    provider: ProviderId,
    limit: Duration,
) -> TextStream {
    let mut stream = stream;
    Box::pin(try_stream! {
        loop {
            let next = tokio::time::timeout_at(deadline, stream.next())
                .await
                .map_err(|_| ChatError::timeout(provider, limit))?;
            match next {
                Some(item) => {
                    let fragment = item?;
                    yield fragment;
                }
                None => break,
            }
        }
    })
}

/**
 * \brief 把一次性结果包装成只有一个片段的流。
 */
pub(crate) fn once_stream(full: String) -> TextStream {
    Box::pin(try_stream! {
        if !full.is_empty() {
            yield full;
        }
    })
}
