use std::time::Duration;

use axum::http::StatusCode;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::models::ProviderId;

const MAX_DETAIL_CHARS: usize = 1_024;

static BEARER_TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bBearer\s+[A-Za-z0-9._\-+/=]{8,}").expect("valid bearer token regex")
});

/** \brief 匹配 `key=`、`api_key=`、`x-api-key=` 等形式的参数值。 */
static KEY_PARAM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)key=[^&\s]+").expect("valid key parameter regex"));

/**
 * \brief 远端失败的粗分类，基于状态码与文本的尽力匹配，不构成稳定契约。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    Credential,
    Quota,
    ModelUnavailable,
    Transient,
    Unknown,
}

impl ErrorClass {
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            401 | 403 => Some(Self::Credential),
            429 => Some(Self::Quota),
            404 => Some(Self::ModelUnavailable),
            408 | 500..=599 => Some(Self::Transient),
            _ => None,
        }
    }

    pub fn from_detail(detail: &str) -> Option<Self> {
        let lower = detail.to_lowercase();
        if lower.contains("api key")
            || lower.contains("api_key")
            || lower.contains("unauthenticated")
            || lower.contains("permission denied")
        {
            Some(Self::Credential)
        } else if lower.contains("quota")
            || lower.contains("rate limit")
            || lower.contains("resource_exhausted")
        {
            Some(Self::Quota)
        } else if lower.contains("not available")
            || lower.contains("not found")
            || lower.contains("not supported")
        {
            Some(Self::ModelUnavailable)
        } else {
            None
        }
    }

    /**
     * \brief 先看状态码，再看错误文本，都无法识别时为 Unknown。
     */
    pub fn classify(status: Option<u16>, detail: &str) -> Self {
        status
            .and_then(Self::from_status)
            .or_else(|| Self::from_detail(detail))
            .unwrap_or(Self::Unknown)
    }
}

/**
 * \brief 核心层统一的错误分类。
 */
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChatError {
    #[error("{} API key is required", .provider.label())]
    MissingCredential { provider: ProviderId },

    #[error("{0}")]
    InvalidPayload(String),

    #[error("The last message must be from the user")]
    InvalidTurnOrder,

    /** \brief 历史转换后没有可用的用户消息；由 Secondary 适配器拦截并转为单轮调用。 */
    #[error("no user-authored history survived conversion")]
    NoUsableHistory,

    #[error("{}", describe_provider_error(.provider, .class, .model, .detail))]
    Provider {
        provider: ProviderId,
        class: ErrorClass,
        model: String,
        detail: String,
    },

    #[error("{} request timed out after {after_secs} seconds", .provider.label())]
    Timeout { provider: ProviderId, after_secs: f64 },
}

fn describe_provider_error(
    provider: &ProviderId,
    class: &ErrorClass,
    model: &str,
    detail: &str,
) -> String {
    let label = provider.label();
    match *class {
        ErrorClass::Credential => {
            format!("Invalid {label} API key. Please check your API key and try again.")
        }
        ErrorClass::Quota => format!(
            "{label} API quota exceeded. Please try again later or check your quota limits."
        ),
        ErrorClass::ModelUnavailable => {
            format!("The selected model ({model}) is not available. Try a different model.")
        }
        ErrorClass::Transient | ErrorClass::Unknown => format!("{label} API error: {detail}"),
    }
}

impl ChatError {
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload(message.into())
    }

    /**
     * \brief 由远端 HTTP 失败构造错误；正文会先经过脱敏与截断。
     */
    pub fn from_status(provider: ProviderId, model: &str, status: u16, body: &str) -> Self {
        let detail = format!("{} {}", status, sanitize_detail(body));
        Self::Provider {
            provider,
            class: ErrorClass::classify(Some(status), &detail),
            model: model.to_string(),
            detail,
        }
    }

    /** \brief 总时长超限。 */
    pub fn timeout(provider: ProviderId, limit: Duration) -> Self {
        Self::Timeout {
            provider,
            after_secs: limit.as_secs_f64(),
        }
    }

    /** \brief 由传输层错误构造；连接失败与超时归为 Transient。 */
    pub fn transport(provider: ProviderId, model: &str, err: reqwest::Error) -> Self {
        let transient = err.is_connect() || err.is_timeout();
        let status = err.status().map(|s| s.as_u16());
        let detail = sanitize_detail(&err.without_url().to_string());
        let class = if transient {
            ErrorClass::Transient
        } else {
            ErrorClass::classify(status, &detail)
        };
        Self::Provider {
            provider,
            class,
            model: model.to_string(),
            detail,
        }
    }

    /** \brief 远端返回了无法解读的内容。 */
    pub fn unexpected(provider: ProviderId, model: &str, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self::Provider {
            provider,
            class: ErrorClass::classify(None, &detail),
            model: model.to_string(),
            detail,
        }
    }

    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            Self::Provider { class, .. } => Some(*class),
            Self::Timeout { .. } => Some(ErrorClass::Transient),
            _ => None,
        }
    }

    /**
     * \brief 校验类错误返回 400，其余一律 500。
     */
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingCredential { .. } | Self::InvalidPayload(_) | Self::InvalidTurnOrder => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/**
 * \brief 提取错误正文中的 error.message，脱敏密钥后截断。
 */
pub fn sanitize_detail(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "Unknown error".to_string();
    }
    let message = serde_json::from_str::<Value>(trimmed)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| trimmed.to_string());

    let redacted = BEARER_TOKEN_RE.replace_all(&message, "Bearer [REDACTED]");
    let redacted = KEY_PARAM_RE.replace_all(&redacted, "key=[REDACTED]");
    if redacted.chars().count() > MAX_DETAIL_CHARS {
        let mut cut: String = redacted.chars().take(MAX_DETAIL_CHARS).collect();
        cut.push_str("...");
        cut
    } else {
        redacted.into_owned()
    }
}
