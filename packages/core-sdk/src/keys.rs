use axum::http::StatusCode;
use serde::Serialize;

use crate::models::ProviderId;

const OPENAI_KEY_PREFIX: &str = "sk-";
const OPENAI_MIN_LEN: usize = 20;
const GEMINI_MIN_LEN: usize = 10;

/**
 * \brief 密钥格式检查结果，对应 validate-key 接口的响应体。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyCheck {
    pub valid: bool,
    pub error: Option<String>,
}

impl KeyCheck {
    fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
        }
    }
}

/**
 * \brief 仅做格式检查，不发起网络请求。
 */
pub fn check_format(provider: ProviderId, api_key: &str) -> KeyCheck {
    match provider {
        ProviderId::Primary => {
            if api_key.starts_with(OPENAI_KEY_PREFIX) && api_key.len() >= OPENAI_MIN_LEN {
                KeyCheck::ok()
            } else {
                KeyCheck::invalid(
                    "OpenAI API keys should start with 'sk-' and be at least 20 characters long",
                )
            }
        }
        ProviderId::Secondary => {
            if api_key.len() >= GEMINI_MIN_LEN {
                KeyCheck::ok()
            } else {
                KeyCheck::invalid("Gemini API key should be at least 10 characters long")
            }
        }
    }
}

/**
 * \brief validate-key 接口逻辑：缺少密钥或未知 provider 返回 400。
 */
pub fn validate(provider: Option<&str>, api_key: Option<&str>) -> (StatusCode, KeyCheck) {
    let api_key = match api_key.filter(|k| !k.is_empty()) {
        Some(k) => k,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                KeyCheck::invalid("No API key provided"),
            )
        }
    };
    match provider.and_then(ProviderId::parse) {
        Some(p) => (StatusCode::OK, check_format(p, api_key)),
        None => (
            StatusCode::BAD_REQUEST,
            KeyCheck::invalid(format!("Unknown provider: {}", provider.unwrap_or(""))),
        ),
    }
}
