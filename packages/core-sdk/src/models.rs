use std::{fmt, time::Duration};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/** \brief 未提供自定义提示词时使用的默认系统提示词。 */
pub const DEFAULT_SYSTEM_PROMPT: &str = concat!(
    "You are a helpful AI assistant in a console-based chat application. ",
    "Provide concise, helpful responses. ",
    "You can use simple markdown formatting like **bold** and *italic* when appropriate."
);

/** \brief 单次调用的默认总时长上限。 */
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub const OPENAI_API_BASE: &str = "https://api.openai.com";
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com";

/** \brief 可选模型条目：模型 ID 与展示名称。 */
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ModelEntry {
    pub id: &'static str,
    pub name: &'static str,
}

/** \brief OpenAI 允许的模型列表，首项为默认模型。 */
pub const OPENAI_MODELS: &[ModelEntry] = &[
    ModelEntry { id: "gpt-3.5-turbo", name: "GPT-3.5 Turbo" },
    ModelEntry { id: "gpt-3.5-turbo-16k", name: "GPT-3.5 Turbo 16K" },
    ModelEntry { id: "gpt-4", name: "GPT-4" },
    ModelEntry { id: "gpt-4-turbo", name: "GPT-4 Turbo" },
    ModelEntry { id: "gpt-4o", name: "GPT-4o" },
];

/** \brief Gemini 允许的模型列表，首项为默认模型。 */
pub const GEMINI_MODELS: &[ModelEntry] = &[
    ModelEntry { id: "gemini-2.0-flash", name: "Gemini 2.0 Flash" },
    ModelEntry { id: "gemini-1.5-pro", name: "Gemini 1.5 Pro" },
    ModelEntry { id: "gemini-1.5-flash", name: "Gemini 1.5 Flash" },
    ModelEntry { id: "gemini-1.0-pro", name: "Gemini 1.0 Pro" },
    ModelEntry { id: "gemini-1.0-pro-vision", name: "Gemini 1.0 Pro Vision" },
];

/**
 * \brief 两个可互换的后端：Primary 为 GPT 风格，Secondary 为 Gemini 风格。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderId {
    #[serde(rename = "openai")]
    Primary,
    #[serde(rename = "gemini")]
    Secondary,
}

impl ProviderId {
    /**
     * \brief 严格解析 Provider 名称，无法识别时返回 None。
     */
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" | "primary" => Some(Self::Primary),
            "gemini" | "google" | "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }

    /**
     * \brief 宽松解析调用方的 provider 选择器；缺失或无法识别时回落到 Primary。
     */
    pub fn from_selector(selector: Option<&str>) -> Self {
        selector.and_then(Self::parse).unwrap_or(Self::Primary)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Primary => "OpenAI",
            Self::Secondary => "Gemini",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "openai",
            Self::Secondary => "gemini",
        }
    }

    pub fn models(self) -> &'static [ModelEntry] {
        match self {
            Self::Primary => OPENAI_MODELS,
            Self::Secondary => GEMINI_MODELS,
        }
    }

    pub fn default_model(self) -> &'static str {
        self.models()[0].id
    }

    pub fn default_api_base(self) -> &'static str {
        match self {
            Self::Primary => OPENAI_API_BASE,
            Self::Secondary => GEMINI_API_BASE,
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/**
 * \brief 将调用方给出的模型名解析为允许列表中的条目。
 *
 * 缺失时使用默认模型；未知模型同样回落到默认模型，只记录警告，不报错。
 */
pub fn resolve_model(provider: ProviderId, requested: Option<&str>) -> &'static str {
    let requested = match requested.map(str::trim).filter(|m| !m.is_empty()) {
        Some(m) => m,
        None => return provider.default_model(),
    };
    match provider.models().iter().find(|entry| entry.id == requested) {
        Some(entry) => entry.id,
        None => {
            let fallback = provider.default_model();
            tracing::warn!(
                provider = %provider,
                requested,
                fallback,
                "unknown model, falling back to default"
            );
            fallback
        }
    }
}

/** \brief 消息角色：system/user/assistant */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn parse(role: &str) -> Option<Self> {
        match role {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/**
 * \brief 一轮对话消息，与 OpenAI Chat 消息格式对齐，额外携带 ID。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /** \brief 不透明的唯一标识 */
    pub id: String,
    /** \brief 角色 */
    pub role: Role,
    /** \brief 内容 */
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /**
     * \brief 从调用方 JSON 条目构造消息；缺少 role/content、内容为空或角色未知时返回 None。
     */
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let role = Role::parse(obj.get("role")?.as_str()?)?;
        let content = obj.get("content")?.as_str()?;
        if content.trim().is_empty() {
            return None;
        }
        let id = match obj.get("id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        Some(Self {
            id,
            role,
            content: content.to_string(),
        })
    }
}

/**
 * \brief 单次调用的 Provider 配置，调用结束即丢弃。
 */
#[derive(Debug)]
pub struct ProviderConfig {
    pub provider: ProviderId,
    /** \brief API 密钥，不写入日志 */
    pub api_key: SecretString,
    /** \brief 已解析的模型名 */
    pub model: String,
    /** \brief 调用方自定义的系统提示词 */
    pub system_prompt: Option<String>,
    /** \brief API 基地址 */
    pub api_base: String,
    /** \brief 总时长上限 */
    pub timeout: Duration,
}

impl ProviderConfig {
    pub fn new(provider: ProviderId, api_key: impl Into<String>) -> Self {
        Self {
            provider,
            api_key: SecretString::from(api_key.into()),
            model: provider.default_model().to_string(),
            system_prompt: None,
            api_base: provider.default_api_base().to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_model(mut self, model: Option<&str>) -> Self {
        self.model = resolve_model(self.provider, model).to_string();
        self
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.expose_secret().trim().is_empty()
    }

    /** \brief 调用方提供的非空系统提示词。 */
    pub fn custom_system_prompt(&self) -> Option<&str> {
        self.system_prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }

    /** \brief 实际生效的系统提示词，缺省时为默认值。 */
    pub fn effective_system_prompt(&self) -> &str {
        self.custom_system_prompt().unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }

    pub(crate) fn base_url(&self) -> &str {
        self.api_base.trim_end_matches('/')
    }
}

/**
 * \brief 一次完整交换的结果。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderResult {
    pub text: String,
    pub id: String,
}

/**
 * \brief 以当前毫秒时间戳合成交换 ID。
 */
pub fn synthesize_id() -> String {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    millis.to_string()
}
