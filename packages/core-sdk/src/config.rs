use std::time::Duration;

use secrecy::SecretString;

use crate::models::{ProviderId, DEFAULT_TIMEOUT, GEMINI_API_BASE, OPENAI_API_BASE};

/**
 * \brief 远端地址、超时与服务端兜底密钥；进程内只读。
 */
#[derive(Debug)]
pub struct Endpoints {
    pub openai_base: String,
    pub gemini_base: String,
    pub timeout: Duration,
    /** \brief 请求未携带密钥时 Primary 使用的服务端密钥（OPENAI_API_KEY） */
    pub openai_key_fallback: Option<SecretString>,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            openai_base: OPENAI_API_BASE.to_string(),
            gemini_base: GEMINI_API_BASE.to_string(),
            timeout: DEFAULT_TIMEOUT,
            openai_key_fallback: None,
        }
    }
}

impl Endpoints {
    /**
     * \brief 从环境变量读取配置，非法值回落到默认值并记录警告。
     */
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            openai_base: env_or("CONSOLECHAT_OPENAI_BASE", defaults.openai_base),
            gemini_base: env_or("CONSOLECHAT_GEMINI_BASE", defaults.gemini_base),
            timeout: timeout_from(std::env::var("CONSOLECHAT_TIMEOUT_SECS").ok().as_deref()),
            openai_key_fallback: std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty())
                .map(SecretString::from),
        }
    }

    pub fn api_base(&self, provider: ProviderId) -> &str {
        match provider {
            ProviderId::Primary => &self.openai_base,
            ProviderId::Secondary => &self.gemini_base,
        }
    }
}

/**
 * \brief HTTP 服务配置。
 */
#[derive(Debug)]
pub struct ServerConfig {
    /** \brief 监听地址，如 "127.0.0.1:5173" */
    pub addr: String,
    pub ui_dir: String,
    pub ui_fallback_dir: String,
    pub endpoints: Endpoints,
}

impl ServerConfig {
    pub fn from_env(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            ui_dir: env_or("CONSOLECHAT_UI_DIR", "packages/ui/dist".to_string()),
            ui_fallback_dir: env_or("CONSOLECHAT_UI_FALLBACK", "web".to_string()),
            endpoints: Endpoints::from_env(),
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
}

fn timeout_from(raw: Option<&str>) -> Duration {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        None => DEFAULT_TIMEOUT,
        Some(v) => match v.parse::<u64>() {
            Ok(secs) if secs > 0 => Duration::from_secs(secs),
            _ => {
                tracing::warn!(value = v, "invalid CONSOLECHAT_TIMEOUT_SECS, using default");
                DEFAULT_TIMEOUT
            }
        },
    }
}
