use serde::Serialize;

use crate::error::ChatError;
use crate::models::{ChatMessage, Role};

/**
 * \brief Primary 端的消息格式：role/content 直接透传。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrimaryMessage {
    pub role: Role,
    pub content: String,
}

/** \brief Secondary 端只区分 user 与 model 两种角色。 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SecondaryRole {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecondaryPart {
    pub text: String,
}

/**
 * \brief Secondary 端的一条历史记录：{role, parts: [{text}]}。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecondaryContent {
    pub role: SecondaryRole,
    pub parts: Vec<SecondaryPart>,
}

impl SecondaryContent {
    fn new(role: SecondaryRole, text: &str) -> Self {
        Self {
            role,
            parts: vec![SecondaryPart {
                text: text.to_string(),
            }],
        }
    }
}

/**
 * \brief 过滤掉内容为空的消息；一条都不剩时视为无效载荷。
 */
pub fn transmittable(messages: &[ChatMessage]) -> Result<Vec<ChatMessage>, ChatError> {
    let kept: Vec<ChatMessage> = messages
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .cloned()
        .collect();
    if kept.len() != messages.len() {
        tracing::debug!(
            skipped = messages.len() - kept.len(),
            "skipping messages with empty content"
        );
    }
    if kept.is_empty() {
        return Err(ChatError::invalid_payload("Valid messages array is required"));
    }
    Ok(kept)
}

/**
 * \brief 转换为 Primary 端格式；输入中没有 system 消息时在最前面补一条。
 */
pub fn to_primary(messages: &[ChatMessage], system_prompt: &str) -> Vec<PrimaryMessage> {
    let has_system = messages.iter().any(|m| m.role == Role::System);
    let mut out = Vec::with_capacity(messages.len() + 1);
    if !has_system {
        out.push(PrimaryMessage {
            role: Role::System,
            content: system_prompt.to_string(),
        });
    }
    out.extend(messages.iter().map(|m| PrimaryMessage {
        role: m.role,
        content: m.content.clone(),
    }));
    out
}

/**
 * \brief 取出 Secondary 端的当前用户轮次。
 *
 * 最后一条必须是 user；有自定义提示词时以 `[System: ...]` 前缀注入。
 */
pub fn secondary_turn(
    messages: &[ChatMessage],
    custom_prompt: Option<&str>,
) -> Result<String, ChatError> {
    let last = messages
        .last()
        .ok_or_else(|| ChatError::invalid_payload("Valid messages array is required"))?;
    if last.role != Role::User {
        return Err(ChatError::InvalidTurnOrder);
    }
    Ok(match custom_prompt {
        Some(prompt) => format!("[System: {}]\n\n{}", prompt, last.content),
        None => last.content.clone(),
    })
}

/**
 * \brief 构造 Secondary 端的历史（不含最后一条）。
 *
 * 依次：丢弃 system；角色映射为 user/model；去掉开头的非 user 记录。
 * 没有任何 user 记录留下时返回 NoUsableHistory。
 */
pub fn secondary_history(messages: &[ChatMessage]) -> Result<Vec<SecondaryContent>, ChatError> {
    let prior = match messages.split_last() {
        Some((_, prior)) => prior,
        None => return Err(ChatError::NoUsableHistory),
    };

    let history: Vec<SecondaryContent> = prior
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let role = match m.role {
                Role::User => SecondaryRole::User,
                _ => SecondaryRole::Model,
            };
            SecondaryContent::new(role, &m.content)
        })
        .skip_while(|c| c.role != SecondaryRole::User)
        .collect();

    if history.is_empty() {
        return Err(ChatError::NoUsableHistory);
    }
    Ok(history)
}

pub fn secondary_turn_content(turn: &str) -> SecondaryContent {
    SecondaryContent::new(SecondaryRole::User, turn)
}
