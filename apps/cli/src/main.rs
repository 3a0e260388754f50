use std::io::Write;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;

use consolechat_core_sdk::config::{Endpoints, ServerConfig};
use consolechat_core_sdk::keys;
use consolechat_core_sdk::prelude::*;
use consolechat_core_sdk::telemetry::TelemetryOptions;

/**
 * \brief CLI 程序入口：终端对话与本地 HTTP 服务。
 */
#[derive(Parser, Debug)]
#[command(
    name = "consolechat",
    version,
    about = "ConsoleChat: OpenAI / Gemini chat in the terminal"
)]
struct Cli {
    /** \brief 日志级别（RUST_LOG 优先） */
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
    /** \brief 以 JSON 行输出日志 */
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,
    /** \brief 同时写入 logs/consolechat.log */
    #[arg(long, global = true, default_value_t = false)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 保存 Provider、密钥、模型与系统提示词。
     */
    Init {
        #[arg(long, default_value = "openai")]
        provider: String,
        #[arg(long)]
        api_key: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        system_prompt: Option<String>,
    },

    /**
     * \brief 发送一条用户消息并流式显示模型回复。
     */
    Chat {
        #[arg(long)]
        prompt: String,
        /** \brief 覆盖已保存的 Provider */
        #[arg(long)]
        provider: Option<String>,
        #[arg(long, default_value_t = false)]
        no_stream: bool,
    },

    /** \brief 清空本地对话历史。 */
    Clear,

    /** \brief 打印本地对话历史。 */
    History,

    /** \brief 列出可选模型。 */
    Models,

    /**
     * \brief 检查密钥格式（不访问网络）。
     */
    ValidateKey {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        api_key: String,
    },

    /**
     * \brief 启动本地 HTTP 服务并提供前端页面。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    telemetry::init(&TelemetryOptions {
        level: cli.log_level.clone(),
        json: cli.log_json,
        log_file: cli.log_file,
    })?;

    match cli.command {
        Commands::Init {
            provider,
            api_key,
            model,
            system_prompt,
        } => init(&provider, &api_key, model, system_prompt)?,
        Commands::Chat {
            prompt,
            provider,
            no_stream,
        } => chat(&prompt, provider.as_deref(), no_stream).await?,
        Commands::Clear => {
            let conn = store::open_default_store().context("open store failed")?;
            store::clear_history(&conn).context("clear history failed")?;
            println!("History cleared.");
        }
        Commands::History => {
            let conn = store::open_default_store().context("open store failed")?;
            let history = store::load_history(&conn).context("load history failed")?;
            if history.is_empty() {
                println!("(no messages)");
            }
            for message in history {
                println!("{}: {}", message.role.as_str(), message.content);
            }
        }
        Commands::Models => {
            for provider in [ProviderId::Primary, ProviderId::Secondary] {
                println!("{}:", provider.label());
                for entry in provider.models() {
                    let marker = if entry.id == provider.default_model() {
                        " (default)"
                    } else {
                        ""
                    };
                    println!("  {:<24} {}{}", entry.id, entry.name, marker);
                }
            }
        }
        Commands::ValidateKey { provider, api_key } => {
            let (_, check) = keys::validate(Some(&provider), Some(&api_key));
            match check.error {
                None if check.valid => println!("Key format looks valid."),
                error => bail!(error.unwrap_or_else(|| "invalid key".to_string())),
            }
        }
        Commands::Serve { addr } => {
            server::run(ServerConfig::from_env(&addr)).await?;
        }
    }

    Ok(())
}

fn key_slot(provider: ProviderId) -> &'static str {
    match provider {
        ProviderId::Primary => store::OPENAI_KEY_KEY,
        ProviderId::Secondary => store::GEMINI_KEY_KEY,
    }
}

fn model_slot(provider: ProviderId) -> &'static str {
    match provider {
        ProviderId::Primary => store::OPENAI_MODEL_KEY,
        ProviderId::Secondary => store::GEMINI_MODEL_KEY,
    }
}

fn init(
    provider: &str,
    api_key: &str,
    model: Option<String>,
    system_prompt: Option<String>,
) -> Result<()> {
    let Some(provider) = ProviderId::parse(provider) else {
        bail!("Unknown provider: {}", provider);
    };
    let check = keys::check_format(provider, api_key);
    if let Some(warning) = &check.error {
        eprintln!("warning: {}", warning);
    }

    let conn = store::open_default_store().context("open store failed")?;
    store::set(&conn, store::PROVIDER_KEY, provider.as_str()).context("save provider failed")?;
    store::set(&conn, key_slot(provider), api_key).context("save api key failed")?;
    let model = models::resolve_model(provider, model.as_deref());
    store::set(&conn, model_slot(provider), model).context("save model failed")?;
    let saved = match system_prompt.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        Some(prompt) => store::set(&conn, store::SYSTEM_PROMPT_KEY, prompt),
        None => store::remove(&conn, store::SYSTEM_PROMPT_KEY),
    };
    saved.context("save system prompt failed")?;

    println!("Saved settings (provider={} | model={})", provider, model);
    Ok(())
}

async fn chat(prompt: &str, provider: Option<&str>, no_stream: bool) -> Result<()> {
    let conn = store::open_default_store().context("open store failed")?;
    let provider = match provider {
        Some(name) => match ProviderId::parse(name) {
            Some(p) => p,
            None => bail!("Unknown provider: {}", name),
        },
        None => ProviderId::from_selector(store::get(&conn, store::PROVIDER_KEY)?.as_deref()),
    };

    let mut history = store::load_history(&conn).context("load history failed")?;
    history.push(ChatMessage::user(prompt));

    let request = ChatRequest::from_history(&history)
        .with_provider(provider)
        .with_api_key(store::get(&conn, key_slot(provider))?)
        .with_model(store::get(&conn, model_slot(provider))?)
        .with_system_prompt(store::get(&conn, store::SYSTEM_PROMPT_KEY)?);
    let dispatcher = Dispatcher::new(Endpoints::from_env());

    let reply = if no_stream {
        let result = dispatcher.generate(&request).await?;
        println!("{}", result.text);
        result.text
    } else {
        match stream_reply(&dispatcher, &request).await? {
            Some(reply) => reply,
            None => return Ok(()),
        }
    };

    history.push(ChatMessage::assistant(reply));
    if let Err(e) = store::save_history(&conn, &history) {
        tracing::warn!(error = %e, "saving history failed");
    }
    Ok(())
}

/**
 * \brief 逐片段打印回复；Ctrl-C 取消时返回 None，已打印的部分不回收。
 */
async fn stream_reply(dispatcher: &Dispatcher, request: &ChatRequest) -> Result<Option<String>> {
    let stream = dispatcher.stream(request).await?;
    let mut fragments = stream.fragments;
    let mut reply = String::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!();
                eprintln!("Cancelled.");
                tracing::info!(id = %stream.id, chars = reply.len(), "stream cancelled by user");
                return Ok(None);
            }
            item = fragments.next() => match item {
                Some(Ok(delta)) => {
                    print!("{}", delta);
                    std::io::stdout().flush().ok();
                    reply.push_str(&delta);
                }
                Some(Err(e)) => {
                    println!();
                    return Err(e.into());
                }
                None => break,
            },
        }
    }
    println!();
    Ok(Some(reply))
}
