use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

const LOG_DIR: &str = "logs";
const LOG_FILE: &str = "consolechat.log";

/** \brief 文件日志的后台写线程守卫，进程结束前不得释放。 */
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/**
 * \brief 日志初始化选项。
 */
#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    /** \brief 默认级别（RUST_LOG 优先） */
    pub level: String,
    /** \brief 控制台以 JSON 行输出 */
    pub json: bool,
    /** \brief 额外写入 logs/consolechat.log */
    pub log_file: bool,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            log_file: false,
        }
    }
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => {
            EnvFilter::try_new(level).with_context(|| format!("invalid log level: {}", level))
        }
    }
}

/**
 * \brief 安装全局 tracing 订阅者；控制台输出到 stderr，避免与对话正文混在 stdout。
 */
pub fn init(options: &TelemetryOptions) -> Result<()> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if options.json {
        layers.push(fmt::layer().json().with_writer(std::io::stderr).boxed());
    } else {
        layers.push(
            fmt::layer()
                .with_target(false)
                .compact()
                .with_writer(std::io::stderr)
                .boxed(),
        );
    }

    if options.log_file {
        std::fs::create_dir_all(LOG_DIR).context("create log directory failed")?;
        let appender = tracing_appender::rolling::never(LOG_DIR, LOG_FILE);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        layers.push(fmt::layer().with_ansi(false).with_writer(writer).boxed());
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(build_filter(&options.level)?)
        .try_init()
        .context("install tracing subscriber failed")?;
    Ok(())
}
