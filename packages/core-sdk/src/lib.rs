pub mod config;
pub mod convert;
pub mod dispatch;
pub mod error;
pub mod keys;
pub mod llm;
pub mod models;
pub mod server;
pub mod store;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config;
    pub use crate::dispatch::{ChatRequest, Dispatcher};
    pub use crate::error::{ChatError, ErrorClass};
    pub use crate::llm;
    pub use crate::models::{self, ChatMessage, ProviderConfig, ProviderId, ProviderResult, Role};
    pub use crate::server;
    pub use crate::store;
    pub use crate::telemetry;
}
