//! LLM 提供商实现
//!
//! 包含各个 LLM 服务的具体实现

use std::time::Duration;

use anyhow::{Context, Result};

pub mod anthropic;
pub mod custom;
pub mod google;
pub mod ollama;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use custom::CustomProvider;
pub use google::GoogleProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAIProvider;

/// 所有适配器共享的 HTTP 客户端；整体超时由调度层控制
pub fn http_client(connect_timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .user_agent(concat!("prism-arena/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("创建 HTTP 客户端失败")
}
