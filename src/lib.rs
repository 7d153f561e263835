//! Prism Arena
//!
//! 把同一个 prompt 同时发给多个 LLM 提供商，对比结果并按模型续写对话。
//! 凭证在本地加密保存，所有请求直接从本机发出。

// 注意：模块声明顺序很重要，被依赖的模块需要先声明
pub mod config;
pub mod logging;
pub mod llm;
pub mod database;
pub mod vault;
pub mod orchestrator;
pub mod cli;

pub use config::AppConfig;
pub use orchestrator::{PromptOrchestrator, PromptSubmission};
