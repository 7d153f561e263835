//! LLM 客户端核心模块
//!
//! 实现多厂商 LLM API 集成，包括：
//! - 模型目录与能力查询
//! - 统一的 LLM 服务接口
//! - 多厂商适配器 (OpenAI, Anthropic, Google, Ollama, 自定义)
//! - 错误归一化与流式统一

pub mod errors;
pub mod factory;
pub mod interface;
pub mod model_resolver;
pub mod providers;
pub mod registry;
pub mod stream;

pub use errors::{normalize_error, ErrorCode, HttpStatusError, LlmError};
pub use factory::{AdapterFactory, AdapterRegistry};
pub use interface::{
    GenerationOutput, GenerationRequest, ImageOptions, ImageResponse, LLMService, Message, MessageRole,
    ModelParams, ProviderConfig, ResponseChunk, TextResponse, Usage,
};
pub use model_resolver::{resolve_targets, ModelResolver, ProviderKind, Target};
pub use registry::{Capability, ModelInfo};
