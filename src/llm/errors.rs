//! 提供商调用的错误分类与归一化
//!
//! 所有适配器的失败路径都经过 [`normalize_error`]，编排器只会看到带有单个
//! [`ErrorCode`] 的 [`LlmError`]。

use std::error::Error as StdError;
use std::fmt;
use std::io;

use async_openai::error::OpenAIError;
use serde::{Deserialize, Serialize};

/// 固定的错误码集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    InvalidApiKey,
    MissingApiKey,
    PermissionDenied,
    ModelNotFound,
    RateLimitExceeded,
    ServiceUnavailable,
    NetworkError,
    TimeoutError,
    ApiCallError,
    InvalidPrompt,
    InvalidResponseFormat,
    UnsupportedOperation,
    UnsupportedCapability,
    EncryptionError,
    UnknownError,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 16] = [
        ErrorCode::InvalidRequest,
        ErrorCode::InvalidApiKey,
        ErrorCode::MissingApiKey,
        ErrorCode::PermissionDenied,
        ErrorCode::ModelNotFound,
        ErrorCode::RateLimitExceeded,
        ErrorCode::ServiceUnavailable,
        ErrorCode::NetworkError,
        ErrorCode::TimeoutError,
        ErrorCode::ApiCallError,
        ErrorCode::InvalidPrompt,
        ErrorCode::InvalidResponseFormat,
        ErrorCode::UnsupportedOperation,
        ErrorCode::UnsupportedCapability,
        ErrorCode::EncryptionError,
        ErrorCode::UnknownError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::InvalidApiKey => "INVALID_API_KEY",
            ErrorCode::MissingApiKey => "MISSING_API_KEY",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::ModelNotFound => "MODEL_NOT_FOUND",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::TimeoutError => "TIMEOUT_ERROR",
            ErrorCode::ApiCallError => "API_CALL_ERROR",
            ErrorCode::InvalidPrompt => "INVALID_PROMPT",
            ErrorCode::InvalidResponseFormat => "INVALID_RESPONSE_FORMAT",
            ErrorCode::UnsupportedOperation => "UNSUPPORTED_OPERATION",
            ErrorCode::UnsupportedCapability => "UNSUPPORTED_CAPABILITY",
            ErrorCode::EncryptionError => "ENCRYPTION_ERROR",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|code| code.as_str() == value)
    }

    /// 稍后重试是否可能成功
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimitExceeded
                | ErrorCode::ServiceUnavailable
                | ErrorCode::NetworkError
                | ErrorCode::TimeoutError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 归一化后的提供商错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct LlmError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl LlmError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
            provider: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn invalid_prompt(reason: &str) -> Self {
        Self::new(ErrorCode::InvalidPrompt, format!("无效的 prompt: {}", reason))
    }

    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, reason)
    }

    pub fn model_not_found(model: &str) -> Self {
        Self::new(
            ErrorCode::ModelNotFound,
            format!("该提供商没有模型 '{}'", model),
        )
    }

    pub fn unsupported_capability(model: &str, capability: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::UnsupportedCapability,
            format!("模型 '{}' 不支持 {}", model, capability),
        )
    }

    pub fn invalid_response(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidResponseFormat, reason)
    }

    pub fn unsupported_operation(operation: &str) -> Self {
        Self::new(
            ErrorCode::UnsupportedOperation,
            format!("该提供商不支持操作 '{}'", operation),
        )
    }

    pub fn missing_api_key(provider: &str) -> Self {
        Self::new(
            ErrorCode::MissingApiKey,
            format!("尚未保存 '{}' 的 API Key", provider),
        )
        .with_provider(provider)
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(
            ErrorCode::TimeoutError,
            format!("请求在 {} 秒后超时", after.as_secs()),
        )
    }
}

/// 提供商接口返回的非 2xx 响应
#[derive(Debug, thiserror::Error)]
#[error("{provider} API 错误: {status} - {body}")]
pub struct HttpStatusError {
    pub provider: String,
    pub status: u16,
    pub body: String,
}

impl HttpStatusError {
    /// 成功响应原样返回，其余转为错误
    pub async fn check(provider: &str, response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(HttpStatusError {
            provider: provider.to_string(),
            status: status.as_u16(),
            body,
        }
        .into())
    }

    /// 响应体是 JSON 错误包时取提供商自己的消息
    pub fn provider_message(&self) -> String {
        let parsed: Option<serde_json::Value> = serde_json::from_str(&self.body).ok();
        let message = parsed.as_ref().and_then(|value| {
            value
                .pointer("/error/message")
                .or_else(|| value.get("message"))
                .or_else(|| value.get("error"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        });

        match message {
            Some(message) => message,
            None if self.body.trim().is_empty() => format!("HTTP {}", self.status),
            None => self.body.chars().take(300).collect(),
        }
    }
}

/// HTTP 状态码到错误码的映射
pub fn code_for_status(status: u16) -> ErrorCode {
    match status {
        400 | 422 => ErrorCode::InvalidRequest,
        401 => ErrorCode::InvalidApiKey,
        403 => ErrorCode::PermissionDenied,
        404 => ErrorCode::ModelNotFound,
        408 => ErrorCode::TimeoutError,
        429 => ErrorCode::RateLimitExceeded,
        500 | 502 | 503 | 504 | 529 => ErrorCode::ServiceUnavailable,
        _ => ErrorCode::ApiCallError,
    }
}

fn find_cause<'a, T: StdError + 'static>(err: &'a anyhow::Error) -> Option<&'a T> {
    err.chain().find_map(|cause| cause.downcast_ref::<T>())
}

/// 把任意失败转换为固定错误码
///
/// 依次检查：已归一化的错误、HTTP 状态、网络故障、SDK 错误，最后是 `UNKNOWN_ERROR`。
pub fn normalize_error(err: anyhow::Error) -> LlmError {
    if let Some(normalized) = find_cause::<LlmError>(&err) {
        return normalized.clone();
    }

    if let Some(normalized) = from_status(&err) {
        return normalized;
    }

    if let Some(normalized) = from_network(&err) {
        return normalized;
    }

    if let Some(normalized) = from_sdk(&err) {
        return normalized;
    }

    LlmError::new(ErrorCode::UnknownError, format!("{:#}", err))
}

fn from_status(err: &anyhow::Error) -> Option<LlmError> {
    if let Some(http) = find_cause::<HttpStatusError>(err) {
        return Some(
            LlmError::new(code_for_status(http.status), http.provider_message())
                .with_status(http.status)
                .with_provider(http.provider.clone()),
        );
    }

    let reqwest_err = find_cause::<reqwest::Error>(err)?;
    let status = reqwest_err.status()?;
    Some(LlmError::new(code_for_status(status.as_u16()), reqwest_err.to_string()).with_status(status.as_u16()))
}

fn from_network(err: &anyhow::Error) -> Option<LlmError> {
    if let Some(reqwest_err) = find_cause::<reqwest::Error>(err) {
        if reqwest_err.is_timeout() {
            return Some(LlmError::new(ErrorCode::TimeoutError, reqwest_err.to_string()));
        }
        if reqwest_err.is_connect() {
            return Some(LlmError::new(ErrorCode::NetworkError, reqwest_err.to_string()));
        }
    }

    if find_cause::<tokio::time::error::Elapsed>(err).is_some() {
        return Some(LlmError::new(ErrorCode::TimeoutError, "请求超时"));
    }

    let io_err = find_cause::<io::Error>(err)?;
    let code = match io_err.kind() {
        io::ErrorKind::TimedOut => ErrorCode::TimeoutError,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::AddrNotAvailable => ErrorCode::NetworkError,
        _ => return None,
    };
    Some(LlmError::new(code, io_err.to_string()))
}

fn from_sdk(err: &anyhow::Error) -> Option<LlmError> {
    if let Some(openai_err) = find_cause::<OpenAIError>(err) {
        let normalized = match openai_err {
            OpenAIError::ApiError(api) => {
                let code = match api.code.as_deref() {
                    Some("invalid_api_key") => ErrorCode::InvalidApiKey,
                    Some("model_not_found") => ErrorCode::ModelNotFound,
                    Some("rate_limit_exceeded") | Some("insufficient_quota") => {
                        ErrorCode::RateLimitExceeded
                    }
                    _ => ErrorCode::ApiCallError,
                };
                LlmError::new(code, api.message.clone())
            }
            OpenAIError::InvalidArgument(message) => {
                LlmError::new(ErrorCode::InvalidPrompt, message.clone())
            }
            OpenAIError::JSONDeserialize(e) => {
                LlmError::new(ErrorCode::InvalidResponseFormat, e.to_string())
            }
            other => LlmError::new(ErrorCode::ApiCallError, other.to_string()),
        };
        // 自定义提供商也复用 OpenAI 客户端，来源由适配器补上
        return Some(normalized);
    }

    if let Some(json_err) = find_cause::<serde_json::Error>(err) {
        return Some(LlmError::new(ErrorCode::InvalidResponseFormat, json_err.to_string()));
    }

    let reqwest_err = find_cause::<reqwest::Error>(err)?;
    let code = if reqwest_err.is_decode() {
        ErrorCode::InvalidResponseFormat
    } else {
        ErrorCode::ApiCallError
    };
    Some(LlmError::new(code, reqwest_err.to_string()))
}
