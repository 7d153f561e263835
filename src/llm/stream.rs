//! 流式响应统一
//!
//! 把各提供商的原生事件流（[`ProviderStream`]）转换成统一的 [`ChunkStream`]：
//! 每个非空增量一个非终止块，流结束时恰好一个携带元数据的终止块；
//! 源流报错时只产出一个归一化后的错误并结束。

use std::pin::Pin;

use anyhow::Result;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::llm::errors::normalize_error;
use crate::llm::interface::{ChunkMetadata, ChunkStream, ProviderEvent, ProviderStream, ResponseChunk, Usage};

/// 一条 SSE 事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// 事件类型，未声明时为空串
    pub event: String,
    pub data: String,
}

pub type SseStream = Pin<Box<dyn Stream<Item = Result<SseEvent>> + Send>>;

/// 将原生事件流统一为块流
pub fn unify_stream(source: ProviderStream, model: String) -> ChunkStream {
    let stream = async_stream::stream! {
        let mut source = source;
        let mut model = model;
        let mut usage: Option<Usage> = None;
        let mut finish_reason: Option<String> = None;

        while let Some(event) = source.next().await {
            match event {
                Ok(ProviderEvent::Delta(text)) => {
                    if !text.is_empty() {
                        yield Ok(ResponseChunk::delta(text));
                    }
                }
                Ok(ProviderEvent::Usage(reported)) => {
                    usage = Some(match usage {
                        Some(current) => current.merge(reported),
                        None => reported,
                    });
                }
                Ok(ProviderEvent::Finish(reason)) => {
                    finish_reason = Some(reason);
                }
                Ok(ProviderEvent::Model(name)) => {
                    if !name.is_empty() {
                        model = name;
                    }
                }
                Err(e) => {
                    yield Err(normalize_error(e));
                    return;
                }
            }
        }

        yield Ok(ResponseChunk::terminal(ChunkMetadata {
            model,
            usage,
            finish_reason,
        }));
    };

    Box::pin(stream)
}

/// 解码 SSE 响应体
///
/// 传输层错误保留原始 `reqwest::Error`，便于错误归一化识别网络故障。
pub fn sse_data_stream(response: reqwest::Response) -> SseStream {
    let events = response.bytes_stream().eventsource().map(|item| match item {
        Ok(event) => Ok(SseEvent {
            event: event.event,
            data: event.data,
        }),
        Err(EventStreamError::Transport(e)) => Err(anyhow::Error::new(e)),
        Err(e) => Err(anyhow::anyhow!("SSE 解析失败: {}", e)),
    });

    Box::pin(events)
}

/// 令牌取消后停止向下游传播；被丢弃的源流会关闭底层连接
pub fn cancellable<S, T>(stream: S, token: CancellationToken) -> Pin<Box<dyn Stream<Item = T> + Send>>
where
    S: Stream<Item = T> + Send + 'static,
    T: Send + 'static,
{
    let stream = async_stream::stream! {
        let mut inner = Box::pin(stream);
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                item = inner.next() => item,
            };
            match next {
                Some(item) => yield item,
                None => break,
            }
        }
    };

    Box::pin(stream)
}
