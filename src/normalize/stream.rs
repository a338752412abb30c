//! 流式响应（SSE）重组

use std::convert::Infallible;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::Value;

/// OpenAI 流式分块标记
const OPENAI_CHUNK_MARKER: &str = "\"chat.completion.chunk\"";
/// Anthropic 增量事件标记
const ANTHROPIC_DELTA_MARKER: &str = "\"content_block_delta\"";
/// 流结束哨兵
const DONE_SENTINEL: &str = "[DONE]";

/// 响应体方言
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDialect {
    /// 普通 JSON 响应
    NotStreaming,
    OpenAiDelta,
    AnthropicDelta,
    /// SSE 分帧但无已知标记
    Unknown,
}

impl StreamDialect {
    /// 按结构特征识别方言
    pub fn detect(text: &str) -> Self {
        if !looks_like_sse(text) {
            return Self::NotStreaming;
        }
        if text.contains(OPENAI_CHUNK_MARKER) {
            Self::OpenAiDelta
        } else if text.contains(ANTHROPIC_DELTA_MARKER) {
            Self::AnthropicDelta
        } else {
            Self::Unknown
        }
    }
}

fn looks_like_sse(text: &str) -> bool {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return false;
    }
    text.lines().any(|line| {
        let line = line.trim_start();
        line.starts_with("data:") || line.starts_with("event:")
    })
}

/// 重组流式响应为 `{"content": ...}` JSON 文本
///
/// 非流式、未知方言或没有任何增量片段时返回 None，由调用方原样透传
pub fn reconstruct(dialect: StreamDialect, text: &str) -> Option<String> {
    let fragments = match dialect {
        StreamDialect::NotStreaming | StreamDialect::Unknown => return None,
        StreamDialect::OpenAiDelta => collect_fragments(text, openai_fragment),
        StreamDialect::AnthropicDelta => collect_fragments(text, anthropic_fragment),
    };

    if fragments.is_empty() {
        tracing::debug!(dialect = ?dialect, "流式响应中没有内容片段");
        return None;
    }

    let content = fragments.concat();
    tracing::debug!(
        dialect = ?dialect,
        fragments = fragments.len(),
        content_len = content.len(),
        "流式响应已重组"
    );
    serde_json::to_string(&serde_json::json!({ "content": content })).ok()
}

fn openai_fragment(event: &Value) -> Option<String> {
    event
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn anthropic_fragment(event: &Value) -> Option<String> {
    if event.get("type")?.as_str()? != "content_block_delta" {
        return None;
    }
    event
        .get("delta")?
        .get("text")?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn collect_fragments(text: &str, extract: fn(&Value) -> Option<String>) -> Vec<String> {
    sse_data(text)
        .iter()
        .filter(|data| data.trim() != DONE_SENTINEL)
        .filter_map(|data| serde_json::from_str::<Value>(data).ok())
        .filter_map(|event| extract(&event))
        .collect()
}

/// 解码 SSE 分帧，返回每个事件的 data 字段
fn sse_data(text: &str) -> Vec<String> {
    let mut owned = text.to_string();
    // 末尾事件缺少空行时补齐，确保被派发
    if !owned.ends_with("\n\n") {
        owned.push_str("\n\n");
    }
    let chunks = futures::stream::iter([Ok::<_, Infallible>(owned.into_bytes())]);
    futures::executor::block_on(
        chunks
            .eventsource()
            .filter_map(|item| async move { item.ok().map(|event| event.data) })
            .collect::<Vec<_>>(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openai_stream(parts: &[&str]) -> String {
        let mut out = String::new();
        for part in parts {
            out.push_str(&format!(
                "data: {{\"object\":\"chat.completion.chunk\",\"choices\":[{{\"delta\":{{\"content\":{}}}}}]}}\n\n",
                serde_json::to_string(part).unwrap()
            ));
        }
        out.push_str("data: [DONE]\n\n");
        out
    }

    #[test]
    fn test_detect_dialects() {
        assert_eq!(StreamDialect::detect("{\"content\":\"x\"}"), StreamDialect::NotStreaming);
        assert_eq!(StreamDialect::detect(&openai_stream(&["a"])), StreamDialect::OpenAiDelta);
        assert_eq!(
            StreamDialect::detect("event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"Hi\"}}\n\n"),
            StreamDialect::AnthropicDelta
        );
        assert_eq!(StreamDialect::detect("data: {\"foo\":1}\n\n"), StreamDialect::Unknown);
        assert_eq!(StreamDialect::detect("plain text"), StreamDialect::NotStreaming);
    }

    #[test]
    fn test_openai_reconstruction() {
        let text = openai_stream(&["Hel", "lo", " world"]);
        let out = reconstruct(StreamDialect::detect(&text), &text).unwrap();
        assert_eq!(out, r#"{"content":"Hello world"}"#);
    }

    #[test]
    fn test_anthropic_reconstruction() {
        let text = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" there\"}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}"
        );
        let out = reconstruct(StreamDialect::AnthropicDelta, text).unwrap();
        assert_eq!(out, r#"{"content":"Hi there"}"#);
    }

    #[test]
    fn test_fragments_with_quotes_are_escaped() {
        let text = openai_stream(&["say \"hi\"\n"]);
        let out = reconstruct(StreamDialect::OpenAiDelta, &text).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["content"], "say \"hi\"\n");
    }

    #[test]
    fn test_known_dialect_without_fragments_passes_through() {
        let text = "data: {\"object\":\"chat.completion.chunk\",\"choices\":[{\"delta\":{}}]}\n\n";
        assert!(reconstruct(StreamDialect::OpenAiDelta, text).is_none());
        assert!(reconstruct(StreamDialect::Unknown, "data: x\n\n").is_none());
    }
}
