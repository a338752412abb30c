//! 请求/响应体标准化
//!
//! 将捕获到的原始请求体解析为 `{messages, model, modelParams}`，
//! 将响应体（含重组后的流式响应）解析为 `{content}`。任一侧失败都不产出样本。

pub mod json;
pub mod stream;

use std::collections::BTreeMap;
use std::io::Read;

use flate2::read::GzDecoder;
use serde_json::Value;

use crate::common::{MAX_BODY_BYTES, truncate_with_marker};
use crate::model::sample::{CapturedCall, CollectedSample, ParsedRequest, ParsedResponse};

pub use stream::StreamDialect;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// 解码响应体字节，gzip 压缩的内容先解压
pub fn decode_body(raw: &[u8]) -> String {
    if raw.starts_with(&GZIP_MAGIC) {
        let mut decoded = Vec::new();
        match GzDecoder::new(raw).read_to_end(&mut decoded) {
            Ok(_) => return String::from_utf8_lossy(&decoded).into_owned(),
            Err(e) => tracing::debug!("gzip 解压失败，按原文处理: {}", e),
        }
    }
    String::from_utf8_lossy(raw).into_owned()
}

/// 流式响应重组为单个 JSON；非流式内容按上限截断后透传
pub fn prepare_response(raw: &[u8]) -> String {
    let text = decode_body(raw);
    let dialect = StreamDialect::detect(&text);
    if let Some(reconstructed) = stream::reconstruct(dialect, &text) {
        return reconstructed;
    }
    truncate_with_marker(&text, MAX_BODY_BYTES)
}

/// 解析请求体，要求同时包含 `messages` 数组与字符串 `model`
pub fn parse_request(raw: &str) -> Option<ParsedRequest> {
    if raw.trim().is_empty() {
        return None;
    }
    let Value::Object(mut body) = json::parse_lenient(raw)? else {
        tracing::debug!("请求体不是 JSON 对象");
        return None;
    };

    let (Some(Value::Array(messages)), Some(Value::String(model))) =
        (body.shift_remove("messages"), body.shift_remove("model"))
    else {
        tracing::debug!("请求体缺少 messages 或 model 字段");
        return None;
    };

    let messages = messages
        .into_iter()
        .filter_map(|message| match message {
            Value::Object(fields) => Some(flatten_message(fields)),
            _ => None,
        })
        .collect();

    Some(ParsedRequest {
        messages,
        model,
        model_params: body,
    })
}

/// 字符串原样保留，其它非空值保留为紧凑 JSON 文本
fn flatten_message(fields: serde_json::Map<String, Value>) -> BTreeMap<String, String> {
    fields
        .into_iter()
        .filter_map(|(key, value)| match value {
            Value::Null => None,
            Value::String(s) => Some((key, s)),
            other => Some((key, other.to_string())),
        })
        .collect()
}

/// 解析响应体
pub fn parse_response(raw: &[u8]) -> Option<ParsedResponse> {
    let text = prepare_response(raw);
    if text.trim().is_empty() {
        return None;
    }
    let body = json::parse_lenient(&text)?;
    let content = extract_content(&body);
    if content.is_none() {
        tracing::debug!("响应体中没有可识别的 content 字段");
    }
    content.map(|content| ParsedResponse { content })
}

fn extract_content(body: &Value) -> Option<String> {
    match body.get("content") {
        Some(Value::String(s)) => return Some(s.clone()),
        Some(Value::Object(nested)) => {
            if let Some(Value::String(s)) = nested.get("content") {
                return Some(s.clone());
            }
        }
        Some(Value::Array(blocks)) => {
            let texts: Vec<&str> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str).is_none_or(|t| t == "text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            if !texts.is_empty() {
                return Some(texts.concat());
            }
        }
        _ => {}
    }

    let choice = body.get("choices")?.get(0)?;
    if let Some(s) = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
    {
        return Some(s.to_string());
    }
    choice
        .get("delta")
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// 将一次捕获标准化为样本；请求或响应无法解析时返回 None
pub fn normalize(mut call: CapturedCall) -> Option<CollectedSample> {
    let Some(request) = parse_request(&call.request_body) else {
        log_dropped(&call, "request");
        return None;
    };
    let Some(response) = parse_response(&call.response_body) else {
        log_dropped(&call, "response");
        return None;
    };
    let location = call.take_call_site().resolve();
    Some(CollectedSample::assemble(&call, request, response, location))
}

#[cfg(not(feature = "sensitive-logs"))]
fn log_dropped(call: &CapturedCall, side: &str) {
    tracing::debug!(
        id = %call.id,
        url = %call.url,
        status = call.status,
        side,
        request_len = call.request_body.len(),
        response_len = call.response_body.len(),
        "无法解析，丢弃该调用"
    );
}

#[cfg(feature = "sensitive-logs")]
fn log_dropped(call: &CapturedCall, side: &str) {
    tracing::debug!(
        id = %call.id,
        url = %call.url,
        status = call.status,
        side,
        request = %call.request_body,
        response = %String::from_utf8_lossy(&call.response_body),
        "无法解析，丢弃该调用"
    );
}
