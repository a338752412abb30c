//! 捕获记录与样本数据模型

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::call_site::CallSite;

/// 未打标签时写入的 tag
pub const UNTAGGED: &str = "untagged";

/// 无法在不消费的前提下读取请求体时使用的占位符
pub const STREAM_SENTINEL: &str = "[stream]";

/// 调用点位置
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallLocation {
    pub file: String,
    pub line_number: String,
}

impl CallLocation {
    pub fn new(file: impl Into<String>, line_number: impl ToString) -> Self {
        Self {
            file: file.into(),
            line_number: line_number.to_string(),
        }
    }

    /// 找不到业务代码帧时的占位位置
    pub fn unknown() -> Self {
        Self::new("unknown", "0")
    }

    /// 空字段回退为 unknown / 0
    pub fn sanitized(mut self) -> Self {
        if self.file.is_empty() {
            self.file = "unknown".to_string();
        }
        if self.line_number.is_empty() {
            self.line_number = "0".to_string();
        }
        self
    }
}

/// 拦截器产出的原始捕获记录，由 Exporter 恰好消费一次
#[derive(Debug)]
pub struct CapturedCall {
    pub id: String,
    pub request_body: String,
    pub response_body: Vec<u8>,
    pub url: String,
    pub start_ms: i64,
    pub end_ms: i64,
    /// 0 表示请求在拿到响应前失败
    pub status: u16,
    pub tag: Option<String>,
    pub call_site: CallSite,
}

impl CapturedCall {
    /// 取出调用点，原位置留下 unknown
    pub fn take_call_site(&mut self) -> CallSite {
        std::mem::replace(&mut self.call_site, CallSite::Resolved(CallLocation::unknown()))
    }
}

/// 解析后的请求体
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequest {
    pub messages: Vec<BTreeMap<String, String>>,
    pub model: String,
    pub model_params: serde_json::Map<String, serde_json::Value>,
}

/// 解析后的响应体
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedResponse {
    pub content: String,
}

/// 写入事件分片的标准化样本（每行一个 JSON 对象）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectedSample {
    pub duration_ms: i64,
    pub tag: String,
    pub input: Vec<BTreeMap<String, String>>,
    pub output: ParsedResponse,
    pub model: String,
    pub model_params: serde_json::Map<String, serde_json::Value>,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub url: String,
    pub location: CallLocation,
}

impl CollectedSample {
    /// 由已解析的请求/响应组装样本
    pub fn assemble(
        call: &CapturedCall,
        request: ParsedRequest,
        response: ParsedResponse,
        location: CallLocation,
    ) -> Self {
        let tag = match call.tag.as_deref() {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => UNTAGGED.to_string(),
        };
        Self {
            duration_ms: (call.end_ms - call.start_ms).max(0),
            tag,
            input: request.messages,
            output: response,
            model: request.model,
            model_params: request.model_params,
            start_time_ms: call.start_ms,
            end_time_ms: call.end_ms,
            url: call.url.clone(),
            location,
        }
    }
}
