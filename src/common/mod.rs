//! 公共工具模块

use chrono::{SecondsFormat, Utc};

/// 捕获的请求/响应体上限（2 MiB）
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// 截断标记
pub const TRUNCATION_MARKER: &str = "...[truncated]";

/// 安全地截断 UTF-8 字符串，确保不会在多字节字符中间截断
///
/// 返回不超过 `max_bytes` 字节的最长有效 UTF-8 子串
pub fn truncate_str_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }

    // 从 max_bytes 位置向前查找有效的字符边界
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }

    &s[..end]
}

/// 超过上限时截断并追加截断标记，未超过时原样返回
pub fn truncate_with_marker(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let truncate_at = max_bytes.saturating_sub(TRUNCATION_MARKER.len());
    format!("{}{}", truncate_str_safe(s, truncate_at), TRUNCATION_MARKER)
}

/// 当前 unix 毫秒时间戳
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// 当前 UTC 时间（ISO-8601，秒级精度，例如 `2026-01-01T00:00:00Z`）
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
