//! 宽松 JSON 解析

use serde_json::Value;

/// 解析 JSON，失败时修复字符串内的裸换行后重试一次
pub fn parse_lenient(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => Some(value),
        Err(first) => {
            let repaired = escape_newlines_in_strings(text);
            if repaired == text {
                tracing::debug!("JSON 解析失败: {}", first);
                return None;
            }
            match serde_json::from_str::<Value>(&repaired) {
                Ok(value) => {
                    tracing::debug!("修复字符串内换行后解析成功");
                    Some(value)
                }
                Err(e) => {
                    tracing::debug!("JSON 修复后仍解析失败: {}", e);
                    None
                }
            }
        }
    }
}

/// 只转义双引号字符串内部的 `\n` 与 `\r`，结构性空白保持不变
pub fn escape_newlines_in_strings(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(c);
                continue;
            }
            match c {
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                _ => out.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }
    }

    out
}
