//! 调用点注册表数据模型（`_registry.json`）

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::sample::CallLocation;

/// 当前注册表 schema 版本
pub const REGISTRY_SCHEMA: u32 = 1;

/// 单个调用点的使用记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub line_number: String,
    pub tag: String,
    pub first_seen: String,
    pub last_seen: String,
    pub count: u64,
}

/// 注册表：文件路径 -> 行号 -> 记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default = "default_schema")]
    pub schema: u32,
    #[serde(default, deserialize_with = "deserialize_files")]
    pub files: BTreeMap<String, BTreeMap<String, RegistryEntry>>,
}

fn default_schema() -> u32 {
    REGISTRY_SCHEMA
}

/// `"files": null` 视为空表
fn deserialize_files<'de, D>(
    deserializer: D,
) -> Result<BTreeMap<String, BTreeMap<String, RegistryEntry>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::deserialize(deserializer)?.unwrap_or_default())
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            schema: REGISTRY_SCHEMA,
            files: BTreeMap::new(),
        }
    }
}

impl Registry {
    /// 从原始文件内容解析注册表
    ///
    /// 空文件、`{}` 和无效 JSON 都视为空注册表，不向上抛出解析错误
    pub fn from_bytes(data: &[u8]) -> Self {
        let text = String::from_utf8_lossy(data);
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed == "{}" {
            tracing::debug!("注册表为空，重新初始化");
            return Self::default();
        }
        match serde_json::from_str::<Registry>(trimmed) {
            Ok(registry) => registry,
            Err(e) => {
                tracing::error!("注册表已损坏，重新创建: {}", e);
                Self::default()
            }
        }
    }

    /// 记录一次调用点命中，返回更新后的记录
    ///
    /// 新记录设置 firstSeen；已有记录只刷新 lastSeen，并以最新 tag 覆盖
    pub fn touch(&mut self, location: &CallLocation, tag: &str, now: &str) -> &RegistryEntry {
        let location = location.clone().sanitized();
        let line = location.line_number.clone();
        let entry = self
            .files
            .entry(location.file)
            .or_default()
            .entry(line.clone())
            .and_modify(|e| {
                e.tag = tag.to_string();
                e.last_seen = now.to_string();
                e.count += 1;
            })
            .or_insert_with(|| RegistryEntry {
                line_number: line,
                tag: tag.to_string(),
                first_seen: now.to_string(),
                last_seen: now.to_string(),
                count: 1,
            });
        entry
    }

    pub fn entry(&self, file: &str, line: &str) -> Option<&RegistryEntry> {
        self.files.get(file).and_then(|lines| lines.get(line))
    }
}
