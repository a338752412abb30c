//! 存储后端 trait
//!
//! 事件分片与注册表都通过该接口读写，本地目录与对象存储对调用方完全一致。

use async_trait::async_trait;

use super::error::StoreError;

/// 键值式存储后端
///
/// 键为相对于数据目录的 `/` 分隔路径，例如 `events/1700000000000.jsonl`
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// 读取对象，不存在时返回 None
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// 覆盖写入对象
    async fn write(&self, key: &str, data: &[u8]) -> Result<(), StoreError>;

    /// 追加写入对象，不存在时创建
    async fn append(&self, key: &str, data: &[u8]) -> Result<(), StoreError>;

    /// 列出指定前缀下的全部键
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// 后端描述（用于日志）
    fn describe(&self) -> String;
}
