//! 调用点注册表存储（`_registry.json`）
//!
//! 读-改-写整个文件，多进程并发写入时以最后一次写入为准。

use std::sync::Arc;

use crate::common::now_iso;
use crate::model::registry::Registry;
use crate::model::sample::CallLocation;

use super::backend::StorageBackend;
use super::error::StoreError;

pub const REGISTRY_KEY: &str = "_registry.json";

pub struct RegistryStore {
    backend: Arc<dyn StorageBackend>,
}

impl RegistryStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// 读取注册表；文件缺失、为空或损坏时返回空注册表
    pub async fn load(&self) -> Result<Registry, StoreError> {
        match self.backend.read(REGISTRY_KEY).await? {
            Some(data) => Ok(Registry::from_bytes(&data)),
            None => Ok(Registry::default()),
        }
    }

    /// 记录单个调用点命中
    pub async fn update(&self, location: &CallLocation, tag: &str) -> Result<(), StoreError> {
        self.update_many(&[(location.clone(), tag.to_string())]).await
    }

    /// 一次读-改-写应用多个命中（按顺序，后者的 tag 覆盖前者）
    pub async fn update_many(&self, hits: &[(CallLocation, String)]) -> Result<(), StoreError> {
        self.update_many_at(hits, &now_iso()).await
    }

    pub async fn update_many_at(
        &self,
        hits: &[(CallLocation, String)],
        now: &str,
    ) -> Result<(), StoreError> {
        if hits.is_empty() {
            return Ok(());
        }

        let mut registry = self.load().await?;
        for (location, tag) in hits {
            let entry = registry.touch(location, tag, now);
            tracing::debug!(
                file = %location.file,
                line = %location.line_number,
                tag = %tag,
                count = entry.count,
                "注册表已更新"
            );
        }

        let data = serde_json::to_vec_pretty(&registry)?;
        self.backend.write(REGISTRY_KEY, &data).await
    }
}
