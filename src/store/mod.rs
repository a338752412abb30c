//! 事件与注册表存储
//!
//! 数据目录可以是本地路径（或 `file://`），也可以是 `s3://bucket/prefix`、`gs://bucket/prefix`：
//! - `events/<unix_ms>.jsonl`：按时间窗口分片的样本
//! - `_registry.json`：调用点注册表

pub mod backend;
pub mod error;
pub mod events;
#[cfg(feature = "gcs")]
pub mod gcs;
pub mod local;
pub mod registry;
#[cfg(feature = "s3")]
pub mod s3;

use std::path::PathBuf;
use std::sync::Arc;

pub use backend::StorageBackend;
pub use error::StoreError;
pub use events::EventStore;
pub use local::LocalStorage;
pub use registry::RegistryStore;

use crate::model::sample::CollectedSample;

/// 解析后的数据目录
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataFolder {
    Local(PathBuf),
    S3 { bucket: String, prefix: String },
    Gcs { bucket: String, prefix: String },
}

impl DataFolder {
    /// 解析数据目录；相对路径基于当前工作目录转为绝对路径
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(StoreError::InvalidFolder(raw.to_string()));
        }

        if let Some(rest) = raw.strip_prefix("s3://") {
            let (bucket, prefix) = split_bucket(raw, rest)?;
            return Ok(Self::S3 { bucket, prefix });
        }
        if let Some(rest) = raw.strip_prefix("gs://").or_else(|| raw.strip_prefix("gcp://")) {
            let (bucket, prefix) = split_bucket(raw, rest)?;
            return Ok(Self::Gcs { bucket, prefix });
        }

        let raw = raw.strip_prefix("file://").unwrap_or(raw);
        if raw.is_empty() || raw.contains("://") {
            return Err(StoreError::InvalidFolder(raw.to_string()));
        }

        let path = PathBuf::from(raw);
        if path.is_absolute() {
            return Ok(Self::Local(path));
        }
        let cwd = std::env::current_dir()?;
        Ok(Self::Local(cwd.join(path)))
    }

    /// 构造对应的存储后端
    pub fn open(&self) -> Result<Arc<dyn StorageBackend>, StoreError> {
        match self {
            Self::Local(path) => Ok(Arc::new(LocalStorage::new(path.clone()))),
            #[cfg(feature = "s3")]
            Self::S3 { bucket, prefix } => Ok(Arc::new(s3::S3Storage::new(bucket, prefix))),
            #[cfg(not(feature = "s3"))]
            Self::S3 { bucket, prefix } => Err(StoreError::InvalidFolder(format!(
                "s3://{}/{} (s3 feature disabled)",
                bucket, prefix
            ))),
            #[cfg(feature = "gcs")]
            Self::Gcs { bucket, prefix } => Ok(Arc::new(gcs::GcsStorage::new(bucket, prefix)?)),
            #[cfg(not(feature = "gcs"))]
            Self::Gcs { bucket, prefix } => Err(StoreError::InvalidFolder(format!(
                "gs://{}/{} (gcs feature disabled)",
                bucket, prefix
            ))),
        }
    }
}

fn split_bucket(raw: &str, rest: &str) -> Result<(String, String), StoreError> {
    let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(StoreError::InvalidFolder(raw.to_string()));
    }
    Ok((bucket.to_string(), prefix.trim_matches('/').to_string()))
}

/// 事件存储与注册表存储的组合
pub struct DataStore {
    events: EventStore,
    registry: RegistryStore,
}

impl DataStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            events: EventStore::new(backend.clone()),
            registry: RegistryStore::new(backend),
        }
    }

    pub fn open(folder: &DataFolder) -> Result<Self, StoreError> {
        Ok(Self::new(folder.open()?))
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    pub fn registry(&self) -> &RegistryStore {
        &self.registry
    }

    /// 持久化一个 flush 周期的样本：先更新注册表，再整批写入事件分片
    pub async fn persist(&self, samples: &[CollectedSample]) -> Result<usize, StoreError> {
        if samples.is_empty() {
            return Ok(0);
        }
        let hits: Vec<_> = samples
            .iter()
            .map(|s| (s.location.clone(), s.tag.clone()))
            .collect();
        self.registry.update_many(&hits).await?;
        self.events.append(samples).await
    }
}
