//! 事件分片存储（`events/<unix_ms>.jsonl`）

use std::sync::Arc;

use crate::common::now_ms;
use crate::model::sample::CollectedSample;

use super::backend::StorageBackend;
use super::error::StoreError;

/// 分片目录
pub const EVENTS_PREFIX: &str = "events";

/// 最近分片在该窗口内时继续追加，否则新建分片
pub const SHARD_WINDOW_MS: i64 = 10 * 60 * 1000;

pub struct EventStore {
    backend: Arc<dyn StorageBackend>,
}

impl EventStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// 追加一批样本，返回写入条数
    ///
    /// 空批次不产生任何 I/O
    pub async fn append(&self, samples: &[CollectedSample]) -> Result<usize, StoreError> {
        self.append_at(samples, now_ms()).await
    }

    pub async fn append_at(
        &self,
        samples: &[CollectedSample],
        now: i64,
    ) -> Result<usize, StoreError> {
        if samples.is_empty() {
            return Ok(0);
        }

        let shard = self.select_shard(now).await?;
        let key = shard_key(shard);

        let mut buf = Vec::with_capacity(samples.len() * 512);
        for sample in samples {
            serde_json::to_writer(&mut buf, sample)?;
            buf.push(b'\n');
        }
        self.backend.append(&key, &buf).await?;

        tracing::debug!(
            shard = %key,
            count = samples.len(),
            backend = %self.backend.describe(),
            "样本已写入分片"
        );
        Ok(samples.len())
    }

    /// 选择目标分片时间戳
    async fn select_shard(&self, now: i64) -> Result<i64, StoreError> {
        let latest = self.shards().await?.into_iter().max();
        match latest {
            Some(ts) if now - ts < SHARD_WINDOW_MS => Ok(ts),
            _ => Ok(now),
        }
    }

    /// 已存在的分片时间戳（升序）
    pub async fn shards(&self) -> Result<Vec<i64>, StoreError> {
        let mut shards: Vec<i64> = self
            .backend
            .list(EVENTS_PREFIX)
            .await?
            .iter()
            .filter_map(|key| parse_shard_key(key))
            .collect();
        shards.sort_unstable();
        Ok(shards)
    }

    /// 读取一个分片中的样本，跳过无法解析的行
    pub async fn read_shard(&self, shard: i64) -> Result<Vec<CollectedSample>, StoreError> {
        let Some(data) = self.backend.read(&shard_key(shard)).await? else {
            return Ok(Vec::new());
        };
        let text = String::from_utf8_lossy(&data);
        let mut samples = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<CollectedSample>(line) {
                Ok(sample) => samples.push(sample),
                Err(e) => tracing::warn!(shard, "跳过损坏的样本行: {}", e),
            }
        }
        Ok(samples)
    }
}

pub fn shard_key(shard: i64) -> String {
    format!("{}/{}.jsonl", EVENTS_PREFIX, shard)
}

fn parse_shard_key(key: &str) -> Option<i64> {
    let name = key.rsplit('/').next()?;
    name.strip_suffix(".jsonl")?.parse().ok()
}
