//! S3 对象存储
//!
//! 键结构：`{prefix}/{key}`。S3 不支持追加，append 采用读取-拼接-覆盖写入。
//!
//! 仅在启用 `s3` feature 时可用。

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use tokio::sync::OnceCell;

use super::backend::StorageBackend;
use super::error::StoreError;

/// S3 存储（客户端在首次使用时按默认凭证链初始化）
#[derive(Debug)]
pub struct S3Storage {
    bucket: String,
    prefix: String,
    client: OnceCell<Client>,
}

impl S3Storage {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into().trim_matches('/').to_string(),
            client: OnceCell::new(),
        }
    }

    /// 使用已构建的客户端（测试或自定义 endpoint）
    pub fn with_client(bucket: impl Into<String>, prefix: impl Into<String>, client: Client) -> Self {
        let storage = Self::new(bucket, prefix);
        let _ = storage.client.set(client);
        storage
    }

    async fn client(&self) -> &Client {
        self.client
            .get_or_init(|| async {
                let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .load()
                    .await;
                tracing::debug!(bucket = %self.bucket, prefix = %self.prefix, "S3 客户端已初始化");
                Client::new(&config)
            })
            .await
    }

    fn object_key(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    fn relative_key<'a>(&self, object_key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            return object_key;
        }
        object_key
            .strip_prefix(self.prefix.as_str())
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(object_key)
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let object_key = self.object_key(key);
        let response = match self
            .client()
            .await
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    return Ok(None);
                }
                return Err(StoreError::Backend(format!(
                    "S3 get_object error: {}",
                    service_err
                )));
            }
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Backend(format!("S3 body read error: {}", e)))?
            .into_bytes()
            .to_vec();
        Ok(Some(data))
    }

    async fn write(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let object_key = self.object_key(key);
        self.client()
            .await
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| StoreError::Backend(format!("S3 put_object error: {}", e)))?;

        tracing::debug!(key = %object_key, size = data.len(), "对象已写入 S3");
        Ok(())
    }

    async fn append(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let mut existing = self.read(key).await?.unwrap_or_default();
        existing.extend_from_slice(data);
        self.write(key, &existing).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let list_prefix = self.object_key(prefix);
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client()
                .await
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&list_prefix);

            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| StoreError::Backend(format!("S3 list_objects_v2 error: {}", e)))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key())
                    .map(|k| self.relative_key(k).to_string()),
            );

            if response.is_truncated() == Some(true) {
                continuation_token = response.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }
}
