//! Google Cloud Storage 对象存储
//!
//! 通过 JSON API 读写 `{prefix}/{key}` 对象。GCS 不支持追加，append 采用读取-拼接-覆盖写入。
//! 凭证来自 gcp_auth 的默认链；设置了 `STORAGE_EMULATOR_HOST` 时改为匿名访问该端点。
//!
//! 仅在启用 `gcs` feature 时可用。

use std::sync::Arc;

use async_trait::async_trait;
use gcp_auth::TokenProvider;
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use tokio::sync::OnceCell;

use super::backend::StorageBackend;
use super::error::StoreError;

pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

/// 本地模拟器地址（与官方客户端库一致）
pub const ENV_EMULATOR_HOST: &str = "STORAGE_EMULATOR_HOST";

const SCOPES: &[&str] = &["https://www.googleapis.com/auth/devstorage.read_write"];

enum Auth {
    /// 首次请求时按默认凭证链初始化
    Default(OnceCell<Arc<dyn TokenProvider>>),
    Anonymous,
}

pub struct GcsStorage {
    bucket: String,
    prefix: String,
    endpoint: Url,
    http: reqwest::Client,
    auth: Auth,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<ObjectItem>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectItem {
    name: String,
}

impl GcsStorage {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Result<Self, StoreError> {
        match std::env::var(ENV_EMULATOR_HOST)
            .ok()
            .filter(|host| !host.trim().is_empty())
        {
            Some(host) => Self::anonymous(bucket, prefix, &host),
            None => Self::build(bucket, prefix, DEFAULT_ENDPOINT, Auth::Default(OnceCell::new())),
        }
    }

    /// 不带凭证访问指定端点（模拟器或测试）
    pub fn anonymous(
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        endpoint: &str,
    ) -> Result<Self, StoreError> {
        Self::build(bucket, prefix, endpoint, Auth::Anonymous)
    }

    fn build(
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        endpoint: &str,
        auth: Auth,
    ) -> Result<Self, StoreError> {
        let endpoint = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("http://{}", endpoint)
        };
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| StoreError::InvalidFolder(format!("GCS endpoint {}: {}", endpoint, e)))?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| StoreError::Backend(format!("GCS HTTP client error: {}", e)))?;

        Ok(Self {
            bucket: bucket.into(),
            prefix: prefix.into().trim_matches('/').to_string(),
            endpoint,
            http,
            auth,
        })
    }

    fn object_name(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    fn relative_key<'a>(&self, object_name: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            return object_name;
        }
        object_name
            .strip_prefix(self.prefix.as_str())
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(object_name)
    }

    /// `{endpoint}[/upload]/storage/v1/b/{bucket}/o[/{object}]`，对象名整体作为一个路径段编码
    fn api_url(&self, upload: bool, object: Option<&str>) -> Result<Url, StoreError> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| StoreError::InvalidFolder(format!("GCS endpoint {}", self.endpoint)))?;
            segments.pop_if_empty();
            if upload {
                segments.push("upload");
            }
            segments.extend(["storage", "v1", "b", self.bucket.as_str(), "o"]);
            if let Some(object) = object {
                segments.push(object);
            }
        }
        Ok(url)
    }

    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, StoreError> {
        let provider = match &self.auth {
            Auth::Anonymous => return Ok(request),
            Auth::Default(provider) => provider
                .get_or_try_init(|| async {
                    let provider = gcp_auth::provider().await?;
                    tracing::debug!(bucket = %self.bucket, prefix = %self.prefix, "GCS 凭证已初始化");
                    Ok::<_, gcp_auth::Error>(provider)
                })
                .await
                .map_err(|e| StoreError::Backend(format!("GCS credentials error: {}", e)))?,
        };
        let token = provider
            .token(SCOPES)
            .await
            .map_err(|e| StoreError::Backend(format!("GCS token error: {}", e)))?;
        Ok(request.bearer_auth(token.as_str()))
    }

    async fn send(&self, request: RequestBuilder, op: &str) -> Result<reqwest::Response, StoreError> {
        self.authorize(request)
            .await?
            .send()
            .await
            .map_err(|e| StoreError::Backend(format!("GCS {} error: {}", op, e)))
    }
}

async fn status_error(response: reqwest::Response, op: &str) -> StoreError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    StoreError::Backend(format!("GCS {} error: {} {}", op, status, body.trim()))
}

#[async_trait]
impl StorageBackend for GcsStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut url = self.api_url(false, Some(&self.object_name(key)))?;
        url.query_pairs_mut().append_pair("alt", "media");

        let response = self.send(self.http.get(url), "get").await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let data = response
                    .bytes()
                    .await
                    .map_err(|e| StoreError::Backend(format!("GCS body read error: {}", e)))?;
                Ok(Some(data.to_vec()))
            }
            _ => Err(status_error(response, "get").await),
        }
    }

    async fn write(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let name = self.object_name(key);
        let mut url = self.api_url(true, None)?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", &name);

        let request = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data.to_vec());
        let response = self.send(request, "upload").await?;
        if !response.status().is_success() {
            return Err(status_error(response, "upload").await);
        }

        tracing::debug!(key = %name, size = data.len(), "对象已写入 GCS");
        Ok(())
    }

    async fn append(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let mut existing = self.read(key).await?.unwrap_or_default();
        existing.extend_from_slice(data);
        self.write(key, &existing).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let list_prefix = self.object_name(prefix);
        let mut keys = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.api_url(false, None)?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("prefix", &list_prefix);
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }

            let response = self.send(self.http.get(url), "list").await?;
            if !response.status().is_success() {
                return Err(status_error(response, "list").await);
            }
            let page: ListResponse = response
                .json()
                .await
                .map_err(|e| StoreError::Backend(format!("GCS list decode error: {}", e)))?;

            keys.extend(
                page.items
                    .iter()
                    .map(|item| self.relative_key(&item.name).to_string()),
            );

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn describe(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DataStore, RegistryStore};
    use axum::Router;
    use axum::body::Bytes;
    use axum::extract::{Path, Query, State};
    use axum::http::HeaderMap;
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockGcs {
        objects: Mutex<BTreeMap<String, Vec<u8>>>,
        list_calls: AtomicUsize,
        authorized: Mutex<Vec<bool>>,
    }

    type Shared = Arc<MockGcs>;

    fn note_auth(mock: &MockGcs, headers: &HeaderMap) {
        mock.authorized
            .lock()
            .push(headers.contains_key(axum::http::header::AUTHORIZATION));
    }

    async fn get_object(
        State(mock): State<Shared>,
        Path((_bucket, object)): Path<(String, String)>,
        Query(params): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> Response {
        note_auth(&mock, &headers);
        assert_eq!(params.get("alt").map(String::as_str), Some("media"));
        match mock.objects.lock().get(&object) {
            Some(data) => data.clone().into_response(),
            None => (axum::http::StatusCode::NOT_FOUND, "No such object").into_response(),
        }
    }

    async fn upload(
        State(mock): State<Shared>,
        Query(params): Query<HashMap<String, String>>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response {
        note_auth(&mock, &headers);
        assert_eq!(params.get("uploadType").map(String::as_str), Some("media"));
        let name = params.get("name").cloned().unwrap_or_default();
        mock.objects.lock().insert(name.clone(), body.to_vec());
        axum::Json(serde_json::json!({ "name": name })).into_response()
    }

    /// 每页一个对象，覆盖分页
    async fn list_objects(
        State(mock): State<Shared>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Response {
        mock.list_calls.fetch_add(1, Ordering::SeqCst);
        let prefix = params.get("prefix").cloned().unwrap_or_default();
        let start: usize = params
            .get("pageToken")
            .and_then(|t| t.parse().ok())
            .unwrap_or(0);
        let names: Vec<String> = mock
            .objects
            .lock()
            .keys()
            .filter(|name| name.starts_with(&prefix))
            .cloned()
            .collect();

        let mut page = serde_json::json!({ "kind": "storage#objects" });
        if let Some(name) = names.get(start) {
            page["items"] = serde_json::json!([{ "name": name }]);
        }
        if start + 1 < names.len() {
            page["nextPageToken"] = serde_json::json!((start + 1).to_string());
        }
        axum::Json(page).into_response()
    }

    async fn mock_gcs() -> (String, Shared) {
        let mock: Shared = Arc::new(MockGcs::default());
        let app = Router::new()
            .route("/storage/v1/b/{bucket}/o", get(list_objects))
            .route("/storage/v1/b/{bucket}/o/{object}", get(get_object))
            .route("/upload/storage/v1/b/{bucket}/o", post(upload))
            .with_state(mock.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), mock)
    }

    #[test]
    fn test_object_urls() {
        let storage = GcsStorage::anonymous("bucket", "/runs/a/", "http://127.0.0.1:9000").unwrap();
        assert_eq!(storage.object_name("events/1.jsonl"), "runs/a/events/1.jsonl");
        assert_eq!(storage.relative_key("runs/a/events/1.jsonl"), "events/1.jsonl");
        assert_eq!(
            storage
                .api_url(false, Some("runs/a/events/1.jsonl"))
                .unwrap()
                .as_str(),
            "http://127.0.0.1:9000/storage/v1/b/bucket/o/runs%2Fa%2Fevents%2F1.jsonl"
        );
        assert_eq!(
            storage.api_url(true, None).unwrap().as_str(),
            "http://127.0.0.1:9000/upload/storage/v1/b/bucket/o"
        );
        assert_eq!(storage.describe(), "gs://bucket/runs/a");

        let bare = GcsStorage::anonymous("bucket", "", "localhost:4443").unwrap();
        assert_eq!(bare.endpoint.as_str(), "http://localhost:4443/");
    }

    #[tokio::test]
    async fn test_read_append_list_against_mock() {
        let (endpoint, mock) = mock_gcs().await;
        let storage = GcsStorage::anonymous("bucket", "runs", &endpoint).unwrap();

        assert!(storage.read("events/1.jsonl").await.unwrap().is_none());

        storage.append("events/1.jsonl", b"a\n").await.unwrap();
        storage.append("events/1.jsonl", b"b\n").await.unwrap();
        storage.append("events/2.jsonl", b"c\n").await.unwrap();
        storage.write("_registry.json", b"{}").await.unwrap();

        assert_eq!(
            storage.read("events/1.jsonl").await.unwrap().unwrap(),
            b"a\nb\n"
        );
        assert_eq!(
            mock.objects.lock().get("runs/events/1.jsonl").cloned(),
            Some(b"a\nb\n".to_vec())
        );

        assert_eq!(
            storage.list("events").await.unwrap(),
            vec!["events/1.jsonl".to_string(), "events/2.jsonl".to_string()]
        );
        assert_eq!(mock.list_calls.load(Ordering::SeqCst), 2);
        assert!(mock.authorized.lock().iter().all(|sent| !sent));
    }

    #[tokio::test]
    async fn test_event_and_registry_stores_over_gcs() {
        let (endpoint, mock) = mock_gcs().await;
        let backend: Arc<dyn StorageBackend> =
            Arc::new(GcsStorage::anonymous("bucket", "runs", &endpoint).unwrap());
        let store = DataStore::new(backend.clone());

        let samples = crate::store::tests::samples(&["first", "second"]);
        assert_eq!(store.persist(&samples).await.unwrap(), 2);

        let shards = store.events().shards().await.unwrap();
        assert_eq!(shards.len(), 1);
        let written = store.events().read_shard(shards[0]).await.unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written[1].tag, "second");

        let registry = RegistryStore::new(backend).load().await.unwrap();
        let entry = registry.entry("/srv/app/main.rs", "7").unwrap();
        assert_eq!(entry.count, 2);
        assert_eq!(entry.tag, "second");
        assert!(mock.objects.lock().contains_key("runs/_registry.json"));
    }
}
