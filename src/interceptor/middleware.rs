//! reqwest 中间件实现

use std::sync::Arc;

use http::Extensions;
use http_body_util::BodyDataStream;
use reqwest::{Request, Response, ResponseBuilderExt};
use reqwest_middleware::{Middleware, Next};

use crate::call_site::CallSite;
use crate::common::{MAX_BODY_BYTES, now_ms, truncate_with_marker};
use crate::exporter::Exporter;
use crate::model::sample::{CapturedCall, STREAM_SENTINEL};

use super::tee::{ResponseCapture, TeeStream};
use super::{HostAllowlist, Intercepted, Target, spawn_record, take_tag};

/// 捕获 LLM 调用的中间件
#[derive(Clone)]
pub struct TrainloopMiddleware {
    target: Target,
}

impl TrainloopMiddleware {
    /// 绑定到指定导出器
    pub fn new(exporter: Exporter, allowlist: HostAllowlist) -> Self {
        Self {
            target: Target::Fixed {
                exporter,
                allowlist: Arc::new(allowlist),
            },
        }
    }

    /// 使用进程级 Agent（`collect()` 之后生效）
    pub fn global() -> Self {
        Self {
            target: Target::Global,
        }
    }
}

#[async_trait::async_trait]
impl Middleware for TrainloopMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        if extensions.get::<Intercepted>().is_some() {
            return next.run(req, extensions).await;
        }
        extensions.insert(Intercepted);

        // 标签头无论是否捕获都不发送给上游
        let tag = take_tag(req.headers_mut());

        let Some((exporter, allowlist)) = self.target.resolve() else {
            return next.run(req, extensions).await;
        };
        if !allowlist.allows(req.url()) {
            tracing::trace!(url = %req.url(), "主机不在白名单内，跳过捕获");
            return next.run(req, extensions).await;
        }

        let call = CapturedCall {
            id: uuid::Uuid::new_v4().to_string(),
            request_body: capture_request_body(&req),
            response_body: Vec::new(),
            url: req.url().to_string(),
            start_ms: now_ms(),
            end_ms: 0,
            status: 0,
            tag,
            call_site: CallSite::capture(),
        };

        match next.run(req, extensions).await {
            Ok(response) => Ok(tee_response(response, call, exporter)),
            Err(err) => {
                let mut call = call;
                call.end_ms = now_ms();
                call.response_body = err.to_string().into_bytes();
                tracing::debug!(id = %call.id, url = %call.url, "请求失败: {}", err);
                spawn_record(exporter, call);
                Err(err)
            }
        }
    }
}

/// 读取请求体而不消费；流式请求体记录为占位符
fn capture_request_body(req: &Request) -> String {
    match req.body() {
        None => String::new(),
        Some(body) => match body.as_bytes() {
            Some(bytes) => truncate_with_marker(&String::from_utf8_lossy(bytes), MAX_BODY_BYTES),
            None => STREAM_SENTINEL.to_string(),
        },
    }
}

/// 包装响应体，状态码、头、扩展与 URL 保持不变
fn tee_response(response: Response, mut call: CapturedCall, exporter: Exporter) -> Response {
    call.status = response.status().as_u16();
    let capture = ResponseCapture::new(call, exporter);

    // http::Response 不携带 URL，转换回来前需要重新写入扩展
    let url = response.url().clone();
    let response: http::Response<reqwest::Body> = response.into();
    let (mut parts, body) = response.into_parts();
    let mut carrier = http::response::Builder::new().url(url);
    if let Some(extensions) = carrier.extensions_mut() {
        parts.extensions.extend(std::mem::take(extensions));
    }

    let body = reqwest::Body::wrap_stream(TeeStream::new(BodyDataStream::new(body), capture));
    Response::from(http::Response::from_parts(parts, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::ExporterOptions;
    use crate::store::{DataFolder, DataStore, EventStore, LocalStorage};
    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, header};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use futures::StreamExt;
    use parking_lot::Mutex;
    use std::time::Duration;

    type SeenTags = Arc<Mutex<Vec<Option<String>>>>;

    const CHAT_RESPONSE: &str = r#"{"choices":[{"message":{"role":"assistant","content":"hello"}}]}"#;

    async fn chat(State(seen): State<SeenTags>, headers: HeaderMap) -> impl IntoResponse {
        let tag = headers
            .get("x-trainloop-tag")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        seen.lock().push(tag);
        ([(header::CONTENT_TYPE, "application/json")], CHAT_RESPONSE)
    }

    async fn stream() -> impl IntoResponse {
        let mut body = String::new();
        for part in ["Hel", "lo", " world"] {
            body.push_str(&format!(
                "data: {{\"object\":\"chat.completion.chunk\",\"choices\":[{{\"delta\":{{\"content\":\"{}\"}}}}]}}\n\n",
                part
            ));
        }
        body.push_str("data: [DONE]\n\n");
        ([(header::CONTENT_TYPE, "text/event-stream")], body)
    }

    async fn mock_provider() -> (String, SeenTags) {
        let seen: SeenTags = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/v1/chat/completions", post(chat))
            .route("/v1/stream", get(stream))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), seen)
    }

    fn exporter(dir: &std::path::Path) -> Exporter {
        let store = DataStore::open(&DataFolder::Local(dir.to_path_buf())).unwrap();
        Exporter::new(
            store,
            ExporterOptions {
                flush_immediately: false,
                batch_size: 100,
                flush_interval: Duration::from_secs(3600),
                ..ExporterOptions::default()
            },
        )
    }

    fn client(exporter: &Exporter, hosts: &[&str]) -> reqwest_middleware::ClientWithMiddleware {
        reqwest_middleware::ClientBuilder::new(reqwest::Client::new())
            .with(TrainloopMiddleware::new(exporter.clone(), HostAllowlist::new(hosts)))
            .build()
    }

    async fn wait_recorded(exporter: &Exporter, n: u64) {
        for _ in 0..200 {
            if exporter.stats().recorded >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn samples(dir: &std::path::Path) -> Vec<crate::model::sample::CollectedSample> {
        let events = EventStore::new(Arc::new(LocalStorage::new(dir)));
        let mut out = Vec::new();
        for shard in events.shards().await.unwrap() {
            out.extend(events.read_shard(shard).await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_allowed_host_is_captured_and_tag_stripped() {
        let (base, seen) = mock_provider().await;
        let dir = tempfile::tempdir().unwrap();
        let exporter = exporter(dir.path());
        let client = client(&exporter, &["127.0.0.1"]);

        let response = client
            .post(format!("{}/v1/chat/completions", base))
            .headers(crate::trainloop_tag("greeting"))
            .body(r#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"hi"}],"temperature":0}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), CHAT_RESPONSE);

        wait_recorded(&exporter, 1).await;
        assert_eq!(seen.lock().as_slice(), &[None]);
        assert_eq!(exporter.flush().await, 1);

        let samples = samples(dir.path()).await;
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].tag, "greeting");
        assert_eq!(samples[0].model, "gpt-4o-mini");
        assert_eq!(samples[0].output.content, "hello");
        assert_eq!(samples[0].model_params["temperature"], 0);
    }

    #[tokio::test]
    async fn test_captured_response_keeps_url_and_headers() {
        let (base, _) = mock_provider().await;
        let dir = tempfile::tempdir().unwrap();
        let exporter = exporter(dir.path());
        let instrumented = client(&exporter, &["127.0.0.1"]);
        let url = format!("{}/v1/chat/completions", base);

        let plain = reqwest::Client::new().post(&url).body("{}").send().await.unwrap();
        let captured = instrumented.post(&url).body("{}").send().await.unwrap();
        assert_eq!(captured.url(), plain.url());
        assert_eq!(captured.url().path(), "/v1/chat/completions");
        assert_eq!(captured.status(), plain.status());
        assert_eq!(
            captured.headers().get(header::CONTENT_TYPE),
            plain.headers().get(header::CONTENT_TYPE)
        );

        // error_for_status 依赖响应 URL
        assert!(captured.error_for_status_ref().is_ok());
        assert_eq!(captured.text().await.unwrap(), CHAT_RESPONSE);
        wait_recorded(&exporter, 1).await;
        assert_eq!(exporter.stats().recorded, 1);
    }

    #[tokio::test]
    async fn test_disallowed_host_is_not_captured() {
        let (base, seen) = mock_provider().await;
        let dir = tempfile::tempdir().unwrap();
        let exporter = exporter(dir.path());
        let client = client(&exporter, &["api.openai.com"]);

        let body = client
            .post(format!("{}/v1/chat/completions", base))
            .headers(crate::trainloop_tag("ignored"))
            .body("{}")
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, CHAT_RESPONSE);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(exporter.stats().recorded, 0);
        // 即使不捕获，标签头也不会发送给上游
        assert_eq!(seen.lock().as_slice(), &[None]);
    }

    #[tokio::test]
    async fn test_streaming_response_is_reconstructed() {
        let (base, _) = mock_provider().await;
        let dir = tempfile::tempdir().unwrap();
        let exporter = exporter(dir.path());
        let client = client(&exporter, &["127.0.0.1"]);

        let response = client
            .get(format!("{}/v1/stream", base))
            .body(r#"{"model":"gpt-4o-mini","stream":true,"messages":[{"role":"user","content":"hi"}]}"#)
            .send()
            .await
            .unwrap();
        let mut stream = response.bytes_stream();
        let mut raw = Vec::new();
        while let Some(chunk) = stream.next().await {
            raw.extend_from_slice(&chunk.unwrap());
        }
        assert!(String::from_utf8(raw).unwrap().ends_with("data: [DONE]\n\n"));

        wait_recorded(&exporter, 1).await;
        exporter.flush().await;
        let samples = samples(dir.path()).await;
        assert_eq!(samples[0].output.content, "Hello world");
        assert_eq!(samples[0].model_params["stream"], true);
    }

    #[tokio::test]
    async fn test_double_installation_captures_once() {
        let (base, _) = mock_provider().await;
        let dir = tempfile::tempdir().unwrap();
        let exporter = exporter(dir.path());
        let allowlist = HostAllowlist::new(["127.0.0.1"]);
        let client = reqwest_middleware::ClientBuilder::new(reqwest::Client::new())
            .with(TrainloopMiddleware::new(exporter.clone(), allowlist.clone()))
            .with(TrainloopMiddleware::new(exporter.clone(), allowlist))
            .build();

        client
            .post(format!("{}/v1/chat/completions", base))
            .body("{}")
            .send()
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();

        wait_recorded(&exporter, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(exporter.stats().recorded, 1);
    }

    #[tokio::test]
    async fn test_transport_error_is_returned_and_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = exporter(dir.path());
        let client = client(&exporter, &["127.0.0.1"]);

        // 绑定后立即释放，得到一个无人监听的端口
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = client
            .post(format!("http://127.0.0.1:{}/v1/chat/completions", port))
            .body(r#"{"model":"m","messages":[]}"#)
            .send()
            .await;
        assert!(result.is_err());

        wait_recorded(&exporter, 1).await;
        assert_eq!(exporter.stats().recorded, 1);
        assert_eq!(exporter.flush().await, 0);
        assert_eq!(exporter.stats().dropped_unparsable, 1);
    }

    #[tokio::test]
    async fn test_dropped_response_still_captured() {
        let (base, _) = mock_provider().await;
        let dir = tempfile::tempdir().unwrap();
        let exporter = exporter(dir.path());
        let client = client(&exporter, &["127.0.0.1"]);

        let response = client
            .post(format!("{}/v1/chat/completions", base))
            .body("{}")
            .send()
            .await
            .unwrap();
        drop(response);

        wait_recorded(&exporter, 1).await;
        assert_eq!(exporter.stats().recorded, 1);
    }

    #[test]
    fn test_stream_request_body_uses_sentinel() {
        let mut req = Request::new(
            reqwest::Method::POST,
            reqwest::Url::parse("https://api.openai.com/v1/chat/completions").unwrap(),
        );
        assert_eq!(capture_request_body(&req), "");

        let chunks: Vec<Result<bytes::Bytes, std::io::Error>> = vec![Ok(bytes::Bytes::from_static(b"{}"))];
        *req.body_mut() = Some(reqwest::Body::wrap_stream(futures::stream::iter(chunks)));
        assert_eq!(capture_request_body(&req), STREAM_SENTINEL);

        *req.body_mut() = Some(reqwest::Body::from("{\"a\":1}"));
        assert_eq!(capture_request_body(&req), "{\"a\":1}");
    }
}
