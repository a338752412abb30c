//! TrainLoop LLM 调用采集
//!
//! 在宿主进程内观察发往 LLM 服务商的出站 HTTP 调用，重组请求/响应（含流式响应），
//! 并以追加写入的分片文件持久化，供离线评估使用。
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! trainloop_llm_logging::collect(None);
//!
//! let client = trainloop_llm_logging::instrument(reqwest::Client::new());
//! let response = client
//!     .post("https://api.openai.com/v1/chat/completions")
//!     .headers(trainloop_llm_logging::trainloop_tag("checkout"))
//!     .body(r#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"hi"}]}"#)
//!     .send()
//!     .await?;
//! let _ = response.text().await?;
//!
//! trainloop_llm_logging::shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod call_site;
pub mod common;
pub mod exporter;
pub mod interceptor;
pub mod logging;
pub mod model;
pub mod normalize;
pub mod store;

use std::path::Path;
use std::sync::{Arc, OnceLock};

use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};

pub use call_site::locate;
pub use exporter::{Exporter, ExporterOptions, ExporterState, ExporterStats};
pub use interceptor::{HEADER_NAME, HostAllowlist, TrainloopMiddleware, trainloop_tag};
pub use model::config::{Config, LogLevel};
pub use model::sample::{CallLocation, CollectedSample};

use store::{DataFolder, DataStore};

/// 进程级 Agent
struct Agent {
    exporter: Exporter,
    allowlist: Arc<HostAllowlist>,
}

/// None 表示已初始化但处于禁用状态
static AGENT: OnceLock<Option<Agent>> = OnceLock::new();

/// `fetch` 使用的共享客户端
static FETCH_CLIENT: OnceLock<ClientWithMiddleware> = OnceLock::new();

impl Agent {
    fn start(config_path: Option<&Path>) -> Option<Self> {
        let config = Config::resolve(config_path);
        logging::init_from_config(&config);
        for warning in config.warnings() {
            tracing::warn!("{}", warning);
        }
        model::config::publish(&config);

        let Some(raw_folder) = config.data_folder.as_deref() else {
            tracing::warn!(
                "未配置数据目录（{} 或 trainloop.config.yaml），采集已禁用",
                model::config::ENV_DATA_FOLDER
            );
            return None;
        };

        let store = match DataFolder::parse(raw_folder).and_then(|folder| DataStore::open(&folder)) {
            Ok(store) => store,
            Err(e) => {
                tracing::warn!("数据目录不可用，采集已禁用: {}", e);
                return None;
            }
        };

        let exporter = Exporter::new(store, ExporterOptions::from_config(&config));
        let allowlist = Arc::new(HostAllowlist::new(&config.host_allowlist));

        tracing::info!(
            data_folder = %raw_folder,
            hosts = ?allowlist.hosts(),
            flush_immediately = config.flush_immediately,
            "TrainLoop 采集已启用"
        );
        Some(Self {
            exporter,
            allowlist,
        })
    }
}

/// 初始化采集（幂等），返回是否启用
///
/// 只有第一次调用会解析配置；之后的调用直接返回首次的结果。
/// 不会安装全局日志订阅器，除非显式设置了 `TRAINLOOP_LOG_LEVEL`（见 [`logging`]）
pub fn collect(config_path: Option<&Path>) -> bool {
    AGENT
        .get_or_init(|| Agent::start(config_path))
        .is_some()
}

/// 最近一次 `collect()` 解析出的配置
pub fn config() -> Option<Config> {
    model::config::current()
}

/// 是否已初始化且处于启用状态
pub fn is_enabled() -> bool {
    matches!(AGENT.get(), Some(Some(_)))
}

pub(crate) fn active_target() -> Option<(Exporter, Arc<HostAllowlist>)> {
    let agent = AGENT.get()?.as_ref()?;
    Some((agent.exporter.clone(), agent.allowlist.clone()))
}

/// 为客户端挂载采集中间件
///
/// 未启用时中间件直接放行
pub fn instrument(client: reqwest::Client) -> ClientWithMiddleware {
    with_interceptor(ClientBuilder::new(client)).build()
}

/// 在已有中间件链上追加采集中间件
pub fn with_interceptor(builder: ClientBuilder) -> ClientBuilder {
    builder.with(TrainloopMiddleware::global())
}

/// 通过共享的插桩客户端执行请求
pub async fn fetch(request: reqwest::Request) -> reqwest_middleware::Result<reqwest::Response> {
    let client = FETCH_CLIENT.get_or_init(|| instrument(reqwest::Client::new()));
    client.execute(request).await
}

/// 立即导出缓冲区，返回写入的样本数；未启用时返回 0
pub async fn flush() -> usize {
    match AGENT.get() {
        Some(Some(agent)) => agent.exporter.flush().await,
        _ => 0,
    }
}

/// 最终导出并关闭，进程退出前应等待其完成
pub async fn shutdown() {
    if let Some(Some(agent)) = AGENT.get() {
        agent.exporter.shutdown().await;
    }
}

/// 导出器计数快照（未启用时为 None）
pub fn exporter_stats() -> Option<ExporterStats> {
    match AGENT.get() {
        Some(Some(agent)) => Some(agent.exporter.stats()),
        _ => None,
    }
}
