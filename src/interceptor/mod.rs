//! HTTP 拦截器
//!
//! 以 reqwest 中间件的形式观察所有出站调用：剥离标签头、记录调用点与请求体，
//! 真实请求原样放行，响应体旁路复制后异步交给导出器。

pub mod host;
pub mod middleware;
pub mod tee;

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::exporter::Exporter;
use crate::model::sample::CapturedCall;

pub use host::HostAllowlist;
pub use middleware::TrainloopMiddleware;

/// 标签请求头名称
pub const HEADER_NAME: &str = "X-Trainloop-Tag";

/// 小写形式，供 `HeaderName::from_static` 使用
const HEADER_NAME_LOWER: &str = "x-trainloop-tag";

/// 已被拦截的请求标记，用于避免重复捕获
#[derive(Debug, Clone, Copy)]
pub struct Intercepted;

/// 中间件的导出目标
#[derive(Clone)]
pub enum Target {
    /// 绑定到指定导出器与白名单
    Fixed {
        exporter: Exporter,
        allowlist: Arc<HostAllowlist>,
    },
    /// 每次请求时查找进程级 Agent（未启用时放行）
    Global,
}

impl Target {
    pub fn resolve(&self) -> Option<(Exporter, Arc<HostAllowlist>)> {
        match self {
            Self::Fixed {
                exporter,
                allowlist,
            } => Some((exporter.clone(), allowlist.clone())),
            Self::Global => crate::active_target(),
        }
    }
}

/// 生成携带标签的请求头
pub fn trainloop_tag(tag: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    match HeaderValue::from_str(tag) {
        Ok(value) => {
            headers.insert(tag_header(), value);
        }
        Err(e) => tracing::warn!("无效的标签值 '{}': {}", tag, e),
    }
    headers
}

pub fn tag_header() -> HeaderName {
    HeaderName::from_static(HEADER_NAME_LOWER)
}

/// 取出并删除标签头
pub fn take_tag(headers: &mut HeaderMap) -> Option<String> {
    let value = headers.remove(tag_header())?;
    match value.to_str() {
        Ok(tag) => Some(tag.to_string()),
        Err(_) => Some(String::from_utf8_lossy(value.as_bytes()).into_owned()),
    }
}

/// 异步提交捕获记录，调用方不等待
pub(crate) fn spawn_record(exporter: Exporter, call: CapturedCall) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                exporter.record(call).await;
            });
        }
        Err(_) => {
            tracing::debug!(id = %call.id, "没有可用的 tokio 运行时，丢弃捕获记录");
        }
    }
}
