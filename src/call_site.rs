//! 调用点定位
//!
//! 拦截时只采集未解析的栈帧地址（开销很小），符号解析推迟到 flush 时进行。

use std::path::Path;

use backtrace::{Backtrace, BacktraceFrame};

use crate::model::sample::CallLocation;

/// 本 crate 的源码目录
const CRATE_SRC_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/src/");

/// 本 crate 的符号前缀
const CRATE_SYMBOL_PREFIX: &str = "trainloop_llm_logging::";

/// 标准库与工具链源码路径特征
const STD_PATH_MARKERS: &[&str] = &[
    "/rustc/",
    "/library/std/",
    "/library/core/",
    "/library/alloc/",
    "/.rustup/toolchains/",
];

/// 第三方依赖源码路径特征
const DEPENDENCY_PATH_MARKERS: &[&str] = &["/.cargo/registry/", "/.cargo/git/"];

/// 调用点：拦截时采集，导出时解析
#[derive(Debug, Clone)]
pub enum CallSite {
    Pending(Backtrace),
    Resolved(CallLocation),
}

impl CallSite {
    /// 在当前线程采集未解析的调用栈
    pub fn capture() -> Self {
        Self::Pending(Backtrace::new_unresolved())
    }

    /// 解析为调用点位置
    pub fn resolve(self) -> CallLocation {
        match self {
            Self::Resolved(location) => location.sanitized(),
            Self::Pending(mut backtrace) => {
                backtrace.resolve();
                first_application_frame(backtrace.frames()).unwrap_or_else(CallLocation::unknown)
            }
        }
    }
}

/// 立即定位当前调用点
pub fn locate() -> CallLocation {
    CallSite::capture().resolve()
}

fn first_application_frame(frames: &[BacktraceFrame]) -> Option<CallLocation> {
    for frame in frames {
        for symbol in frame.symbols() {
            let Some(file) = symbol.filename() else {
                continue;
            };
            let Some(line) = symbol.lineno() else {
                continue;
            };
            let name = symbol.name().map(|n| n.to_string());
            if is_internal_frame(file, name.as_deref()) {
                continue;
            }
            return Some(CallLocation::new(file.to_string_lossy(), line));
        }
    }
    None
}

/// 是否属于标准库、依赖或本 crate 内部的帧
fn is_internal_frame(file: &Path, symbol: Option<&str>) -> bool {
    let mut path = file.to_string_lossy().replace('\\', "/");
    if !path.starts_with('/') {
        path.insert(0, '/');
    }

    if STD_PATH_MARKERS.iter().any(|m| path.contains(m)) {
        return true;
    }
    if DEPENDENCY_PATH_MARKERS.iter().any(|m| path.contains(m)) {
        return true;
    }
    if path.starts_with(CRATE_SRC_DIR) {
        return true;
    }
    symbol.is_some_and(|name| name.trim_start_matches('<').starts_with(CRATE_SYMBOL_PREFIX))
}
