//! 缓冲导出器
//!
//! 拦截器产生的捕获记录先进入内存缓冲区，按以下时机落盘：
//! - 缓冲区达到批量阈值，或启用了立即刷新
//! - 后台定时器周期触发
//! - 显式调用 `flush()` / `shutdown()`

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::model::config::Config;
use crate::model::sample::{CapturedCall, CollectedSample};
use crate::normalize;
use crate::store::DataStore;

/// 默认批量阈值
pub const DEFAULT_BATCH_SIZE: usize = 5;
/// 默认定时刷新间隔
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
/// 缓冲区上限，超出时丢弃最旧的记录
pub const DEFAULT_MAX_BUFFER: usize = 10_000;

#[derive(Debug, Clone)]
pub struct ExporterOptions {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_buffer: usize,
    pub flush_immediately: bool,
}

impl Default for ExporterOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_buffer: DEFAULT_MAX_BUFFER,
            flush_immediately: true,
        }
    }
}

impl ExporterOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            flush_immediately: config.flush_immediately,
            ..Self::default()
        }
    }
}

/// 导出器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterState {
    Idle,
    Accumulating,
    Flushing,
    ShutDown,
}

/// 导出器计数快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExporterStats {
    pub recorded: u64,
    pub dropped_overflow: u64,
    pub dropped_unparsable: u64,
    pub samples_written: u64,
    pub flush_cycles: u64,
    pub size_triggered_flushes: u64,
    pub failed_flushes: u64,
}

#[derive(Default)]
struct Counters {
    recorded: AtomicU64,
    dropped_overflow: AtomicU64,
    dropped_unparsable: AtomicU64,
    samples_written: AtomicU64,
    flush_cycles: AtomicU64,
    size_triggered_flushes: AtomicU64,
    failed_flushes: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTrigger {
    Size,
    Immediate,
    Timer,
    Explicit,
    Shutdown,
}

struct Inner {
    options: ExporterOptions,
    store: DataStore,
    buffer: Mutex<VecDeque<CapturedCall>>,
    /// 串行化导出，避免同进程内读-改-写交错
    io_lock: tokio::sync::Mutex<()>,
    flushing: AtomicBool,
    shut_down: AtomicBool,
    timer_started: AtomicBool,
    shutdown_notify: Arc<Notify>,
    counters: Counters,
}

/// 缓冲导出器（可廉价克隆，共享同一缓冲区）
#[derive(Clone)]
pub struct Exporter {
    inner: Arc<Inner>,
}

impl Exporter {
    /// 创建导出器；存在 tokio 运行时则立即启动定时器，否则在首次记录时启动
    pub fn new(store: DataStore, options: ExporterOptions) -> Self {
        let exporter = Self {
            inner: Arc::new(Inner {
                options,
                store,
                buffer: Mutex::new(VecDeque::new()),
                io_lock: tokio::sync::Mutex::new(()),
                flushing: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                timer_started: AtomicBool::new(false),
                shutdown_notify: Arc::new(Notify::new()),
                counters: Counters::default(),
            }),
        };
        exporter.ensure_timer();
        exporter
    }

    /// 记录一次捕获；关闭后为空操作
    pub async fn record(&self, call: CapturedCall) {
        if self.inner.shut_down.load(Ordering::Acquire) {
            tracing::debug!(id = %call.id, "导出器已关闭，忽略记录");
            return;
        }
        self.ensure_timer();

        let trigger = {
            let mut buffer = self.inner.buffer.lock();
            // 持锁复查，与 shutdown 的最后一次取走互斥
            if self.inner.shut_down.load(Ordering::Acquire) {
                tracing::debug!(id = %call.id, "导出器已关闭，忽略记录");
                return;
            }
            if buffer.len() >= self.inner.options.max_buffer {
                buffer.pop_front();
                self.inner
                    .counters
                    .dropped_overflow
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    max_buffer = self.inner.options.max_buffer,
                    "捕获缓冲区已满，丢弃最旧的记录"
                );
            }
            tracing::debug!(id = %call.id, url = %call.url, status = call.status, "已记录捕获");
            buffer.push_back(call);
            self.inner.counters.recorded.fetch_add(1, Ordering::Relaxed);

            if self.inner.options.flush_immediately {
                Some(FlushTrigger::Immediate)
            } else if buffer.len() >= self.inner.options.batch_size {
                Some(FlushTrigger::Size)
            } else {
                None
            }
        };

        if let Some(trigger) = trigger {
            if trigger == FlushTrigger::Size {
                self.inner
                    .counters
                    .size_triggered_flushes
                    .fetch_add(1, Ordering::Relaxed);
            }
            self.flush_with(trigger).await;
        }
    }

    /// 立即导出缓冲区内容，返回写入的样本数
    pub async fn flush(&self) -> usize {
        self.flush_with(FlushTrigger::Explicit).await
    }

    /// 执行最后一次导出并进入关闭状态
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown_notify.notify_one();
        let written = self.flush_with(FlushTrigger::Shutdown).await;
        tracing::debug!(written, "导出器已关闭");
    }

    pub fn state(&self) -> ExporterState {
        if self.inner.shut_down.load(Ordering::Acquire) {
            ExporterState::ShutDown
        } else if self.inner.flushing.load(Ordering::Acquire) {
            ExporterState::Flushing
        } else if self.inner.buffer.lock().is_empty() {
            ExporterState::Idle
        } else {
            ExporterState::Accumulating
        }
    }

    pub fn stats(&self) -> ExporterStats {
        let c = &self.inner.counters;
        ExporterStats {
            recorded: c.recorded.load(Ordering::Relaxed),
            dropped_overflow: c.dropped_overflow.load(Ordering::Relaxed),
            dropped_unparsable: c.dropped_unparsable.load(Ordering::Relaxed),
            samples_written: c.samples_written.load(Ordering::Relaxed),
            flush_cycles: c.flush_cycles.load(Ordering::Relaxed),
            size_triggered_flushes: c.size_triggered_flushes.load(Ordering::Relaxed),
            failed_flushes: c.failed_flushes.load(Ordering::Relaxed),
        }
    }

    pub fn buffered(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    async fn flush_with(&self, trigger: FlushTrigger) -> usize {
        let _io = self.inner.io_lock.lock().await;

        // 在任何 I/O 之前取走并清空缓冲区
        let batch: Vec<CapturedCall> = {
            let mut buffer = self.inner.buffer.lock();
            buffer.drain(..).collect()
        };
        if batch.is_empty() {
            return 0;
        }

        self.inner.flushing.store(true, Ordering::Release);
        let written = self.export(batch, trigger).await;
        self.inner.flushing.store(false, Ordering::Release);
        written
    }

    async fn export(&self, batch: Vec<CapturedCall>, trigger: FlushTrigger) -> usize {
        let counters = &self.inner.counters;
        counters.flush_cycles.fetch_add(1, Ordering::Relaxed);
        let captured = batch.len();

        // 调用点符号解析较重，放到阻塞线程池
        let samples = match tokio::task::spawn_blocking(move || normalize_batch(batch)).await {
            Ok(samples) => samples,
            Err(e) => {
                counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
                tracing::error!("标准化捕获记录失败: {}", e);
                return 0;
            }
        };

        let dropped = captured - samples.len();
        if dropped > 0 {
            counters
                .dropped_unparsable
                .fetch_add(dropped as u64, Ordering::Relaxed);
            tracing::debug!(dropped, "部分捕获无法解析，已丢弃");
        }
        if samples.is_empty() {
            tracing::debug!(trigger = ?trigger, captured, "本次刷新没有可写入的样本");
            return 0;
        }

        match self.inner.store.persist(&samples).await {
            Ok(written) => {
                counters
                    .samples_written
                    .fetch_add(written as u64, Ordering::Relaxed);
                tracing::debug!(trigger = ?trigger, captured, written, "样本已导出");
                written
            }
            Err(e) => {
                counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
                tracing::error!("导出样本失败（本批次 {} 条丢失）: {}", samples.len(), e);
                0
            }
        }
    }

    /// 启动定时刷新任务（每个导出器最多一次）
    fn ensure_timer(&self) {
        if self.inner.timer_started.load(Ordering::Acquire) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self.inner.timer_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let notify = self.inner.shutdown_notify.clone();
        let period = self.inner.options.flush_interval;

        handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // 第一次 tick 立即完成
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = notify.notified() => break,
                }

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.shut_down.load(Ordering::Acquire) {
                    break;
                }
                let exporter = Exporter { inner };
                if exporter.buffered() > 0 {
                    exporter.flush_with(FlushTrigger::Timer).await;
                }
            }
            tracing::debug!("定时刷新任务已退出");
        });
    }
}

fn normalize_batch(batch: Vec<CapturedCall>) -> Vec<CollectedSample> {
    batch.into_iter().filter_map(normalize::normalize).collect()
}
