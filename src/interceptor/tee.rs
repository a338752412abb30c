//! 响应体旁路复制
//!
//! 调用方读取的字节与未插桩时完全相同；旁路副本在流结束、出错或被丢弃时
//! 组装成一条捕获记录交给导出器。

use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;

use crate::common::{MAX_BODY_BYTES, now_ms};
use crate::exporter::Exporter;
use crate::model::sample::CapturedCall;

use super::spawn_record;

/// 响应完成前的捕获记录
pub struct ResponseCapture {
    call: CapturedCall,
    exporter: Exporter,
    truncated: bool,
}

impl ResponseCapture {
    pub fn new(call: CapturedCall, exporter: Exporter) -> Self {
        Self {
            call,
            exporter,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let body = &mut self.call.response_body;
        let room = MAX_BODY_BYTES.saturating_sub(body.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        body.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn finish(mut self, reason: &str) {
        self.call.end_ms = now_ms();
        tracing::debug!(
            id = %self.call.id,
            reason,
            size = self.call.response_body.len(),
            truncated = self.truncated,
            "响应捕获完成"
        );
        spawn_record(self.exporter, self.call);
    }
}

pin_project! {
    /// 复制数据块的响应体流
    pub struct TeeStream<S> {
        #[pin]
        inner: S,
        capture: Option<ResponseCapture>,
    }

    impl<S> PinnedDrop for TeeStream<S> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(capture) = this.capture.take() {
                capture.finish("dropped");
            }
        }
    }
}

impl<S> TeeStream<S> {
    pub fn new(inner: S, capture: ResponseCapture) -> Self {
        Self {
            inner,
            capture: Some(capture),
        }
    }
}

impl<S, E> Stream for TeeStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let item = ready!(this.inner.poll_next(cx));

        match &item {
            Some(Ok(chunk)) => {
                if let Some(capture) = this.capture.as_mut() {
                    capture.push(chunk);
                }
            }
            Some(Err(e)) => {
                if let Some(capture) = this.capture.take() {
                    tracing::debug!("读取响应体出错: {}", e);
                    capture.finish("error");
                }
            }
            None => {
                if let Some(capture) = this.capture.take() {
                    capture.finish("end");
                }
            }
        }

        Poll::Ready(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
