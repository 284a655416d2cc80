//! 可观测性（observe）
//!
//! 装饰器只通过两个固定协议对外输出观测数据：
//! - `DurationRecorder`：记录一次耗时（度量名、数值、单位、标签）；
//! - `SpanRecorder`：开启一个跨度（名称、类型、属性），可附加错误标注，丢弃即结束。
//!
//! 默认实现 `LogDurationRecorder` / `LogSpanRecorder` 落在 `tracing` 之上；
//! 对接具体的度量或追踪后端时实现这两个 trait 即可。
//!
mod metrics_bus;
mod tracing_bus;

pub use metrics_bus::{HANDLE_TIME, MetricsBus, PUBLISH_TIME, SUBSCRIBE_TIME};
pub use tracing_bus::TracingBus;

use std::fmt;
use std::time::{Duration, Instant};
use tracing::field;

/// 观测标签（键, 值）
pub type Labels = Vec<(&'static str, String)>;

/// 耗时记录器
pub trait DurationRecorder: Send + Sync {
    fn record(&self, name: &str, value: f64, unit: &str, labels: &[(&'static str, String)]);
}

/// 跨度类型
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpanKind {
    Producer,
    Consumer,
    Internal,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Producer => "producer",
            SpanKind::Consumer => "consumer",
            SpanKind::Internal => "internal",
        }
    }
}

/// 进行中的跨度；丢弃时结束
pub trait RecordedSpan: Send {
    fn record_error(&mut self, error: &dyn fmt::Display);

    /// 对应的 `tracing` 跨度，被包裹的调用在其中执行
    fn tracing_span(&self) -> tracing::Span {
        tracing::Span::none()
    }
}

/// 跨度记录器
pub trait SpanRecorder: Send + Sync {
    fn start(&self, name: String, kind: SpanKind, attributes: Labels) -> Box<dyn RecordedSpan>;
}

/// 结果状态标签值：`ok` / `error`
pub fn status<T, E>(res: &Result<T, E>) -> &'static str {
    if res.is_ok() { "ok" } else { "error" }
}

/// 毫秒（带小数）
pub fn milliseconds(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

/// 以 `tracing` 事件输出耗时
#[derive(Clone, Copy, Debug, Default)]
pub struct LogDurationRecorder;

impl DurationRecorder for LogDurationRecorder {
    fn record(&self, name: &str, value: f64, unit: &str, labels: &[(&'static str, String)]) {
        tracing::debug!(
            target: "streambus::metrics",
            measurement = name,
            value,
            unit,
            labels = ?labels,
            "duration recorded"
        );
    }
}

/// 以 `tracing` 跨度承载追踪
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSpanRecorder;

impl SpanRecorder for LogSpanRecorder {
    fn start(&self, name: String, kind: SpanKind, attributes: Labels) -> Box<dyn RecordedSpan> {
        let span = tracing::info_span!(
            "bus",
            otel.name = %name,
            otel.kind = kind.as_str(),
            attributes = ?attributes,
            error = field::Empty,
        );

        Box::new(LogSpan {
            span,
            name,
            started: Instant::now(),
            failed: false,
        })
    }
}

struct LogSpan {
    span: tracing::Span,
    name: String,
    started: Instant,
    failed: bool,
}

impl RecordedSpan for LogSpan {
    fn record_error(&mut self, error: &dyn fmt::Display) {
        self.failed = true;
        self.span.record("error", field::display(error));
    }

    fn tracing_span(&self) -> tracing::Span {
        self.span.clone()
    }
}

impl Drop for LogSpan {
    fn drop(&mut self) {
        tracing::debug!(
            parent: &self.span,
            span = %self.name,
            elapsed_ms = milliseconds(self.started.elapsed()),
            failed = self.failed,
            "span finished"
        );
    }
}
