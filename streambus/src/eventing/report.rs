//! 错误上报（report）
//!
//! 消费任务通过有界通道上报失败记录，永不阻塞：
//! 通道已满或接收端已关闭时，记录交给同步的兜底上报器。
//!
use super::ConsumeError;
use futures_core::stream::BoxStream;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// 兜底上报器：错误通道无法立即接收时同步调用
pub type ErrorReporter = Arc<dyn Fn(&ConsumeError) + Send + Sync>;

/// 默认兜底：记录到日志
pub fn log_reporter() -> ErrorReporter {
    Arc::new(|err: &ConsumeError| {
        tracing::error!(
            channel = err.channel(),
            group = err.group(),
            consumer = err.consumer(),
            message_id = err.message_id(),
            error = %err.error(),
            "bus error not delivered to error channel"
        );
    })
}

/// 消费任务持有的上报端
#[derive(Clone)]
pub(crate) struct ErrorSink {
    tx: mpsc::Sender<ConsumeError>,
    fallback: ErrorReporter,
}

impl ErrorSink {
    pub(crate) fn new(tx: mpsc::Sender<ConsumeError>, fallback: ErrorReporter) -> Self {
        Self { tx, fallback }
    }

    pub(crate) fn report(&self, err: ConsumeError) {
        match self.tx.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(err)) | Err(TrySendError::Closed(err)) => (self.fallback)(&err),
        }
    }
}

/// 持续消费错误通道，直到令牌取消或通道关闭
pub async fn handle_errors<F, Fut>(
    token: CancellationToken,
    mut errors: mpsc::Receiver<ConsumeError>,
    mut handler: F,
) where
    F: FnMut(ConsumeError) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = errors.recv() => match next {
                Some(err) => handler(err).await,
                None => break,
            },
        }
    }
}

/// 将错误通道适配为 `'static` 流，便于在 `tokio::spawn` 中组合使用
pub fn error_stream(errors: mpsc::Receiver<ConsumeError>) -> BoxStream<'static, ConsumeError> {
    Box::pin(ReceiverStream::new(errors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BusError;
    use futures_util::StreamExt;
    use std::sync::Mutex;

    fn record(n: usize) -> ConsumeError {
        ConsumeError::new("orders", "g", "c", BusError::MissingName).with_message_id(format!("{n}-0"))
    }

    #[tokio::test]
    async fn full_channel_falls_back_without_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let dropped = dropped.clone();
            ErrorSink::new(
                tx,
                Arc::new(move |err: &ConsumeError| {
                    dropped
                        .lock()
                        .unwrap()
                        .push(err.message_id().unwrap_or_default().to_string());
                }),
            )
        };

        sink.report(record(1));
        sink.report(record(2));
        sink.report(record(3));

        assert_eq!(rx.recv().await.unwrap().message_id(), Some("1-0"));
        assert_eq!(*dropped.lock().unwrap(), vec!["2-0", "3-0"]);
    }

    #[tokio::test]
    async fn closed_channel_falls_back() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let hits = Arc::new(Mutex::new(0));
        let sink = {
            let hits = hits.clone();
            ErrorSink::new(tx, Arc::new(move |_: &ConsumeError| *hits.lock().unwrap() += 1))
        };

        sink.report(record(1));
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn handle_errors_stops_when_channel_closes() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(record(1)).await.unwrap();
        tx.send(record(2)).await.unwrap();
        drop(tx);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        handle_errors(CancellationToken::new(), rx, move |err| {
            sink.lock()
                .unwrap()
                .push(err.message_id().unwrap_or_default().to_string());
            async {}
        })
        .await;

        assert_eq!(*seen.lock().unwrap(), vec!["1-0", "2-0"]);
    }

    #[tokio::test]
    async fn handle_errors_stops_on_cancel() {
        let (_tx, rx) = mpsc::channel::<ConsumeError>(4);
        let token = CancellationToken::new();
        token.cancel();

        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            handle_errors(token, rx, |_| async {}),
        )
        .await
        .expect("cancelled drain must return");
    }

    #[tokio::test]
    async fn error_stream_ends_with_channel() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(record(1)).await.unwrap();
        drop(tx);

        let collected: Vec<ConsumeError> = error_stream(rx).collect().await;
        assert_eq!(collected.len(), 1);
    }
}
