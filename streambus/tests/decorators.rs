use anyhow::Result as AnyResult;
use streambus::envelope::Envelope;
use streambus::error::BusError;
use streambus::eventing::{
    Publisher, StreamBus, StreamBusConfig, Subscriber, handler_fn, middleware_fn,
};
use streambus::observe::{
    DurationRecorder, HANDLE_TIME, Labels, MetricsBus, PUBLISH_TIME, RecordedSpan, SpanKind,
    SpanRecorder, TracingBus,
};
use streambus::store::InMemoryLogStore;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

type Journal = Arc<Mutex<Vec<String>>>;

struct JournalMetrics {
    journal: Journal,
}

impl DurationRecorder for JournalMetrics {
    fn record(&self, name: &str, _value: f64, _unit: &str, labels: &[(&'static str, String)]) {
        let status = labels
            .iter()
            .find(|(k, _)| *k == "status")
            .map(|(_, v)| v.as_str())
            .unwrap_or("-");
        self.journal
            .lock()
            .unwrap()
            .push(format!("metric {name} {status}"));
    }
}

struct JournalSpans {
    journal: Journal,
}

struct JournalSpan {
    name: String,
    error: Option<String>,
    journal: Journal,
}

impl RecordedSpan for JournalSpan {
    fn record_error(&mut self, error: &dyn fmt::Display) {
        self.error = Some(error.to_string());
    }
}

impl Drop for JournalSpan {
    fn drop(&mut self) {
        let outcome = self.error.as_deref().unwrap_or("ok");
        self.journal
            .lock()
            .unwrap()
            .push(format!("end {} {outcome}", self.name));
    }
}

impl SpanRecorder for JournalSpans {
    fn start(&self, name: String, kind: SpanKind, _attributes: Labels) -> Box<dyn RecordedSpan> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("start {name} {}", kind.as_str()));
        Box::new(JournalSpan {
            name,
            error: None,
            journal: self.journal.clone(),
        })
    }
}

fn engine(store: &InMemoryLogStore) -> StreamBus {
    StreamBus::builder()
        .store(Arc::new(store.clone()))
        .config(StreamBusConfig {
            read_block: Some(Duration::from_millis(50)),
            ..Default::default()
        })
        .build()
}

fn stack(store: &InMemoryLogStore, journal: &Journal) -> TracingBus<MetricsBus<StreamBus>> {
    let metrics = MetricsBus::new(
        engine(store),
        Arc::new(JournalMetrics {
            journal: journal.clone(),
        }),
    );
    TracingBus::new(
        metrics,
        Arc::new(JournalSpans {
            journal: journal.clone(),
        }),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn outer_decorator_observes_handling_first() -> AnyResult<()> {
    let store = InMemoryLogStore::new();
    let journal = Journal::default();
    let bus = stack(&store, &journal);

    let handled = journal.clone();
    let handler = handler_fn("projector", move |_ctx, _envelope, _additional| {
        handled.lock().unwrap().push("handler".to_string());
        Box::pin(async { Ok::<(), anyhow::Error>(()) })
    });
    bus.subscribe("orders", Arc::new(handler)).await?;
    journal.lock().unwrap().clear();

    bus.publish(&Envelope::raw("orders", b"{}".to_vec())).await?;

    let waited = tokio::time::timeout(Duration::from_secs(3), async {
        while !journal
            .lock()
            .unwrap()
            .iter()
            .any(|line| line.starts_with("end handle.Event"))
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "handling was not observed");

    // 发布与处理并发进行，分别检查两侧的先后
    let (publishing, handling): (Vec<String>, Vec<String>) = journal
        .lock()
        .unwrap()
        .iter()
        .cloned()
        .partition(|line| line.contains("publish"));

    // 发布：外层追踪跨度包住内层度量
    assert_eq!(
        publishing,
        vec![
            "start publish.Event(orders) producer".to_string(),
            format!("metric {PUBLISH_TIME} ok"),
            "end publish.Event(orders) ok".to_string(),
        ]
    );
    // 处理：外层追踪中间件先执行，内层度量中间件包住处理器
    assert_eq!(
        handling,
        vec![
            "start handle.Event(orders) consumer".to_string(),
            "handler".to_string(),
            format!("metric {HANDLE_TIME} ok"),
            "end handle.Event(orders) ok".to_string(),
        ]
    );

    bus.stop(Duration::from_secs(1)).await?;
    assert!(store.pending("orders", "orders:projector").is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn decorators_pass_errors_through_unchanged() -> AnyResult<()> {
    let store = InMemoryLogStore::new();
    let journal = Journal::default();
    let bus = stack(&store, &journal);

    let invalid = Envelope::from_parts(Uuid::nil(), chrono::Utc::now(), "orders", None);
    let err = bus.publish(&invalid).await.unwrap_err();
    assert!(matches!(err, BusError::MissingId));
    assert!(store.is_empty("orders"));

    let handler = || {
        Arc::new(handler_fn("projector", |_ctx, _envelope, _additional| {
            Box::pin(async { Ok::<(), anyhow::Error>(()) })
        }))
    };
    bus.subscribe("orders", handler()).await?;
    let err = bus.subscribe("orders", handler()).await.unwrap_err();
    assert!(matches!(err, BusError::HandlerAlreadyAdded { ref key } if key == "orders:projector"));

    let journal = journal.lock().unwrap().clone();
    assert!(journal.contains(&"end publish.Event(orders) missing id".to_string()));
    assert!(journal.contains(&format!("metric {PUBLISH_TIME} error")));
    assert!(journal.contains(
        &"end subscribe.Handler(projector) handler already added: key=orders:projector".to_string()
    ));

    // 错误通道经装饰器透传，且只能取走一次
    assert!(bus.errors().is_some());
    assert!(bus.inner().inner().errors().is_none());

    bus.stop(Duration::from_secs(1)).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn each_decorator_injects_exactly_one_stage() -> AnyResult<()> {
    let store = InMemoryLogStore::new();
    let journal = Journal::default();
    let bus = stack(&store, &journal);

    let handler = handler_fn("projector", |_ctx, _envelope, _additional| {
        Box::pin(async { Err::<(), _>(anyhow::anyhow!("rejected")) })
    });
    bus.subscribe("orders", Arc::new(handler)).await?;
    let mut errors = bus.errors().expect("errors receiver");

    bus.publish(&Envelope::raw("orders", b"{}".to_vec())).await?;
    let record = tokio::time::timeout(Duration::from_secs(3), errors.recv())
        .await?
        .expect("failure record");
    assert!(matches!(record.error(), BusError::Handler { .. }));

    let journal = journal.lock().unwrap().clone();
    let handle_spans = journal
        .iter()
        .filter(|line| line.starts_with("start handle.Event"))
        .count();
    let handle_metrics = journal
        .iter()
        .filter(|line| line.starts_with(&format!("metric {HANDLE_TIME}")))
        .count();
    assert_eq!((handle_spans, handle_metrics), (1, 1));
    assert!(journal.contains(&"end handle.Event(orders) rejected".to_string()));
    assert!(journal.contains(&format!("metric {HANDLE_TIME} error")));

    bus.stop(Duration::from_secs(1)).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn user_middleware_runs_inside_decorator_stages() -> AnyResult<()> {
    let store = InMemoryLogStore::new();
    let journal = Journal::default();
    let bus = stack(&store, &journal);

    let trail = journal.clone();
    bus.middleware(vec![Arc::new(middleware_fn(
        move |ctx, envelope, additional, next| {
            trail.lock().unwrap().push("middleware".to_string());
            Box::pin(next.run(ctx, envelope, additional))
        },
    ))]);
    let handled = journal.clone();
    let handler = handler_fn("projector", move |_ctx, _envelope, _additional| {
        handled.lock().unwrap().push("handler".to_string());
        Box::pin(async { Ok::<(), anyhow::Error>(()) })
    });
    bus.subscribe("orders", Arc::new(handler)).await?;
    journal.lock().unwrap().clear();

    bus.publish(&Envelope::raw("orders", b"{}".to_vec())).await?;
    let waited = tokio::time::timeout(Duration::from_secs(3), async {
        while !journal
            .lock()
            .unwrap()
            .iter()
            .any(|line| line.starts_with("end handle.Event"))
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "handling was not observed");

    let handling: Vec<String> = journal
        .lock()
        .unwrap()
        .iter()
        .filter(|line| !line.contains("publish"))
        .cloned()
        .collect();
    assert_eq!(
        handling,
        vec![
            "start handle.Event(orders) consumer".to_string(),
            "middleware".to_string(),
            "handler".to_string(),
            format!("metric {HANDLE_TIME} ok"),
            "end handle.Event(orders) ok".to_string(),
        ]
    );

    bus.stop(Duration::from_secs(1)).await?;
    Ok(())
}
