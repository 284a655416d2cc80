/// 内存版总线示例
/// 展示 发布 -> 消费组订阅 -> 处理/确认 的闭环，以及处理失败后经错误通道上报
use anyhow::Result as AnyResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use streambus::envelope::{Additional, Envelope};
use streambus::eventing::{
    Handler, MessageContext, Publisher, StreamBus, StreamBusConfig, Subscriber, handle_errors,
    middleware_fn,
};
use streambus::observe::{MetricsBus, TracingBus};
use streambus::store::InMemoryLogStore;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: String,
    amount: u64,
}

struct OrderProjector;

#[async_trait::async_trait]
impl Handler for OrderProjector {
    fn handler_name(&self) -> &str {
        "order-projector"
    }

    async fn handle(
        &self,
        ctx: &MessageContext,
        envelope: &Envelope,
        additional: &Additional,
    ) -> anyhow::Result<()> {
        let placed: OrderPlaced = envelope.payload_as()?;
        if placed.amount == 0 {
            anyhow::bail!("order {} has no amount", placed.order_id);
        }

        println!(
            "[{}] {} -> {:?} (tenant={:?})",
            ctx.consumer(),
            ctx.message_id(),
            placed,
            additional.get("tenant")
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    let store = InMemoryLogStore::new();
    let engine = StreamBus::builder()
        .store(Arc::new(store.clone()))
        .config(StreamBusConfig {
            client_id: "demo".into(),
            read_block: Some(Duration::from_millis(200)),
            append: streambus::store::AppendOptions::default()
                .approx_max_len(10_000)
                .with_values([("tenant", "acme")]),
            ..Default::default()
        })
        .build();
    let bus = TracingBus::logged(MetricsBus::logged(engine));

    bus.middleware(vec![Arc::new(middleware_fn(
        |ctx, envelope, additional, next| {
            println!("-> {} ({})", envelope.name(), envelope.id());
            Box::pin(next.run(ctx, envelope, additional))
        },
    ))]);

    let token = CancellationToken::new();
    let errors = bus.errors().expect("errors receiver is taken once");
    let reporter = tokio::spawn(handle_errors(token.clone(), errors, |err| async move {
        println!("error: {err}");
    }));

    bus.subscribe("orders", Arc::new(OrderProjector)).await?;

    for (order_id, amount) in [("o-1", 42), ("o-2", 0), ("o-3", 7)] {
        let placed = OrderPlaced {
            order_id: order_id.into(),
            amount,
        };
        bus.publish(&Envelope::new("orders", &placed)?).await?;
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    println!(
        "pending after handling: {:?}",
        store.pending("orders", "orders:order-projector")
    );

    bus.stop(Duration::from_secs(2)).await?;
    // 错误通道关闭后上报任务自行结束
    reporter.await?;
    token.cancel();

    Ok(())
}
