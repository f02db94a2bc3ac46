use futures::future::join_all;
use replcache::{
    config::ServiceDependencies,
    test_utils::{ConfigBus, LoopbackCluster},
    Result,
};
use serde_json::json;
use std::env;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MEMBERS: u16 = 3;
const KEYS: usize = 16;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let dependencies = match env::args().nth(1) {
        Some(path) => ServiceDependencies::load(&path)?,
        None => ServiceDependencies::default(),
    };
    info!(?dependencies, "replcache simulator starting");

    let cluster = LoopbackCluster::with_dependencies(MEMBERS, dependencies);
    let writers: Vec<_> = (1..=MEMBERS).map(|m| cluster.handler(m, "orders")).collect();

    // every member writes every key concurrently
    let puts = writers.iter().flat_map(|handler| {
        (0..KEYS).map(move |i| {
            let key = format!("order-{i}");
            let value = json!({ "writer": handler.this_member().0, "seq": i });
            async move { handler.put(&key, value).await }
        })
    });
    let failed = join_all(puts).await.into_iter().filter(|r| r.is_err()).count();
    if failed > 0 {
        warn!(failed, "some writes gave up");
    }

    for handler in &writers {
        info!(member = %handler.this_member(), entries = handler.size()?, "cache contents");
    }
    let reference = writers[0].get("order-0")?;
    let converged = writers.iter().all(|h| h.get("order-0").ok().flatten() == reference);
    info!(converged, value = ?reference, "order-0 after concurrent writes");

    cluster.depart(1);
    writers[1].put("order-0", json!({ "writer": 2, "after": "failover" })).await?;
    info!(value = ?writers[2].get("order-0")?, "write after the oldest member left");

    let bus = ConfigBus::with_members(&[1, 3, 2]);
    bus.map(2).put("partition-count", json!(257))?;
    bus.depart(1);
    let delivered = bus.deliver_all();
    info!(
        delivered,
        pending = bus.map(2).pending_request_count(),
        value = ?bus.map(3).get("partition-count"),
        "config map after coordinator failover"
    );

    cluster.drain_events().await;
    Ok(())
}
