use async_trait::async_trait;
use realtime_feed_sdk::{
    observer, ChannelObserver, EngineConfig, EngineEvent, FeedEngine, FeedSource, SourceError,
    SubscribeOptions, TriggerOptions,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Simulated gas oracle: the estimate drifts a little on every fetch
struct SimulatedGasOracle {
    ticks: AtomicU64,
}

#[async_trait]
impl FeedSource for SimulatedGasOracle {
    async fn fetch(
        &self,
        feed: &str,
        filter: Option<&Value>,
    ) -> Result<Option<Value>, SourceError> {
        if feed != "gas_price" {
            return Err(SourceError::UnsupportedFeed(feed.to_string()));
        }

        let tick = self.ticks.fetch_add(1, Ordering::Relaxed);
        let base = 20.0 + (tick % 7) as f64 * 1.5;
        let tier = filter
            .and_then(|f| f.get("tier"))
            .and_then(Value::as_str)
            .unwrap_or("standard");
        let gwei = if tier == "fast" { base * 1.4 } else { base };

        sleep(Duration::from_millis(40)).await;
        Ok(Some(json!({ "tier": tier, "gwei": gwei, "tick": tick })))
    }

    fn source_name(&self) -> &'static str {
        "simulated_gas_oracle"
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "realtime_feed_sdk=info".into()),
        )
        .init();

    println!("Gas Price Feed Example");
    println!("======================");

    let config = EngineConfig {
        metrics_interval_ms: 2_000,
        ..EngineConfig::from_env()?
    };
    let source = Arc::new(SimulatedGasOracle {
        ticks: AtomicU64::new(0),
    });
    let engine = FeedEngine::new(config, source)?;

    let mut events = engine.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if matches!(event, EngineEvent::Metrics { .. } | EngineEvent::Alert { .. }) {
                println!("[event] {}", event);
            }
        }
    });

    // Standard tier printed inline
    engine
        .subscribe(
            "gas_price",
            observer::from_fn(|update| {
                println!(
                    "[standard] {} gwei (coalesced {})",
                    update.payload["gwei"], update.coalesced
                )
            }),
            SubscribeOptions::default()
                .with_filter(json!({"tier": "standard"}))
                .with_interval(Duration::from_millis(500)),
        )
        .await?;

    // Fast tier consumed from a channel by a separate task
    let (fast_observer, mut fast_updates) = ChannelObserver::channel(32);
    engine
        .subscribe(
            "gas_price",
            fast_observer,
            SubscribeOptions::default()
                .with_filter(json!({"tier": "fast"}))
                .with_interval(Duration::from_secs(1))
                .with_priority(9),
        )
        .await?;
    tokio::spawn(async move {
        while let Some(update) = fast_updates.recv().await {
            println!("[fast]     {} gwei", update.payload["gwei"]);
        }
    });

    engine.start();
    sleep(Duration::from_secs(3)).await;

    println!("\nPushing a manual spike...");
    let outcome = engine
        .trigger_update(
            "gas_price",
            json!({"tier": "fast", "gwei": 250.0, "tick": "manual"}),
            TriggerOptions::forced(),
        )
        .await;
    println!("Manual update outcome: {:?}", outcome);

    sleep(Duration::from_secs(2)).await;

    println!("\n{:-<50}", "");
    if let Some(latest) = engine.get_cached_data("gas_price").await {
        println!("Cached gas price: {}", latest);
    }

    let metrics = engine.get_metrics().await;
    println!(
        "Updates: {} ({} ok, {} failed, {} throttled), rate {:.2}/s, p50 {:.2}ms, p99 {:.2}ms",
        metrics.total_updates,
        metrics.successful_updates,
        metrics.failed_updates,
        metrics.throttled_updates,
        metrics.current_rate,
        metrics.dispatch_latency_p50_ms,
        metrics.dispatch_latency_p99_ms,
    );

    for sub in engine.active_subscriptions().await {
        println!(
            "{} on {}: {} updates, {} errors",
            sub.id, sub.feed, sub.update_count, sub.error_count
        );
    }

    let health = engine.health_check().await;
    println!("Health: {:?} - {}", health.status, health.message.unwrap_or_default());

    engine.stop().await;
    Ok(())
}
