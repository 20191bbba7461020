use loom_eventbus::{handler_fn, Body, BusConfig, BusError, EventBus, Failure, FailureCode, Message};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logging / tracing
    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,loom_eventbus=info,ping_pong=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let rounds: u32 = std::env::var("PING_ROUNDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5);
    let interval = Duration::from_millis(
        std::env::var("PING_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(200),
    );

    // Defaults + env + optional eventbus.toml
    let bus = EventBus::with_config(BusConfig::load());
    info!(target = "ping_pong", reply_timeout = ?bus.config().default_reply_timeout, "Starting ping/pong demo");

    // Two pong workers share the address; sends alternate between them.
    for name in ["pong-1", "pong-2"] {
        bus.register_handler(
            "pong",
            Arc::new(handler_fn(move |msg: Message| async move {
                let n = msg.body().and_then(Body::as_int).unwrap_or_default();
                if n % 4 == 3 {
                    msg.fail(Failure::new(FailureCode::CALM_DOWN, format!("{} needs a break", name)))?;
                } else {
                    msg.reply(json!({ "from": name, "round": n }))?;
                }
                Ok::<(), BusError>(())
            })),
        )?;
    }

    // Everyone listening on "ticks" sees every publish.
    for name in ["audit", "metrics"] {
        bus.register_local_handler(
            "ticks",
            Arc::new(handler_fn(move |msg: Message| async move {
                info!(target = "ping_pong", subscriber = name, tick = ?msg.body(), "Tick");
                Ok::<(), BusError>(())
            })),
        )?;
    }

    // Never answers; used to show the timeout path.
    bus.register_handler(
        "sleepy",
        Arc::new(handler_fn(|_msg: Message| async move { Ok::<(), BusError>(()) })),
    )?;

    for round in 0..rounds as i32 {
        bus.publish("ticks", round)?;
        match bus.request("pong", round, Some(Duration::from_secs(1))).await {
            Ok(reply) => info!(target = "ping_pong", round, reply = ?reply.body(), "Pong"),
            Err(failure) => warn!(
                target = "ping_pong",
                round,
                code = failure.code().as_i32(),
                reason = failure.reason(),
                "Ping failed"
            ),
        }
        tokio::time::sleep(interval).await;
    }

    if let Err(failure) = bus.request("nobody", "hello?", None).await {
        info!(target = "ping_pong", code = failure.code().name(), "No handler, as expected");
    }
    if let Err(failure) = bus
        .request("sleepy", "wake up", Some(Duration::from_millis(300)))
        .await
    {
        info!(target = "ping_pong", code = failure.code().name(), "Sleepy timed out");
    }

    if let Some(stats) = bus.stats("pong") {
        info!(target = "ping_pong", stats = %serde_json::to_string(&stats)?, "Pong stats");
    }
    bus.shutdown().await?;
    Ok(())
}
