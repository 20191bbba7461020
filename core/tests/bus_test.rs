mod common;

use async_trait::async_trait;
use common::{collector, recv, Outcomes};
use loom_eventbus::{
    Body, BusError, Envelope, EventBus, Failure, FailureCode, Handler, Message, Result,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Tags each message with the handler's name before forwarding it.
struct Named {
    name: &'static str,
    tx: mpsc::UnboundedSender<(&'static str, Message)>,
}

#[async_trait]
impl Handler for Named {
    async fn handle(&self, msg: Message) -> Result<()> {
        let _ = self.tx.send((self.name, msg));
        Ok(())
    }
}

struct Broken;

#[async_trait]
impl Handler for Broken {
    async fn handle(&self, _msg: Message) -> Result<()> {
        Err(BusError::Handler("broken subscriber".into()))
    }
}

#[tokio::test]
async fn send_rotates_over_handlers_fairly() -> Result<()> {
    let bus = EventBus::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    for name in ["a", "b", "c"] {
        bus.register_handler("work", Arc::new(Named { name, tx: tx.clone() }))?;
    }

    for i in 0..10 {
        bus.send("work", i)?;
    }
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for _ in 0..10 {
        let (name, _) = recv(&mut rx).await;
        *counts.entry(name).or_default() += 1;
    }
    assert_eq!(counts["a"], 4);
    assert_eq!(counts["b"], 3);
    assert_eq!(counts["c"], 3);
    Ok(())
}

#[tokio::test]
async fn publish_reaches_every_subscriber_despite_failures() -> Result<()> {
    let bus = EventBus::new();
    let (first, mut first_rx) = collector();
    let (second, mut second_rx) = collector();
    bus.register_handler("news", first)?;
    bus.register_handler("news", Arc::new(Broken))?;
    bus.register_handler("news", second)?;

    assert_eq!(bus.publish("news", "headline")?, 3);
    assert_eq!(bus.publish("news", "follow-up")?, 3);

    for rx in [&mut first_rx, &mut second_rx] {
        let msg = recv(&mut *rx).await;
        assert_eq!(msg.body().and_then(Body::as_str), Some("headline"));
        assert!(!msg.is_send());
        let msg = recv(&mut *rx).await;
        assert_eq!(msg.body().and_then(Body::as_str), Some("follow-up"));
    }
    Ok(())
}

#[tokio::test]
async fn publish_and_send_without_subscribers_are_silent() -> Result<()> {
    let bus = EventBus::new();
    assert_eq!(bus.publish("void", 1i32)?, 0);
    bus.send("void", 2i32)?;

    assert!(bus.stats("void").is_none());
    Ok(())
}

#[tokio::test]
async fn unknown_addresses_leave_no_stats_behind() -> Result<()> {
    let bus = EventBus::new();
    for i in 0..100 {
        let frame = Envelope::new(true, format!("ghost.{i}"), i).to_frame()?;
        assert_eq!(bus.receive_frame(&frame)?, 0);
        bus.send(&format!("ghost.send.{i}"), i)?;
        bus.publish(&format!("ghost.pub.{i}"), i)?;
    }
    for i in 0..100 {
        assert!(bus.stats(&format!("ghost.{i}")).is_none());
        assert!(bus.stats(&format!("ghost.send.{i}")).is_none());
        assert!(bus.stats(&format!("ghost.pub.{i}")).is_none());
    }

    let (handler, mut rx) = collector();
    let id = bus.register_handler("ghost.0", handler)?;
    bus.send("ghost.0", 1i32)?;
    recv(&mut rx).await;
    let stats = bus.stats("ghost.0").expect("stats");
    assert_eq!(stats.active_handlers, 1);
    assert_eq!(stats.total_sent, 1);
    assert_eq!(stats.total_delivered, 1);

    assert!(bus.unregister_handler("ghost.0", id));
    assert!(bus.stats("ghost.0").is_none());
    Ok(())
}

#[tokio::test]
async fn conflicting_visibility_is_rejected() -> Result<()> {
    let bus = EventBus::new();
    let (shared, _shared_rx) = collector();
    let id = bus.register_handler("svc.shared", shared.clone())?;
    let err = bus
        .register_local_handler("svc.shared", shared.clone())
        .unwrap_err();
    assert!(matches!(err, BusError::Handler(_)));
    assert!(bus.is_advertised("svc.shared"));
    assert_eq!(bus.handler_count("svc.shared"), 1);
    assert_eq!(bus.register_handler("svc.shared", shared)?, id);

    let (private, _private_rx) = collector();
    let id = bus.register_local_handler("svc.private", private.clone())?;
    let err = bus
        .register_handler("svc.private", private.clone())
        .unwrap_err();
    assert!(matches!(err, BusError::Handler(_)));
    assert!(!bus.is_advertised("svc.private"));
    assert_eq!(bus.handler_count("svc.private"), 1);

    assert!(bus.unregister_handler("svc.private", id));
    bus.register_handler("svc.private", private)?;
    assert!(bus.is_advertised("svc.private"));
    Ok(())
}

#[tokio::test]
async fn reply_with_handler_needs_a_replyable_message() -> Result<()> {
    let bus = EventBus::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.register_handler(
        "chatty",
        Arc::new(loom_eventbus::handler_fn(move |msg: Message| {
            let tx = tx.clone();
            async move {
                let (outcomes, _outcomes_rx) = Outcomes::new();
                let _ = tx.send(msg.reply_with_handler("more?", outcomes, None));
                Ok::<(), BusError>(())
            }
        })),
    )?;

    bus.send("chatty", Failure::new(FailureCode::FORBIDDEN, "denied"))?;
    assert!(matches!(
        recv(&mut rx).await,
        Err(BusError::UnsupportedOperation(_))
    ));

    bus.send("chatty", "no reply address")?;
    assert!(matches!(recv(&mut rx).await, Err(BusError::NoReplyAddress)));
    assert_eq!(bus.pending_replies(), 0);
    Ok(())
}

#[tokio::test]
async fn registering_the_same_handler_twice_is_one_registration() {
    let bus = EventBus::new();
    let (handler, _rx) = collector();
    let first = bus.register_handler("dup", handler.clone()).unwrap();
    let second = bus.register_handler("dup", handler).unwrap();
    assert_eq!(first, second);
    assert_eq!(bus.handler_count("dup"), 1);

    assert!(bus.unregister_handler("dup", first));
    assert!(!bus.unregister_handler("dup", first));
    assert_eq!(bus.handler_count("dup"), 0);
}

/// Blocks inside `handle` until released.
struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
    done: mpsc::UnboundedSender<i32>,
}

#[async_trait]
impl Handler for Gate {
    async fn handle(&self, msg: Message) -> Result<()> {
        self.entered.notify_one();
        self.release.notified().await;
        let _ = self
            .done
            .send(msg.body().and_then(Body::as_int).unwrap_or_default());
        Ok(())
    }
}

#[tokio::test]
async fn unregister_during_flight_completes_and_then_skips() -> Result<()> {
    let bus = EventBus::new();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let gated = bus.register_handler(
        "job",
        Arc::new(Gate {
            entered: entered.clone(),
            release: release.clone(),
            done: done_tx,
        }),
    )?;
    let (other, mut other_rx) = collector();
    bus.register_handler("job", other)?;

    bus.send("job", 1i32)?;
    entered.notified().await;
    assert!(bus.unregister_handler("job", gated));

    for i in 2..5 {
        bus.send("job", i)?;
    }
    release.notify_one();
    assert_eq!(recv(&mut done_rx).await, 1);

    for i in 2..5 {
        let msg = recv(&mut other_rx).await;
        assert_eq!(msg.body().and_then(Body::as_int), Some(i));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(done_rx.try_recv().is_err());
    Ok(())
}

/// Records the highest number of concurrent `handle` calls.
#[derive(Default)]
struct Overlap {
    current: AtomicUsize,
    peak: AtomicUsize,
    seen: AtomicUsize,
}

#[async_trait]
impl Handler for Overlap {
    async fn handle(&self, _msg: Message) -> Result<()> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deliveries_to_one_handler_are_serialized() -> Result<()> {
    let bus = EventBus::new();
    let overlap = Arc::new(Overlap::default());
    bus.register_handler("serial", overlap.clone())?;

    for i in 0..20 {
        bus.publish("serial", i)?;
    }
    for _ in 0..200 {
        if overlap.seen.load(Ordering::SeqCst) == 20 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(overlap.seen.load(Ordering::SeqCst), 20);
    assert_eq!(overlap.peak.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn replying_to_a_failure_is_unsupported() -> Result<()> {
    let bus = EventBus::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.register_handler(
        "failures",
        Arc::new(loom_eventbus::handler_fn(move |msg: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg.reply("answer"));
                Ok::<(), BusError>(())
            }
        })),
    )?;

    bus.send("failures", Failure::new(FailureCode::BAD_SYNTAX, "bad input"))?;
    let result = recv(&mut rx).await;
    assert!(matches!(result, Err(BusError::UnsupportedOperation(_))));
    Ok(())
}

#[tokio::test]
async fn plain_send_has_no_reply_address() -> Result<()> {
    let bus = EventBus::new();
    let (handler, mut rx) = collector();
    bus.register_local_handler("plain", handler)?;
    bus.send("plain", true)?;

    let msg = recv(&mut rx).await;
    assert!(msg.reply_address().is_none());
    assert!(matches!(msg.reply(false), Err(BusError::NoReplyAddress)));
    assert!(!bus.is_advertised("plain"));
    Ok(())
}

#[tokio::test]
async fn shutdown_removes_every_handler() -> Result<()> {
    let bus = EventBus::new();
    let (handler, _rx) = collector();
    bus.register_handler("a", handler.clone())?;
    bus.register_local_handler("b", handler)?;
    bus.shutdown().await?;

    assert_eq!(bus.handler_count("a"), 0);
    assert_eq!(bus.handler_count("b"), 0);
    assert!(bus.stats("a").is_none());
    Ok(())
}
