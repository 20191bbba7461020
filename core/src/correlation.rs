// Reply correlation for send_with_reply: Armed -> Replied | Failed | TimedOut, first wins
use dashmap::DashMap;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, trace};

use crate::failure::{Failure, FailureCode};
use crate::handler::ReplyHandler;
use crate::message::Message;
use crate::registry::{HandlerId, Registry};
use crate::timer::TimerHandle;

/// How a pending reply ended.
#[derive(Debug)]
pub enum Outcome {
    Replied(Message),
    Failed(Failure),
    TimedOut,
}

impl Outcome {
    fn state(&self) -> &'static str {
        match self {
            Outcome::Replied(_) => "replied",
            Outcome::Failed(_) => "failed",
            Outcome::TimedOut => "timed_out",
        }
    }
}

struct PendingReply {
    reply_address: String,
    handler: Arc<dyn ReplyHandler>,
    registration: HandlerId,
    timer: Mutex<Option<TimerHandle>>,
    resolved: AtomicBool,
}

impl PendingReply {
    fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    fn take_timer(&self) -> Option<TimerHandle> {
        match self.timer.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

/// In-flight request/reply exchanges keyed by reply address.
#[derive(Default)]
pub struct ReplyTable {
    pending: DashMap<String, Arc<PendingReply>>,
}

impl ReplyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new exchange in the `Armed` state.
    pub fn arm(
        &self,
        reply_address: impl Into<String>,
        handler: Arc<dyn ReplyHandler>,
        registration: HandlerId,
    ) {
        let reply_address = reply_address.into();
        let pending = Arc::new(PendingReply {
            reply_address: reply_address.clone(),
            handler,
            registration,
            timer: Mutex::new(None),
            resolved: AtomicBool::new(false),
        });
        self.pending.insert(reply_address, pending);
    }

    /// Attaches the timeout timer. If the exchange already resolved the timer
    /// is cancelled on the spot.
    pub fn attach_timer(&self, reply_address: &str, handle: TimerHandle) {
        let Some(pending) = self.pending.get(reply_address).map(|p| Arc::clone(p.value())) else {
            handle.cancel();
            return;
        };
        match pending.timer.lock() {
            Ok(mut guard) => *guard = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
        // resolve() may have run between the lookup and the store.
        if pending.is_resolved() {
            if let Some(handle) = pending.take_timer() {
                handle.cancel();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Claims the exchange for the caller. Only the first claim succeeds; the
    /// timer is cancelled and the one-shot registration removed.
    fn claim(&self, registry: &Registry, reply_address: &str) -> Option<Arc<PendingReply>> {
        let (_, pending) = self.pending.remove(reply_address)?;
        if pending
            .resolved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        if let Some(timer) = pending.take_timer() {
            timer.cancel();
        }
        registry.unregister(reply_address, pending.registration);
        Some(pending)
    }

    /// Drives the exchange to its terminal state and invokes the reply
    /// handler on a fresh task. Returns `false` when the exchange had already
    /// resolved (or never existed); the outcome is then dropped.
    pub fn resolve(&self, registry: &Registry, reply_address: &str, outcome: Outcome) -> bool {
        let Some(pending) = self.claim(registry, reply_address) else {
            trace!(target: "eventbus", reply_address = %reply_address, outcome = outcome.state(), "Late resolution dropped");
            return false;
        };
        debug!(target: "eventbus", reply_address = %reply_address, outcome = outcome.state(), "Reply resolved");
        tokio::spawn(invoke(pending, outcome));
        true
    }

    /// Discards an exchange without notifying its handler.
    pub fn discard(&self, registry: &Registry, reply_address: &str) -> bool {
        self.claim(registry, reply_address).is_some()
    }

    /// Fails every pending exchange with `failure`. Returns how many were failed.
    pub fn fail_all(&self, registry: &Registry, failure: &Failure) -> usize {
        let addresses: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        addresses
            .into_iter()
            .filter(|a| self.resolve(registry, a, Outcome::Failed(failure.clone())))
            .count()
    }
}

async fn invoke(pending: Arc<PendingReply>, outcome: Outcome) {
    let handler = Arc::clone(&pending.handler);
    let call = async move {
        match outcome {
            Outcome::Replied(msg) => {
                if let Err(e) = handler.handle(msg).await {
                    error!(target: "eventbus", reply_address = %pending.reply_address, error = %e, "Reply handler failed");
                }
            }
            Outcome::Failed(failure) => handler.fail(failure).await,
            Outcome::TimedOut => {
                handler
                    .fail(Failure::new(
                        FailureCode::REQUEST_TIMEOUT,
                        format!("no reply on {} before timeout", pending.reply_address),
                    ))
                    .await
            }
        }
    };
    if AssertUnwindSafe(call).catch_unwind().await.is_err() {
        error!(target: "eventbus", "Reply handler panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Endpoint;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorder {
        fails: AtomicUsize,
        codes: Mutex<Vec<FailureCode>>,
        done: Mutex<Option<mpsc::UnboundedSender<()>>>,
    }

    #[async_trait]
    impl ReplyHandler for Recorder {
        async fn handle(&self, _reply: Message) -> crate::Result<()> {
            Ok(())
        }

        async fn fail(&self, failure: Failure) {
            self.fails.fetch_add(1, Ordering::SeqCst);
            self.codes.lock().unwrap().push(failure.code());
            if let Some(tx) = self.done.lock().unwrap().as_ref() {
                let _ = tx.send(());
            }
        }
    }

    fn armed(table: &ReplyTable, registry: &Registry, handler: Arc<Recorder>) -> String {
        let (reg, _) = registry.register("r.1", Endpoint::Reply, None, false, None);
        table.arm("r.1", handler, reg.id());
        "r.1".to_string()
    }

    #[tokio::test]
    async fn first_resolution_wins() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Recorder {
            done: Mutex::new(Some(tx)),
            ..Default::default()
        });
        let table = ReplyTable::new();
        let registry = Registry::new();
        let addr = armed(&table, &registry, Arc::clone(&handler));

        assert!(table.resolve(&registry, &addr, Outcome::TimedOut));
        assert!(!table.resolve(
            &registry,
            &addr,
            Outcome::Failed(Failure::new(FailureCode::INTERNAL_ERROR, "late"))
        ));

        rx.recv().await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(handler.fails.load(Ordering::SeqCst), 1);
        assert_eq!(*handler.codes.lock().unwrap(), vec![FailureCode::REQUEST_TIMEOUT]);
        assert!(table.is_empty());
        assert!(!registry.contains(&addr));
    }

    #[tokio::test]
    async fn timer_attached_after_resolution_is_cancelled() {
        let table = ReplyTable::new();
        let registry = Registry::new();
        let addr = armed(&table, &registry, Arc::new(Recorder::default()));
        assert!(table.discard(&registry, &addr));

        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        table.attach_timer(&addr, TimerHandle::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn resolution_cancels_pending_timer() {
        let table = ReplyTable::new();
        let registry = Registry::new();
        let addr = armed(&table, &registry, Arc::new(Recorder::default()));

        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        table.attach_timer(&addr, TimerHandle::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(!cancelled.load(Ordering::SeqCst));

        assert!(table.resolve(&registry, &addr, Outcome::Failed(Failure::new(FailureCode::NOT_FOUND, "x"))));
        assert!(cancelled.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
