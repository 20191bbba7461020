// Handler traits
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::failure::Failure;
use crate::message::Message;
use crate::Result;

/// Subscriber registered on an address.
///
/// Deliveries to one registration are serialized. An `Err` (or a panic) is
/// caught by the bus: when the message expected a reply the requester is
/// failed with `INTERNAL_ERROR`, otherwise the error is logged.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, msg: Message) -> Result<()>;
}

/// Receiver of the outcome of a `send_with_reply`.
///
/// Exactly one of `handle` or `fail` is invoked, exactly once.
#[async_trait]
pub trait ReplyHandler: Send + Sync + 'static {
    async fn handle(&self, reply: Message) -> Result<()>;

    async fn fail(&self, failure: Failure);

    /// Timeout for this exchange; `None` defers to the bus default.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wraps an async closure as a [`Handler`].
///
/// ```
/// use loom_eventbus::handler::handler_fn;
///
/// let echo = handler_fn(|msg| async move {
///     if let Some(body) = msg.body().cloned() {
///         msg.reply(body)?;
///     }
///     Ok::<(), loom_eventbus::BusError>(())
/// });
/// # let _ = echo;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnHandler {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F, Fut>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, msg: Message) -> Result<()> {
        (self.f)(msg).await
    }
}

pub type ReplyOutcome = std::result::Result<Message, Failure>;

/// [`ReplyHandler`] forwarding the outcome into a oneshot channel.
pub struct ReplyChannel {
    tx: Mutex<Option<oneshot::Sender<ReplyOutcome>>>,
    timeout: Option<Duration>,
}

impl ReplyChannel {
    pub fn new(timeout: Option<Duration>) -> (Self, oneshot::Receiver<ReplyOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
                timeout,
            },
            rx,
        )
    }

    fn complete(&self, outcome: ReplyOutcome) {
        let tx = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(tx) = tx {
            if tx.send(outcome).is_err() {
                tracing::debug!(target: "eventbus", "Reply receiver dropped before completion");
            }
        }
    }
}

#[async_trait]
impl ReplyHandler for ReplyChannel {
    async fn handle(&self, reply: Message) -> Result<()> {
        self.complete(Ok(reply));
        Ok(())
    }

    async fn fail(&self, failure: Failure) {
        self.complete(Err(failure));
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
