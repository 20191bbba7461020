// Event bus implementation
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::codec::{Body, Envelope};
use crate::config::BusConfig;
use crate::correlation::{Outcome, ReplyTable};
use crate::failure::{Failure, FailureCode};
use crate::handler::{Handler, ReplyChannel, ReplyHandler, ReplyOutcome};
use crate::message::Message;
use crate::registry::{Endpoint, HandlerId, Registration, Registry, Visibility};
use crate::timer::{Timer, TokioTimer};
use crate::transport::{Delivery, Transport};
use crate::{BusError, Result};

/// Per-address counters, kept while the address has a local registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub total_published: u64,
    pub total_sent: u64,
    pub total_delivered: u64,
    pub forwarded_remote: u64,
    pub no_handlers: u64,
    pub handler_failures: u64,
    pub reply_timeouts: u64,
    pub active_handlers: usize,
}

/// Where a point-to-point message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Local,
    Remote,
    Nowhere,
}

/// Addressed event bus: publish to all, send to one, or send and await a reply.
///
/// `EventBus` is a cheap handle; clones share the same registry and pending
/// reply table. Handler registration and all dispatch must happen inside a
/// tokio runtime.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    replies: ReplyTable,
    transport: Option<Arc<dyn Transport>>,
    timer: Arc<dyn Timer>,
    config: BusConfig,
    stats: DashMap<String, BusStats>,
}

/// Builder for an [`EventBus`] with non-default collaborators.
pub struct EventBusBuilder {
    config: BusConfig,
    transport: Option<Arc<dyn Transport>>,
    timer: Arc<dyn Timer>,
}

impl EventBusBuilder {
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = timer;
        self
    }

    pub fn build(self) -> EventBus {
        EventBus {
            inner: Arc::new(Inner {
                registry: Registry::new(),
                replies: ReplyTable::new(),
                transport: self.transport,
                timer: self.timer,
                config: self.config,
                stats: DashMap::new(),
            }),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn with_config(config: BusConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> EventBusBuilder {
        EventBusBuilder {
            config: BusConfig::default(),
            transport: None,
            timer: Arc::new(TokioTimer),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!(target: "eventbus", "Event Bus shutting down");
        let failure = Failure::new(FailureCode::SERVICE_UNAVAILABLE, "event bus shut down");
        let failed = self
            .inner
            .replies
            .fail_all(&self.inner.registry, &failure);
        let removed = self.inner.registry.clear();
        self.inner.stats.clear();
        info!(target: "eventbus", pending_failed = failed, handlers_removed = removed, "Event Bus shut down");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Subscriber API
    // ------------------------------------------------------------------

    /// Registers a cluster-visible handler on `address`.
    ///
    /// Registering the same handler again returns the existing id. Asking for
    /// a different visibility than the existing registration has is rejected
    /// with [`BusError::Handler`](crate::BusError::Handler); unregister first.
    pub fn register_handler(
        &self,
        address: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<HandlerId> {
        self.register(address.into(), handler, false)
    }

    /// Registers a handler visible only inside this process. Same rules as
    /// [`register_handler`](Self::register_handler).
    pub fn register_local_handler(
        &self,
        address: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<HandlerId> {
        self.register(address.into(), handler, true)
    }

    /// Removes the registration. Messages already delivered to its mailbox
    /// are still handled. Returns `false` if no such registration existed.
    pub fn unregister_handler(&self, address: &str, id: HandlerId) -> bool {
        match self.inner.registry.unregister(address, id) {
            Some(_) => {
                self.update_stats(address, |s| {
                    s.active_handlers = s.active_handlers.saturating_sub(1)
                });
                let registry = &self.inner.registry;
                self.inner
                    .stats
                    .remove_if(address, |_, _| !registry.contains(address));
                info!(target: "eventbus", address = %address, handler_id = %id, "Unregistered handler");
                true
            }
            None => false,
        }
    }

    fn register(
        &self,
        address: String,
        handler: Arc<dyn Handler>,
        local_only: bool,
    ) -> Result<HandlerId> {
        let identity = Arc::as_ptr(&handler) as *const () as usize;
        let (tx, rx) = mpsc::unbounded_channel();
        let (registration, created) = self.inner.registry.register(
            &address,
            Endpoint::Mailbox(tx),
            Some(identity),
            local_only,
            None,
        );
        if !created {
            if registration.is_local_only() != local_only {
                warn!(target: "eventbus", address = %address, handler_id = %registration.id(), local_only, "Handler already registered with other visibility");
                return Err(BusError::Handler(format!(
                    "handler {} on {} is already registered as {}",
                    registration.id(),
                    address,
                    if registration.is_local_only() { "local-only" } else { "cluster-visible" },
                )));
            }
            debug!(target: "eventbus", address = %address, handler_id = %registration.id(), "Handler already registered");
            return Ok(registration.id());
        }
        self.spawn_worker(&registration, handler, rx);
        self.inner
            .stats
            .entry(address.clone())
            .or_default()
            .active_handlers += 1;
        info!(target: "eventbus", address = %address, handler_id = %registration.id(), local_only, "Registered handler");
        Ok(registration.id())
    }

    /// Runs one handler: messages from its mailbox are handled one at a time.
    fn spawn_worker(
        &self,
        registration: &Registration,
        handler: Arc<dyn Handler>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        let bus = Arc::downgrade(&self.inner);
        let address = registration.address().to_string();
        let id = registration.id();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let reply_address = msg.reply_address().map(str::to_owned);
                let failure = match AssertUnwindSafe(handler.handle(msg)).catch_unwind().await {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => Failure::from_error(FailureCode::INTERNAL_ERROR, &e),
                    Err(panic) => Failure::new(FailureCode::INTERNAL_ERROR, panic_reason(panic)),
                };
                let Some(bus) = EventBus::upgrade(&bus) else {
                    error!(target: "eventbus", address = %address, handler_id = %id, reason = failure.reason(), "Handler failed after bus shutdown");
                    continue;
                };
                bus.update_stats(&address, |s| s.handler_failures += 1);
                match reply_address {
                    Some(reply_address) => {
                        warn!(target: "eventbus", address = %address, handler_id = %id, reason = failure.reason(), "Handler failed; failing requester");
                        if let Err(e) = bus.send_envelope(Envelope::new(true, reply_address, failure)) {
                            error!(target: "eventbus", address = %address, error = %e, "Could not return failure to requester");
                        }
                    }
                    None => {
                        error!(target: "eventbus", address = %address, handler_id = %id, reason = failure.reason(), trace = failure.trace(), "Handler failed");
                    }
                }
            }
            debug!(target: "eventbus", address = %address, handler_id = %id, "Handler worker stopped");
        });
    }

    fn upgrade(inner: &Weak<Inner>) -> Option<EventBus> {
        inner.upgrade().map(|inner| EventBus { inner })
    }

    // ------------------------------------------------------------------
    // Delivery modes
    // ------------------------------------------------------------------

    /// Delivers to every handler on `address`, locally and through the
    /// transport. Returns how many local handlers the message was queued for.
    /// Publishing to an address nobody listens on is a no-op.
    pub fn publish(&self, address: &str, body: impl Into<Body>) -> Result<usize> {
        let env = Envelope::new(false, address, body);
        self.update_stats(address, |s| s.total_published += 1);
        debug!(target: "eventbus", address = %address, "Publishing");

        let delivered = self.publish_local(&env, Visibility::Local);
        let forwarded = match &self.inner.transport {
            Some(transport) if transport.has_remote(address) => {
                self.forward(Arc::clone(transport), &env)?;
                true
            }
            _ => false,
        };
        if delivered == 0 && !forwarded {
            debug!(target: "eventbus", address = %address, "No subscribers for publish");
        }
        Ok(delivered)
    }

    /// Delivers to exactly one handler, chosen round-robin. Without any
    /// handler the message is dropped silently.
    pub fn send(&self, address: &str, body: impl Into<Body>) -> Result<()> {
        self.send_envelope(Envelope::new(true, address, body))
    }

    /// Point-to-point send expecting an answer. The timeout comes from the
    /// reply handler or, failing that, the bus default.
    pub fn send_with_reply(
        &self,
        address: impl Into<String>,
        body: impl Into<Body>,
        handler: Arc<dyn ReplyHandler>,
    ) -> Result<()> {
        self.send_with_reply_timeout(address, body, handler, None)
    }

    /// Like [`send_with_reply`](Self::send_with_reply) with an explicit timeout
    /// taking precedence over the handler's and the bus default.
    ///
    /// If nothing is registered on `address` anywhere, the handler is failed
    /// with `NOT_IMPLEMENTED` and nothing is transmitted. Without an answer
    /// before the timeout it is failed with `REQUEST_TIMEOUT`.
    pub fn send_with_reply_timeout(
        &self,
        address: impl Into<String>,
        body: impl Into<Body>,
        handler: Arc<dyn ReplyHandler>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let address = address.into();
        let timeout = timeout
            .or_else(|| handler.timeout())
            .or(self.inner.config.default_reply_timeout);
        let reply_address = format!("{}{}", self.inner.config.reply_prefix, uuid::Uuid::new_v4());

        let (registration, _) =
            self.inner
                .registry
                .register(&reply_address, Endpoint::Reply, None, false, timeout);
        self.inner
            .replies
            .arm(reply_address.clone(), handler, registration.id());
        if let Some(delay) = registration.timeout() {
            let bus = Arc::downgrade(&self.inner);
            let pending = reply_address.clone();
            let target = address.clone();
            let handle = self.inner.timer.schedule(
                delay,
                Box::new(move || {
                    if let Some(bus) = EventBus::upgrade(&bus) {
                        bus.on_reply_timeout(&pending, &target);
                    }
                }),
            );
            self.inner.replies.attach_timer(&reply_address, handle);
        }

        let env = Envelope::new(true, address.as_str(), body).with_reply_address(reply_address.as_str());
        match self.dispatch_send(env, Visibility::Local) {
            Ok(Target::Nowhere) => {
                warn!(target: "eventbus", address = %address, "No handlers for request");
                self.inner.replies.resolve(
                    &self.inner.registry,
                    &reply_address,
                    Outcome::Failed(Failure::new(
                        FailureCode::NOT_IMPLEMENTED,
                        format!("no handlers for address {}", address),
                    )),
                );
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                self.inner
                    .replies
                    .discard(&self.inner.registry, &reply_address);
                Err(e)
            }
        }
    }

    /// Sends and awaits the answer.
    pub async fn request(
        &self,
        address: impl Into<String>,
        body: impl Into<Body>,
        timeout: Option<Duration>,
    ) -> ReplyOutcome {
        let (handler, rx) = ReplyChannel::new(timeout);
        if let Err(e) = self.send_with_reply(address, body, Arc::new(handler)) {
            return Err(Failure::from_error(FailureCode::INTERNAL_ERROR, &e));
        }
        rx.await.unwrap_or_else(|_| {
            Err(Failure::new(
                FailureCode::SERVICE_UNAVAILABLE,
                "reply channel closed",
            ))
        })
    }

    // ------------------------------------------------------------------
    // Cluster seam
    // ------------------------------------------------------------------

    /// Inbound path for frames from remote peers. Local-only handlers are
    /// never targeted and nothing is forwarded again. Returns the number of
    /// local handlers reached.
    pub fn receive_frame(&self, frame: &[u8]) -> Result<usize> {
        let env = Envelope::from_frame(frame)?;
        let address = env.address().to_string();
        debug!(target: "eventbus", address = %address, send = env.is_send(), "Received remote frame");

        if !env.is_send() {
            self.update_stats(&address, |s| s.total_published += 1);
            return Ok(self.publish_local(&env, Visibility::Remote));
        }

        let reply_address = env.reply_address().map(str::to_owned);
        let is_failure = env.is_failure();
        match self.dispatch_send(env, Visibility::Remote)? {
            Target::Nowhere => {
                // The requester's node believed we serve this address.
                if let (Some(reply_address), false) = (reply_address, is_failure) {
                    self.send_envelope(Envelope::new(
                        true,
                        reply_address,
                        Failure::new(
                            FailureCode::NOT_IMPLEMENTED,
                            format!("no handlers for address {}", address),
                        ),
                    ))?;
                }
                Ok(0)
            }
            _ => Ok(1),
        }
    }

    /// Whether this node has a cluster-visible registration on `address`.
    pub fn is_advertised(&self, address: &str) -> bool {
        self.inner.registry.has_cluster_visible(address)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn handler_count(&self, address: &str) -> usize {
        self.inner.registry.handlers_for(address).len()
    }

    pub fn pending_replies(&self) -> usize {
        self.inner.replies.len()
    }

    /// Counters for `address`; `None` unless a handler is registered on it.
    pub fn stats(&self, address: &str) -> Option<BusStats> {
        self.inner.stats.get(address).map(|s| s.clone())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    pub(crate) fn send_envelope(&self, env: Envelope) -> Result<()> {
        let address = env.address().to_string();
        if self.dispatch_send(env, Visibility::Local)? == Target::Nowhere {
            debug!(target: "eventbus", address = %address, "No handlers for send; dropped");
        }
        Ok(())
    }

    fn dispatch_send(&self, env: Envelope, visibility: Visibility) -> Result<Target> {
        let address = env.address().to_string();
        self.update_stats(&address, |s| s.total_sent += 1);

        if let Some(registration) = self.inner.registry.next_for_send(&address, visibility) {
            self.deliver(&registration, env);
            return Ok(Target::Local);
        }
        if visibility == Visibility::Local {
            if let Some(transport) = &self.inner.transport {
                if transport.has_remote(&address) {
                    self.forward(Arc::clone(transport), &env)?;
                    return Ok(Target::Remote);
                }
            }
        }
        self.update_stats(&address, |s| s.no_handlers += 1);
        Ok(Target::Nowhere)
    }

    fn publish_local(&self, env: &Envelope, visibility: Visibility) -> usize {
        self.inner
            .registry
            .visible_handlers(env.address(), visibility)
            .iter()
            .filter(|r| self.deliver(r, env.clone()))
            .count()
    }

    fn deliver(&self, registration: &Registration, env: Envelope) -> bool {
        let address = registration.address().to_string();
        let delivered = match registration.endpoint() {
            Endpoint::Mailbox(tx) => tx.send(Message::new(env, self.clone())).is_ok(),
            Endpoint::Reply => {
                let outcome = if env.is_failure() {
                    Outcome::Failed(match env.into_body() {
                        Some(Body::Failure(failure)) => failure,
                        _ => Failure::new(FailureCode::UNKNOWN, "failure without details"),
                    })
                } else {
                    Outcome::Replied(Message::new(env, self.clone()))
                };
                self.inner
                    .replies
                    .resolve(&self.inner.registry, &address, outcome)
            }
        };
        if delivered {
            self.update_stats(&address, |s| s.total_delivered += 1);
        } else {
            debug!(target: "eventbus", address = %address, handler_id = %registration.id(), "Delivery target gone");
        }
        delivered
    }

    fn forward(&self, transport: Arc<dyn Transport>, env: &Envelope) -> Result<()> {
        let frame = env.to_frame()?;
        let address = env.address().to_string();
        let reply_address = env.reply_address().map(str::to_owned);
        let bus = Arc::downgrade(&self.inner);
        self.update_stats(&address, |s| s.forwarded_remote += 1);

        tokio::spawn(async move {
            let failure = match transport.deliver(&address, frame).await {
                Ok(Delivery::Delivered) => return,
                Ok(Delivery::Absent) => Failure::new(
                    FailureCode::NOT_IMPLEMENTED,
                    format!("no handlers for address {}", address),
                ),
                Err(e) => Failure::from_error(FailureCode::SERVICE_UNAVAILABLE, &e),
            };
            warn!(target: "eventbus", address = %address, reason = failure.reason(), "Remote delivery failed");
            if let (Some(reply_address), Some(bus)) = (reply_address, EventBus::upgrade(&bus)) {
                bus.inner.replies.resolve(
                    &bus.inner.registry,
                    &reply_address,
                    Outcome::Failed(failure),
                );
            }
        });
        Ok(())
    }

    fn on_reply_timeout(&self, reply_address: &str, target: &str) {
        if self
            .inner
            .replies
            .resolve(&self.inner.registry, reply_address, Outcome::TimedOut)
        {
            warn!(target: "eventbus", address = %target, reply_address = %reply_address, "Reply timed out");
            self.update_stats(target, |s| s.reply_timeouts += 1);
        }
    }

    // Update stats helper function. Only addresses with a local
    // registration have an entry; everything else is not counted.
    fn update_stats<F>(&self, address: &str, f: F)
    where
        F: FnOnce(&mut BusStats),
    {
        if let Some(mut stats) = self.inner.stats.get_mut(address) {
            f(stats.value_mut());
        }
    }
}

fn panic_reason(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}
