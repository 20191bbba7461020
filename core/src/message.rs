// Messages as delivered to handlers
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::EventBus;
use crate::codec::{Body, Envelope};
use crate::failure::Failure;
use crate::handler::ReplyHandler;
use crate::{BusError, Result};

/// A delivered message, as seen by a handler.
///
/// Carries the envelope plus a handle to the bus it arrived on, so the
/// receiver can answer with [`reply`](Message::reply) or
/// [`fail`](Message::fail).
#[derive(Clone)]
pub struct Message {
    envelope: Envelope,
    bus: EventBus,
}

impl Message {
    pub(crate) fn new(envelope: Envelope, bus: EventBus) -> Self {
        Self { envelope, bus }
    }

    pub fn address(&self) -> &str {
        self.envelope.address()
    }

    pub fn reply_address(&self) -> Option<&str> {
        self.envelope.reply_address()
    }

    pub fn is_send(&self) -> bool {
        self.envelope.is_send()
    }

    pub fn body(&self) -> Option<&Body> {
        self.envelope.body()
    }

    pub fn into_body(self) -> Option<Body> {
        self.envelope.into_body()
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Answers the sender. Silently dropped by the sender's bus if the
    /// exchange already resolved (e.g. timed out).
    pub fn reply(&self, body: impl Into<Body>) -> Result<()> {
        let reply = self.envelope.reply_envelope(body)?;
        self.bus.send_envelope(reply)
    }

    /// Answers the sender and expects an answer to the answer.
    pub fn reply_with_handler(
        &self,
        body: impl Into<Body>,
        handler: Arc<dyn ReplyHandler>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if self.envelope.is_failure() {
            return Err(BusError::UnsupportedOperation(
                "cannot reply to a failure".into(),
            ));
        }
        let address = self.reply_address().ok_or(BusError::NoReplyAddress)?;
        self.bus
            .send_with_reply_timeout(address, body, handler, timeout)
    }

    /// Signals an explicit failure to the sender; it arrives through the
    /// sender's `ReplyHandler::fail`.
    pub fn fail(&self, failure: Failure) -> Result<()> {
        let reply = self.envelope.reply_envelope(failure)?;
        self.bus.send_envelope(reply)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("envelope", &self.envelope)
            .finish()
    }
}
