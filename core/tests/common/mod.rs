#![allow(dead_code)]

use async_trait::async_trait;
use loom_eventbus::{Failure, Handler, Message, ReplyHandler, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Forwards every delivered message into a channel.
pub struct Collect {
    tx: mpsc::UnboundedSender<Message>,
}

pub fn collector() -> (Arc<Collect>, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Collect { tx }), rx)
}

#[async_trait]
impl Handler for Collect {
    async fn handle(&self, msg: Message) -> Result<()> {
        let _ = self.tx.send(msg);
        Ok(())
    }
}

/// Replies with the received body after `delay`.
pub struct Echo {
    pub delay: Duration,
}

#[async_trait]
impl Handler for Echo {
    async fn handle(&self, msg: Message) -> Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(body) = msg.body().cloned() {
            msg.reply(body)?;
        }
        Ok(())
    }
}

/// Counts reply-side callbacks and forwards them into a channel.
#[derive(Default)]
pub struct Outcomes {
    pub handled: AtomicUsize,
    pub failed: AtomicUsize,
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<std::result::Result<Message, Failure>>>>,
}

impl Outcomes {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<std::result::Result<Message, Failure>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let outcomes = Outcomes {
            tx: std::sync::Mutex::new(Some(tx)),
            ..Default::default()
        };
        (Arc::new(outcomes), rx)
    }

    pub fn total(&self) -> usize {
        self.handled.load(Ordering::SeqCst) + self.failed.load(Ordering::SeqCst)
    }

    fn forward(&self, outcome: std::result::Result<Message, Failure>) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(outcome);
        }
    }
}

#[async_trait]
impl ReplyHandler for Outcomes {
    async fn handle(&self, reply: Message) -> Result<()> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        self.forward(Ok(reply));
        Ok(())
    }

    async fn fail(&self, failure: Failure) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.forward(Err(failure));
    }
}

pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timeout")
        .expect("channel closed")
}
