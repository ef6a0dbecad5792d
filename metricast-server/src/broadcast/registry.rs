use std::{collections::HashMap, fmt, sync::Arc};

use metricast_proto::Payload;
use tokio::sync::{
    Mutex,
    mpsc::{self, error::TrySendError},
};
use tracing::debug;

/// Handle returned by [`SubscriberRegistry::attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    #[error("subscriber is not keeping up with the stream")]
    Lagging,
    #[error("subscriber connection is closed")]
    Closed,
}

/// Outbound side of one attached viewer.
///
/// `write` is called with the registry lock held and must never wait.
pub trait Subscriber: Send {
    fn write(&mut self, payload: &Payload) -> Result<(), WriteError>;

    /// Called once, right before the registry forgets the subscriber.
    fn close(&mut self) {}
}

#[derive(Default)]
struct Members {
    next_id: u64,
    subscribers: HashMap<SubscriberId, Box<dyn Subscriber>>,
}

/// The set of currently attached subscribers.
///
/// Attach, detach and delivery all take the same lock, so a delivery always
/// sees one consistent membership.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    members: Arc<Mutex<Members>>,
}

impl fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberRegistry").finish_non_exhaustive()
    }
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, subscriber: Box<dyn Subscriber>) -> SubscriberId {
        let mut members = self.members.lock().await;
        let id = SubscriberId(members.next_id);
        members.next_id += 1;
        members.subscribers.insert(id, subscriber);
        debug!(subscriber = %id, total = members.subscribers.len(), "subscriber attached");
        id
    }

    /// Remove a subscriber. Returns `false` if it was already gone.
    pub async fn detach(&self, id: SubscriberId) -> bool {
        let mut members = self.members.lock().await;
        match members.subscribers.remove(&id) {
            Some(mut subscriber) => {
                subscriber.close();
                debug!(subscriber = %id, total = members.subscribers.len(), "subscriber detached");
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.members.lock().await.subscribers.len()
    }

    #[cfg(test)]
    pub async fn contains(&self, id: SubscriberId) -> bool {
        self.members.lock().await.subscribers.contains_key(&id)
    }

    /// Write `payload` to every subscriber, closing and removing each one
    /// whose write fails. Returns how many subscribers accepted it.
    pub async fn deliver(&self, payload: &Payload) -> usize {
        let mut members = self.members.lock().await;
        let mut delivered = 0;
        members
            .subscribers
            .retain(|id, subscriber| match subscriber.write(payload) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(e) => {
                    debug!(subscriber = %id, error = %e, "removing subscriber");
                    subscriber.close();
                    false
                }
            });
        delivered
    }

    /// Close and forget every subscriber.
    pub async fn close_all(&self) -> usize {
        let mut members = self.members.lock().await;
        let closed = members.subscribers.len();
        for (_, mut subscriber) in members.subscribers.drain() {
            subscriber.close();
        }
        closed
    }
}

/// A subscriber backed by a bounded queue drained by its connection task.
///
/// A full queue means the viewer is too slow and counts as a failed write.
#[derive(Debug)]
pub struct ChannelSubscriber {
    tx: Option<mpsc::Sender<Payload>>,
}

impl ChannelSubscriber {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx: Some(tx) }, rx)
    }
}

impl Subscriber for ChannelSubscriber {
    fn write(&mut self, payload: &Payload) -> Result<(), WriteError> {
        let tx = self.tx.as_ref().ok_or(WriteError::Closed)?;
        tx.try_send(payload.clone()).map_err(|e| match e {
            TrySendError::Full(_) => WriteError::Lagging,
            TrySendError::Closed(_) => WriteError::Closed,
        })
    }

    fn close(&mut self) {
        // dropping the sender ends the connection's receive loop
        self.tx = None;
    }
}
