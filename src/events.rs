//! Relay events for the P2P collaborator

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::types::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    /// The active tip moved
    NewTip { hash: Hash, height: Natural },
    BlockConnected { hash: Hash, height: Natural },
    /// A block left the active chain during a reorganization
    BlockDisconnected { hash: Hash, height: Natural },
    /// A transaction entered the mempool and should be relayed
    TransactionAccepted { txid: Hash },
    /// A transaction left the mempool without being mined
    TransactionRemoved { txid: Hash, reason: RemovalReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Conflict,
    Replaced,
    Evicted,
    Reorg,
}

/// Fan-out of events to every live subscriber. Subscribers whose receiver
/// was dropped are forgotten on the next publish.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<ChainEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<ChainEvent> {
        let (sender, receiver) = unbounded();
        self.subscribers.lock().push(sender);
        receiver
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn publish(&self, event: ChainEvent) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = ChainEvent>) {
        for event in events {
            self.publish(event);
        }
    }
}
