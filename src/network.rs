//! Inbound message boundary
//!
//! The P2P collaborator hands raw `block`, `tx` and `headers` payloads to a
//! bounded queue drained by a small pool of worker threads. Every message
//! produces a [`ProcessedMessage`] on the outcome channel, carrying the
//! verdict and whether the sending peer should be penalized. Workers only
//! call the public `ChainState` API, so all state changes stay serialized
//! behind its lock.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::chainstate::{AcceptResult, ChainState};
use crate::error::ConsensusError;
use crate::storage::BlockStore;

pub type PeerId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Serialized block
    Block(Vec<u8>),
    /// Serialized transaction
    Transaction(Vec<u8>),
    /// Serialized `headers` payload: a count followed by 80-byte headers
    Headers(Vec<u8>),
}

impl InboundMessage {
    pub fn command(&self) -> &'static str {
        match self {
            InboundMessage::Block(_) => "block",
            InboundMessage::Transaction(_) => "tx",
            InboundMessage::Headers(_) => "headers",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Accepted(AcceptResult),
    HeadersAccepted(usize),
    Rejected(ConsensusError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedMessage {
    pub peer: PeerId,
    pub command: &'static str,
    pub outcome: MessageOutcome,
    /// The peer sent data that can never become valid
    pub penalize: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("inbound queue is full")]
    QueueFull,
    #[error("message processor has shut down")]
    Disconnected,
}

/// Run one message against the chain state on the calling thread
pub fn handle_message<S: BlockStore>(
    chain: &ChainState<S>,
    peer: PeerId,
    message: InboundMessage,
) -> ProcessedMessage {
    let command = message.command();
    let result = match &message {
        InboundMessage::Block(bytes) => chain.submit_block(bytes).map(MessageOutcome::Accepted),
        InboundMessage::Transaction(bytes) => {
            chain.submit_transaction(bytes).map(MessageOutcome::Accepted)
        }
        InboundMessage::Headers(bytes) => {
            chain.submit_headers(bytes).map(MessageOutcome::HeadersAccepted)
        }
    };
    match result {
        Ok(outcome) => {
            debug!(peer, command, "processed message");
            ProcessedMessage {
                peer,
                command,
                outcome,
                penalize: false,
            }
        }
        Err(e) => {
            if e.is_fatal() {
                error!(peer, command, reason = %e, "message hit a halted chain state");
            } else {
                debug!(peer, command, reason = %e, "message rejected");
            }
            ProcessedMessage {
                peer,
                command,
                penalize: e.should_penalize_peer(),
                outcome: MessageOutcome::Rejected(e),
            }
        }
    }
}

/// Bounded queue of inbound messages served by worker threads
#[derive(Debug)]
pub struct MessageProcessor {
    sender: Option<Sender<(PeerId, InboundMessage)>>,
    outcomes: Receiver<ProcessedMessage>,
    workers: Vec<JoinHandle<()>>,
}

impl MessageProcessor {
    pub fn start<S: BlockStore + 'static>(
        chain: Arc<ChainState<S>>,
        workers: usize,
        queue_capacity: usize,
    ) -> Self {
        let (sender, inbound) = bounded::<(PeerId, InboundMessage)>(queue_capacity.max(1));
        let (outcome_sender, outcomes) = unbounded();

        let handles = (0..workers.max(1))
            .filter_map(|i| {
                let chain = Arc::clone(&chain);
                let inbound = inbound.clone();
                let outcome_sender = outcome_sender.clone();
                let spawned = thread::Builder::new()
                    .name(format!("msg-worker-{}", i))
                    .spawn(move || {
                        for (peer, message) in inbound.iter() {
                            let processed = handle_message(&chain, peer, message);
                            if outcome_sender.send(processed).is_err() {
                                break;
                            }
                        }
                    });
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        warn!(worker = i, reason = %e, "failed to spawn message worker");
                        None
                    }
                }
            })
            .collect();

        Self {
            sender: Some(sender),
            outcomes,
            workers: handles,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue a message without blocking; a full queue is reported back so
    /// the caller can slow the peer down
    pub fn submit(&self, peer: PeerId, message: InboundMessage) -> Result<(), SubmitError> {
        let sender = self.sender.as_ref().ok_or(SubmitError::Disconnected)?;
        sender.try_send((peer, message)).map_err(|e| match e {
            TrySendError::Full(_) => SubmitError::QueueFull,
            TrySendError::Disconnected(_) => SubmitError::Disconnected,
        })
    }

    /// Queue a message, waiting for room
    pub fn submit_blocking(&self, peer: PeerId, message: InboundMessage) -> Result<(), SubmitError> {
        let sender = self.sender.as_ref().ok_or(SubmitError::Disconnected)?;
        sender
            .send((peer, message))
            .map_err(|_| SubmitError::Disconnected)
    }

    pub fn outcomes(&self) -> &Receiver<ProcessedMessage> {
        &self.outcomes
    }

    /// Stop accepting messages, let workers drain the queue and wait for
    /// them. Returns the outcomes nobody has read yet.
    pub fn shutdown(mut self) -> Vec<ProcessedMessage> {
        self.sender = None;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("message worker panicked");
            }
        }
        self.outcomes.try_iter().collect()
    }
}

impl Drop for MessageProcessor {
    fn drop(&mut self) {
        self.sender = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
