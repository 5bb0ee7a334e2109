//! Chain-access boundary.
//!
//! The runtime only needs to read blocks and subscribe to filtered logs.
//! Transports live behind these traits; [`memory::InMemoryChain`] is the
//! in-process implementation used by tests and the demo binary.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ChainError;

pub use memory::InMemoryChain;

/// A block header, reduced to what jobs typically need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    /// Unix seconds.
    pub timestamp: u64,
}

/// An emitted contract log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub address: String,
    pub topics: Vec<String>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub transaction_hash: String,
    pub log_index: u64,
}

/// Log filter for subscriptions.
///
/// Empty `addresses` matches any emitter. `topics` is positional: an empty
/// set at position `i` is a wildcard, otherwise the log's `i`-th topic must
/// be one of the listed values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterQuery {
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub addresses: Vec<String>,
    pub topics: Vec<Vec<String>>,
}

impl FilterQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.addresses.push(address.into());
        self
    }

    pub fn topic(mut self, position: usize, value: impl Into<String>) -> Self {
        if self.topics.len() <= position {
            self.topics.resize(position + 1, Vec::new());
        }
        self.topics[position].push(value.into());
        self
    }

    pub fn from_block(mut self, number: u64) -> Self {
        self.from_block = Some(number);
        self
    }

    pub fn to_block(mut self, number: u64) -> Self {
        self.to_block = Some(number);
        self
    }

    /// Whether `log` passes this filter.
    pub fn matches(&self, log: &Log) -> bool {
        if self.from_block.is_some_and(|from| log.block_number < from) {
            return false;
        }
        if self.to_block.is_some_and(|to| log.block_number > to) {
            return false;
        }
        if !self.addresses.is_empty()
            && !self
                .addresses
                .iter()
                .any(|a| a.eq_ignore_ascii_case(&log.address))
        {
            return false;
        }
        self.topics
            .iter()
            .enumerate()
            .all(|(i, wanted)| match log.topics.get(i) {
                _ if wanted.is_empty() => true,
                Some(topic) => wanted.iter().any(|w| w.eq_ignore_ascii_case(topic)),
                None => false,
            })
    }
}

/// Read access to chain state.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn current_block(&self) -> Result<Block, ChainError>;

    async fn block_by_number(&self, number: u64) -> Result<Block, ChainError>;
}

/// Push access to chain events.
#[async_trait]
pub trait ChainSubscriber: Send + Sync {
    /// Subscribe to logs matching `filter`. Matching logs arrive on the
    /// returned receiver; transport failures arrive on [`Subscription::err`].
    async fn subscribe_filter_logs(
        &self,
        filter: FilterQuery,
    ) -> Result<(Subscription, mpsc::Receiver<Log>), ChainError>;
}

/// Everything the runtime needs from a chain client. Implementations must be
/// safe for concurrent use by many jobs.
pub trait Chain: ChainReader + ChainSubscriber {}

impl<T: ChainReader + ChainSubscriber + ?Sized> Chain for T {}

/// Consumer half of a live subscription.
#[derive(Debug)]
pub struct Subscription {
    errors: mpsc::Receiver<ChainError>,
    closed: CancellationToken,
}

/// Producer half of a subscription, held by the chain client.
#[derive(Debug, Clone)]
pub struct SubscriptionFeed {
    errors: mpsc::Sender<ChainError>,
    closed: CancellationToken,
}

impl Subscription {
    /// Create a connected subscription/feed pair.
    pub fn pair() -> (Subscription, SubscriptionFeed) {
        let (tx, rx) = mpsc::channel(1);
        let closed = CancellationToken::new();
        (
            Subscription {
                errors: rx,
                closed: closed.clone(),
            },
            SubscriptionFeed { errors: tx, closed },
        )
    }

    /// Resolves with the next subscription error. Never resolves if the
    /// feed goes away without reporting one.
    pub async fn err(&mut self) -> ChainError {
        match self.errors.recv().await {
            Some(err) => err,
            None => std::future::pending().await,
        }
    }

    /// Tear the subscription down. Idempotent.
    pub fn unsubscribe(&self) {
        self.closed.cancel();
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl SubscriptionFeed {
    /// Report a transport failure. Only the first pending error is kept.
    pub fn fail(&self, err: ChainError) {
        let _ = self.errors.try_send(err);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the consumer unsubscribes or drops the subscription.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}
