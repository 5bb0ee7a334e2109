//! In-process chain used by tests and the demo binary.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

use super::{Block, ChainReader, ChainSubscriber, FilterQuery, Log, Subscription, SubscriptionFeed};
use crate::error::ChainError;

/// Buffered logs per subscriber before `emit_log` starts waiting.
const SUBSCRIBER_BUFFER: usize = 64;

struct Subscriber {
    filter: FilterQuery,
    logs: mpsc::Sender<Log>,
    feed: SubscriptionFeed,
}

/// A chain held entirely in memory. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct InMemoryChain {
    blocks: Arc<RwLock<Vec<Block>>>,
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl InMemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next block and return it.
    pub async fn push_block(&self) -> Block {
        let mut blocks = self.blocks.write().await;
        let number = blocks.last().map(|b| b.number + 1).unwrap_or(0);
        let parent_hash = blocks
            .last()
            .map(|b| b.hash.clone())
            .unwrap_or_else(|| format!("0x{:064x}", 0));
        let block = Block {
            number,
            hash: format!("0x{:064x}", number + 1),
            parent_hash,
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
        };
        blocks.push(block.clone());
        block
    }

    /// Deliver `log` to every live subscriber whose filter matches.
    /// Returns the number of subscribers it was delivered to.
    pub async fn emit_log(&self, log: Log) -> usize {
        self.prune().await;
        // Sends may wait on a full buffer; don't hold the lock across them.
        let targets: Vec<mpsc::Sender<Log>> = self
            .subscribers
            .read()
            .await
            .iter()
            .filter(|s| s.filter.matches(&log))
            .map(|s| s.logs.clone())
            .collect();
        let mut delivered = 0;
        for logs in targets {
            if logs.send(log.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        debug!(delivered, block = log.block_number, "Emitted log");
        delivered
    }

    /// Push `err` to every live subscription, simulating a transport failure.
    pub async fn fail_subscriptions(&self, err: ChainError) {
        let subscribers = self.subscribers.read().await;
        for sub in subscribers.iter().filter(|s| !s.feed.is_closed()) {
            sub.feed.fail(err.clone());
        }
        warn!(error = %err, count = subscribers.len(), "Failed subscriptions");
    }

    /// Number of subscriptions that have not been torn down.
    pub async fn live_subscriptions(&self) -> usize {
        self.subscribers
            .read()
            .await
            .iter()
            .filter(|s| !s.feed.is_closed())
            .count()
    }

    async fn prune(&self) {
        self.subscribers
            .write()
            .await
            .retain(|s| !s.feed.is_closed() && !s.logs.is_closed());
    }
}

#[async_trait]
impl ChainReader for InMemoryChain {
    async fn current_block(&self) -> Result<Block, ChainError> {
        self.blocks
            .read()
            .await
            .last()
            .cloned()
            .ok_or(ChainError::BlockNotFound { number: 0 })
    }

    async fn block_by_number(&self, number: u64) -> Result<Block, ChainError> {
        self.blocks
            .read()
            .await
            .iter()
            .find(|b| b.number == number)
            .cloned()
            .ok_or(ChainError::BlockNotFound { number })
    }
}

#[async_trait]
impl ChainSubscriber for InMemoryChain {
    async fn subscribe_filter_logs(
        &self,
        filter: FilterQuery,
    ) -> Result<(Subscription, mpsc::Receiver<Log>), ChainError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let (subscription, feed) = Subscription::pair();
        self.subscribers.write().await.push(Subscriber {
            filter,
            logs: tx,
            feed,
        });
        Ok((subscription, rx))
    }
}
