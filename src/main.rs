use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use offchain_runtime::chain::{Chain, FilterQuery, InMemoryChain, Log, Subscription};
use offchain_runtime::error::{ChainError, JobError};
use offchain_runtime::job::{Conditional, EthSubscribable, Polling};
use offchain_runtime::worker::LogSink;
use offchain_runtime::{BaseApp, Context, Input, Job, JobKind, RuntimeConfig};

const TOKEN: &str = "0x00000000000000000000000000000000000000aa";
const TRANSFER_TOPIC: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// Reports the chain head on a timer.
struct HeadReporter;

#[async_trait]
impl Job for HeadReporter {
    fn id(&self) -> &str {
        "head-reporter"
    }

    async fn execute(
        &self,
        ctx: &Context,
        _input: Option<Input>,
    ) -> Result<serde_json::Value, JobError> {
        let head = ctx
            .chain()
            .current_block()
            .await
            .map_err(|e| JobError::failed(self.id(), e.to_string()))?;
        Ok(serde_json::json!({ "head": head.number, "hash": head.hash }))
    }
}

impl Polling for HeadReporter {
    fn interval(&self, _ctx: &Context) -> Duration {
        Duration::from_secs(2)
    }
}

/// Fires once the chain reaches a target height.
struct HeightReached {
    target: u64,
}

#[async_trait]
impl Job for HeightReached {
    fn id(&self) -> &str {
        "height-reached"
    }

    async fn execute(
        &self,
        _ctx: &Context,
        _input: Option<Input>,
    ) -> Result<serde_json::Value, JobError> {
        Ok(serde_json::json!({ "reached": self.target }))
    }
}

#[async_trait]
impl Conditional for HeightReached {
    async fn condition(&self, ctx: &Context) -> bool {
        ctx.chain()
            .current_block()
            .await
            .map(|b| b.number >= self.target)
            .unwrap_or(false)
    }
}

/// Watches token transfers.
struct TransferWatcher;

#[async_trait]
impl Job for TransferWatcher {
    fn id(&self) -> &str {
        "transfer-watcher"
    }

    async fn execute(
        &self,
        _ctx: &Context,
        input: Option<Input>,
    ) -> Result<serde_json::Value, JobError> {
        match input {
            Some(Input::Log(log)) => Ok(serde_json::json!({
                "block": log.block_number,
                "tx": log.transaction_hash,
                "bytes": log.data.len(),
            })),
            _ => Err(JobError::failed(self.id(), "expected a log")),
        }
    }
}

#[async_trait]
impl EthSubscribable for TransferWatcher {
    async fn subscribe(
        &self,
        ctx: &Context,
    ) -> Result<(Subscription, mpsc::Receiver<Log>), ChainError> {
        let filter = FilterQuery::new().address(TOKEN).topic(0, TRANSFER_TOPIC);
        ctx.chain().subscribe_filter_logs(filter).await
    }

    async fn unsubscribe(&self, _ctx: &Context) {
        tracing::info!("Transfer watcher unsubscribed");
    }
}

/// Mine a block every second and emit a transfer log on every third one.
fn spawn_block_producer(chain: InMemoryChain) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tick.tick().await;
            let block = chain.push_block().await;
            if block.number % 3 == 0 {
                chain
                    .emit_log(Log {
                        address: TOKEN.to_string(),
                        topics: vec![TRANSFER_TOPIC.to_string()],
                        data: block.number.to_be_bytes().to_vec(),
                        block_number: block.number,
                        transaction_hash: format!("0x{:064x}", block.number),
                        log_index: 0,
                    })
                    .await;
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RuntimeConfig::from_env()?;

    eprintln!("⛓  Offchain runtime v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   App: {}", config.name);
    eprintln!("   Workers: {}", config.workers);
    eprintln!("   Press Ctrl-C to stop.\n");

    let chain = InMemoryChain::new();
    chain.push_block().await;
    let producer = spawn_block_producer(chain.clone());

    let jobs = vec![
        JobKind::polling(HeadReporter),
        JobKind::conditional(HeightReached { target: 5 }),
        JobKind::eth_subscribable(TransferWatcher),
    ];

    let chain: Arc<dyn Chain> = Arc::new(chain);
    let app = BaseApp::new(config, chain, jobs, Arc::new(LogSink));
    app.start().await?;

    tokio::signal::ctrl_c().await?;
    eprintln!();

    app.stop().await;
    producer.abort();
    Ok(())
}
