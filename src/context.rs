//! Ambient execution context shared by drivers and execution units.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chain::Chain;
use crate::logger::Logger;

/// Cancellation signal, chain handle and logger for a running job set.
///
/// One root context is built per application run. Every execution unit gets
/// its own child derived from it via [`Context::derive`], so cancelling the
/// root cancels all activations while an activation can be cancelled alone.
#[derive(Clone)]
pub struct Context {
    cancel: CancellationToken,
    chain: Arc<dyn Chain>,
    logger: Logger,
    activation: Option<Uuid>,
}

impl Context {
    /// Create a root context.
    pub fn new(chain: Arc<dyn Chain>, logger: Logger) -> Self {
        Self {
            cancel: CancellationToken::new(),
            chain,
            logger,
            activation: None,
        }
    }

    /// Derive a child scoped to one activation.
    pub fn derive(&self, activation: Uuid) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            chain: Arc::clone(&self.chain),
            logger: self.logger.with(format!("unit-{activation}")),
            activation: Some(activation),
        }
    }

    /// Same context with a different logging scope.
    pub fn with_logger(&self, logger: Logger) -> Self {
        Self {
            logger,
            ..self.clone()
        }
    }

    pub fn chain(&self) -> &Arc<dyn Chain> {
        &self.chain
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// The activation this context was derived for, if any.
    pub fn activation(&self) -> Option<Uuid> {
        self.activation
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once this context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("namespace", &self.logger.namespace())
            .field("activation", &self.activation)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
