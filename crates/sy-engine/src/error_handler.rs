//! Error handlers
//!
//! An error handler wraps a node's composed output and becomes the channel's
//! entry point. Handlers that support redelivery run the output again after
//! a failure; metrics instrumentation is then placed inside the handler so
//! that every attempt is measured.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sy_common::Exchange;
use tracing::{error, warn};

use crate::lifecycle::{Service, ServiceState};
use crate::processor::{AsyncProcessor, ManagedProcessor};
use crate::Result;

/// Exchange property holding the number of redelivery attempts made
pub const REDELIVERY_COUNTER: &str = "SwitchyardRedeliveryCounter";

pub trait ErrorHandlerFactory: Send + Sync {
    fn supports_redelivery(&self) -> bool;

    fn create(&self, node_id: &str, output: Arc<dyn ManagedProcessor>) -> Arc<dyn ManagedProcessor>;
}

// ============================================================================
// Logging
// ============================================================================

/// Logs failed exchanges and leaves the failure in place
#[derive(Debug, Default)]
pub struct LoggingErrorHandlerFactory;

impl ErrorHandlerFactory for LoggingErrorHandlerFactory {
    fn supports_redelivery(&self) -> bool {
        false
    }

    fn create(&self, node_id: &str, output: Arc<dyn ManagedProcessor>) -> Arc<dyn ManagedProcessor> {
        Arc::new(LoggingErrorHandler {
            node_id: node_id.to_string(),
            output,
            state: ServiceState::new(),
        })
    }
}

struct LoggingErrorHandler {
    node_id: String,
    output: Arc<dyn ManagedProcessor>,
    state: ServiceState,
}

#[async_trait]
impl AsyncProcessor for LoggingErrorHandler {
    async fn process(&self, exchange: &mut Exchange) {
        self.output.process(exchange).await;
        if let Some(failure) = exchange.failure() {
            error!(
                node_id = %self.node_id,
                exchange_id = %exchange.id(),
                kind = %failure.kind,
                error = %failure.message,
                "Exchange failed"
            );
        }
    }
}

#[async_trait]
impl Service for LoggingErrorHandler {
    async fn start(&self) -> Result<()> {
        self.state.mark_started();
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.state.mark_stopped();
        Ok(())
    }
}

// ============================================================================
// Redelivery
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    pub max_redeliveries: u32,
    pub redelivery_delay: Duration,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_redeliveries: 3,
            redelivery_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Default)]
pub struct RedeliveryErrorHandlerFactory {
    policy: RedeliveryPolicy,
}

impl RedeliveryErrorHandlerFactory {
    pub fn new(policy: RedeliveryPolicy) -> Self {
        Self { policy }
    }
}

impl ErrorHandlerFactory for RedeliveryErrorHandlerFactory {
    fn supports_redelivery(&self) -> bool {
        true
    }

    fn create(&self, node_id: &str, output: Arc<dyn ManagedProcessor>) -> Arc<dyn ManagedProcessor> {
        Arc::new(RedeliveryErrorHandler {
            node_id: node_id.to_string(),
            policy: self.policy,
            output,
            state: ServiceState::new(),
        })
    }
}

struct RedeliveryErrorHandler {
    node_id: String,
    policy: RedeliveryPolicy,
    output: Arc<dyn ManagedProcessor>,
    state: ServiceState,
}

#[async_trait]
impl AsyncProcessor for RedeliveryErrorHandler {
    async fn process(&self, exchange: &mut Exchange) {
        let mut attempt = 0u32;
        loop {
            self.output.process(exchange).await;
            let Some(failure) = exchange.failure() else {
                return;
            };

            if attempt >= self.policy.max_redeliveries {
                error!(
                    node_id = %self.node_id,
                    exchange_id = %exchange.id(),
                    attempts = attempt + 1,
                    error = %failure,
                    "Exchange failed after redeliveries exhausted"
                );
                return;
            }

            attempt += 1;
            warn!(
                node_id = %self.node_id,
                exchange_id = %exchange.id(),
                attempt,
                max = self.policy.max_redeliveries,
                error = %failure,
                "Redelivering failed exchange"
            );
            exchange.take_failure();
            exchange.set_property(REDELIVERY_COUNTER, attempt);
            tokio::time::sleep(self.policy.redelivery_delay).await;
        }
    }
}

#[async_trait]
impl Service for RedeliveryErrorHandler {
    async fn start(&self) -> Result<()> {
        self.state.mark_started();
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.state.mark_stopped();
        Ok(())
    }
}
