//! Inline before/after hooks around a composed step
//!
//! Advices run in registration order before the step and in reverse order
//! after it. Only advices whose `before` succeeded get their `after` called.
//! A failing `before` records the failure on the exchange and skips the step.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use sy_common::{Exchange, ExchangeFailure};
use tracing::debug;

use crate::processor::ManagedProcessor;

/// State handed from an advice's `before` to its `after`
pub type AdviceState = Option<Box<dyn Any + Send>>;

#[async_trait]
pub trait Advice: Send + Sync {
    fn name(&self) -> &str;

    async fn before(&self, exchange: &mut Exchange) -> Result<AdviceState, ExchangeFailure>;

    async fn after(&self, _exchange: &mut Exchange, _state: AdviceState) {}
}

#[derive(Default, Clone)]
pub struct AdviceChain {
    advices: Vec<Arc<dyn Advice>>,
}

impl AdviceChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, advice: Arc<dyn Advice>) {
        self.advices.push(advice);
    }

    pub fn len(&self) -> usize {
        self.advices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.advices.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.advices.iter().map(|a| a.name()).collect()
    }

    /// Run the befores, the target and the afters for one exchange
    pub async fn run(&self, exchange: &mut Exchange, target: &dyn ManagedProcessor) {
        let mut entered: Vec<(&Arc<dyn Advice>, AdviceState)> =
            Vec::with_capacity(self.advices.len());
        let mut proceed = true;

        for advice in &self.advices {
            match advice.before(exchange).await {
                Ok(state) => entered.push((advice, state)),
                Err(failure) => {
                    debug!(
                        advice = advice.name(),
                        exchange_id = %exchange.id(),
                        error = %failure,
                        "Advice failed before step, skipping target"
                    );
                    exchange.set_failure(failure);
                    proceed = false;
                    break;
                }
            }
        }

        if proceed {
            target.process(exchange).await;
        }

        while let Some((advice, state)) = entered.pop() {
            advice.after(exchange, state).await;
        }
    }
}
