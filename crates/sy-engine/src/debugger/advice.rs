use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sy_common::{Exchange, ExchangeFailure};

use super::BacklogDebugger;
use crate::advice::{Advice, AdviceState};

/// Gives the debugger a chance to park the exchange before the node runs
pub struct BacklogDebuggerAdvice {
    debugger: Arc<BacklogDebugger>,
    route_id: String,
    node_id: String,
}

impl BacklogDebuggerAdvice {
    pub fn new(debugger: Arc<BacklogDebugger>, route_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            debugger,
            route_id: route_id.into(),
            node_id: node_id.into(),
        }
    }
}

#[async_trait]
impl Advice for BacklogDebuggerAdvice {
    fn name(&self) -> &str {
        "backlog-debugger"
    }

    async fn before(&self, exchange: &mut Exchange) -> Result<AdviceState, ExchangeFailure> {
        let started = self
            .debugger
            .before_process(exchange, Some(&self.route_id), &self.node_id)
            .await;
        Ok(started.map(|s| Box::new(s) as Box<dyn std::any::Any + Send>))
    }

    async fn after(&self, exchange: &mut Exchange, state: AdviceState) {
        if let Some(started) = state.and_then(|s| s.downcast::<Instant>().ok()) {
            self.debugger.after_process(exchange, &self.node_id, *started);
        }
    }
}
