use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use sy_common::{Exchange, ExchangeFailure, MessageHistoryEntry};

use crate::advice::{Advice, AdviceState};

/// Appends a history entry for the node once it has run
#[derive(Debug, Clone)]
pub struct MessageHistoryAdvice {
    route_id: String,
    node_id: String,
}

impl MessageHistoryAdvice {
    pub fn new(route_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            route_id: route_id.into(),
            node_id: node_id.into(),
        }
    }
}

#[async_trait]
impl Advice for MessageHistoryAdvice {
    fn name(&self) -> &str {
        "message-history"
    }

    async fn before(&self, _exchange: &mut Exchange) -> Result<AdviceState, ExchangeFailure> {
        Ok(Some(Box::new((Utc::now(), Instant::now()))))
    }

    async fn after(&self, exchange: &mut Exchange, state: AdviceState) {
        let Some((timestamp, started)) = state
            .and_then(|s| s.downcast::<(chrono::DateTime<Utc>, Instant)>().ok())
            .map(|s| *s)
        else {
            return;
        };
        exchange.push_history(MessageHistoryEntry {
            route_id: Some(self.route_id.clone()),
            node_id: self.node_id.clone(),
            timestamp,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
    }
}
