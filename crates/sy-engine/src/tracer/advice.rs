use std::sync::Arc;

use async_trait::async_trait;
use sy_common::{Exchange, ExchangeFailure};
use sy_config::TracePoint;
use tracing::warn;

use super::BacklogTracer;
use crate::advice::{Advice, AdviceState};

/// Records backlog snapshots for one node.
///
/// With route-entry tracing on, the first node of a route also records an
/// event without a target node, ahead of its own event.
pub struct BacklogTracerAdvice {
    tracer: Arc<BacklogTracer>,
    route_id: String,
    node_id: String,
    first_in_route: bool,
}

impl BacklogTracerAdvice {
    pub fn new(
        tracer: Arc<BacklogTracer>,
        route_id: impl Into<String>,
        node_id: impl Into<String>,
        first_in_route: bool,
    ) -> Self {
        Self {
            tracer,
            route_id: route_id.into(),
            node_id: node_id.into(),
            first_in_route,
        }
    }

    fn capture(&self, exchange: &Exchange) {
        match self
            .tracer
            .should_trace(&self.node_id, Some(&self.route_id), exchange)
        {
            Ok(true) => {
                if self.first_in_route && self.tracer.is_trace_route_entry() {
                    let entry = self.tracer.create_event(Some(&self.route_id), None, exchange);
                    self.tracer.trace_event(entry);
                }
                let event = self
                    .tracer
                    .create_event(Some(&self.route_id), Some(&self.node_id), exchange);
                self.tracer.trace_event(event);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    node_id = %self.node_id,
                    exchange_id = %exchange.id(),
                    error = %e,
                    "Trace filter failed, exchange not traced"
                );
            }
        }
    }
}

#[async_trait]
impl Advice for BacklogTracerAdvice {
    fn name(&self) -> &str {
        "backlog-tracer"
    }

    async fn before(&self, exchange: &mut Exchange) -> Result<AdviceState, ExchangeFailure> {
        if self.tracer.is_enabled() && self.tracer.trace_point() == TracePoint::Before {
            self.capture(exchange);
        }
        Ok(None)
    }

    async fn after(&self, exchange: &mut Exchange, _state: AdviceState) {
        if self.tracer.is_enabled() && self.tracer.trace_point() == TracePoint::After {
            self.capture(exchange);
        }
    }
}
