//! Intercept strategies
//!
//! A strategy wraps the processor of every step it is applied to. Strategies
//! come from the context (all routes) and from a route (its steps only).
//! Generic strategies are applied in `wrapping_order`, so that the one with the
//! highest priority ends up outermost and observes the exchange first.

use std::sync::Arc;

use async_trait::async_trait;
use sy_common::Exchange;
use tracing::info;

use crate::definition::NodeDefinition;
use crate::lifecycle::Service;
use crate::processor::{AsyncProcessor, ManagedProcessor, StepUnit};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Applied in the generic, priority-ordered pass
    Custom,
    /// Applied before the generic pass; skipped when context tracing is off
    Tracing,
    /// Marker that turns on stream caching; never applied as a wrapper
    StreamCaching,
}

/// What a strategy is told about the node it wraps
#[derive(Debug, Clone, Copy)]
pub struct WrapContext<'a> {
    pub route_id: &'a str,
    pub node: &'a NodeDefinition,
    pub node_id: &'a str,
}

pub trait InterceptStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Higher priority wraps outermost
    fn priority(&self) -> i32 {
        0
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Custom
    }

    fn wrap(&self, ctx: &WrapContext<'_>, target: Arc<dyn ManagedProcessor>) -> Result<StepUnit>;
}

/// Generic strategies in the order they are applied, innermost first.
///
/// Ascending priority; on equal priority the later-registered strategy is
/// applied first so that registration order is preserved from the outside.
pub fn wrapping_order(strategies: &[Arc<dyn InterceptStrategy>]) -> Vec<Arc<dyn InterceptStrategy>> {
    let mut ordered: Vec<(usize, &Arc<dyn InterceptStrategy>)> = strategies
        .iter()
        .enumerate()
        .filter(|(_, s)| s.kind() == StrategyKind::Custom)
        .collect();
    ordered.sort_by(|(ia, a), (ib, b)| a.priority().cmp(&b.priority()).then(ib.cmp(ia)));
    ordered.into_iter().map(|(_, s)| s.clone()).collect()
}

// ============================================================================
// Trace Log Strategy
// ============================================================================

/// Tracing-kind strategy that logs every exchange entering a node
#[derive(Debug, Default)]
pub struct TraceLogStrategy;

impl InterceptStrategy for TraceLogStrategy {
    fn name(&self) -> &str {
        "trace-log"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Tracing
    }

    fn wrap(&self, ctx: &WrapContext<'_>, target: Arc<dyn ManagedProcessor>) -> Result<StepUnit> {
        Ok(StepUnit::managed(TraceLogInterceptor {
            route_id: ctx.route_id.to_string(),
            node_id: ctx.node_id.to_string(),
            target,
        }))
    }
}

struct TraceLogInterceptor {
    route_id: String,
    node_id: String,
    target: Arc<dyn ManagedProcessor>,
}

#[async_trait]
impl AsyncProcessor for TraceLogInterceptor {
    async fn process(&self, exchange: &mut Exchange) {
        info!(
            route_id = %self.route_id,
            node_id = %self.node_id,
            exchange_id = %exchange.id(),
            body_type = exchange.message().body().type_name(),
            "Exchange entering node"
        );
        self.target.process(exchange).await
    }
}

#[async_trait]
impl Service for TraceLogInterceptor {
    async fn start(&self) -> Result<()> {
        self.target.start().await
    }

    async fn stop(&self) -> Result<()> {
        self.target.stop().await
    }

    async fn shutdown(&self) -> Result<()> {
        self.target.shutdown().await
    }
}
