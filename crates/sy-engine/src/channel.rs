//! Channel: the composed runtime unit for one step
//!
//! `Channel::init` turns a step definition plus the registered cross-cutting
//! services into a single unit, once, when the route is built. Composition
//! order:
//!
//! 1. Resolve the node (child definition if present) and assign its id.
//! 2. Look up instrumentation; it is attached after error handler wiring.
//! 3. Backlog tracer advice first, then the backlog debugger advice.
//! 4. Message history advice, if enabled for the route.
//! 5. Tracing-kind strategies wrap the target, unless tracing is off.
//! 6. Generic strategies wrap the target in `wrapping_order`; the highest
//!    priority ends up outermost.
//! 7. Results without a lifecycle get one; blocking results are bridged
//!    with a warning.
//! 8. Stream caching advice, if enabled.
//! 9. Delay advice, if configured.
//! 10. The error handler, if any, becomes the entry point around the output.
//!
//! Advices run inline around the entry point in the order they were attached.

use std::sync::Arc;

use async_trait::async_trait;
use sy_common::Exchange;
use tracing::{debug, warn};

use crate::advice::AdviceChain;
use crate::debugger::BacklogDebuggerAdvice;
use crate::definition::{NodeDefinition, StepDefinition};
use crate::delay::DelayAdvice;
use crate::error::EngineError;
use crate::history::MessageHistoryAdvice;
use crate::intercept::{wrapping_order, InterceptStrategy, StrategyKind, WrapContext};
use crate::lifecycle::{Service, ServiceState};
use crate::processor::{AsyncProcessor, BlockingBridge, LifecycleWrapper, ManagedProcessor, StepUnit};
use crate::route::RouteContext;
use crate::stream_cache::StreamCachingAdvice;
use crate::tracer::BacklogTracerAdvice;
use crate::Result;

pub struct Channel {
    route_id: String,
    node: NodeDefinition,
    node_id: String,
    next: Arc<dyn ManagedProcessor>,
    output: Arc<dyn ManagedProcessor>,
    error_handler: Option<Arc<dyn ManagedProcessor>>,
    advices: AdviceChain,
    context_scoped: bool,
    state: ServiceState,
}

impl Channel {
    /// Compose one step. `first_in_route` marks the step that records the
    /// route-entry trace event.
    pub fn init(route: &RouteContext<'_>, step: StepDefinition, first_in_route: bool) -> Result<Self> {
        let context = route.context;
        let StepDefinition {
            mut node,
            child,
            processor,
            context_scoped,
        } = step;

        // 1. resolve the traced node and its id
        node.ensure_id(context.node_ids());
        let mut node = match child {
            Some(child) => child,
            None => node,
        };
        let node_id = node.ensure_id(context.node_ids()).to_string();

        let next = processor.into_managed();
        let mut target = next.clone();
        let mut advices = AdviceChain::new();

        // 2. instrumentation is attached after error handler wiring
        let instrumentation = context.instrumentation();

        // 3. backlog tracer first, debugger right after
        let tracer = context.backlog_tracer()?;
        advices.push(Arc::new(BacklogTracerAdvice::new(
            tracer,
            route.route_id.as_str(),
            node_id.as_str(),
            first_in_route,
        )));
        let debugger = context.backlog_debugger()?;
        advices.push(Arc::new(BacklogDebuggerAdvice::new(
            debugger,
            route.route_id.as_str(),
            node_id.as_str(),
        )));

        // 4. message history
        if route.message_history {
            advices.push(Arc::new(MessageHistoryAdvice::new(
                route.route_id.as_str(),
                node_id.as_str(),
            )));
        }

        let strategies: Vec<Arc<dyn InterceptStrategy>> = context
            .intercept_strategies()
            .into_iter()
            .chain(route.intercept_strategies.iter().cloned())
            .collect();
        let wrap_ctx = WrapContext {
            route_id: &route.route_id,
            node: &node,
            node_id: &node_id,
        };

        // 5. tracing-kind strategies
        if context.is_tracing() {
            for strategy in strategies.iter().filter(|s| s.kind() == StrategyKind::Tracing) {
                target = apply_strategy(strategy.as_ref(), &wrap_ctx, target)?;
            }
        }

        // 6 and 7. generic strategies, innermost first
        for strategy in wrapping_order(&strategies) {
            target = apply_strategy(strategy.as_ref(), &wrap_ctx, target)?;
        }

        // 8. stream caching
        let stream_caching = route.stream_caching
            || strategies.iter().any(|s| s.kind() == StrategyKind::StreamCaching);
        if stream_caching {
            advices.push(Arc::new(StreamCachingAdvice));
        }

        // 9. delay
        if let Some(delay) = route.delay.filter(|d| !d.is_zero()) {
            advices.push(Arc::new(DelayAdvice::new(delay)));
        }

        // 10. error handler and deferred instrumentation
        let output = target;
        let error_handler = match &route.error_handler {
            Some(factory) => {
                let handled = match &instrumentation {
                    Some(instr) if factory.supports_redelivery() => {
                        instr.wrap(&route.route_id, &node_id, output.clone())
                    }
                    Some(instr) => {
                        advices.push(instr.advice(&route.route_id, &node_id));
                        output.clone()
                    }
                    None => output.clone(),
                };
                Some(factory.create(&node_id, handled))
            }
            None => {
                if let Some(instr) = &instrumentation {
                    advices.push(instr.advice(&route.route_id, &node_id));
                }
                None
            }
        };

        debug!(
            route_id = %route.route_id,
            node_id = %node_id,
            advices = ?advices.names(),
            error_handler = error_handler.is_some(),
            "Channel composed"
        );

        Ok(Self {
            route_id: route.route_id.clone(),
            node,
            node_id,
            next,
            output,
            error_handler,
            advices,
            context_scoped,
            state: ServiceState::new(),
        })
    }

    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    pub fn node(&self) -> &NodeDefinition {
        &self.node
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The step's own processor, before any wrapping
    pub fn next(&self) -> &Arc<dyn ManagedProcessor> {
        &self.next
    }

    /// The fully wrapped processor
    pub fn output(&self) -> &Arc<dyn ManagedProcessor> {
        &self.output
    }

    pub fn error_handler(&self) -> Option<&Arc<dyn ManagedProcessor>> {
        self.error_handler.as_ref()
    }

    /// What an exchange enters: the error handler if present, else the output
    pub fn entry(&self) -> &Arc<dyn ManagedProcessor> {
        self.error_handler.as_ref().unwrap_or(&self.output)
    }

    pub fn advice_names(&self) -> Vec<&str> {
        self.advices.names()
    }

    pub fn is_context_scoped(&self) -> bool {
        self.context_scoped
    }
}

/// Wrap `target` with one strategy, normalizing the result into a managed
/// processor. A strategy error aborts composition.
fn apply_strategy(
    strategy: &dyn InterceptStrategy,
    ctx: &WrapContext<'_>,
    target: Arc<dyn ManagedProcessor>,
) -> Result<Arc<dyn ManagedProcessor>> {
    let unit = strategy
        .wrap(ctx, target.clone())
        .map_err(|e| EngineError::Composition {
            node_id: ctx.node_id.to_string(),
            reason: format!("intercept strategy '{}' failed: {}", strategy.name(), e),
        })?;

    Ok(match unit {
        StepUnit::Managed(processor) => processor,
        StepUnit::Async(processor) => Arc::new(LifecycleWrapper::new(processor, Some(target))),
        StepUnit::Blocking(processor) => {
            warn!(
                strategy = strategy.name(),
                node_id = %ctx.node_id,
                "Intercept strategy returned a blocking processor, bridging it; the strategy should return an async processor"
            );
            Arc::new(LifecycleWrapper::new(
                Arc::new(BlockingBridge::new(processor)),
                Some(target),
            ))
        }
    })
}

#[async_trait]
impl AsyncProcessor for Channel {
    async fn process(&self, exchange: &mut Exchange) {
        self.advices.run(exchange, self.entry().as_ref()).await
    }
}

#[async_trait]
impl Service for Channel {
    async fn start(&self) -> Result<()> {
        if !self.state.mark_started() {
            return Ok(());
        }
        self.output.start().await?;
        if let Some(handler) = &self.error_handler {
            handler.start().await?;
        }
        Ok(())
    }

    /// Context-scoped channels are shared and keep running
    async fn stop(&self) -> Result<()> {
        if self.context_scoped {
            debug!(node_id = %self.node_id, "Context scoped channel, not stopping");
            return Ok(());
        }
        if !self.state.mark_stopped() {
            return Ok(());
        }
        if let Some(handler) = &self.error_handler {
            handler.stop().await?;
        }
        self.output.stop().await
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(handler) = &self.error_handler {
            handler.stop().await?;
        }
        self.output.stop().await?;
        if let Some(handler) = &self.error_handler {
            handler.shutdown().await?;
        }
        self.output.shutdown().await?;
        self.state.mark_shutdown();
        Ok(())
    }
}
