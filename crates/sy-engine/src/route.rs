//! Routes: ordered steps composed into channels and run as a pipeline

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sy_common::{Body, Exchange};
use tracing::{debug, info};

use crate::channel::Channel;
use crate::context::EngineContext;
use crate::definition::{NodeDefinition, StepDefinition};
use crate::error::EngineError;
use crate::error_handler::ErrorHandlerFactory;
use crate::intercept::InterceptStrategy;
use crate::lifecycle::Service;
use crate::processor::{AsyncProcessor, ManagedProcessor, Pipeline, StepUnit};
use crate::Result;

/// Static description of a route. Settings left unset fall back to the
/// context's `[routes]` defaults.
#[derive(Default)]
pub struct RouteDefinition {
    id: Option<String>,
    steps: Vec<StepDefinition>,
    stream_caching: Option<bool>,
    message_history: Option<bool>,
    delay: Option<Duration>,
    intercept_strategies: Vec<Arc<dyn InterceptStrategy>>,
    error_handler: Option<Arc<dyn ErrorHandlerFactory>>,
}

impl RouteDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Route whose id is assigned from the context's id factory
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Append a step with a generated node id
    pub fn step(self, short_name: &str, processor: StepUnit) -> Self {
        self.add_step(StepDefinition::new(NodeDefinition::new(short_name), processor))
    }

    /// Append a step with an explicit node id
    pub fn step_with_id(self, id: &str, short_name: &str, processor: StepUnit) -> Self {
        self.add_step(StepDefinition::new(
            NodeDefinition::new(short_name).with_id(id),
            processor,
        ))
    }

    pub fn add_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn stream_caching(mut self, enabled: bool) -> Self {
        self.stream_caching = Some(enabled);
        self
    }

    pub fn message_history(mut self, enabled: bool) -> Self {
        self.message_history = Some(enabled);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn intercept_strategy(mut self, strategy: Arc<dyn InterceptStrategy>) -> Self {
        self.intercept_strategies.push(strategy);
        self
    }

    pub fn error_handler(mut self, factory: Arc<dyn ErrorHandlerFactory>) -> Self {
        self.error_handler = Some(factory);
        self
    }
}

/// Resolved route settings handed to every channel of the route
pub struct RouteContext<'a> {
    pub context: &'a EngineContext,
    pub route_id: String,
    pub stream_caching: bool,
    pub message_history: bool,
    pub delay: Option<Duration>,
    pub intercept_strategies: Vec<Arc<dyn InterceptStrategy>>,
    pub error_handler: Option<Arc<dyn ErrorHandlerFactory>>,
}

pub struct Route {
    id: String,
    channels: Vec<Arc<Channel>>,
    pipeline: Pipeline,
}

impl Route {
    /// Compose every step. Any composition error aborts the whole route.
    pub fn build(context: &EngineContext, definition: RouteDefinition) -> Result<Self> {
        let defaults = &context.config().routes;
        let route_id = definition
            .id
            .unwrap_or_else(|| context.node_ids().create_id("route"));

        if definition.steps.is_empty() {
            return Err(EngineError::Composition {
                node_id: route_id,
                reason: "route has no steps".to_string(),
            });
        }

        let route = RouteContext {
            context,
            route_id: route_id.clone(),
            stream_caching: definition.stream_caching.unwrap_or(defaults.stream_caching),
            message_history: definition.message_history.unwrap_or(defaults.message_history),
            delay: definition.delay.or_else(|| defaults.delay()),
            intercept_strategies: definition.intercept_strategies,
            error_handler: definition.error_handler,
        };

        let mut channels = Vec::with_capacity(definition.steps.len());
        for (index, step) in definition.steps.into_iter().enumerate() {
            channels.push(Arc::new(Channel::init(&route, step, index == 0)?));
        }

        let pipeline = Pipeline::new(
            channels
                .iter()
                .map(|c| c.clone() as Arc<dyn ManagedProcessor>)
                .collect(),
        );

        info!(
            route_id = %route_id,
            steps = channels.len(),
            stream_caching = route.stream_caching,
            "Route built"
        );

        Ok(Self {
            id: route_id,
            channels,
            pipeline,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    pub fn channel(&self, node_id: &str) -> Option<&Arc<Channel>> {
        self.channels.iter().find(|c| c.node_id() == node_id)
    }

    pub fn node_ids(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.node_id()).collect()
    }

    /// Run an exchange through the route and hand it back
    pub async fn send(&self, mut exchange: Exchange) -> Exchange {
        self.process(&mut exchange).await;
        exchange
    }

    pub async fn send_body(&self, body: impl Into<Body>) -> Exchange {
        self.send(Exchange::with_body(body)).await
    }
}

#[async_trait]
impl AsyncProcessor for Route {
    async fn process(&self, exchange: &mut Exchange) {
        exchange.set_route_id(self.id.as_str());
        self.pipeline.process(exchange).await;
        debug!(
            route_id = %self.id,
            exchange_id = %exchange.id(),
            failed = exchange.is_failed(),
            "Exchange completed route"
        );
    }
}

#[async_trait]
impl Service for Route {
    async fn start(&self) -> Result<()> {
        self.pipeline.start().await?;
        info!(route_id = %self.id, "Route started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.pipeline.stop().await?;
        info!(route_id = %self.id, "Route stopped");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.pipeline.shutdown().await
    }
}
