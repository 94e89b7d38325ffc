//! Per-step metrics through the `metrics` facade
//!
//! Nothing is recorded unless the process installs a recorder (the dev
//! binary installs the Prometheus exporter).

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use sy_common::{Exchange, ExchangeFailure};

use crate::advice::{Advice, AdviceState};
use crate::lifecycle::Service;
use crate::processor::{AsyncProcessor, ManagedProcessor};
use crate::Result;

pub const STEP_EXCHANGES_TOTAL: &str = "switchyard_step_exchanges_total";
pub const STEP_FAILURES_TOTAL: &str = "switchyard_step_failures_total";
pub const STEP_DURATION_SECONDS: &str = "switchyard_step_duration_seconds";

/// Register metric descriptions with the installed recorder
pub fn describe_metrics() {
    describe_counter!(STEP_EXCHANGES_TOTAL, "Exchanges processed per route step");
    describe_counter!(STEP_FAILURES_TOTAL, "Exchanges that left a route step failed");
    describe_histogram!(STEP_DURATION_SECONDS, "Time spent in a route step, seconds");
}

/// Produces the instrumentation for one node: an inline advice, or a
/// wrapping processor when it has to sit inside a redelivering handler
pub trait InstrumentationStrategy: Send + Sync {
    fn advice(&self, route_id: &str, node_id: &str) -> Arc<dyn Advice>;

    fn wrap(&self, route_id: &str, node_id: &str, target: Arc<dyn ManagedProcessor>) -> Arc<dyn ManagedProcessor>;
}

#[derive(Debug, Default)]
pub struct MetricsInstrumentation;

impl InstrumentationStrategy for MetricsInstrumentation {
    fn advice(&self, route_id: &str, node_id: &str) -> Arc<dyn Advice> {
        Arc::new(InstrumentationAdvice {
            metrics: StepMetrics::new(route_id, node_id),
        })
    }

    fn wrap(&self, route_id: &str, node_id: &str, target: Arc<dyn ManagedProcessor>) -> Arc<dyn ManagedProcessor> {
        Arc::new(InstrumentedProcessor {
            metrics: StepMetrics::new(route_id, node_id),
            target,
        })
    }
}

#[derive(Debug, Clone)]
struct StepMetrics {
    route_id: String,
    node_id: String,
}

impl StepMetrics {
    fn new(route_id: &str, node_id: &str) -> Self {
        Self {
            route_id: route_id.to_string(),
            node_id: node_id.to_string(),
        }
    }

    fn record(&self, started: Instant, failed: bool) {
        let route = self.route_id.clone();
        let node = self.node_id.clone();
        counter!(STEP_EXCHANGES_TOTAL, "route" => route.clone(), "node" => node.clone()).increment(1);
        if failed {
            counter!(STEP_FAILURES_TOTAL, "route" => route.clone(), "node" => node.clone()).increment(1);
        }
        histogram!(STEP_DURATION_SECONDS, "route" => route, "node" => node)
            .record(started.elapsed().as_secs_f64());
    }
}

struct InstrumentationAdvice {
    metrics: StepMetrics,
}

#[async_trait]
impl Advice for InstrumentationAdvice {
    fn name(&self) -> &str {
        "instrumentation"
    }

    async fn before(&self, _exchange: &mut Exchange) -> std::result::Result<AdviceState, ExchangeFailure> {
        Ok(Some(Box::new(Instant::now())))
    }

    async fn after(&self, exchange: &mut Exchange, state: AdviceState) {
        if let Some(started) = state.and_then(|s| s.downcast::<Instant>().ok()) {
            self.metrics.record(*started, exchange.is_failed());
        }
    }
}

struct InstrumentedProcessor {
    metrics: StepMetrics,
    target: Arc<dyn ManagedProcessor>,
}

#[async_trait]
impl AsyncProcessor for InstrumentedProcessor {
    async fn process(&self, exchange: &mut Exchange) {
        let started = Instant::now();
        self.target.process(exchange).await;
        self.metrics.record(started, exchange.is_failed());
    }
}

#[async_trait]
impl Service for InstrumentedProcessor {
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
