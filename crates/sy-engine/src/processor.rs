//! Processing units
//!
//! A step in a route is one of three shapes:
//! - `AsyncProcessor`: the native non-blocking contract. The returned future
//!   completing is the single completion signal; failures are recorded on the
//!   exchange rather than returned.
//! - `Processor`: the older blocking contract returning a `Result`.
//! - `ManagedProcessor`: an async processor that also has a lifecycle.
//!
//! `StepUnit` carries whichever shape a definition or intercept strategy
//! produced, and `into_managed` normalizes it for composition.

use std::sync::Arc;

use async_trait::async_trait;
use sy_common::{Exchange, ExchangeFailure};
use tracing::debug;

use crate::lifecycle::{Service, ServiceState};
use crate::Result;

#[async_trait]
pub trait AsyncProcessor: Send + Sync {
    async fn process(&self, exchange: &mut Exchange);
}

/// Blocking processor contract
pub trait Processor: Send + Sync {
    fn process(&self, exchange: &mut Exchange) -> std::result::Result<(), ExchangeFailure>;
}

/// Async processor with a lifecycle. Implemented for every type that has both.
pub trait ManagedProcessor: AsyncProcessor + Service {}

impl<T: AsyncProcessor + Service> ManagedProcessor for T {}

// ============================================================================
// Step Unit
// ============================================================================

#[derive(Clone)]
pub enum StepUnit {
    Managed(Arc<dyn ManagedProcessor>),
    Async(Arc<dyn AsyncProcessor>),
    Blocking(Arc<dyn Processor>),
}

impl std::fmt::Debug for StepUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepUnit::Managed(_) => f.write_str("StepUnit::Managed"),
            StepUnit::Async(_) => f.write_str("StepUnit::Async"),
            StepUnit::Blocking(_) => f.write_str("StepUnit::Blocking"),
        }
    }
}

impl StepUnit {
    pub fn managed<P: AsyncProcessor + Service + 'static>(processor: P) -> Self {
        StepUnit::Managed(Arc::new(processor))
    }

    pub fn from_async<P: AsyncProcessor + 'static>(processor: P) -> Self {
        StepUnit::Async(Arc::new(processor))
    }

    pub fn blocking<P: Processor + 'static>(processor: P) -> Self {
        StepUnit::Blocking(Arc::new(processor))
    }

    /// True when the unit is natively composable without a bridge
    pub fn is_async(&self) -> bool {
        !matches!(self, StepUnit::Blocking(_))
    }

    /// Normalize into a managed processor. Units without a lifecycle get a
    /// no-op one; blocking units are bridged inline.
    pub fn into_managed(self) -> Arc<dyn ManagedProcessor> {
        match self {
            StepUnit::Managed(p) => p,
            StepUnit::Async(p) => Arc::new(LifecycleWrapper::new(p, None)),
            StepUnit::Blocking(p) => {
                Arc::new(LifecycleWrapper::new(Arc::new(BlockingBridge::new(p)), None))
            }
        }
    }
}

/// Wrap a closure as a blocking step unit
pub fn processor_fn<F>(f: F) -> StepUnit
where
    F: Fn(&mut Exchange) -> std::result::Result<(), ExchangeFailure> + Send + Sync + 'static,
{
    StepUnit::Blocking(Arc::new(FnProcessor(f)))
}

struct FnProcessor<F>(F);

impl<F> Processor for FnProcessor<F>
where
    F: Fn(&mut Exchange) -> std::result::Result<(), ExchangeFailure> + Send + Sync,
{
    fn process(&self, exchange: &mut Exchange) -> std::result::Result<(), ExchangeFailure> {
        (self.0)(exchange)
    }
}

// ============================================================================
// Bridges
// ============================================================================

/// Runs a blocking processor inline on the calling task and records its
/// error on the exchange.
pub struct BlockingBridge {
    inner: Arc<dyn Processor>,
}

impl BlockingBridge {
    pub fn new(inner: Arc<dyn Processor>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl AsyncProcessor for BlockingBridge {
    async fn process(&self, exchange: &mut Exchange) {
        if let Err(failure) = self.inner.process(exchange) {
            exchange.set_failure(failure);
        }
    }
}

/// Gives a processor the lifecycle of another unit.
///
/// Used when an intercept strategy returns a processor without a lifecycle:
/// starting or stopping the wrapper reaches the target it was built around.
pub struct LifecycleWrapper {
    wrapped: Arc<dyn AsyncProcessor>,
    target: Option<Arc<dyn ManagedProcessor>>,
}

impl LifecycleWrapper {
    pub fn new(
        wrapped: Arc<dyn AsyncProcessor>,
        target: Option<Arc<dyn ManagedProcessor>>,
    ) -> Self {
        Self { wrapped, target }
    }
}

#[async_trait]
impl AsyncProcessor for LifecycleWrapper {
    async fn process(&self, exchange: &mut Exchange) {
        self.wrapped.process(exchange).await
    }
}

#[async_trait]
impl Service for LifecycleWrapper {
    async fn start(&self) -> Result<()> {
        match &self.target {
            Some(target) => target.start().await,
            None => Ok(()),
        }
    }

    async fn stop(&self) -> Result<()> {
        match &self.target {
            Some(target) => target.stop().await,
            None => Ok(()),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        match &self.target {
            Some(target) => target.shutdown().await,
            None => Ok(()),
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Sequential processors; stops at the first failed step
pub struct Pipeline {
    steps: Vec<Arc<dyn ManagedProcessor>>,
    state: ServiceState,
}

impl Pipeline {
    pub fn new(steps: Vec<Arc<dyn ManagedProcessor>>) -> Self {
        Self {
            steps,
            state: ServiceState::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[async_trait]
impl AsyncProcessor for Pipeline {
    async fn process(&self, exchange: &mut Exchange) {
        for (index, step) in self.steps.iter().enumerate() {
            step.process(exchange).await;
            if exchange.is_failed() {
                debug!(
                    exchange_id = %exchange.id(),
                    step = index,
                    "Pipeline stopped after failed step"
                );
                break;
            }
        }
    }
}

#[async_trait]
impl Service for Pipeline {
    async fn start(&self) -> Result<()> {
        if !self.state.mark_started() {
            return Ok(());
        }
        for step in &self.steps {
            step.start().await?;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.state.mark_stopped() {
            return Ok(());
        }
        for step in self.steps.iter().rev() {
            step.stop().await?;
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        for step in self.steps.iter().rev() {
            step.shutdown().await?;
        }
        self.state.mark_shutdown();
        Ok(())
    }
}
