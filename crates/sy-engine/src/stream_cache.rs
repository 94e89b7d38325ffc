//! Stream caching
//!
//! Turns a one-shot stream body into a re-readable cached body before any
//! interceptor or the step itself reads it.

use std::sync::Arc;

use async_trait::async_trait;
use sy_common::{Body, CachedStream, Exchange, ExchangeFailure};
use tracing::debug;

use crate::advice::{Advice, AdviceState};
use crate::intercept::{InterceptStrategy, StrategyKind, WrapContext};
use crate::processor::{ManagedProcessor, StepUnit};
use crate::Result;

#[derive(Debug, Default)]
pub struct StreamCachingAdvice;

#[async_trait]
impl Advice for StreamCachingAdvice {
    fn name(&self) -> &str {
        "stream-caching"
    }

    async fn before(&self, exchange: &mut Exchange) -> std::result::Result<AdviceState, ExchangeFailure> {
        let Body::Stream(stream) = exchange.message().body() else {
            return Ok(None);
        };
        let data = stream
            .read_to_bytes()
            .map_err(|e| ExchangeFailure::new("StreamCachingFailure", e.to_string()))?;
        debug!(exchange_id = %exchange.id(), bytes = data.len(), "Cached stream body");
        exchange.message_mut().set_body(Body::Cached(CachedStream::new(data)));
        Ok(None)
    }
}

/// Registering this strategy turns stream caching on for every route of the
/// context. It is never applied as a wrapper.
#[derive(Debug, Default)]
pub struct StreamCachingStrategy;

impl InterceptStrategy for StreamCachingStrategy {
    fn name(&self) -> &str {
        "stream-caching"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::StreamCaching
    }

    fn wrap(&self, _ctx: &WrapContext<'_>, target: Arc<dyn ManagedProcessor>) -> Result<StepUnit> {
        Ok(StepUnit::Managed(target))
    }
}
