//! Switchyard Routing Engine
//!
//! This crate turns static route definitions into runtime chains and provides
//! the cross-cutting services wrapped around every step:
//! - Channel: composes advices, intercept strategies and error handling per step
//! - AdviceChain: inline before/after hooks around a composed step
//! - BacklogTracer: bounded, queryable history of traced message snapshots
//! - BacklogDebugger: breakpoints that park an exchange until released
//! - StreamCachingAdvice / DelayAdvice / MessageHistoryAdvice: route-level advices
//! - ErrorHandlerFactory: logging and redelivery error handlers
//! - MetricsInstrumentation: per-step metrics via the `metrics` facade
//! - LanguageRegistry: pluggable predicate languages (`simple`, `header`)
//! - EngineContext / Route: service registry, route building and lifecycle

pub mod error;
pub mod lifecycle;
pub mod processor;
pub mod advice;
pub mod definition;
pub mod intercept;
pub mod channel;
pub mod pattern;
pub mod language;
pub mod tracer;
pub mod debugger;
pub mod stream_cache;
pub mod delay;
pub mod history;
pub mod error_handler;
pub mod instrumentation;
pub mod context;
pub mod route;

pub use error::EngineError;
pub use lifecycle::{Service, ServiceState, ServiceStatus};
pub use processor::{
    AsyncProcessor, Processor, ManagedProcessor, StepUnit, BlockingBridge, LifecycleWrapper,
    Pipeline, processor_fn,
};
pub use advice::{Advice, AdviceChain, AdviceState};
pub use definition::{NodeDefinition, StepDefinition, NodeIdFactory};
pub use intercept::{InterceptStrategy, StrategyKind, WrapContext, TraceLogStrategy, wrapping_order};
pub use channel::Channel;
pub use pattern::PatternSet;
pub use language::{Language, LanguageRegistry, Predicate};
pub use tracer::{BacklogTracer, TracedEvent, DumpOptions, BacklogTracerAdvice};
pub use debugger::{BacklogDebugger, BacklogDebuggerAdvice, ExchangeEdit};
pub use stream_cache::{StreamCachingAdvice, StreamCachingStrategy};
pub use delay::DelayAdvice;
pub use history::MessageHistoryAdvice;
pub use error_handler::{
    ErrorHandlerFactory, LoggingErrorHandlerFactory, RedeliveryErrorHandlerFactory, RedeliveryPolicy,
};
pub use instrumentation::{InstrumentationStrategy, MetricsInstrumentation};
pub use context::EngineContext;
pub use route::{Route, RouteContext, RouteDefinition};

pub use sy_config::MAX_BACKLOG_SIZE;

pub type Result<T> = std::result::Result<T, EngineError>;
