//! Channel Composition Integration Tests
//!
//! Ordering of intercept strategies and advices, bridging of blocking
//! strategy results, error handlers, and channel lifecycle.

use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sy_common::{Body, Exchange, ExchangeFailure, StreamBody};
use sy_engine::{
    processor_fn, AsyncProcessor, EngineContext, EngineError, InterceptStrategy, ManagedProcessor,
    NodeDefinition, Processor, RedeliveryErrorHandlerFactory, RedeliveryPolicy, RouteDefinition,
    Service, StepDefinition, StepUnit, StrategyKind, StreamCachingStrategy, WrapContext,
};

type Log = Arc<Mutex<Vec<String>>>;

fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn logging_step(log: &Log) -> StepUnit {
    let log = log.clone();
    processor_fn(move |_| {
        log.lock().push("step".to_string());
        Ok(())
    })
}

/// Strategy whose interceptor records its name, and the body type it saw,
/// before calling the wrapped target
struct RecordingStrategy {
    name: String,
    priority: i32,
    kind: StrategyKind,
    log: Log,
}

impl RecordingStrategy {
    fn new(name: &str, priority: i32, log: &Log) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            priority,
            kind: StrategyKind::Custom,
            log: log.clone(),
        })
    }
}

impl InterceptStrategy for RecordingStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn kind(&self) -> StrategyKind {
        self.kind
    }

    fn wrap(
        &self,
        _ctx: &WrapContext<'_>,
        target: Arc<dyn ManagedProcessor>,
    ) -> sy_engine::Result<StepUnit> {
        Ok(StepUnit::from_async(RecordingInterceptor {
            name: self.name.clone(),
            log: self.log.clone(),
            target,
        }))
    }
}

struct RecordingInterceptor {
    name: String,
    log: Log,
    target: Arc<dyn ManagedProcessor>,
}

#[async_trait]
impl AsyncProcessor for RecordingInterceptor {
    async fn process(&self, exchange: &mut Exchange) {
        let body_type = exchange.message().body().type_name();
        self.log.lock().push(format!("{}:{}", self.name, body_type));
        self.target.process(exchange).await
    }
}

mod ordering_tests {
    use super::*;

    fn names(log: &Log) -> Vec<String> {
        log.lock()
            .iter()
            .map(|entry| entry.split(':').next().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_higher_priority_observes_first() {
        for register_high_first in [false, true] {
            let log = new_log();
            let context = EngineContext::with_defaults("composition").unwrap();
            let low = RecordingStrategy::new("low", 1, &log);
            let high = RecordingStrategy::new("high", 10, &log);
            if register_high_first {
                context.add_intercept_strategy(high);
                context.add_intercept_strategy(low);
            } else {
                context.add_intercept_strategy(low);
                context.add_intercept_strategy(high);
            }

            let route = context
                .add_route(RouteDefinition::new("orders").step("to", logging_step(&log)))
                .await
                .unwrap();
            route.send_body("x").await;

            assert_eq!(names(&log), vec!["high", "low", "step"]);
        }
    }

    #[tokio::test]
    async fn test_equal_priority_keeps_registration_order() {
        let log = new_log();
        let context = EngineContext::with_defaults("composition").unwrap();
        context.add_intercept_strategy(RecordingStrategy::new("first", 0, &log));
        context.add_intercept_strategy(RecordingStrategy::new("second", 0, &log));

        let route = context
            .add_route(
                RouteDefinition::new("orders")
                    .intercept_strategy(RecordingStrategy::new("route-level", 0, &log))
                    .step("to", logging_step(&log)),
            )
            .await
            .unwrap();
        route.send_body("x").await;

        assert_eq!(names(&log), vec!["first", "second", "route-level", "step"]);
    }

    #[tokio::test]
    async fn test_advice_order() {
        let context = EngineContext::with_defaults("composition").unwrap();
        let route = context
            .add_route(
                RouteDefinition::new("orders")
                    .message_history(true)
                    .stream_caching(true)
                    .delay(Duration::from_millis(1))
                    .step("to", processor_fn(|_| Ok(()))),
            )
            .await
            .unwrap();

        assert_eq!(
            route.channels()[0].advice_names(),
            vec![
                "backlog-tracer",
                "backlog-debugger",
                "message-history",
                "stream-caching",
                "delay"
            ]
        );
    }

    #[tokio::test]
    async fn test_tracing_strategies_follow_context_switch() {
        let log = new_log();
        let context = EngineContext::with_defaults("composition").unwrap();
        context.add_intercept_strategy(Arc::new(RecordingStrategy {
            name: "tracing".to_string(),
            priority: 0,
            kind: StrategyKind::Tracing,
            log: log.clone(),
        }));

        let traced = context
            .add_route(RouteDefinition::new("traced").step("to", logging_step(&log)))
            .await
            .unwrap();
        traced.send_body("x").await;
        assert_eq!(names(&log), vec!["tracing", "step"]);

        log.lock().clear();
        context.set_tracing(false);
        let untraced = context
            .add_route(RouteDefinition::new("untraced").step("to", logging_step(&log)))
            .await
            .unwrap();
        untraced.send_body("x").await;
        assert_eq!(names(&log), vec!["step"]);
    }
}

mod stream_caching_tests {
    use super::*;

    fn stream_body() -> StreamBody {
        StreamBody::new(Cursor::new(b"payload".to_vec()))
    }

    #[tokio::test]
    async fn test_interceptor_sees_cached_body() {
        let log = new_log();
        let context = EngineContext::with_defaults("composition").unwrap();
        context.add_intercept_strategy(RecordingStrategy::new("custom", 5, &log));

        let read = Arc::new(Mutex::new(None));
        let read_by_step = read.clone();
        let route = context
            .add_route(RouteDefinition::new("orders").stream_caching(true).step(
                "to",
                processor_fn(move |exchange| {
                    *read_by_step.lock() = exchange.message().body().as_text();
                    Ok(())
                }),
            ))
            .await
            .unwrap();

        let exchange = route.send_body(stream_body()).await;

        assert_eq!(*log.lock(), vec!["custom:cached-stream"]);
        assert_eq!(read.lock().as_deref(), Some("payload"));
        assert!(matches!(exchange.message().body(), Body::Cached(_)));
    }

    #[tokio::test]
    async fn test_stream_caching_strategy_enables_caching() {
        let log = new_log();
        let context = EngineContext::with_defaults("composition").unwrap();
        context.add_intercept_strategy(Arc::new(StreamCachingStrategy));
        context.add_intercept_strategy(RecordingStrategy::new("custom", 0, &log));

        let route = context
            .add_route(RouteDefinition::new("orders").step("to", processor_fn(|_| Ok(()))))
            .await
            .unwrap();
        route.send_body(stream_body()).await;

        assert_eq!(*log.lock(), vec!["custom:cached-stream"]);
    }

    #[tokio::test]
    async fn test_without_caching_interceptor_sees_stream() {
        let log = new_log();
        let context = EngineContext::with_defaults("composition").unwrap();
        context.add_intercept_strategy(RecordingStrategy::new("custom", 0, &log));

        let route = context
            .add_route(RouteDefinition::new("orders").step("to", processor_fn(|_| Ok(()))))
            .await
            .unwrap();
        route.send_body(stream_body()).await;

        assert_eq!(*log.lock(), vec!["custom:stream"]);
    }
}

mod bridging_tests {
    use super::*;

    struct CountingStep {
        starts: AtomicU32,
        stops: AtomicU32,
        shutdowns: AtomicU32,
    }

    impl CountingStep {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                starts: AtomicU32::new(0),
                stops: AtomicU32::new(0),
                shutdowns: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl AsyncProcessor for CountingStep {
        async fn process(&self, exchange: &mut Exchange) {
            exchange.message_mut().set_header("step", true);
        }
    }

    #[async_trait]
    impl Service for CountingStep {
        async fn start(&self) -> sy_engine::Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> sy_engine::Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self) -> sy_engine::Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MarkHeader;

    impl Processor for MarkHeader {
        fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeFailure> {
            exchange.message_mut().set_header("bridged", true);
            Ok(())
        }
    }

    struct BlockingStrategy;

    impl InterceptStrategy for BlockingStrategy {
        fn name(&self) -> &str {
            "blocking"
        }

        fn wrap(
            &self,
            _ctx: &WrapContext<'_>,
            _target: Arc<dyn ManagedProcessor>,
        ) -> sy_engine::Result<StepUnit> {
            Ok(StepUnit::blocking(MarkHeader))
        }
    }

    struct FailingStrategy;

    impl InterceptStrategy for FailingStrategy {
        fn name(&self) -> &str {
            "failing"
        }

        fn wrap(
            &self,
            ctx: &WrapContext<'_>,
            _target: Arc<dyn ManagedProcessor>,
        ) -> sy_engine::Result<StepUnit> {
            Err(EngineError::Lifecycle(format!("cannot wrap {}", ctx.node_id)))
        }
    }

    #[tokio::test]
    async fn test_blocking_result_is_bridged_with_target_lifecycle() {
        let context = EngineContext::with_defaults("composition").unwrap();
        context.add_intercept_strategy(Arc::new(BlockingStrategy));
        let step = CountingStep::new();

        let route = context
            .add_route(RouteDefinition::new("orders").step("to", StepUnit::Managed(step.clone())))
            .await
            .unwrap();
        context.start().await.unwrap();
        assert_eq!(step.starts.load(Ordering::SeqCst), 1);

        let exchange = route.send_body("x").await;
        assert_eq!(exchange.message().header("bridged"), Some(&serde_json::Value::Bool(true)));
        assert!(exchange.message().header("step").is_none());
    }

    #[tokio::test]
    async fn test_failing_strategy_aborts_route() {
        let context = EngineContext::with_defaults("composition").unwrap();
        context.add_intercept_strategy(Arc::new(FailingStrategy));

        let err = context
            .add_route(RouteDefinition::new("orders").step_with_id("audit", "to", processor_fn(|_| Ok(()))))
            .await
            .err()
            .unwrap();

        match err {
            EngineError::Composition { node_id, reason } => {
                assert_eq!(node_id, "audit");
                assert!(reason.contains("failing"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(context.route("orders").is_none());
    }

    #[tokio::test]
    async fn test_context_scoped_channel_survives_stop() {
        let context = EngineContext::with_defaults("composition").unwrap();
        let step = CountingStep::new();
        let definition = RouteDefinition::new("orders").add_step(
            StepDefinition::new(NodeDefinition::new("on-exception"), StepUnit::Managed(step.clone()))
                .context_scoped(true),
        );
        let route = context.add_route(definition).await.unwrap();

        route.start().await.unwrap();
        route.stop().await.unwrap();
        assert_eq!(step.stops.load(Ordering::SeqCst), 0);

        route.shutdown().await.unwrap();
        assert_eq!(step.stops.load(Ordering::SeqCst), 1);
        assert_eq!(step.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_route_scoped_channel_stops() {
        let context = EngineContext::with_defaults("composition").unwrap();
        let step = CountingStep::new();
        let route = context
            .add_route(RouteDefinition::new("orders").step("to", StepUnit::Managed(step.clone())))
            .await
            .unwrap();

        route.start().await.unwrap();
        route.stop().await.unwrap();
        assert_eq!(step.stops.load(Ordering::SeqCst), 1);
    }
}

mod runtime_tests {
    use super::*;

    #[tokio::test]
    async fn test_redelivery_error_handler_is_entry_point() {
        let context = EngineContext::with_defaults("composition").unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let step_calls = calls.clone();

        let route = context
            .add_route(
                RouteDefinition::new("orders")
                    .error_handler(Arc::new(RedeliveryErrorHandlerFactory::new(RedeliveryPolicy {
                        max_redeliveries: 2,
                        redelivery_delay: Duration::from_millis(1),
                    })))
                    .step(
                        "to",
                        processor_fn(move |_| {
                            if step_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                                Err(ExchangeFailure::new("Transient", "first attempt fails"))
                            } else {
                                Ok(())
                            }
                        }),
                    ),
            )
            .await
            .unwrap();

        assert!(route.channels()[0].error_handler().is_some());
        let exchange = route.send_body("x").await;
        assert!(!exchange.is_failed());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pipeline_stops_at_first_failure_and_records_history() {
        let log = new_log();
        let context = EngineContext::with_defaults("composition").unwrap();
        let route = context
            .add_route(
                RouteDefinition::new("orders")
                    .message_history(true)
                    .step("log", processor_fn(|_| Ok(())))
                    .step("to", processor_fn(|_| Err(ExchangeFailure::new("Boom", "down"))))
                    .step("audit", logging_step(&log)),
            )
            .await
            .unwrap();

        let exchange = route.send_body("x").await;

        assert_eq!(exchange.failure().unwrap().kind, "Boom");
        assert_eq!(exchange.route_id(), Some("orders"));
        assert!(log.lock().is_empty());
        let visited: Vec<&str> = exchange.history().iter().map(|h| h.node_id.as_str()).collect();
        assert_eq!(visited, vec!["log1", "to1"]);
    }
}
