//! Backlog Tracer Integration Tests
//!
//! Bounded backlog behaviour, dumps, and tracing driven through routes.

use std::sync::Arc;

use sy_common::Exchange;
use sy_config::TracePoint;
use sy_engine::{
    processor_fn, BacklogTracer, EngineContext, EngineError, LanguageRegistry, RouteDefinition,
    Service, StepUnit, MAX_BACKLOG_SIZE,
};

fn enabled_tracer() -> BacklogTracer {
    let tracer = BacklogTracer::new(Arc::new(LanguageRegistry::with_defaults()));
    tracer.set_enabled(true);
    tracer
}

fn record(tracer: &BacklogTracer, node_id: &str, body: &str) {
    let exchange = Exchange::with_body(body);
    let event = tracer.create_event(Some("orders"), Some(node_id), &exchange);
    tracer.trace_event(event);
}

fn noop() -> StepUnit {
    processor_fn(|_| Ok(()))
}

fn upper() -> StepUnit {
    processor_fn(|exchange| {
        let text = exchange.message().body().as_text().unwrap_or_default();
        exchange.message_mut().set_body(text.to_uppercase());
        Ok(())
    })
}

mod backlog_tests {
    use super::*;

    #[test]
    fn test_eviction_keeps_most_recent_in_order() {
        for extra in [1usize, 4] {
            let tracer = enabled_tracer();
            tracer.set_backlog_size(3).unwrap();
            tracer.set_remove_on_dump(false);

            let total = 3 + extra;
            for i in 0..total {
                record(&tracer, &format!("n{}", i), "x");
            }

            let nodes: Vec<String> = tracer
                .dump_all_traced_messages()
                .iter()
                .map(|e| e.to_node().unwrap_or_default().to_string())
                .collect();
            let expected: Vec<String> = (extra..total).map(|i| format!("n{}", i)).collect();
            assert_eq!(nodes, expected);
        }
    }

    #[test]
    fn test_capacity_validation() {
        let tracer = enabled_tracer();
        let max = MAX_BACKLOG_SIZE as i64;

        for size in [0, -1, max + 1] {
            let err = tracer.set_backlog_size(size).err();
            assert!(
                matches!(err, Some(EngineError::InvalidBacklogSize { .. })),
                "size {} should be rejected",
                size
            );
        }
        assert_eq!(tracer.backlog_size(), sy_config::DEFAULT_BACKLOG_SIZE);

        tracer.set_backlog_size(max).unwrap();
        assert_eq!(tracer.backlog_size(), MAX_BACKLOG_SIZE);
    }

    #[test]
    fn test_dump_with_removal_is_idempotent() {
        let tracer = enabled_tracer();
        assert!(tracer.is_remove_on_dump());
        for node in ["a", "b", "c"] {
            record(&tracer, node, "x");
        }

        assert_eq!(tracer.dump_all_traced_messages().len(), 3);
        assert!(tracer.dump_all_traced_messages().is_empty());
        assert_eq!(tracer.backlog_len(), 0);
    }

    #[test]
    fn test_per_node_dump() {
        let tracer = enabled_tracer();
        record(&tracer, "A", "first-a");
        record(&tracer, "B", "only-b");
        record(&tracer, "A", "second-a");
        record(&tracer, "C", "only-c");

        let a_events = tracer.dump_traced_messages("A");
        assert_eq!(a_events.len(), 2);
        assert!(a_events[0].message_as_xml().contains("first-a"));
        assert!(a_events[1].message_as_xml().contains("second-a"));
        assert!(a_events[0].uid() < a_events[1].uid());

        let rest: Vec<String> = tracer
            .dump_all_traced_messages()
            .iter()
            .map(|e| e.to_node().unwrap_or_default().to_string())
            .collect();
        assert_eq!(rest, vec!["B", "C"]);
    }

    #[test]
    fn test_dump_without_removal_keeps_backlog() {
        let tracer = enabled_tracer();
        tracer.set_remove_on_dump(false);
        record(&tracer, "A", "x");
        record(&tracer, "B", "y");

        assert_eq!(tracer.dump_traced_messages("A").len(), 1);
        assert_eq!(tracer.dump_all_traced_messages().len(), 2);
        assert_eq!(tracer.backlog_len(), 2);
    }

    #[test]
    fn test_xml_dump_of_empty_backlog() {
        let tracer = enabled_tracer();
        assert_eq!(
            tracer.dump_all_traced_messages_as_xml(),
            "<backlogTracerEventMessages>\n</backlogTracerEventMessages>"
        );
    }

    #[test]
    fn test_xml_dump_keeps_multiline_text_intact() {
        let tracer = enabled_tracer();
        let mut exchange = Exchange::with_body("line1\nline2\n  line3");
        exchange.message_mut().set_header("note", "a\nb");
        tracer.trace_event(tracer.create_event(Some("orders"), Some("to1"), &exchange));

        let xml = tracer.dump_all_traced_messages_as_xml();
        assert!(xml.contains("<body type=\"string\">line1\nline2\n  line3</body>"));
        assert!(xml.contains("<header key=\"note\" type=\"string\">a\nb</header>"));
        assert!(xml.contains("\n    <message exchangeId=\""));
        assert!(xml.contains("\n    </message>\n  </backlogTracerEventMessage>"));
    }
}

mod concurrency_tests {
    use super::*;
    use std::collections::HashSet;

    const TASKS: u64 = 8;
    const PER_TASK: u64 = 50;
    const BACKLOG: usize = 16;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tracing_shares_one_counter_and_bound() {
        let tracer = Arc::new(enabled_tracer());
        tracer.set_backlog_size(BACKLOG as i64).unwrap();
        tracer.set_remove_on_dump(false);

        let handles: Vec<_> = (0..TASKS)
            .map(|task| {
                let tracer = tracer.clone();
                tokio::spawn(async move {
                    let mut uids = Vec::new();
                    for i in 0..PER_TASK {
                        let exchange = Exchange::with_body(format!("t{}-{}", task, i));
                        let event = tracer.create_event(Some("orders"), Some("to1"), &exchange);
                        uids.push(event.uid());
                        tracer.trace_event(event);
                        assert!(tracer.backlog_len() <= BACKLOG);
                        tokio::task::yield_now().await;
                    }
                    uids
                })
            })
            .collect();

        let mut uids = HashSet::new();
        for result in futures::future::join_all(handles).await {
            for uid in result.unwrap() {
                assert!(uids.insert(uid), "uid {} handed out twice", uid);
            }
        }

        let total = TASKS * PER_TASK;
        assert_eq!(uids.len() as u64, total);
        assert_eq!(uids, (1..=total).collect::<HashSet<u64>>());
        assert_eq!(tracer.trace_counter(), total);
        assert_eq!(tracer.backlog_len(), BACKLOG);

        let retained: HashSet<u64> = tracer.dump_all_traced_messages().iter().map(|e| e.uid()).collect();
        assert_eq!(retained.len(), BACKLOG);
        assert!(retained.is_subset(&uids));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_eviction_after_concurrent_load_keeps_most_recent() {
        let tracer = Arc::new(enabled_tracer());
        tracer.set_backlog_size(BACKLOG as i64).unwrap();
        tracer.set_remove_on_dump(false);

        let handles: Vec<_> = (0..TASKS)
            .map(|_| {
                let tracer = tracer.clone();
                tokio::spawn(async move {
                    for _ in 0..PER_TASK {
                        record(&tracer, "to1", "load");
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for result in futures::future::join_all(handles).await {
            result.unwrap();
        }

        let total = TASKS * PER_TASK;
        for _ in 0..BACKLOG {
            record(&tracer, "to2", "tail");
        }

        let uids: Vec<u64> = tracer.dump_all_traced_messages().iter().map(|e| e.uid()).collect();
        let expected: Vec<u64> = (total + 1..=total + BACKLOG as u64).collect();
        assert_eq!(uids, expected);
        assert_eq!(tracer.trace_counter(), total + BACKLOG as u64);
    }
}

mod route_tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_keeps_last_two_messages() {
        let context = EngineContext::with_defaults("tracer-test").unwrap();
        let tracer = context.backlog_tracer().unwrap();
        tracer.set_enabled(true);
        tracer.set_backlog_size(2).unwrap();

        let route = context
            .add_route(RouteDefinition::new("orders").step("to", noop()))
            .await
            .unwrap();
        context.start().await.unwrap();

        for body in ["m1", "m2", "m3"] {
            route.send_body(body).await;
        }

        let events = tracer.dump_all_traced_messages();
        assert_eq!(events.len(), 2);
        assert!(events[0].message_as_xml().contains(">m2</body>"));
        assert!(events[1].message_as_xml().contains(">m3</body>"));
        assert!(events[0].uid() < events[1].uid());
        assert_eq!(events[0].to_node(), Some("to1"));
        assert_eq!(events[0].route_id(), Some("orders"));

        context.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_route_entry_event() {
        let context = EngineContext::with_defaults("tracer-test").unwrap();
        let tracer = context.backlog_tracer().unwrap();
        tracer.set_enabled(true);
        tracer.set_trace_route_entry(true);

        let route = context
            .add_route(
                RouteDefinition::new("orders")
                    .step("to", noop())
                    .step("log", noop()),
            )
            .await
            .unwrap();
        let exchange = route.send_body("hello").await;

        let events = tracer.dump_all_traced_messages();
        let targets: Vec<Option<&str>> = events.iter().map(|e| e.to_node()).collect();
        assert_eq!(targets, vec![None, Some("to1"), Some("log1")]);
        assert!(events.iter().all(|e| e.exchange_id() == exchange.id()));
        assert!(events[0].to_xml(0).contains("<toNode>orders</toNode>"));
    }

    #[tokio::test]
    async fn test_trace_point_after_sees_step_output() {
        let context = EngineContext::with_defaults("tracer-test").unwrap();
        let tracer = context.backlog_tracer().unwrap();
        tracer.set_enabled(true);
        tracer.set_trace_point(TracePoint::After);

        let route = context
            .add_route(RouteDefinition::new("orders").step("transform", upper()))
            .await
            .unwrap();
        route.send_body("quiet").await;

        let events = tracer.dump_traced_messages("transform1");
        assert_eq!(events.len(), 1);
        assert!(events[0].message_as_xml().contains(">QUIET</body>"));
    }

    #[tokio::test]
    async fn test_filter_and_pattern_through_route() {
        let context = EngineContext::with_defaults("tracer-test").unwrap();
        let tracer = context.backlog_tracer().unwrap();
        tracer.set_enabled(true);
        tracer.set_trace_pattern(Some("audit*"));
        tracer
            .set_trace_filter(Some("${header.region} == 'emea'"))
            .unwrap();

        let route = context
            .add_route(
                RouteDefinition::new("orders")
                    .step("to", noop())
                    .step_with_id("audit-log", "log", noop()),
            )
            .await
            .unwrap();

        let mut emea = Exchange::with_body("a");
        emea.message_mut().set_header("region", "emea");
        route.send(emea).await;

        let mut apac = Exchange::with_body("b");
        apac.message_mut().set_header("region", "apac");
        route.send(apac).await;

        let events = tracer.dump_all_traced_messages();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].to_node(), Some("audit-log"));
    }

    #[tokio::test]
    async fn test_disabled_tracer_records_nothing() {
        let context = EngineContext::with_defaults("tracer-test").unwrap();
        let route = context
            .add_route(RouteDefinition::new("orders").step("to", noop()))
            .await
            .unwrap();

        route.send_body("x").await;

        let tracer = context.backlog_tracer().unwrap();
        assert_eq!(tracer.backlog_len(), 0);
        assert_eq!(route.channels()[0].advice_names()[0], "backlog-tracer");
    }

    #[tokio::test]
    async fn test_json_dump() {
        let context = EngineContext::with_defaults("tracer-test").unwrap();
        let tracer = context.backlog_tracer().unwrap();
        tracer.set_enabled(true);

        let route = context
            .add_route(RouteDefinition::new("orders").step("to", noop()))
            .await
            .unwrap();
        route.send_body("x").await;

        let json: serde_json::Value =
            serde_json::from_str(&tracer.dump_all_traced_messages_as_json().unwrap()).unwrap();
        let events = json.as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["toNode"], "to1");
        assert!(events[0]["message"].as_str().unwrap().contains("<message "));
    }
}
