//! Switchyard Development Binary
//!
//! Runs a small demo route through the engine:
//! - Loads the engine configuration (TOML file plus environment overrides)
//! - Builds an `orders` route: transform -> enrich -> deliver
//! - Optionally parks one exchange at a breakpoint and prints its snapshot
//! - Sends messages and dumps the backlog as XML or JSON
//! - Optionally renders the step metrics in Prometheus format

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::json;
use sy_common::{ExchangeFailure, StreamBody};
use sy_config::EngineConfig;
use sy_engine::instrumentation::describe_metrics;
use sy_engine::{
    processor_fn, BacklogDebugger, EngineContext, LoggingErrorHandlerFactory, Route, RouteDefinition,
    Service, TraceLogStrategy,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Switchyard Development Runner
#[derive(Parser, Debug)]
#[command(name = "sy-dev")]
#[command(about = "Run a demo route with the backlog tracer and debugger")]
struct Args {
    /// Engine configuration file (TOML)
    #[arg(long, env = "SWITCHYARD_CONFIG")]
    config: Option<PathBuf>,

    /// Number of messages to send
    #[arg(long, default_value = "3")]
    messages: u32,

    /// Backlog size, overrides the configuration
    #[arg(long)]
    backlog_size: Option<i64>,

    /// Park the first message at this node id and print its snapshot
    #[arg(long)]
    breakpoint: Option<String>,

    /// Send bodies as one-shot streams
    #[arg(long, default_value = "false")]
    stream: bool,

    /// Dump the backlog as JSON instead of XML
    #[arg(long, default_value = "false")]
    json: bool,

    /// Render step metrics in Prometheus format at the end
    #[arg(long, default_value = "false")]
    metrics: bool,

    /// Log every exchange entering a node
    #[arg(long, default_value = "false")]
    trace_log: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
        )
        .init();

    let args = Args::parse();

    info!("Starting Switchyard dev runner");

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => {
            let mut config = EngineConfig::default();
            config.apply_env_overrides()?;
            config.validate()?;
            config
        }
    };
    config.tracer.enabled = true;
    config.routes.stream_caching |= args.stream;

    let prometheus = if args.metrics {
        config.routes.instrumentation = true;
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("installing Prometheus recorder")?;
        describe_metrics();
        Some(handle)
    } else {
        None
    };

    let context = EngineContext::new("sy-dev", config)?;
    if args.trace_log {
        context.add_intercept_strategy(Arc::new(TraceLogStrategy));
    }

    let tracer = context.backlog_tracer()?;
    if let Some(size) = args.backlog_size {
        tracer.set_backlog_size(size)?;
    }

    let route = context.add_route(demo_route()).await?;
    info!(route_id = %route.id(), nodes = ?route.node_ids(), "Demo route ready");

    context.start().await?;

    if let Some(node_id) = &args.breakpoint {
        let debugger = context.backlog_debugger()?;
        debug_one(&route, &debugger, node_id, args.stream).await?;
    }

    for n in 1..=args.messages {
        let payload = json!({ "order": n, "customer": "acme" }).to_string();
        let exchange = if args.stream {
            route.send_body(StreamBody::new(std::io::Cursor::new(payload.into_bytes()))).await
        } else {
            route.send_body(payload).await
        };
        if let Some(failure) = exchange.failure() {
            warn!(exchange_id = %exchange.id(), error = %failure, "Message failed");
        }
    }

    info!(
        traced = tracer.trace_counter(),
        backlog = tracer.backlog_len(),
        "Dumping backlog"
    );
    if args.json {
        println!("{}", tracer.dump_all_traced_messages_as_json()?);
    } else {
        println!("{}", tracer.dump_all_traced_messages_as_xml());
    }

    if let Some(handle) = prometheus {
        println!("{}", handle.render());
    }

    context.shutdown().await?;
    info!("Switchyard dev runner finished");
    Ok(())
}

fn demo_route() -> RouteDefinition {
    RouteDefinition::new("orders")
        .error_handler(Arc::new(LoggingErrorHandlerFactory))
        .step(
            "transform",
            processor_fn(|exchange| {
                let text = exchange.message().body().as_text().unwrap_or_default();
                exchange.message_mut().set_body(text.to_uppercase());
                Ok(())
            }),
        )
        .step(
            "enrich",
            processor_fn(|exchange| {
                let size = exchange.message().body().as_text().map(|t| t.len()).unwrap_or(0);
                exchange.message_mut().set_header("size", size);
                Ok(())
            }),
        )
        .step(
            "deliver",
            processor_fn(|exchange| {
                if exchange.message().body().is_empty() {
                    return Err(ExchangeFailure::new("EmptyBody", "nothing to deliver"));
                }
                info!(exchange_id = %exchange.id(), "Delivered");
                Ok(())
            }),
        )
}

/// Park one exchange at `node_id`, print the parked snapshot, then continue it
async fn debug_one(route: &Arc<Route>, debugger: &Arc<BacklogDebugger>, node_id: &str, stream: bool) -> Result<()> {
    debugger.enable_debugger();
    debugger.add_breakpoint(node_id);

    let sender = route.clone();
    let handle = tokio::spawn(async move {
        let payload = json!({ "order": 0, "customer": "debug" }).to_string();
        if stream {
            sender.send_body(StreamBody::new(std::io::Cursor::new(payload.into_bytes()))).await
        } else {
            sender.send_body(payload).await
        }
    });

    let parked = tokio::time::timeout(Duration::from_secs(5), async {
        while debugger.suspended_breakpoint_node_ids().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    if parked.is_err() {
        warn!(node_id, "No exchange parked at breakpoint, is the node id correct?");
        debugger.disable_debugger();
        handle.await?;
        return Ok(());
    }

    println!("{}", debugger.dump_traced_messages_as_xml(node_id));
    debugger.set_message_header_on_breakpoint(node_id, "debugged", true);
    debugger.continue_breakpoint(node_id);
    handle.await?;
    debugger.disable_debugger();
    Ok(())
}
