//! Engine context: owner of the routes and the process-wide services
//!
//! The backlog tracer and debugger are created on first use and live for
//! the whole context, shared by every channel of every route.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use sy_config::EngineConfig;
use tracing::{debug, info};

use crate::debugger::BacklogDebugger;
use crate::definition::NodeIdFactory;
use crate::error::EngineError;
use crate::instrumentation::{InstrumentationStrategy, MetricsInstrumentation};
use crate::intercept::InterceptStrategy;
use crate::language::LanguageRegistry;
use crate::lifecycle::{Service, ServiceState};
use crate::route::{Route, RouteDefinition};
use crate::tracer::BacklogTracer;
use crate::Result;

pub struct EngineContext {
    name: String,
    config: EngineConfig,
    languages: Arc<LanguageRegistry>,
    node_ids: NodeIdFactory,
    backlog_tracer: Mutex<Option<Arc<BacklogTracer>>>,
    backlog_debugger: Mutex<Option<Arc<BacklogDebugger>>>,
    intercept_strategies: RwLock<Vec<Arc<dyn InterceptStrategy>>>,
    instrumentation: RwLock<Option<Arc<dyn InstrumentationStrategy>>>,
    tracing: AtomicBool,
    routes: RwLock<IndexMap<String, Arc<Route>>>,
    state: ServiceState,
}

impl EngineContext {
    /// Create a context. The configuration is validated, and services that
    /// are enabled in it are created right away so a bad filter fails here.
    pub fn new(name: impl Into<String>, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let instrumentation: Option<Arc<dyn InstrumentationStrategy>> = if config.routes.instrumentation {
            Some(Arc::new(MetricsInstrumentation))
        } else {
            None
        };

        let context = Self {
            name: name.into(),
            tracing: AtomicBool::new(config.routes.tracing),
            config,
            languages: Arc::new(LanguageRegistry::with_defaults()),
            node_ids: NodeIdFactory::new(),
            backlog_tracer: Mutex::new(None),
            backlog_debugger: Mutex::new(None),
            intercept_strategies: RwLock::new(Vec::new()),
            instrumentation: RwLock::new(instrumentation),
            routes: RwLock::new(IndexMap::new()),
            state: ServiceState::new(),
        };

        if context.config.tracer.enabled {
            context.backlog_tracer()?;
        }
        if context.config.debugger.enabled {
            context.backlog_debugger()?;
        }
        Ok(context)
    }

    pub fn with_defaults(name: impl Into<String>) -> Result<Self> {
        Self::new(name, EngineConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn languages(&self) -> &Arc<LanguageRegistry> {
        &self.languages
    }

    pub fn node_ids(&self) -> &NodeIdFactory {
        &self.node_ids
    }

    // ========================================================================
    // Services
    // ========================================================================

    /// The context's backlog tracer, created and configured on first use
    pub fn backlog_tracer(&self) -> Result<Arc<BacklogTracer>> {
        let mut slot = self.backlog_tracer.lock();
        if let Some(tracer) = slot.as_ref() {
            return Ok(tracer.clone());
        }
        let tracer = Arc::new(BacklogTracer::new(self.languages.clone()));
        tracer.configure(&self.config.tracer)?;
        debug!(context = %self.name, "Created backlog tracer");
        *slot = Some(tracer.clone());
        Ok(tracer)
    }

    /// The context's backlog debugger, created and configured on first use
    pub fn backlog_debugger(&self) -> Result<Arc<BacklogDebugger>> {
        let mut slot = self.backlog_debugger.lock();
        if let Some(debugger) = slot.as_ref() {
            return Ok(debugger.clone());
        }
        let debugger = Arc::new(BacklogDebugger::new(self.languages.clone()));
        debugger.configure(&self.config.debugger);
        debug!(context = %self.name, "Created backlog debugger");
        *slot = Some(debugger.clone());
        Ok(debugger)
    }

    /// Register a strategy applied to every route built afterwards
    pub fn add_intercept_strategy(&self, strategy: Arc<dyn InterceptStrategy>) {
        debug!(strategy = strategy.name(), priority = strategy.priority(), "Registered intercept strategy");
        self.intercept_strategies.write().push(strategy);
    }

    pub fn intercept_strategies(&self) -> Vec<Arc<dyn InterceptStrategy>> {
        self.intercept_strategies.read().clone()
    }

    pub fn instrumentation(&self) -> Option<Arc<dyn InstrumentationStrategy>> {
        self.instrumentation.read().clone()
    }

    pub fn set_instrumentation(&self, instrumentation: Option<Arc<dyn InstrumentationStrategy>>) {
        *self.instrumentation.write() = instrumentation;
    }

    /// Whether tracing-kind strategies are applied
    pub fn is_tracing(&self) -> bool {
        self.tracing.load(Ordering::SeqCst)
    }

    pub fn set_tracing(&self, tracing: bool) {
        self.tracing.store(tracing, Ordering::SeqCst);
    }

    // ========================================================================
    // Routes
    // ========================================================================

    /// Build a route and register it. When the context is already running
    /// the route is started too.
    pub async fn add_route(&self, definition: RouteDefinition) -> Result<Arc<Route>> {
        let route = Arc::new(Route::build(self, definition)?);
        {
            let mut routes = self.routes.write();
            if routes.contains_key(route.id()) {
                return Err(EngineError::Composition {
                    node_id: route.id().to_string(),
                    reason: "a route with this id already exists".to_string(),
                });
            }
            routes.insert(route.id().to_string(), route.clone());
        }

        if self.state.is_started() {
            self.start_services().await?;
            route.start().await?;
        }
        Ok(route)
    }

    pub fn route(&self, id: &str) -> Option<Arc<Route>> {
        self.routes.read().get(id).cloned()
    }

    pub fn route_ids(&self) -> Vec<String> {
        self.routes.read().keys().cloned().collect()
    }

    fn routes_snapshot(&self) -> Vec<Arc<Route>> {
        self.routes.read().values().cloned().collect()
    }

    fn services(&self) -> (Option<Arc<BacklogTracer>>, Option<Arc<BacklogDebugger>>) {
        (
            self.backlog_tracer.lock().clone(),
            self.backlog_debugger.lock().clone(),
        )
    }

    async fn start_services(&self) -> Result<()> {
        let (tracer, debugger) = self.services();
        if let Some(tracer) = tracer {
            tracer.start().await?;
        }
        if let Some(debugger) = debugger {
            debugger.start().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Service for EngineContext {
    async fn start(&self) -> Result<()> {
        if !self.state.mark_started() {
            return Ok(());
        }
        self.start_services().await?;
        let routes = self.routes_snapshot();
        for route in &routes {
            route.start().await?;
        }
        info!(context = %self.name, routes = routes.len(), "Engine context started");
        Ok(())
    }

    /// Stops the debugger first so parked exchanges are released
    async fn stop(&self) -> Result<()> {
        if !self.state.mark_stopped() {
            return Ok(());
        }
        let (tracer, debugger) = self.services();
        if let Some(debugger) = &debugger {
            debugger.stop().await?;
        }
        for route in self.routes_snapshot().iter().rev() {
            route.stop().await?;
        }
        if let Some(tracer) = &tracer {
            tracer.stop().await?;
        }
        info!(context = %self.name, "Engine context stopped");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.stop().await?;
        let (tracer, debugger) = self.services();
        if let Some(debugger) = debugger {
            debugger.shutdown().await?;
        }
        for route in self.routes_snapshot().iter().rev() {
            route.shutdown().await?;
        }
        if let Some(tracer) = tracer {
            tracer.shutdown().await?;
        }
        self.state.mark_shutdown();
        info!(context = %self.name, "Engine context shut down");
        Ok(())
    }
}
