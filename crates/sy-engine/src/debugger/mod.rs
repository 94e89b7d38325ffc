//! Backlog Debugger
//!
//! Breakpoints keyed by node id. An exchange reaching an active breakpoint
//! whose condition holds is parked on a one-shot gate until it is continued,
//! its breakpoint is removed, or the debugger is disabled.
//!
//! Per node:
//! ```text
//! Unregistered --add--> Registered --arrival--> Suspended
//!      ^                   |  ^                     |
//!      +------remove-------+  +------continue-------+
//!      +-----------------remove / disable------------+
//! ```
//!
//! At most one exchange is parked per node. A second exchange arriving at a
//! node that already holds a parked exchange passes through without pausing,
//! so a continue or remove always reaches the exchange that was parked first.
//!
//! A gate whose sender is dropped without an explicit release counts as a
//! continue. With a fallback timeout configured, an expired wait also
//! continues, with a warning.

mod advice;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use sy_common::{Body, Exchange};
use sy_config::DebuggerConfig;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::language::{LanguageRegistry, Predicate};
use crate::lifecycle::{Service, ServiceState};
use crate::tracer::{events_to_xml, message_as_xml, DumpOptions, TracedEvent, MESSAGE_INDENT};
use crate::Result;

pub use advice::BacklogDebuggerAdvice;

/// A change queued against a parked exchange, applied when it resumes
#[derive(Debug, Clone)]
pub enum ExchangeEdit {
    SetBody(Body),
    SetHeader(String, Value),
    RemoveHeader(String),
}

impl ExchangeEdit {
    fn apply(self, exchange: &mut Exchange) {
        match self {
            ExchangeEdit::SetBody(body) => exchange.message_mut().set_body(body),
            ExchangeEdit::SetHeader(name, value) => exchange.message_mut().set_header(name, value),
            ExchangeEdit::RemoveHeader(name) => {
                exchange.message_mut().remove_header(&name);
            }
        }
    }
}

struct NodeBreakpoint {
    condition: Option<Arc<dyn Predicate>>,
    active: bool,
}

impl NodeBreakpoint {
    fn unconditional() -> Self {
        Self {
            condition: None,
            active: true,
        }
    }
}

struct SuspendedExchange {
    uid: u64,
    route_id: Option<String>,
    exchange_id: String,
    gate: oneshot::Sender<Vec<ExchangeEdit>>,
    /// Copy of the parked exchange with queued edits applied, for display
    snapshot: Exchange,
    edits: Vec<ExchangeEdit>,
}

impl SuspendedExchange {
    fn release(self) {
        // The waiter may already be gone after a fallback timeout
        let _ = self.gate.send(self.edits);
    }

    fn queue(&mut self, edit: ExchangeEdit) {
        edit.clone().apply(&mut self.snapshot);
        self.edits.push(edit);
    }
}

type SuspendedMap = Mutex<IndexMap<String, SuspendedExchange>>;

/// Removes a parked entry when the waiting task is dropped or times out
struct SuspensionGuard<'a> {
    suspended: &'a SuspendedMap,
    node_id: &'a str,
    exchange_id: String,
}

impl Drop for SuspensionGuard<'_> {
    fn drop(&mut self) {
        let mut suspended = self.suspended.lock();
        let ours = suspended
            .get(self.node_id)
            .is_some_and(|s| s.exchange_id == self.exchange_id);
        if ours {
            suspended.shift_remove(self.node_id);
        }
    }
}

pub struct BacklogDebugger {
    enabled: AtomicBool,
    /// `enabled` from the configuration, restored every time the service starts
    enabled_on_start: AtomicBool,
    breakpoints: DashMap<String, NodeBreakpoint>,
    suspended: SuspendedMap,
    debug_counter: AtomicU64,
    fallback_timeout: RwLock<Option<Duration>>,
    body_max_chars: AtomicUsize,
    body_include_streams: AtomicBool,
    initial_breakpoints: RwLock<Vec<String>>,
    languages: Arc<LanguageRegistry>,
    state: ServiceState,
}

impl BacklogDebugger {
    pub fn new(languages: Arc<LanguageRegistry>) -> Self {
        let defaults = DebuggerConfig::default();
        Self {
            enabled: AtomicBool::new(false),
            enabled_on_start: AtomicBool::new(defaults.enabled),
            breakpoints: DashMap::new(),
            suspended: Mutex::new(IndexMap::new()),
            debug_counter: AtomicU64::new(0),
            fallback_timeout: RwLock::new(defaults.fallback_timeout()),
            body_max_chars: AtomicUsize::new(defaults.body_max_chars),
            body_include_streams: AtomicBool::new(defaults.body_include_streams),
            initial_breakpoints: RwLock::new(Vec::new()),
            languages,
            state: ServiceState::new(),
        }
    }

    pub fn configure(&self, config: &DebuggerConfig) {
        self.set_fallback_timeout(config.fallback_timeout());
        self.body_max_chars.store(config.body_max_chars, Ordering::SeqCst);
        self.body_include_streams
            .store(config.body_include_streams, Ordering::SeqCst);
        *self.initial_breakpoints.write() = config.initial_breakpoint_ids();
        self.enabled_on_start.store(config.enabled, Ordering::SeqCst);
        if config.enabled {
            self.enable_debugger();
        }
    }

    // ========================================================================
    // Global Switch
    // ========================================================================

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn enable_debugger(&self) {
        if !self.enabled.swap(true, Ordering::SeqCst) {
            info!("Backlog debugger enabled");
        }
    }

    /// Turn the debugger off, drop every breakpoint and release every parked
    /// exchange
    pub fn disable_debugger(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        let released = self.clear_breakpoints();
        info!(released, "Backlog debugger disabled");
    }

    /// Drop every breakpoint, then release every gate. Returns how many
    /// parked exchanges were released.
    fn clear_breakpoints(&self) -> usize {
        self.breakpoints.clear();
        let drained: Vec<SuspendedExchange> = {
            let mut suspended = self.suspended.lock();
            suspended.drain(..).map(|(_, s)| s).collect()
        };
        let released = drained.len();
        for parked in drained {
            parked.release();
        }
        released
    }

    // ========================================================================
    // Breakpoints
    // ========================================================================

    /// Register a breakpoint at `node_id`. A no-op if one already exists.
    pub fn add_breakpoint(&self, node_id: &str) {
        let mut added = false;
        self.breakpoints.entry(node_id.to_string()).or_insert_with(|| {
            added = true;
            NodeBreakpoint::unconditional()
        });
        if added {
            info!(node_id, "Breakpoint added");
        }
    }

    /// Register or replace a breakpoint that only pauses exchanges matching
    /// the predicate
    pub fn add_conditional_breakpoint(&self, node_id: &str, language: &str, predicate: &str) -> Result<()> {
        let condition = self.languages.create_predicate(language, predicate)?;
        self.breakpoints.insert(
            node_id.to_string(),
            NodeBreakpoint {
                condition: Some(condition),
                active: true,
            },
        );
        info!(node_id, language, predicate, "Conditional breakpoint added");
        Ok(())
    }

    /// Remove the breakpoint and release the exchange parked there, if any
    pub fn remove_breakpoint(&self, node_id: &str) {
        self.breakpoints.remove(node_id);
        let parked = self.suspended.lock().shift_remove(node_id);
        let released = parked.is_some();
        if let Some(parked) = parked {
            parked.release();
        }
        info!(node_id, released, "Breakpoint removed");
    }

    pub fn remove_all_breakpoints(&self) {
        let released = self.clear_breakpoints();
        info!(released, "All breakpoints removed");
    }

    pub fn has_breakpoint(&self, node_id: &str) -> bool {
        self.breakpoints.contains_key(node_id)
    }

    /// Registered breakpoint ids, sorted
    pub fn breakpoints(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.breakpoints.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Keep the breakpoint registered but let exchanges pass
    pub fn disable_breakpoint(&self, node_id: &str) {
        if let Some(mut bp) = self.breakpoints.get_mut(node_id) {
            bp.active = false;
        }
    }

    pub fn enable_breakpoint(&self, node_id: &str) {
        if let Some(mut bp) = self.breakpoints.get_mut(node_id) {
            bp.active = true;
        }
    }

    /// Release the exchange parked at `node_id`. The breakpoint stays, so the
    /// next arrival pauses again.
    pub fn continue_breakpoint(&self, node_id: &str) {
        let parked = self.suspended.lock().shift_remove(node_id);
        if let Some(parked) = parked {
            info!(node_id, exchange_id = %parked.exchange_id, "Continuing suspended exchange");
            parked.release();
        }
    }

    /// Release every parked exchange, keeping all breakpoints
    pub fn resume_all(&self) {
        let drained: Vec<SuspendedExchange> = {
            let mut suspended = self.suspended.lock();
            suspended.drain(..).map(|(_, s)| s).collect()
        };
        info!(count = drained.len(), "Resuming all suspended exchanges");
        for parked in drained {
            parked.release();
        }
    }

    // ========================================================================
    // Suspended Exchanges
    // ========================================================================

    /// Node ids holding a parked exchange, in the order they were parked
    pub fn suspended_breakpoint_node_ids(&self) -> Vec<String> {
        self.suspended.lock().keys().cloned().collect()
    }

    pub fn suspended_exchange_id(&self, node_id: &str) -> Option<String> {
        self.suspended
            .lock()
            .get(node_id)
            .map(|s| s.exchange_id.clone())
    }

    /// Snapshot of the exchange parked at `node_id`, including queued edits
    pub fn suspended_breakpoint_message(&self, node_id: &str) -> Option<TracedEvent> {
        let options = self.dump_options();
        self.suspended.lock().get(node_id).map(|s| {
            TracedEvent::new(
                s.uid,
                s.route_id.clone(),
                Some(node_id.to_string()),
                s.exchange_id.clone(),
                message_as_xml(&s.snapshot, &options, MESSAGE_INDENT),
            )
        })
    }

    /// XML list holding the parked exchange's snapshot, empty if none
    pub fn dump_traced_messages_as_xml(&self, node_id: &str) -> String {
        let events: Vec<TracedEvent> = self.suspended_breakpoint_message(node_id).into_iter().collect();
        events_to_xml(&events)
    }

    pub fn set_message_body_on_breakpoint(&self, node_id: &str, body: impl Into<Body>) -> bool {
        self.queue_edit(node_id, ExchangeEdit::SetBody(body.into()))
    }

    pub fn set_message_header_on_breakpoint(
        &self,
        node_id: &str,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> bool {
        self.queue_edit(node_id, ExchangeEdit::SetHeader(name.into(), value.into()))
    }

    pub fn remove_message_header_on_breakpoint(&self, node_id: &str, name: impl Into<String>) -> bool {
        self.queue_edit(node_id, ExchangeEdit::RemoveHeader(name.into()))
    }

    fn queue_edit(&self, node_id: &str, edit: ExchangeEdit) -> bool {
        match self.suspended.lock().get_mut(node_id) {
            Some(parked) => {
                debug!(node_id, edit = ?edit, "Queued edit on suspended exchange");
                parked.queue(edit);
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Counters and Settings
    // ========================================================================

    /// Number of times an exchange was parked
    pub fn debug_counter(&self) -> u64 {
        self.debug_counter.load(Ordering::SeqCst)
    }

    pub fn reset_debug_counter(&self) {
        self.debug_counter.store(0, Ordering::SeqCst);
    }

    pub fn fallback_timeout(&self) -> Option<Duration> {
        *self.fallback_timeout.read()
    }

    pub fn set_fallback_timeout(&self, timeout: Option<Duration>) {
        *self.fallback_timeout.write() = timeout;
    }

    pub fn initial_breakpoints(&self) -> Vec<String> {
        self.initial_breakpoints.read().clone()
    }

    /// Comma separated node ids registered when the service starts
    pub fn set_initial_breakpoints(&self, csv: Option<&str>) {
        *self.initial_breakpoints.write() = sy_config::split_csv(csv);
    }

    fn dump_options(&self) -> DumpOptions {
        DumpOptions {
            body_max_chars: self.body_max_chars.load(Ordering::SeqCst),
            include_streams: self.body_include_streams.load(Ordering::SeqCst),
            include_exception: true,
        }
    }

    // ========================================================================
    // Execution Hooks
    // ========================================================================

    /// Called before a step runs. Parks the exchange when an active
    /// breakpoint at `node_id` matches it, and returns once released.
    ///
    /// Returns the start instant when a breakpoint exists at the node, for
    /// the matching `after_process` notification.
    pub async fn before_process(
        &self,
        exchange: &mut Exchange,
        route_id: Option<&str>,
        node_id: &str,
    ) -> Option<Instant> {
        if !self.is_enabled() {
            return None;
        }
        let (active, condition) = match self.breakpoints.get(node_id) {
            Some(bp) => (bp.active, bp.condition.clone()),
            None => return None,
        };
        let started = Instant::now();
        if !active {
            return Some(started);
        }

        if let Some(condition) = condition {
            match condition.matches(exchange) {
                Ok(true) => {}
                Ok(false) => return Some(started),
                Err(e) => {
                    warn!(node_id, exchange_id = %exchange.id(), error = %e, "Breakpoint condition failed, not suspending");
                    return Some(started);
                }
            }
        }

        let (gate, released) = oneshot::channel();
        {
            let mut suspended = self.suspended.lock();
            // Re-check under the lock: disable or remove may have run since
            if !self.is_enabled() || !self.breakpoints.contains_key(node_id) {
                return Some(started);
            }
            if suspended.contains_key(node_id) {
                debug!(node_id, exchange_id = %exchange.id(), "Breakpoint already holds a suspended exchange, passing through");
                return Some(started);
            }
            let uid = self.debug_counter.fetch_add(1, Ordering::SeqCst) + 1;
            suspended.insert(
                node_id.to_string(),
                SuspendedExchange {
                    uid,
                    route_id: route_id.map(str::to_string),
                    exchange_id: exchange.id().to_string(),
                    gate,
                    snapshot: exchange.clone(),
                    edits: Vec::new(),
                },
            );
        }

        info!(node_id, exchange_id = %exchange.id(), "Exchange suspended at breakpoint, waiting to continue");
        let _guard = SuspensionGuard {
            suspended: &self.suspended,
            node_id,
            exchange_id: exchange.id().to_string(),
        };

        let outcome = match self.fallback_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, released).await.ok(),
            None => Some(released.await),
        };

        match outcome {
            Some(Ok(edits)) => {
                let count = edits.len();
                for edit in edits {
                    edit.apply(exchange);
                }
                info!(node_id, exchange_id = %exchange.id(), edits = count, "Suspended exchange continued");
            }
            Some(Err(_)) => {
                info!(node_id, exchange_id = %exchange.id(), "Breakpoint gate dropped, continuing");
            }
            None => {
                warn!(
                    node_id,
                    exchange_id = %exchange.id(),
                    timeout_secs = self.fallback_timeout().map(|t| t.as_secs_f64()),
                    "Suspended exchange hit the fallback timeout, continuing"
                );
            }
        }

        Some(started)
    }

    /// Called after the step ran
    pub fn after_process(&self, exchange: &Exchange, node_id: &str, started: Instant) {
        debug!(
            node_id,
            exchange_id = %exchange.id(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            failed = exchange.is_failed(),
            "Step completed at breakpoint node"
        );
    }
}

#[async_trait]
impl Service for BacklogDebugger {
    async fn start(&self) -> Result<()> {
        if !self.state.mark_started() {
            return Ok(());
        }
        // stop disables the debugger; a restart brings back the configured state
        if self.enabled_on_start.load(Ordering::SeqCst) {
            self.enable_debugger();
        }
        let initial = self.initial_breakpoints();
        for node_id in &initial {
            self.add_breakpoint(node_id);
        }
        info!(
            enabled = self.is_enabled(),
            initial_breakpoints = initial.len(),
            "Backlog debugger started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.state.mark_stopped() {
            self.disable_debugger();
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.disable_debugger();
        self.state.mark_shutdown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn debugger() -> Arc<BacklogDebugger> {
        let debugger = Arc::new(BacklogDebugger::new(Arc::new(LanguageRegistry::with_defaults())));
        debugger.enable_debugger();
        debugger
    }

    async fn wait_suspended(debugger: &BacklogDebugger, node_id: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !debugger
                .suspended_breakpoint_node_ids()
                .iter()
                .any(|id| id == node_id)
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("exchange should be suspended");
    }

    #[test]
    fn test_add_breakpoint_is_idempotent() {
        let debugger = debugger();
        debugger.add_breakpoint("to1");
        debugger
            .add_conditional_breakpoint("log1", "simple", "${header.vip} == true")
            .unwrap();
        debugger.add_breakpoint("log1");

        assert_eq!(debugger.breakpoints(), vec!["log1", "to1"]);
        assert!(debugger.has_breakpoint("log1"));
    }

    #[tokio::test]
    async fn test_disabled_debugger_never_suspends() {
        let debugger = debugger();
        debugger.add_breakpoint("to1");
        debugger.disable_debugger();
        assert!(debugger.breakpoints().is_empty());

        let mut exchange = Exchange::with_body("x");
        assert!(debugger.before_process(&mut exchange, None, "to1").await.is_none());
    }

    #[tokio::test]
    async fn test_edits_applied_on_continue() {
        let debugger = debugger();
        debugger.add_breakpoint("to1");

        let worker = {
            let debugger = debugger.clone();
            tokio::spawn(async move {
                let mut exchange = Exchange::with_body("original");
                exchange.message_mut().set_header("drop-me", 1);
                debugger.before_process(&mut exchange, Some("orders"), "to1").await;
                exchange
            })
        };

        wait_suspended(&debugger, "to1").await;
        assert!(debugger.set_message_body_on_breakpoint("to1", "edited"));
        assert!(debugger.set_message_header_on_breakpoint("to1", "added", "yes"));
        assert!(debugger.remove_message_header_on_breakpoint("to1", "drop-me"));
        assert!(!debugger.set_message_body_on_breakpoint("log1", "nobody parked"));

        let snapshot = debugger.suspended_breakpoint_message("to1").unwrap();
        assert!(snapshot.message_as_xml().contains(">edited</body>"));
        assert_eq!(snapshot.route_id(), Some("orders"));

        debugger.continue_breakpoint("to1");
        let exchange = worker.await.unwrap();
        assert_eq!(exchange.message().body().as_text().as_deref(), Some("edited"));
        assert_eq!(exchange.message().header("added"), Some(&Value::from("yes")));
        assert!(exchange.message().header("drop-me").is_none());
        assert_eq!(debugger.debug_counter(), 1);
    }

    #[tokio::test]
    async fn test_conditional_breakpoint() {
        let debugger = debugger();
        debugger
            .add_conditional_breakpoint("to1", "header", "vip")
            .unwrap();

        let mut regular = Exchange::with_body("x");
        let passed = tokio::time::timeout(
            Duration::from_secs(1),
            debugger.before_process(&mut regular, None, "to1"),
        )
        .await;
        assert!(passed.is_ok());
        assert!(debugger.suspended_breakpoint_node_ids().is_empty());

        let worker = {
            let debugger = debugger.clone();
            tokio::spawn(async move {
                let mut vip = Exchange::with_body("y");
                vip.message_mut().set_header("vip", true);
                debugger.before_process(&mut vip, None, "to1").await;
            })
        };
        wait_suspended(&debugger, "to1").await;
        debugger.resume_all();
        worker.await.unwrap();
        assert!(debugger.has_breakpoint("to1"));
    }

    #[tokio::test]
    async fn test_inactive_breakpoint_passes() {
        let debugger = debugger();
        debugger.add_breakpoint("to1");
        debugger.disable_breakpoint("to1");

        let mut exchange = Exchange::with_body("x");
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            debugger.before_process(&mut exchange, None, "to1"),
        )
        .await;
        assert!(result.unwrap().is_some());
        assert_eq!(debugger.debug_counter(), 0);
    }

    #[tokio::test]
    async fn test_fallback_timeout_continues() {
        let debugger = debugger();
        debugger.add_breakpoint("to1");
        debugger.set_fallback_timeout(Some(Duration::from_millis(50)));

        let mut exchange = Exchange::with_body("x");
        debugger.before_process(&mut exchange, None, "to1").await;

        assert!(debugger.suspended_breakpoint_node_ids().is_empty());
        assert!(debugger.has_breakpoint("to1"));
    }

    #[tokio::test]
    async fn test_second_arrival_passes_through() {
        let debugger = debugger();
        debugger.add_breakpoint("to1");

        let first = {
            let debugger = debugger.clone();
            tokio::spawn(async move {
                let mut exchange = Exchange::with_body("first");
                debugger.before_process(&mut exchange, None, "to1").await;
            })
        };
        wait_suspended(&debugger, "to1").await;
        let parked_id = debugger.suspended_exchange_id("to1").unwrap();

        let mut second = Exchange::with_body("second");
        tokio::time::timeout(
            Duration::from_secs(1),
            debugger.before_process(&mut second, None, "to1"),
        )
        .await
        .expect("second arrival should not park");
        assert_eq!(debugger.suspended_exchange_id("to1"), Some(parked_id));

        debugger.continue_breakpoint("to1");
        first.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_wait_clears_entry() {
        let debugger = debugger();
        debugger.add_breakpoint("to1");

        let worker = {
            let debugger = debugger.clone();
            tokio::spawn(async move {
                let mut exchange = Exchange::with_body("x");
                debugger.before_process(&mut exchange, None, "to1").await;
            })
        };
        wait_suspended(&debugger, "to1").await;

        worker.abort();
        let _ = worker.await;
        assert!(debugger.suspended_breakpoint_node_ids().is_empty());
    }

    #[tokio::test]
    async fn test_initial_breakpoints_on_start() {
        let debugger = BacklogDebugger::new(Arc::new(LanguageRegistry::with_defaults()));
        debugger.configure(&DebuggerConfig {
            enabled: true,
            initial_breakpoints: Some("to1, log2".to_string()),
            ..DebuggerConfig::default()
        });

        debugger.start().await.unwrap();
        assert!(debugger.is_enabled());
        assert_eq!(debugger.breakpoints(), vec!["log2", "to1"]);

        debugger.stop().await.unwrap();
        assert!(!debugger.is_enabled());
        assert!(debugger.breakpoints().is_empty());
    }

    #[tokio::test]
    async fn test_restart_restores_configured_state() {
        let debugger = BacklogDebugger::new(Arc::new(LanguageRegistry::with_defaults()));
        debugger.configure(&DebuggerConfig {
            enabled: true,
            initial_breakpoints: Some("to1".to_string()),
            ..DebuggerConfig::default()
        });

        debugger.start().await.unwrap();
        debugger.stop().await.unwrap();
        assert!(!debugger.is_enabled());

        debugger.start().await.unwrap();
        assert!(debugger.is_enabled());
        assert_eq!(debugger.breakpoints(), vec!["to1"]);
    }

    #[tokio::test]
    async fn test_restart_keeps_unconfigured_debugger_off() {
        let debugger = BacklogDebugger::new(Arc::new(LanguageRegistry::with_defaults()));
        debugger.enable_debugger();
        debugger.start().await.unwrap();
        debugger.stop().await.unwrap();

        debugger.start().await.unwrap();
        assert!(!debugger.is_enabled());
    }
}
