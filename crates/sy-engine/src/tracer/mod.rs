//! Backlog Tracer
//!
//! Keeps a bounded, queryable history of message snapshots taken as
//! exchanges pass through steps. One tracer exists per engine context and it
//! is attached to every channel; while disabled it does nothing.
//!
//! The backlog is a FIFO ring: when full, the oldest events are evicted to
//! make room. Dumps either remove what they return (`remove_on_dump`) or
//! leave the backlog intact.

mod advice;
mod dump;
mod event;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sy_common::Exchange;
use sy_config::{TracePoint, TracerConfig, MAX_BACKLOG_SIZE};
use tracing::{debug, info};

use crate::error::EngineError;
use crate::language::{LanguageRegistry, Predicate};
use crate::lifecycle::{Service, ServiceState};
use crate::pattern::PatternSet;
use crate::Result;

pub use advice::BacklogTracerAdvice;
pub use dump::{body_text, message_as_xml, DumpOptions};
pub use event::{
    events_to_json, events_to_xml, TracedEvent, LIST_TAG, MESSAGE_INDENT, ROOT_TAG, TIMESTAMP_FORMAT,
};

struct TraceFilter {
    source: String,
    predicate: Arc<dyn Predicate>,
}

pub struct BacklogTracer {
    enabled: AtomicBool,
    backlog_size: AtomicUsize,
    remove_on_dump: AtomicBool,
    body_max_chars: AtomicUsize,
    body_include_streams: AtomicBool,
    include_exception: AtomicBool,
    trace_point: RwLock<TracePoint>,
    trace_route_entry: AtomicBool,
    trace_counter: AtomicU64,
    queue: Mutex<VecDeque<TracedEvent>>,
    pattern: RwLock<Option<PatternSet>>,
    filter: RwLock<Option<TraceFilter>>,
    languages: Arc<LanguageRegistry>,
    state: ServiceState,
}

impl BacklogTracer {
    pub fn new(languages: Arc<LanguageRegistry>) -> Self {
        let defaults = TracerConfig::default();
        Self {
            enabled: AtomicBool::new(defaults.enabled),
            backlog_size: AtomicUsize::new(defaults.backlog_size),
            remove_on_dump: AtomicBool::new(defaults.remove_on_dump),
            body_max_chars: AtomicUsize::new(defaults.body_max_chars),
            body_include_streams: AtomicBool::new(defaults.body_include_streams),
            include_exception: AtomicBool::new(defaults.include_exception),
            trace_point: RwLock::new(defaults.trace_point),
            trace_route_entry: AtomicBool::new(defaults.trace_route_entry),
            trace_counter: AtomicU64::new(0),
            queue: Mutex::new(VecDeque::with_capacity(defaults.backlog_size)),
            pattern: RwLock::new(None),
            filter: RwLock::new(None),
            languages,
            state: ServiceState::new(),
        }
    }

    /// Apply a full tracer configuration. Fails on an invalid size or filter
    /// and leaves the previous values of the failing setting in place.
    pub fn configure(&self, config: &TracerConfig) -> Result<()> {
        self.set_backlog_size(i64::try_from(config.backlog_size).unwrap_or(i64::MAX))?;
        self.set_trace_filter(config.trace_filter.as_deref())?;
        self.set_trace_pattern(config.trace_pattern.as_deref());
        self.set_remove_on_dump(config.remove_on_dump);
        self.set_body_max_chars(config.body_max_chars);
        self.set_body_include_streams(config.body_include_streams);
        self.set_include_exception(config.include_exception);
        self.set_trace_point(config.trace_point);
        self.set_trace_route_entry(config.trace_route_entry);
        self.set_enabled(config.enabled);
        Ok(())
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            info!(enabled, "Backlog tracer toggled");
        }
    }

    pub fn backlog_size(&self) -> usize {
        self.backlog_size.load(Ordering::SeqCst)
    }

    /// Set the working capacity, between 1 and `MAX_BACKLOG_SIZE`.
    ///
    /// Shrinking does not evict immediately; the next recorded event trims
    /// the backlog down to the new size.
    pub fn set_backlog_size(&self, size: i64) -> Result<()> {
        let valid = usize::try_from(size)
            .ok()
            .filter(|s| (1..=MAX_BACKLOG_SIZE).contains(s));
        match valid {
            Some(size) => {
                self.backlog_size.store(size, Ordering::SeqCst);
                debug!(backlog_size = size, "Backlog size set");
                Ok(())
            }
            None => Err(EngineError::InvalidBacklogSize {
                size,
                max: MAX_BACKLOG_SIZE,
            }),
        }
    }

    pub fn is_remove_on_dump(&self) -> bool {
        self.remove_on_dump.load(Ordering::SeqCst)
    }

    pub fn set_remove_on_dump(&self, remove: bool) {
        self.remove_on_dump.store(remove, Ordering::SeqCst);
    }

    pub fn body_max_chars(&self) -> usize {
        self.body_max_chars.load(Ordering::SeqCst)
    }

    pub fn set_body_max_chars(&self, max: usize) {
        self.body_max_chars.store(max, Ordering::SeqCst);
    }

    pub fn is_body_include_streams(&self) -> bool {
        self.body_include_streams.load(Ordering::SeqCst)
    }

    pub fn set_body_include_streams(&self, include: bool) {
        self.body_include_streams.store(include, Ordering::SeqCst);
    }

    pub fn is_include_exception(&self) -> bool {
        self.include_exception.load(Ordering::SeqCst)
    }

    pub fn set_include_exception(&self, include: bool) {
        self.include_exception.store(include, Ordering::SeqCst);
    }

    pub fn trace_point(&self) -> TracePoint {
        *self.trace_point.read()
    }

    pub fn set_trace_point(&self, point: TracePoint) {
        *self.trace_point.write() = point;
    }

    pub fn is_trace_route_entry(&self) -> bool {
        self.trace_route_entry.load(Ordering::SeqCst)
    }

    /// Also record a route-entry event, without a target node, ahead of the
    /// first node's event
    pub fn set_trace_route_entry(&self, enabled: bool) {
        self.trace_route_entry.store(enabled, Ordering::SeqCst);
    }

    pub fn trace_pattern(&self) -> Option<String> {
        self.pattern.read().as_ref().map(|p| p.as_strings().join(","))
    }

    /// Comma separated id patterns; `None` or blank clears the pattern
    pub fn set_trace_pattern(&self, pattern: Option<&str>) {
        let parsed = pattern.map(PatternSet::parse).filter(|p| !p.is_empty());
        *self.pattern.write() = parsed;
    }

    pub fn trace_filter(&self) -> Option<String> {
        self.filter.read().as_ref().map(|f| f.source.clone())
    }

    /// Predicate filter, `language:expression` or a bare simple expression.
    /// `None` or blank clears the filter.
    pub fn set_trace_filter(&self, filter: Option<&str>) -> Result<()> {
        let parsed = match filter.map(str::trim).filter(|f| !f.is_empty()) {
            Some(source) => Some(TraceFilter {
                source: source.to_string(),
                predicate: self.languages.parse_filter(source)?,
            }),
            None => None,
        };
        *self.filter.write() = parsed;
        Ok(())
    }

    pub fn dump_options(&self) -> DumpOptions {
        DumpOptions {
            body_max_chars: self.body_max_chars(),
            include_streams: self.is_body_include_streams(),
            include_exception: self.is_include_exception(),
        }
    }

    // ========================================================================
    // Recording
    // ========================================================================

    /// Whether a snapshot should be taken for this node.
    ///
    /// Disabled means no. With a pattern, the node id or route id must match
    /// it. With a filter, the predicate must hold for the exchange; a failing
    /// predicate is returned as an error.
    pub fn should_trace(&self, node_id: &str, route_id: Option<&str>, exchange: &Exchange) -> Result<bool> {
        if !self.is_enabled() {
            return Ok(false);
        }

        if let Some(pattern) = self.pattern.read().as_ref() {
            let matched = pattern.matches(node_id) || route_id.is_some_and(|r| pattern.matches(r));
            if !matched {
                return Ok(false);
            }
        }

        let predicate = self.filter.read().as_ref().map(|f| f.predicate.clone());
        match predicate {
            Some(predicate) => predicate.matches(exchange),
            None => Ok(true),
        }
    }

    /// Build an event for the exchange with the next uid
    pub fn create_event(&self, route_id: Option<&str>, to_node: Option<&str>, exchange: &Exchange) -> TracedEvent {
        let uid = self.trace_counter.fetch_add(1, Ordering::SeqCst) + 1;
        TracedEvent::new(
            uid,
            route_id.map(str::to_string),
            to_node.map(str::to_string),
            exchange.id(),
            message_as_xml(exchange, &self.dump_options(), MESSAGE_INDENT),
        )
    }

    /// Append an event, evicting from the head until it fits.
    ///
    /// Silently ignored while disabled.
    pub fn trace_event(&self, event: TracedEvent) {
        if !self.is_enabled() {
            return;
        }
        let capacity = self.backlog_size();
        let uid = event.uid();
        let mut queue = self.queue.lock();
        let mut evicted = 0usize;
        while queue.len() >= capacity {
            queue.pop_front();
            evicted += 1;
        }
        queue.push_back(event);
        drop(queue);

        if evicted > 0 {
            debug!(evicted, backlog_size = capacity, "Evicted oldest backlog events");
        }
        debug!(uid, "Traced event appended to backlog");
    }

    /// Number of snapshots ever created, including evicted ones
    pub fn trace_counter(&self) -> u64 {
        self.trace_counter.load(Ordering::SeqCst)
    }

    pub fn reset_trace_counter(&self) {
        self.trace_counter.store(0, Ordering::SeqCst);
    }

    /// Events currently held in the backlog
    pub fn backlog_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    // ========================================================================
    // Dumps
    // ========================================================================

    /// Events targeting `node_id` or belonging to the route `node_id`, in
    /// arrival order
    pub fn dump_traced_messages(&self, node_id: &str) -> Vec<TracedEvent> {
        let mut queue = self.queue.lock();
        if self.is_remove_on_dump() {
            let mut taken = Vec::new();
            queue.retain(|event| {
                if event.is_for(node_id) {
                    taken.push(event.clone());
                    false
                } else {
                    true
                }
            });
            taken
        } else {
            queue.iter().filter(|e| e.is_for(node_id)).cloned().collect()
        }
    }

    pub fn dump_traced_messages_as_xml(&self, node_id: &str) -> String {
        events_to_xml(&self.dump_traced_messages(node_id))
    }

    pub fn dump_traced_messages_as_json(&self, node_id: &str) -> serde_json::Result<String> {
        events_to_json(&self.dump_traced_messages(node_id))
    }

    pub fn dump_all_traced_messages(&self) -> Vec<TracedEvent> {
        let mut queue = self.queue.lock();
        if self.is_remove_on_dump() {
            queue.drain(..).collect()
        } else {
            queue.iter().cloned().collect()
        }
    }

    pub fn dump_all_traced_messages_as_xml(&self) -> String {
        events_to_xml(&self.dump_all_traced_messages())
    }

    pub fn dump_all_traced_messages_as_json(&self) -> serde_json::Result<String> {
        events_to_json(&self.dump_all_traced_messages())
    }
}

#[async_trait]
impl Service for BacklogTracer {
    async fn start(&self) -> Result<()> {
        if self.state.mark_started() {
            info!(
                enabled = self.is_enabled(),
                backlog_size = self.backlog_size(),
                "Backlog tracer started"
            );
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.state.mark_stopped() {
            debug!("Backlog tracer stopped");
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.stop().await?;
        self.clear();
        self.state.mark_shutdown();
        Ok(())
    }
}
