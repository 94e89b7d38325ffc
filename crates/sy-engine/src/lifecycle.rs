//! Service lifecycle for composed processors and engine services
//!
//! Every unit placed in a chain can be started, stopped and shut down. The
//! default implementations are no-ops so stateless processors need nothing.

use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;

use crate::Result;

#[async_trait]
pub trait Service: Send + Sync {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Final teardown. Runs `stop` unless overridden.
    async fn shutdown(&self) -> Result<()> {
        self.stop().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Stopped,
    Started,
    ShutDown,
}

const STOPPED: u8 = 0;
const STARTED: u8 = 1;
const SHUT_DOWN: u8 = 2;

/// Atomic status flag shared by the engine's own services
#[derive(Debug)]
pub struct ServiceState(AtomicU8);

impl Default for ServiceState {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceState {
    pub fn new() -> Self {
        Self(AtomicU8::new(STOPPED))
    }

    pub fn status(&self) -> ServiceStatus {
        match self.0.load(Ordering::SeqCst) {
            STARTED => ServiceStatus::Started,
            SHUT_DOWN => ServiceStatus::ShutDown,
            _ => ServiceStatus::Stopped,
        }
    }

    pub fn is_started(&self) -> bool {
        self.status() == ServiceStatus::Started
    }

    /// Returns false when the service was already started
    pub fn mark_started(&self) -> bool {
        self.0.swap(STARTED, Ordering::SeqCst) != STARTED
    }

    /// Returns false when the service was not running
    pub fn mark_stopped(&self) -> bool {
        self.0
            .compare_exchange(STARTED, STOPPED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn mark_shutdown(&self) {
        self.0.store(SHUT_DOWN, Ordering::SeqCst);
    }
}
