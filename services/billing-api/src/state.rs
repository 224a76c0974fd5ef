//! Application state for the Billing API service.

use std::sync::Arc;

use agenda_billing_core::{BillingService, Scheduler};
use agenda_db::DbPool;

use crate::config::Config;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Subscription lifecycle engine
    pub billing: Arc<BillingService>,
    /// Job runner shared with the timer loops, so manual and scheduled runs
    /// share one overlap guard
    pub scheduler: Scheduler,
    /// Database pool (readiness probe)
    pub pool: DbPool,
    /// Configuration
    pub config: Arc<Config>,
}

impl AppState {
    /// Create new application state
    pub fn new(billing: BillingService, scheduler: Scheduler, pool: DbPool, config: Config) -> Self {
        Self {
            billing: Arc::new(billing),
            scheduler,
            pool,
            config: Arc::new(config),
        }
    }

    /// Get request timeout from config
    pub fn request_timeout(&self) -> std::time::Duration {
        self.config.request_timeout
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
