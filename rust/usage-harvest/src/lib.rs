//! Harvest scheduling and retry handling for usage-statistics reports.
//!
//! This crate coordinates many pending "fetch this report for this
//! credential and date range" work items against a much smaller number of
//! remote report endpoints.
//!
//! # Architecture
//!
//! - [`classifier`] maps provider error codes to retry strategies
//! - [`intention`] runs one [`FetchIntention`] and drives its retry chain
//! - [`scheduler`] arbitrates exclusive access to one endpoint
//! - [`harvest`] plans batches of intentions and reports their progress
//! - [`automatic`] reconciles the recurring monthly harvest
//! - [`store`] persists everything behind the [`HarvestStore`] trait
//! - [`runtime`] wires the periodic triggers, wake-ups and stuck sweeps
//!
//! All coordination between workers goes through the persisted scheduler
//! row; nothing is shared in memory between processes.
//!
//! # Usage
//!
//! ```rust,ignore
//! use usage_harvest::prelude::*;
//!
//! let store = Arc::new(SqliteStore::open("./harvest.db").await?);
//! let ctx = HarvestContext::new(store, client, Arc::new(SystemClock));
//!
//! // Queue an urgent fetch
//! let harvest = HarvestPlanner::new(ctx.clone(), wake)
//!     .plan(intentions, None, Priority::Now, Some("admin"))
//!     .await?;
//!
//! // Drive one endpoint
//! let outcome = EndpointScheduler::new(ctx, url).run_next(&token).await?;
//! ```

pub mod automatic;
pub mod classifier;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod harvest;
pub mod intention;
pub mod model;
pub mod outbox;
pub mod runtime;
pub mod scheduler;
pub mod store;

use std::sync::Arc;

// Re-exports
pub use error::{HarvestError, Result};
pub use model::{FetchIntention, Priority};
pub use store::HarvestStore;

use crate::client::{ImportSink, NullImport, ReportClient};
use crate::clock::Clock;
use crate::config::HarvestSettings;

/// Prelude for convenient imports.
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::automatic::{ReconcileReport, Reconciler};
    pub use crate::client::{FetchResponse, ImportSink, ReportClient};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{HarvestConfig, HarvestSettings};
    pub use crate::harvest::HarvestPlanner;
    pub use crate::intention::{IntentionProcessor, ProcessOutcome};
    pub use crate::model::{
        Credential, CredentialReport, FetchIntention, NewIntention, Priority, ReportType,
    };
    pub use crate::scheduler::{EndpointScheduler, RunOutcome};
    pub use crate::store::{HarvestStore, InMemoryStore, SqliteStore};
    pub use crate::HarvestContext;
}

/// Shared collaborators handed to every harvesting component.
///
/// Cloning is cheap; every field is reference counted.
#[derive(Clone)]
pub struct HarvestContext {
    /// Persistent state.
    pub store: Arc<dyn HarvestStore>,
    /// Protocol client performing the actual report download.
    pub client: Arc<dyn ReportClient>,
    /// Destination for successfully downloaded payloads.
    pub import: Arc<dyn ImportSink>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Delays, ceilings and limits.
    pub settings: HarvestSettings,
}

impl HarvestContext {
    /// Create a context with default settings and no import pipeline.
    #[must_use]
    pub fn new(
        store: Arc<dyn HarvestStore>,
        client: Arc<dyn ReportClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            client,
            import: Arc::new(NullImport),
            clock,
            settings: HarvestSettings::default(),
        }
    }

    /// Replace the settings.
    #[must_use]
    pub fn with_settings(mut self, settings: HarvestSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the import pipeline.
    #[must_use]
    pub fn with_import(mut self, import: Arc<dyn ImportSink>) -> Self {
        self.import = import;
        self
    }
}

impl std::fmt::Debug for HarvestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarvestContext")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
