//! Persistence backends for harvest state.
//!
//! Every operation on [`HarvestStore`] is atomic. Operations that coordinate
//! workers ([`HarvestStore::claim_next`], [`HarvestStore::finish_run`],
//! [`HarvestStore::unassign`], [`HarvestStore::complete_intention`]) are
//! compare-and-set updates on persisted fields, so any number of processes
//! may share one store.

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::config::SchedulerDefaults;
use crate::error::Result;
use crate::model::{
    Automatic, Credential, CredentialId, CredentialReport, FetchIntention, Harvest, HarvestId,
    IntentionId, NewIntention, OrganizationId, Outcome, ReportType, ReportTypeId, Scheduler,
};

/// Result of trying to take the next intention of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// Another worker holds the endpoint slot.
    Busy,
    /// Nothing eligible, or the endpoint is throttled for the best candidate.
    Idle,
    /// The slot is now held by the caller for this intention.
    Claimed(FetchIntention),
}

/// Everything written when an intention gets its final result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub outcome: Outcome,
    /// `(url, until)`: move that endpoint's `when_ready` forward to `until`.
    pub throttle: Option<(String, DateTime<Utc>)>,
    /// Next attempt of the lineage. Its `retry_id` names the lineage and is
    /// also stored on the completed intention if that has none yet.
    pub successor: Option<NewIntention>,
    /// Point the other unprocessed intentions for the same request at this one.
    pub collapse_duplicates: bool,
}

impl Completion {
    /// Record `outcome` and nothing else.
    pub fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            throttle: None,
            successor: None,
            collapse_duplicates: false,
        }
    }
}

/// What [`HarvestStore::complete_intention`] wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completed {
    /// The intention had already been processed. Nothing was written.
    AlreadyProcessed,
    Recorded {
        successor: Option<IntentionId>,
        duplicates: usize,
    },
}

/// Changes to one organization's automatic harvest for a month.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub organization_id: OrganizationId,
    pub add: Vec<NewIntention>,
    pub delete: Vec<IntentionId>,
}

/// What a reconciliation transaction changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileCounts {
    /// `Automatic`/`Harvest` pairs created.
    pub created: usize,
    pub added: usize,
    pub deleted: usize,
}

/// Storage for credentials, harvests, intentions, schedulers and automatic plans.
///
/// Implementations must make each method a single atomic step: when a
/// method returns an error, none of its writes are visible.
#[async_trait]
pub trait HarvestStore: Send + Sync {
    /// Insert or replace a credential.
    async fn put_credential(&self, credential: Credential) -> Result<()>;

    async fn credential(&self, id: CredentialId) -> Result<Option<Credential>>;

    /// All credentials, ordered by id.
    async fn credentials(&self) -> Result<Vec<Credential>>;

    async fn put_report_type(&self, report_type: ReportType) -> Result<()>;

    async fn report_type(&self, id: ReportTypeId) -> Result<Option<ReportType>>;

    /// Insert or replace the mapping of a credential to a report type.
    async fn put_credential_report(&self, mapping: CredentialReport) -> Result<()>;

    async fn credential_report(
        &self,
        credential_id: CredentialId,
        report_type_id: ReportTypeId,
    ) -> Result<Option<CredentialReport>>;

    /// All mappings, ordered by credential then report type.
    async fn credential_reports(&self) -> Result<Vec<CredentialReport>>;

    /// Append intentions to a harvest in one transaction.
    ///
    /// # Arguments
    ///
    /// * `existing` - Harvest to extend; a new manual harvest is created when `None`
    /// * `actor` - Recorded as the harvest's last editor
    /// * `intentions` - Rows to insert; those without `not_before` become eligible at `now`
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Any intention has `start_date >= end_date` (`InvalidDateRange`)
    /// - `existing` names a harvest that does not exist (`NotFound`)
    ///
    /// In both cases nothing is written, not even a new harvest.
    async fn plan_harvest(
        &self,
        existing: Option<HarvestId>,
        actor: Option<&str>,
        intentions: Vec<NewIntention>,
        now: DateTime<Utc>,
    ) -> Result<(Harvest, Vec<FetchIntention>)>;

    async fn harvest(&self, id: HarvestId) -> Result<Option<Harvest>>;

    /// Remove a harvest and all of its intentions. Returns the number of intentions removed.
    async fn delete_harvest(&self, id: HarvestId) -> Result<usize>;

    async fn intention(&self, id: IntentionId) -> Result<Option<FetchIntention>>;

    /// Every intention of a harvest, retries and duplicates included.
    async fn harvest_intentions(&self, harvest_id: HarvestId) -> Result<Vec<FetchIntention>>;

    /// Finish an intention together with its follow-ups, in one transaction.
    ///
    /// The outcome is written only if `when_processed` is still unset. Then
    /// the throttle is applied, the successor inserted and duplicates
    /// collapsed, as requested by `completion`. Siblings that are not claimed
    /// by a scheduler are finalized as duplicates immediately; claimed ones
    /// only get `duplicate_of`, which their worker checks before fetching.
    ///
    /// # Errors
    ///
    /// Returns error if the intention or the throttled scheduler does not
    /// exist, or the successor has an invalid date range. Nothing is written
    /// then, so the intention stays unprocessed.
    async fn complete_intention(
        &self,
        id: IntentionId,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<Completed>;

    /// Write a bare outcome. Returns `false` when the intention was already processed.
    async fn record_outcome(
        &self,
        id: IntentionId,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let completed = self
            .complete_intention(id, Completion::new(outcome.clone()), now)
            .await?;
        Ok(completed != Completed::AlreadyProcessed)
    }

    /// Get the scheduler row for `url`, creating it with `defaults` if missing.
    async fn ensure_scheduler(&self, url: &str, defaults: &SchedulerDefaults) -> Result<Scheduler>;

    async fn scheduler(&self, url: &str) -> Result<Option<Scheduler>>;

    /// Move `when_ready` forward to `until`. Never moves it backwards.
    async fn set_when_ready(&self, url: &str, until: DateTime<Utc>) -> Result<()>;

    /// When the endpoint last answered a request issued by one of our intentions.
    async fn last_request_at(&self, url: &str) -> Result<Option<DateTime<Utc>>>;

    /// Take the endpoint slot and the best eligible intention in one step.
    ///
    /// Fails with `Busy` if the slot is held. Candidates are unprocessed,
    /// unclaimed, not duplicates, not blocked by a broken credential or
    /// mapping, and due (`not_before <= now`). The best one is chosen by
    /// priority, then `not_before`, then id. It is admitted when the
    /// endpoint is ready or the candidate has [`Priority::Now`](crate::Priority::Now).
    async fn claim_next(&self, url: &str, worker_token: &str, now: DateTime<Utc>)
        -> Result<Claim>;

    /// Release the slot if `worker_token` still holds it.
    ///
    /// `when_ready` is moved forward to `ready_at` when given. Returns
    /// `false` if the slot had been taken over.
    async fn finish_run(
        &self,
        url: &str,
        worker_token: &str,
        ready_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// Schedulers whose slot is held.
    async fn occupied_schedulers(&self) -> Result<Vec<Scheduler>>;

    /// Forcefully free a slot still held by `worker_token`.
    ///
    /// The held intention, if unprocessed, loses its claim and becomes due
    /// again at `max(now, not_before)`.
    async fn unassign(
        &self,
        url: &str,
        worker_token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IntentionId>>;

    /// URLs with at least one intention that a worker could start now.
    async fn due_endpoints(&self, now: DateTime<Utc>) -> Result<Vec<String>>;

    /// The automatic plan of `(month, organization)`, if one was created.
    async fn automatic(
        &self,
        month: NaiveDate,
        organization_id: OrganizationId,
    ) -> Result<Option<Automatic>>;

    /// Apply the reconciliation of every organization for `month` in one transaction.
    ///
    /// A plan whose organization has no `Automatic` for the month creates
    /// the `Automatic`/`Harvest` pair first, unless it only deletes. Adds
    /// whose request already has an intention in the harvest are skipped.
    /// Deletes only touch unprocessed, unclaimed rows of that harvest.
    ///
    /// # Errors
    ///
    /// Any failure, such as an add with an invalid date range, rolls back
    /// every plan.
    async fn apply_reconciliation(
        &self,
        month: NaiveDate,
        plans: Vec<ReconcilePlan>,
        now: DateTime<Utc>,
    ) -> Result<ReconcileCounts>;
}

/// Actor recorded on harvests maintained by the reconciler.
pub(crate) const AUTOMATIC_ACTOR: &str = "automatic";
