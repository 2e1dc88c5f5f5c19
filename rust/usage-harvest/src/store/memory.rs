//! In-memory store for tests and embedding.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;

use super::{
    Claim, Completed, Completion, HarvestStore, ReconcileCounts, ReconcilePlan, AUTOMATIC_ACTOR,
};
use crate::config::SchedulerDefaults;
use crate::error::{HarvestError, Result};
use crate::model::{
    Automatic, AutomaticId, Credential, CredentialId, CredentialReport, FetchIntention, Harvest,
    HarvestId, IntentionId, IntentionStatus, NewIntention, OrganizationId, Priority, ReportType,
    ReportTypeId, RequestKey, Scheduler,
};

#[derive(Debug, Default)]
struct Tables {
    credentials: BTreeMap<CredentialId, Credential>,
    report_types: BTreeMap<ReportTypeId, ReportType>,
    mappings: BTreeMap<(CredentialId, ReportTypeId), CredentialReport>,
    harvests: BTreeMap<HarvestId, Harvest>,
    automatics: BTreeMap<AutomaticId, Automatic>,
    schedulers: BTreeMap<String, Scheduler>,
    intentions: BTreeMap<IntentionId, FetchIntention>,
    last_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn new_harvest(
        &mut self,
        actor: Option<&str>,
        automatic_id: Option<AutomaticId>,
        now: DateTime<Utc>,
    ) -> Harvest {
        let harvest = Harvest {
            id: HarvestId(self.next_id()),
            created: now,
            last_updated: now,
            last_updated_by: actor.map(str::to_string),
            automatic_id,
        };
        self.harvests.insert(harvest.id, harvest.clone());
        harvest
    }

    fn insert(
        &mut self,
        harvest_id: HarvestId,
        new: NewIntention,
        now: DateTime<Utc>,
    ) -> FetchIntention {
        let intention = FetchIntention {
            id: IntentionId(self.next_id()),
            harvest_id,
            credential_id: new.credential_id,
            report_type_id: new.report_type_id,
            start_date: new.start_date,
            end_date: new.end_date,
            not_before: new.not_before.unwrap_or(now),
            priority: new.priority,
            scheduler: None,
            when_processed: None,
            status: IntentionStatus::Planned,
            error_code: None,
            attempt_id: None,
            retry: new.retry,
            retry_id: new.retry_id,
            duplicate_of: None,
        };
        self.intentions.insert(intention.id, intention.clone());
        intention
    }

    /// Point unprocessed siblings of `of` at it; unclaimed ones are finalized.
    fn collapse_duplicates(&mut self, of: IntentionId, key: RequestKey, now: DateTime<Utc>) -> usize {
        let mut marked = 0;
        for sibling in self.intentions.values_mut() {
            if sibling.id == of
                || sibling.is_processed()
                || sibling.duplicate_of.is_some()
                || sibling.request_key() != key
            {
                continue;
            }
            sibling.duplicate_of = Some(of);
            if sibling.scheduler.is_none() {
                sibling.when_processed = Some(now);
                sibling.status = IntentionStatus::Duplicate;
            }
            marked += 1;
        }
        marked
    }

    fn find_automatic(&self, month: NaiveDate, organization_id: OrganizationId) -> Option<&Automatic> {
        self.automatics
            .values()
            .find(|a| a.month == month && a.organization_id == organization_id)
    }

    /// Credential URL of a runnable intention, or `None` if it is not runnable at `now`.
    fn runnable_url(&self, intention: &FetchIntention, now: DateTime<Utc>) -> Option<&str> {
        if intention.is_processed()
            || intention.scheduler.is_some()
            || intention.duplicate_of.is_some()
            || intention.not_before > now
        {
            return None;
        }
        let credential = self.credentials.get(&intention.credential_id)?;
        if credential.broken {
            return None;
        }
        let mapping_broken = self
            .mappings
            .get(&(intention.credential_id, intention.report_type_id))
            .is_some_and(|m| m.broken);
        if mapping_broken {
            return None;
        }
        Some(credential.url.as_str())
    }

    fn scheduler_mut(&mut self, url: &str) -> Result<&mut Scheduler> {
        self.schedulers
            .get_mut(url)
            .ok_or_else(|| HarvestError::not_found("scheduler", url))
    }
}

/// [`HarvestStore`] backed by in-process maps.
///
/// A single mutex serializes all operations, which trivially makes each of
/// them atomic.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HarvestStore for InMemoryStore {
    async fn put_credential(&self, credential: Credential) -> Result<()> {
        self.tables
            .lock()
            .credentials
            .insert(credential.id, credential);
        Ok(())
    }

    async fn credential(&self, id: CredentialId) -> Result<Option<Credential>> {
        Ok(self.tables.lock().credentials.get(&id).cloned())
    }

    async fn credentials(&self) -> Result<Vec<Credential>> {
        Ok(self.tables.lock().credentials.values().cloned().collect())
    }

    async fn put_report_type(&self, report_type: ReportType) -> Result<()> {
        self.tables
            .lock()
            .report_types
            .insert(report_type.id, report_type);
        Ok(())
    }

    async fn report_type(&self, id: ReportTypeId) -> Result<Option<ReportType>> {
        Ok(self.tables.lock().report_types.get(&id).cloned())
    }

    async fn put_credential_report(&self, mapping: CredentialReport) -> Result<()> {
        self.tables
            .lock()
            .mappings
            .insert((mapping.credential_id, mapping.report_type_id), mapping);
        Ok(())
    }

    async fn credential_report(
        &self,
        credential_id: CredentialId,
        report_type_id: ReportTypeId,
    ) -> Result<Option<CredentialReport>> {
        Ok(self
            .tables
            .lock()
            .mappings
            .get(&(credential_id, report_type_id))
            .copied())
    }

    async fn credential_reports(&self) -> Result<Vec<CredentialReport>> {
        Ok(self.tables.lock().mappings.values().copied().collect())
    }

    async fn plan_harvest(
        &self,
        existing: Option<HarvestId>,
        actor: Option<&str>,
        intentions: Vec<NewIntention>,
        now: DateTime<Utc>,
    ) -> Result<(Harvest, Vec<FetchIntention>)> {
        for new in &intentions {
            new.validate()?;
        }
        let mut tables = self.tables.lock();
        let harvest_id = match existing {
            Some(id) => {
                let harvest = tables
                    .harvests
                    .get_mut(&id)
                    .ok_or_else(|| HarvestError::not_found("harvest", id))?;
                harvest.last_updated = now;
                harvest.last_updated_by = actor.map(str::to_string);
                id
            }
            None => tables.new_harvest(actor, None, now).id,
        };
        let created = intentions
            .into_iter()
            .map(|new| tables.insert(harvest_id, new, now))
            .collect();
        let harvest = tables
            .harvests
            .get(&harvest_id)
            .cloned()
            .ok_or_else(|| HarvestError::not_found("harvest", harvest_id))?;
        Ok((harvest, created))
    }

    async fn harvest(&self, id: HarvestId) -> Result<Option<Harvest>> {
        Ok(self.tables.lock().harvests.get(&id).cloned())
    }

    async fn delete_harvest(&self, id: HarvestId) -> Result<usize> {
        let mut tables = self.tables.lock();
        if tables.harvests.remove(&id).is_none() {
            return Err(HarvestError::not_found("harvest", id));
        }
        let before = tables.intentions.len();
        tables.intentions.retain(|_, i| i.harvest_id != id);
        Ok(before - tables.intentions.len())
    }

    async fn intention(&self, id: IntentionId) -> Result<Option<FetchIntention>> {
        Ok(self.tables.lock().intentions.get(&id).cloned())
    }

    async fn harvest_intentions(&self, harvest_id: HarvestId) -> Result<Vec<FetchIntention>> {
        Ok(self
            .tables
            .lock()
            .intentions
            .values()
            .filter(|i| i.harvest_id == harvest_id)
            .cloned()
            .collect())
    }

    async fn complete_intention(
        &self,
        id: IntentionId,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<Completed> {
        let mut tables = self.tables.lock();
        let (processed, key, harvest_id) = tables
            .intentions
            .get(&id)
            .map(|i| (i.is_processed(), i.request_key(), i.harvest_id))
            .ok_or_else(|| HarvestError::not_found("intention", id))?;
        if processed {
            return Ok(Completed::AlreadyProcessed);
        }
        if let Some(successor) = &completion.successor {
            successor.validate()?;
        }
        if let Some((url, _)) = &completion.throttle {
            if !tables.schedulers.contains_key(url) {
                return Err(HarvestError::not_found("scheduler", url));
            }
        }

        if let Some((url, until)) = &completion.throttle {
            let scheduler = tables.scheduler_mut(url)?;
            scheduler.when_ready = scheduler.when_ready.max(*until);
        }
        let outcome = completion.outcome;
        let lineage = completion.successor.as_ref().and_then(|new| new.retry_id);
        let intention = tables
            .intentions
            .get_mut(&id)
            .ok_or_else(|| HarvestError::not_found("intention", id))?;
        intention.when_processed = Some(now);
        intention.status = outcome.status;
        intention.error_code = outcome.error_code;
        intention.attempt_id = outcome.attempt_id;
        if intention.retry_id.is_none() {
            intention.retry_id = lineage;
        }

        let successor = completion
            .successor
            .map(|new| tables.insert(harvest_id, new, now).id);
        let duplicates = if completion.collapse_duplicates {
            tables.collapse_duplicates(id, key, now)
        } else {
            0
        };
        Ok(Completed::Recorded {
            successor,
            duplicates,
        })
    }

    async fn ensure_scheduler(&self, url: &str, defaults: &SchedulerDefaults) -> Result<Scheduler> {
        Ok(self
            .tables
            .lock()
            .schedulers
            .entry(url.to_string())
            .or_insert_with(|| Scheduler::new(url, defaults))
            .clone())
    }

    async fn scheduler(&self, url: &str) -> Result<Option<Scheduler>> {
        Ok(self.tables.lock().schedulers.get(url).cloned())
    }

    async fn set_when_ready(&self, url: &str, until: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.lock();
        let scheduler = tables.scheduler_mut(url)?;
        scheduler.when_ready = scheduler.when_ready.max(until);
        Ok(())
    }

    async fn last_request_at(&self, url: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .tables
            .lock()
            .intentions
            .values()
            .filter(|i| {
                i.scheduler.as_deref() == Some(url)
                    && matches!(i.status, IntentionStatus::Success | IntentionStatus::Error)
            })
            .filter_map(|i| i.when_processed)
            .max())
    }

    async fn claim_next(
        &self,
        url: &str,
        worker_token: &str,
        now: DateTime<Utc>,
    ) -> Result<Claim> {
        let mut tables = self.tables.lock();
        let scheduler = tables
            .schedulers
            .get(url)
            .ok_or_else(|| HarvestError::not_found("scheduler", url))?;
        if scheduler.is_occupied() {
            return Ok(Claim::Busy);
        }
        let when_ready = scheduler.when_ready;

        let candidate = tables
            .intentions
            .values()
            .filter(|i| tables.runnable_url(i, now) == Some(url))
            .min_by_key(|i| (std::cmp::Reverse(i.priority), i.not_before, i.id))
            .map(|i| (i.id, i.priority));

        let Some((id, priority)) = candidate else {
            return Ok(Claim::Idle);
        };
        if when_ready > now && priority != Priority::Now {
            return Ok(Claim::Idle);
        }

        let scheduler = tables.scheduler_mut(url)?;
        scheduler.current_intention = Some(id);
        scheduler.current_worker_token = Some(worker_token.to_string());
        scheduler.current_start = Some(now);

        let intention = tables
            .intentions
            .get_mut(&id)
            .ok_or_else(|| HarvestError::not_found("intention", id))?;
        intention.scheduler = Some(url.to_string());
        Ok(Claim::Claimed(intention.clone()))
    }

    async fn finish_run(
        &self,
        url: &str,
        worker_token: &str,
        ready_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock();
        let scheduler = tables.scheduler_mut(url)?;
        if scheduler.current_worker_token.as_deref() != Some(worker_token) {
            return Ok(false);
        }
        if let Some(ready_at) = ready_at {
            scheduler.when_ready = scheduler.when_ready.max(ready_at);
        }
        scheduler.release();
        Ok(true)
    }

    async fn occupied_schedulers(&self) -> Result<Vec<Scheduler>> {
        Ok(self
            .tables
            .lock()
            .schedulers
            .values()
            .filter(|s| s.is_occupied())
            .cloned()
            .collect())
    }

    async fn unassign(
        &self,
        url: &str,
        worker_token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IntentionId>> {
        let mut tables = self.tables.lock();
        let scheduler = tables.scheduler_mut(url)?;
        if scheduler.current_worker_token.as_deref() != Some(worker_token) {
            return Ok(None);
        }
        let held = scheduler.current_intention;
        scheduler.release();

        if let Some(intention) = held.and_then(|id| tables.intentions.get_mut(&id)) {
            if !intention.is_processed() {
                intention.scheduler = None;
                intention.not_before = intention.not_before.max(now);
            }
        }
        Ok(held)
    }

    async fn due_endpoints(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let tables = self.tables.lock();
        let mut urls = BTreeSet::new();
        for intention in tables.intentions.values() {
            let Some(url) = tables.runnable_url(intention, now) else {
                continue;
            };
            let ready = tables
                .schedulers
                .get(url)
                .is_none_or(|s| s.when_ready <= now);
            if ready || intention.priority == Priority::Now {
                urls.insert(url.to_string());
            }
        }
        Ok(urls.into_iter().collect())
    }

    async fn automatic(
        &self,
        month: NaiveDate,
        organization_id: OrganizationId,
    ) -> Result<Option<Automatic>> {
        Ok(self
            .tables
            .lock()
            .find_automatic(month, organization_id)
            .cloned())
    }

    async fn apply_reconciliation(
        &self,
        month: NaiveDate,
        plans: Vec<ReconcilePlan>,
        now: DateTime<Utc>,
    ) -> Result<ReconcileCounts> {
        for new in plans.iter().flat_map(|plan| &plan.add) {
            new.validate()?;
        }
        let mut tables = self.tables.lock();
        let mut counts = ReconcileCounts::default();

        for plan in plans {
            let existing = tables
                .find_automatic(month, plan.organization_id)
                .map(|a| a.harvest_id);
            let harvest_id = match existing {
                Some(harvest_id) => harvest_id,
                None if plan.add.is_empty() => continue,
                None => {
                    let id = AutomaticId(tables.next_id());
                    let harvest = tables.new_harvest(Some(AUTOMATIC_ACTOR), Some(id), now);
                    tables.automatics.insert(
                        id,
                        Automatic {
                            id,
                            month,
                            organization_id: plan.organization_id,
                            harvest_id: harvest.id,
                        },
                    );
                    counts.created += 1;
                    harvest.id
                }
            };

            let mut changed = false;
            for new in plan.add {
                let exists = tables.intentions.values().any(|i| {
                    i.harvest_id == harvest_id
                        && i.credential_id == new.credential_id
                        && i.report_type_id == new.report_type_id
                        && i.start_date == new.start_date
                        && i.end_date == new.end_date
                });
                if !exists {
                    tables.insert(harvest_id, new, now);
                    counts.added += 1;
                    changed = true;
                }
            }
            for id in plan.delete {
                let removable = tables.intentions.get(&id).is_some_and(|i| {
                    i.harvest_id == harvest_id && !i.is_processed() && i.scheduler.is_none()
                });
                if removable {
                    tables.intentions.remove(&id);
                    counts.deleted += 1;
                    changed = true;
                }
            }
            if changed {
                if let Some(harvest) = tables.harvests.get_mut(&harvest_id) {
                    harvest.last_updated = now;
                    harvest.last_updated_by = Some(AUTOMATIC_ACTOR.to_string());
                }
            }
        }
        Ok(counts)
    }
}
