//! Monthly reconciliation of recurring harvests.
//!
//! For every organization the reconciler derives the wanted
//! `(credential, report)` pairs for the current month from the usable
//! credential mappings and diffs them against the organization's
//! [`Automatic`] harvest for that month. Re-running it without credential
//! changes is a no-op.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::anyhow;
use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::after;
use crate::error::Result;
use crate::model::{CredentialId, FetchIntention, NewIntention, OrganizationId, ReportTypeId};
use crate::store::ReconcilePlan;
use crate::HarvestContext;

/// Totals of one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub added: usize,
    pub deleted: usize,
}

/// First day of the month, last day of the month, first day of the next month.
fn month_bounds(date: NaiveDate) -> Result<(NaiveDate, NaiveDate, NaiveDate)> {
    let start = date
        .with_day(1)
        .ok_or_else(|| anyhow!("no first day for {date}"))?;
    let next = start
        .checked_add_months(Months::new(1))
        .ok_or_else(|| anyhow!("month after {start} is out of range"))?;
    let end = next
        .pred_opt()
        .ok_or_else(|| anyhow!("day before {next} is out of range"))?;
    Ok((start, end, next))
}

/// The month a pass works on.
struct Period {
    month: NaiveDate,
    month_end: NaiveDate,
    not_before: DateTime<Utc>,
}

/// Keeps each organization's monthly automatic harvest in line with its credentials.
#[derive(Debug, Clone)]
pub struct Reconciler {
    ctx: HarvestContext,
}

impl Reconciler {
    /// Reconciler reading credentials from, and writing plans to, `ctx.store`.
    pub fn new(ctx: HarvestContext) -> Self {
        Self { ctx }
    }

    /// Plan the current month's reports, to be fetched once the next month begins.
    ///
    /// Intentions become eligible at the start of the next month plus the
    /// configured trigger offset. The diffs of all organizations are applied
    /// in a single store transaction: either every organization is brought
    /// up to date or none is.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails; nothing is changed then.
    pub async fn reconcile_for_next_month(&self) -> Result<ReconcileReport> {
        let store = &self.ctx.store;
        let now = self.ctx.clock.now();
        let (month, month_end, next_month) = month_bounds(now.date_naive())?;
        let period = Period {
            month,
            month_end,
            not_before: after(
                next_month.and_time(NaiveTime::MIN).and_utc(),
                self.ctx.settings.automatic_trigger_offset,
            ),
        };

        let credentials = store.credentials().await?;
        let usable: BTreeMap<CredentialId, OrganizationId> = credentials
            .iter()
            .filter(|c| c.is_usable())
            .map(|c| (c.id, c.organization_id))
            .collect();
        let mut wanted: BTreeMap<OrganizationId, BTreeSet<(CredentialId, ReportTypeId)>> =
            credentials
                .iter()
                .map(|c| (c.organization_id, BTreeSet::new()))
                .collect();
        for mapping in store.credential_reports().await? {
            if !mapping.is_usable() {
                continue;
            }
            if let Some(organization) = usable.get(&mapping.credential_id) {
                wanted
                    .entry(*organization)
                    .or_default()
                    .insert((mapping.credential_id, mapping.report_type_id));
            }
        }

        let mut plans = Vec::new();
        for (organization, pairs) in wanted {
            if let Some(plan) = self.diff_organization(organization, &pairs, &period).await? {
                plans.push(plan);
            }
        }
        if plans.is_empty() {
            debug!(%month, "Automatic harvests up to date");
            return Ok(ReconcileReport::default());
        }

        let organizations = plans.len();
        let counts = store.apply_reconciliation(month, plans, now).await?;
        info!(
            %month,
            organizations,
            created = counts.created,
            added = counts.added,
            deleted = counts.deleted,
            "Automatic harvests reconciled"
        );
        Ok(ReconcileReport {
            added: counts.added,
            deleted: counts.deleted,
        })
    }

    /// Changes bringing one organization's automatic harvest to `pairs`, if any.
    async fn diff_organization(
        &self,
        organization: OrganizationId,
        pairs: &BTreeSet<(CredentialId, ReportTypeId)>,
        period: &Period,
    ) -> Result<Option<ReconcilePlan>> {
        let store = &self.ctx.store;
        let in_month: Vec<FetchIntention> = match store.automatic(period.month, organization).await? {
            Some(automatic) => store
                .harvest_intentions(automatic.harvest_id)
                .await?
                .into_iter()
                .filter(|i| i.start_date == period.month && i.end_date == period.month_end)
                .collect(),
            None => Vec::new(),
        };

        let covered: BTreeSet<_> = in_month
            .iter()
            .map(|i| (i.credential_id, i.report_type_id))
            .collect();
        let add = pairs
            .difference(&covered)
            .map(|(credential_id, report_type_id)| {
                NewIntention::new(*credential_id, *report_type_id, period.month, period.month_end)
                    .map(|new| new.with_not_before(period.not_before))
            })
            .collect::<Result<Vec<_>>>()?;
        let delete: Vec<_> = in_month
            .iter()
            .filter(|i| {
                !i.is_processed()
                    && i.scheduler.is_none()
                    && !pairs.contains(&(i.credential_id, i.report_type_id))
            })
            .map(|i| i.id)
            .collect();

        if add.is_empty() && delete.is_empty() {
            return Ok(None);
        }
        debug!(
            %organization,
            add = add.len(),
            delete = delete.len(),
            "Automatic harvest out of date"
        );
        Ok(Some(ReconcilePlan {
            organization_id: organization,
            add,
            delete,
        }))
    }
}
