//! Planning of harvests and their progress reporting.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::info;

use crate::error::{HarvestError, Result};
use crate::model::{Harvest, HarvestId, HarvestStats, NewIntention, Priority};
use crate::outbox::{WakeOutbox, WakeSink};
use crate::HarvestContext;

/// Entry point for queueing fetches.
#[derive(Clone)]
pub struct HarvestPlanner {
    ctx: HarvestContext,
    wake: Arc<dyn WakeSink>,
}

impl std::fmt::Debug for HarvestPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarvestPlanner")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

impl HarvestPlanner {
    /// Planner that wakes endpoints through `wake` after committing.
    pub fn new(ctx: HarvestContext, wake: Arc<dyn WakeSink>) -> Self {
        Self { ctx, wake }
    }

    /// Append `intentions` to `existing`, or to a new harvest.
    ///
    /// Every intention gets `priority`. With [`Priority::Now`] each touched
    /// endpoint is woken once the intentions are stored.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - An intention has `start_date >= end_date`
    /// - An intention names an unknown credential
    /// - `existing` names an unknown harvest
    ///
    /// The harvest and its intentions are written in one transaction, so a
    /// failed plan stores neither.
    pub async fn plan(
        &self,
        intentions: Vec<NewIntention>,
        existing: Option<HarvestId>,
        priority: Priority,
        actor: Option<&str>,
    ) -> Result<Harvest> {
        let store = &self.ctx.store;
        let now = self.ctx.clock.now();

        let mut urls = BTreeSet::new();
        for intention in &intentions {
            intention.validate()?;
            let credential = store
                .credential(intention.credential_id)
                .await?
                .ok_or_else(|| HarvestError::not_found("credential", intention.credential_id))?;
            urls.insert(credential.url);
        }
        for url in &urls {
            store
                .ensure_scheduler(url, &self.ctx.settings.scheduler)
                .await?;
        }

        let intentions: Vec<_> = intentions
            .into_iter()
            .map(|intention| intention.with_priority(priority))
            .collect();
        let (harvest, created) = store.plan_harvest(existing, actor, intentions, now).await?;

        let mut outbox = WakeOutbox::new();
        if priority == Priority::Now {
            for url in urls {
                outbox.defer(url);
            }
        }
        let woken = outbox.flush(self.wake.as_ref());

        info!(
            harvest_id = %harvest.id,
            intentions = created.len(),
            ?priority,
            woken,
            "Harvest planned"
        );
        Ok(harvest)
    }

    /// Progress of a harvest, counting each retry lineage once.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown harvest.
    pub async fn stats(&self, harvest_id: HarvestId) -> Result<HarvestStats> {
        let store = &self.ctx.store;
        if store.harvest(harvest_id).await?.is_none() {
            return Err(HarvestError::not_found("harvest", harvest_id));
        }
        let intentions = store.harvest_intentions(harvest_id).await?;
        Ok(HarvestStats::from_intentions(&intentions))
    }

    /// Delete a manual harvest with all of its intentions.
    ///
    /// Harvests owned by an automatic plan are refused with
    /// `AutomaticHarvest`. Returns the number of intentions removed.
    pub async fn wipe(&self, harvest_id: HarvestId) -> Result<usize> {
        let store = &self.ctx.store;
        let harvest = store
            .harvest(harvest_id)
            .await?
            .ok_or_else(|| HarvestError::not_found("harvest", harvest_id))?;
        if harvest.automatic_id.is_some() {
            return Err(HarvestError::AutomaticHarvest(harvest_id));
        }
        let removed = store.delete_harvest(harvest_id).await?;
        info!(harvest_id = %harvest_id, removed, "Harvest wiped");
        Ok(removed)
    }
}
