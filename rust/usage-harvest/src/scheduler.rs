//! Per-endpoint arbitration.
//!
//! One [`EndpointScheduler`] drives the intentions of one remote endpoint.
//! Mutual exclusion lives entirely in the persisted scheduler row: a worker
//! owns the endpoint while its token sits in the row's slot, and any other
//! worker asking at the same time gets [`RunOutcome::Busy`] instead of
//! waiting.

use tracing::{debug, info, warn};

use crate::clock::after;
use crate::error::Result;
use crate::intention::{IntentionProcessor, ProcessOutcome};
use crate::store::Claim;
use crate::HarvestContext;

/// Coarse result of one [`EndpointScheduler::run_next`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunOutcome {
    /// Nothing could run now.
    Idle,
    /// The endpoint answered too recently; try again after `when_ready`.
    Cooldown,
    /// Another worker holds the endpoint.
    Busy,
    /// One intention was processed.
    Processed,
    /// The selected intention had an unusable credential or mapping.
    Broken,
}

impl RunOutcome {
    /// Whether the caller should come back for this endpoint soon.
    pub fn should_rearm(self) -> bool {
        matches!(
            self,
            RunOutcome::Cooldown | RunOutcome::Busy | RunOutcome::Processed
        )
    }
}

/// Decides whether the worker holding a token is gone.
pub trait LivenessProbe: Send + Sync {
    /// `true` only when the worker is known to be gone.
    ///
    /// Returning `false` for an unknown token is always safe; such slots are
    /// then recovered through the job time limit alone.
    fn is_terminated(&self, worker_token: &str) -> bool;
}

/// Runs the intentions of one endpoint, one at a time.
#[derive(Debug, Clone)]
pub struct EndpointScheduler {
    ctx: HarvestContext,
    url: String,
    processor: IntentionProcessor,
}

impl EndpointScheduler {
    /// Scheduler for the endpoint at `url`. Its row is created on first run.
    pub fn new(ctx: HarvestContext, url: impl Into<String>) -> Self {
        Self {
            processor: IntentionProcessor::new(ctx.clone()),
            ctx,
            url: url.into(),
        }
    }

    /// Select, claim and process the next intention of this endpoint.
    ///
    /// No store transaction is held while the report is fetched. The slot
    /// is released before returning, also when processing fails. If the
    /// slot was taken over meanwhile (see [`unlock_stuck_schedulers`]), the
    /// new holder's slot and `when_ready` are left alone.
    ///
    /// # Arguments
    ///
    /// * `worker_token` - Identity written into the slot; must be unique per live worker
    ///
    /// # Errors
    ///
    /// Returns error if the store fails or processing fails. The slot is
    /// released first in the latter case.
    pub async fn run_next(&self, worker_token: &str) -> Result<RunOutcome> {
        let store = &self.ctx.store;
        let url = self.url.as_str();
        let scheduler = store
            .ensure_scheduler(url, &self.ctx.settings.scheduler)
            .await?;
        let now = self.ctx.clock.now();

        if let Some(last) = store.last_request_at(url).await? {
            let ready_at = after(last, scheduler.cooldown);
            if now < ready_at {
                store.set_when_ready(url, ready_at).await?;
                debug!(url, %ready_at, "Endpoint cooling down");
                return Ok(RunOutcome::Cooldown);
            }
        }

        let intention = match store.claim_next(url, worker_token, now).await? {
            Claim::Busy => {
                debug!(url, worker_token, "Endpoint held by another worker");
                return Ok(RunOutcome::Busy);
            }
            Claim::Idle => return Ok(RunOutcome::Idle),
            Claim::Claimed(intention) => intention,
        };
        debug!(
            url,
            worker_token,
            intention_id = %intention.id,
            priority = ?intention.priority,
            "Claimed intention"
        );

        let result = self.processor.process(&intention).await;

        let finished = self.ctx.clock.now();
        let ready_at = match &result {
            Ok(ProcessOutcome::Broken) => None,
            _ => Some(after(finished, scheduler.cooldown)),
        };
        let still_held = store.finish_run(url, worker_token, ready_at).await?;
        let outcome = result?;

        if !still_held {
            warn!(
                url,
                worker_token,
                intention_id = %intention.id,
                "Scheduler slot was taken over while processing"
            );
            return Ok(RunOutcome::Processed);
        }
        if outcome.is_broken() {
            info!(url, intention_id = %intention.id, "Intention has broken credentials");
            return Ok(RunOutcome::Broken);
        }
        Ok(RunOutcome::Processed)
    }
}

/// Free endpoint slots held by dead workers or held for longer than the job time limit.
///
/// # Arguments
///
/// * `ctx` - Supplies the store, the clock and `job_time_limit`
/// * `probe` - Judges whether a slot holder is gone
///
/// Returns how many schedulers were unlocked. Each release is conditional
/// on the token seen here, so a worker finishing concurrently is not
/// disturbed.
pub async fn unlock_stuck_schedulers(
    ctx: &HarvestContext,
    probe: &dyn LivenessProbe,
) -> Result<usize> {
    let now = ctx.clock.now();
    let limit = ctx.settings.job_time_limit;
    let mut unlocked = 0;

    for scheduler in ctx.store.occupied_schedulers().await? {
        let Some(token) = scheduler.current_worker_token.as_deref() else {
            warn!(url = %scheduler.url, "Scheduler slot has an intention but no worker token");
            continue;
        };
        let expired = scheduler
            .current_start
            .is_none_or(|start| after(start, limit) < now);
        let terminated = probe.is_terminated(token);
        if !expired && !terminated {
            continue;
        }

        let released = ctx.store.unassign(&scheduler.url, token, now).await?;
        if let Some(intention_id) = released {
            warn!(
                url = %scheduler.url,
                worker_token = token,
                %intention_id,
                expired,
                terminated,
                "Unlocked stuck scheduler"
            );
            unlocked += 1;
        }
    }
    Ok(unlocked)
}
