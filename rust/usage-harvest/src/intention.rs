//! Execution of a single [`FetchIntention`] and its retry chain.
//!
//! [`IntentionProcessor::process`] moves an intention from planned to one
//! of the terminal states exactly once. A retryable failure appends one
//! successor to the intention's lineage; a lineage whose retries are
//! exhausted simply stops growing.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use tracing::{debug, error, info, warn};

use crate::classifier::{classify, RetryStrategy};
use crate::clock::after;
use crate::error::{HarvestError, Result};
use crate::model::{
    Credential, ErrorCode, FetchIntention, IntentionId, IntentionStatus, NewIntention, Outcome,
};
use crate::store::{Completed, Completion};
use crate::HarvestContext;

/// Result of [`IntentionProcessor::process`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Someone else already processed the intention; nothing was done.
    AlreadyProcessed,
    /// Credential or mapping is unusable. Final, no request was made.
    Broken,
    /// Another intention already fetched the same data. No request was made.
    Duplicate,
    /// Report downloaded; `duplicates` unprocessed siblings were collapsed onto it.
    Success { duplicates: usize },
    /// The provider answered with an error.
    Failed {
        error_code: Option<ErrorCode>,
        /// Retry appended to the lineage, if the strategy allowed one.
        successor: Option<IntentionId>,
    },
}

impl ProcessOutcome {
    /// Whether processing stopped on an unusable credential or mapping.
    ///
    /// The scheduler leaves `when_ready` untouched for these, since no
    /// request reached the endpoint.
    pub fn is_broken(&self) -> bool {
        matches!(self, ProcessOutcome::Broken)
    }
}

/// `initial * 2^count`, or `None` on overflow.
pub fn exponential_delay(initial: Duration, count: u32) -> Option<Duration> {
    let factor = 1_i32.checked_shl(count).filter(|f| *f > 0)?;
    initial.checked_mul(factor)
}

/// Follow-ups of a retryable failure, decided before anything is written.
#[derive(Debug, Default)]
struct RetryPlan {
    /// New earliest request time for the endpoint.
    throttle: Option<DateTime<Utc>>,
    successor: Option<NewIntention>,
}

/// Runs intentions against the report client and applies retry policy.
#[derive(Debug, Clone)]
pub struct IntentionProcessor {
    ctx: HarvestContext,
}

impl IntentionProcessor {
    /// Processor using the store, client, import sink and retry policy of `ctx`.
    pub fn new(ctx: HarvestContext) -> Self {
        Self { ctx }
    }

    /// Process one intention.
    ///
    /// The outcome, the endpoint throttle, the retry successor and the
    /// duplicate collapse are written in a single store transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails, or if the report client fails
    /// without a provider answer. The latter is first recorded on the
    /// intention with the `client-error` code.
    pub async fn process(&self, intention: &FetchIntention) -> Result<ProcessOutcome> {
        let store = &self.ctx.store;
        let current = store
            .intention(intention.id)
            .await?
            .ok_or_else(|| HarvestError::not_found("intention", intention.id))?;
        if current.is_processed() {
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        let credential = store.credential(current.credential_id).await?;
        let mapping = store
            .credential_report(current.credential_id, current.report_type_id)
            .await?;
        let report_type = store.report_type(current.report_type_id).await?;
        let usable = credential.as_ref().is_some_and(Credential::is_usable)
            && mapping.is_some_and(|m| m.is_usable());
        let (true, Some(credential), Some(report_type)) = (usable, credential, report_type) else {
            debug!(intention_id = %current.id, "Credential or report mapping unusable");
            return self.finish(&current, Outcome::broken(), ProcessOutcome::Broken).await;
        };

        if let Some(original) = current.duplicate_of {
            debug!(intention_id = %current.id, duplicate_of = %original, "Skipping duplicate");
            return self
                .finish(&current, Outcome::duplicate(), ProcessOutcome::Duplicate)
                .await;
        }

        let response = match self
            .ctx
            .client
            .fetch(&credential, &report_type, current.start_date, current.end_date)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                error!(
                    intention_id = %current.id,
                    url = %credential.url,
                    error = %err,
                    "Report client failed"
                );
                let outcome = Outcome {
                    status: IntentionStatus::Error,
                    error_code: Some(ErrorCode::new(ErrorCode::CLIENT_ERROR)),
                    attempt_id: None,
                };
                store
                    .record_outcome(current.id, &outcome, self.ctx.clock.now())
                    .await?;
                return Err(HarvestError::Client {
                    intention: current.id,
                    reason: err.to_string(),
                });
            }
        };

        let now = self.ctx.clock.now();
        let mut completion = Completion::new(Outcome {
            status: if response.success {
                IntentionStatus::Success
            } else {
                IntentionStatus::Error
            },
            error_code: response.error_code.clone(),
            attempt_id: Some(response.attempt_id),
        });
        if response.success {
            completion.collapse_duplicates = true;
        } else if let Some(strategy) = classify(response.error_code.as_ref()) {
            let retry = self.plan_retry(&current, strategy, &credential, now).await?;
            completion.throttle = retry.throttle.map(|until| (credential.url.clone(), until));
            completion.successor = retry.successor;
        }

        let Completed::Recorded {
            successor,
            duplicates,
        } = store.complete_intention(current.id, completion, now).await?
        else {
            warn!(intention_id = %current.id, "Intention processed concurrently, result dropped");
            return Ok(ProcessOutcome::AlreadyProcessed);
        };

        if response.success {
            if let Some(payload) = response.payload {
                let import = std::sync::Arc::clone(&self.ctx.import);
                let attempt_id = response.attempt_id;
                tokio::spawn(async move {
                    if let Err(err) = import.import(attempt_id, payload).await {
                        warn!(%attempt_id, error = %err, "Import of downloaded report failed");
                    }
                });
            }
            info!(
                intention_id = %current.id,
                url = %credential.url,
                duplicates,
                "Report downloaded"
            );
            return Ok(ProcessOutcome::Success { duplicates });
        }

        if let Some(successor) = successor {
            debug!(
                intention_id = %current.id,
                %successor,
                retry_id = %current.lineage(),
                "Retry scheduled"
            );
        }
        info!(
            intention_id = %current.id,
            url = %credential.url,
            error_code = ?response.error_code,
            successor = ?successor,
            "Report request failed"
        );
        Ok(ProcessOutcome::Failed {
            error_code: response.error_code,
            successor,
        })
    }

    async fn finish(
        &self,
        intention: &FetchIntention,
        outcome: Outcome,
        result: ProcessOutcome,
    ) -> Result<ProcessOutcome> {
        let recorded = self
            .ctx
            .store
            .record_outcome(intention.id, &outcome, self.ctx.clock.now())
            .await?;
        Ok(if recorded {
            result
        } else {
            ProcessOutcome::AlreadyProcessed
        })
    }

    /// Decide the throttle and successor `strategy` calls for. Writes nothing.
    async fn plan_retry(
        &self,
        intention: &FetchIntention,
        strategy: RetryStrategy,
        credential: &Credential,
        now: DateTime<Utc>,
    ) -> Result<RetryPlan> {
        let policy = self.ctx.settings.retry;
        let url = credential.url.as_str();
        let mut counters = intention.retry;
        let mut plan = RetryPlan::default();

        let not_before = match strategy {
            RetryStrategy::ServiceNotAvailable | RetryStrategy::ServiceBusy => {
                let scheduler = self
                    .ctx
                    .store
                    .ensure_scheduler(url, &self.ctx.settings.scheduler)
                    .await?;
                let (initial, count) = if strategy == RetryStrategy::ServiceBusy {
                    counters.service_busy += 1;
                    (scheduler.service_busy_delay, intention.retry.service_busy)
                } else {
                    counters.service_not_available += 1;
                    (
                        scheduler.service_not_available_delay,
                        intention.retry.service_not_available,
                    )
                };
                let delay = exponential_delay(initial, count);
                plan.throttle = Some(after(now, delay.unwrap_or(policy.transient_ceiling)));

                let Some(delay) = delay.filter(|d| *d <= policy.transient_ceiling) else {
                    warn!(
                        intention_id = %intention.id,
                        url,
                        ?strategy,
                        "Backoff exceeds ceiling, abandoning retries"
                    );
                    return Ok(plan);
                };
                after(now, delay)
            }
            RetryStrategy::DataNotReady | RetryStrategy::NoData => {
                if intention.retry.data_not_ready >= policy.max_retry_count {
                    warn!(
                        intention_id = %intention.id,
                        retries = intention.retry.data_not_ready,
                        ?strategy,
                        "Retry limit reached, abandoning retries"
                    );
                    return Ok(plan);
                }
                counters.data_not_ready += 1;
                let next = after(now, policy.data_not_ready_delay);
                if strategy == RetryStrategy::NoData {
                    let period_end = intention.end_date.and_time(NaiveTime::MIN).and_utc();
                    if next > after(period_end, policy.no_data_grace) {
                        warn!(
                            intention_id = %intention.id,
                            end_date = %intention.end_date,
                            "Period too old for further no-data retries"
                        );
                        return Ok(plan);
                    }
                }
                next
            }
            RetryStrategy::TooManyRequests => {
                let scheduler = self
                    .ctx
                    .store
                    .ensure_scheduler(url, &self.ctx.settings.scheduler)
                    .await?;
                let until = after(now, scheduler.too_many_requests_delay);
                plan.throttle = Some(until);
                until
            }
        };

        plan.successor = Some(NewIntention::retry_of(
            intention,
            intention.lineage(),
            counters,
            not_before,
        ));
        Ok(plan)
    }
}
