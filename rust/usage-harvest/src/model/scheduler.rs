use chrono::{DateTime, Duration, Utc};

use super::IntentionId;
use crate::config::SchedulerDefaults;

/// Persisted arbitration state of one remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scheduler {
    pub url: String,
    /// Earliest time a new normal-priority request may be sent.
    pub when_ready: DateTime<Utc>,
    pub cooldown: Duration,
    pub too_many_requests_delay: Duration,
    pub service_not_available_delay: Duration,
    pub service_busy_delay: Duration,
    pub current_intention: Option<IntentionId>,
    pub current_worker_token: Option<String>,
    pub current_start: Option<DateTime<Utc>>,
}

impl Scheduler {
    /// Fresh row for `url`, immediately ready.
    pub fn new(url: impl Into<String>, defaults: &SchedulerDefaults) -> Self {
        Self {
            url: url.into(),
            when_ready: DateTime::UNIX_EPOCH,
            cooldown: defaults.cooldown,
            too_many_requests_delay: defaults.too_many_requests_delay,
            service_not_available_delay: defaults.service_not_available_delay,
            service_busy_delay: defaults.service_busy_delay,
            current_intention: None,
            current_worker_token: None,
            current_start: None,
        }
    }

    /// Whether a worker currently holds the slot.
    pub fn is_occupied(&self) -> bool {
        self.current_intention.is_some() || self.current_worker_token.is_some()
    }

    pub(crate) fn release(&mut self) {
        self.current_intention = None;
        self.current_worker_token = None;
        self.current_start = None;
    }
}
