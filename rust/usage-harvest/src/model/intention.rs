use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CredentialId, HarvestId, IntentionId, ReportTypeId};
use crate::error::{HarvestError, Result};

/// Scheduling priority of an intention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    /// Bypasses the endpoint throttle window. Used for manual requests.
    Now,
}

impl Priority {
    /// Persisted rank; higher runs first.
    pub const fn rank(self) -> i64 {
        match self {
            Priority::Normal => 0,
            Priority::Now => 1,
        }
    }

    pub const fn from_rank(rank: i64) -> Self {
        if rank > 0 {
            Priority::Now
        } else {
            Priority::Normal
        }
    }
}

/// Where an intention is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentionStatus {
    #[default]
    Planned,
    Success,
    Error,
    Broken,
    Duplicate,
}

impl IntentionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            IntentionStatus::Planned => "planned",
            IntentionStatus::Success => "success",
            IntentionStatus::Error => "error",
            IntentionStatus::Broken => "broken",
            IntentionStatus::Duplicate => "duplicate",
        }
    }
}

impl fmt::Display for IntentionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentionStatus {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "planned" => Ok(IntentionStatus::Planned),
            "success" => Ok(IntentionStatus::Success),
            "error" => Ok(IntentionStatus::Error),
            "broken" => Ok(IntentionStatus::Broken),
            "duplicate" => Ok(IntentionStatus::Duplicate),
            other => Err(HarvestError::Decode(format!("unknown intention status {other:?}"))),
        }
    }
}

/// Provider error code as reported in the response exception.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub String);

impl ErrorCode {
    /// Recorded when the protocol client failed without a provider answer.
    pub const CLIENT_ERROR: &'static str = "client-error";

    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-category retry counters carried along a lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetryCounters {
    pub data_not_ready: u32,
    pub service_not_available: u32,
    pub service_busy: u32,
}

/// Terminal result written atomically with `when_processed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: IntentionStatus,
    pub error_code: Option<ErrorCode>,
    pub attempt_id: Option<Uuid>,
}

impl Outcome {
    pub fn broken() -> Self {
        Self {
            status: IntentionStatus::Broken,
            error_code: None,
            attempt_id: None,
        }
    }

    pub fn duplicate() -> Self {
        Self {
            status: IntentionStatus::Duplicate,
            error_code: None,
            attempt_id: None,
        }
    }
}

/// One planned attempt to fetch one report for one credential and date range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchIntention {
    pub id: IntentionId,
    pub harvest_id: HarvestId,
    pub credential_id: CredentialId,
    pub report_type_id: ReportTypeId,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub not_before: DateTime<Utc>,
    pub priority: Priority,
    /// URL of the scheduler that claimed this intention.
    pub scheduler: Option<String>,
    pub when_processed: Option<DateTime<Utc>>,
    pub status: IntentionStatus,
    pub error_code: Option<ErrorCode>,
    pub attempt_id: Option<Uuid>,
    pub retry: RetryCounters,
    pub retry_id: Option<IntentionId>,
    pub duplicate_of: Option<IntentionId>,
}

impl FetchIntention {
    /// Key grouping an original intention with all of its retries.
    pub fn lineage(&self) -> IntentionId {
        self.retry_id.unwrap_or(self.id)
    }

    pub fn is_processed(&self) -> bool {
        self.when_processed.is_some()
    }

    /// Identity of the requested data, used for duplicate collapsing.
    pub fn request_key(&self) -> RequestKey {
        RequestKey {
            credential_id: self.credential_id,
            report_type_id: self.report_type_id,
            start_date: self.start_date,
            end_date: self.end_date,
        }
    }
}

/// `(credential, report, start_date, end_date)` of an intention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub credential_id: CredentialId,
    pub report_type_id: ReportTypeId,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// Intention that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIntention {
    pub credential_id: CredentialId,
    pub report_type_id: ReportTypeId,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub not_before: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub retry: RetryCounters,
    pub retry_id: Option<IntentionId>,
}

impl NewIntention {
    /// Rejects ranges where `start_date` is not strictly before `end_date`.
    pub fn new(
        credential_id: CredentialId,
        report_type_id: ReportTypeId,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Self> {
        let intention = Self {
            credential_id,
            report_type_id,
            start_date,
            end_date,
            not_before: None,
            priority: Priority::Normal,
            retry: RetryCounters::default(),
            retry_id: None,
        };
        intention.validate()?;
        Ok(intention)
    }

    /// Check `start_date < end_date`.
    ///
    /// The fields are public, so stores check again before inserting.
    pub fn validate(&self) -> Result<()> {
        if self.start_date >= self.end_date {
            return Err(HarvestError::InvalidDateRange {
                start: self.start_date,
                end: self.end_date,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn with_not_before(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = Some(not_before);
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Successor of `previous` in the same lineage, eligible at `not_before`.
    pub(crate) fn retry_of(
        previous: &FetchIntention,
        lineage: IntentionId,
        retry: RetryCounters,
        not_before: DateTime<Utc>,
    ) -> Self {
        Self {
            credential_id: previous.credential_id,
            report_type_id: previous.report_type_id,
            start_date: previous.start_date,
            end_date: previous.end_date,
            not_before: Some(not_before),
            priority: previous.priority,
            retry,
            retry_id: Some(lineage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_new_intention_rejects_empty_range() {
        let err = NewIntention::new(
            CredentialId(1),
            ReportTypeId(1),
            date(2024, 1, 31),
            date(2024, 1, 1),
        )
        .unwrap_err();
        assert!(matches!(err, HarvestError::InvalidDateRange { .. }));

        assert!(NewIntention::new(
            CredentialId(1),
            ReportTypeId(1),
            date(2024, 1, 1),
            date(2024, 1, 1)
        )
        .is_err());
    }

    #[test]
    fn test_priority_rank_roundtrip() {
        assert!(Priority::Now > Priority::Normal);
        assert_eq!(Priority::from_rank(Priority::Now.rank()), Priority::Now);
        assert_eq!(Priority::from_rank(Priority::Normal.rank()), Priority::Normal);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(
            "duplicate".parse::<IntentionStatus>().unwrap(),
            IntentionStatus::Duplicate
        );
        assert!(matches!(
            "bogus".parse::<IntentionStatus>(),
            Err(HarvestError::Decode(_))
        ));
    }
}
