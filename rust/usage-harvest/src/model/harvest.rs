use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{AutomaticId, FetchIntention, HarvestId, IntentionStatus, OrganizationId};

/// A batch of intentions created together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Harvest {
    pub id: HarvestId,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub last_updated_by: Option<String>,
    /// Set when the harvest is owned by a monthly plan.
    pub automatic_id: Option<AutomaticId>,
}

/// The recurring monthly harvest of one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Automatic {
    pub id: AutomaticId,
    /// First day of the harvested month.
    pub month: NaiveDate,
    pub organization_id: OrganizationId,
    pub harvest_id: HarvestId,
}

/// Progress of a harvest, one unit per retry lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HarvestStats {
    pub total: usize,
    pub finished: usize,
    pub planned: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub broken: usize,
    pub duplicate: usize,
}

impl HarvestStats {
    /// Aggregate over the latest intention of every lineage.
    pub fn from_intentions(intentions: &[FetchIntention]) -> Self {
        let mut latest: HashMap<_, &FetchIntention> = HashMap::new();
        for intention in intentions {
            latest
                .entry(intention.lineage())
                .and_modify(|current| {
                    if intention.id > current.id {
                        *current = intention;
                    }
                })
                .or_insert(intention);
        }

        let mut stats = HarvestStats {
            total: latest.len(),
            ..HarvestStats::default()
        };
        for intention in latest.values() {
            if !intention.is_processed() {
                stats.planned += 1;
                continue;
            }
            stats.finished += 1;
            match intention.status {
                IntentionStatus::Success => stats.succeeded += 1,
                IntentionStatus::Error => stats.failed += 1,
                IntentionStatus::Broken => stats.broken += 1,
                IntentionStatus::Duplicate => stats.duplicate += 1,
                IntentionStatus::Planned => {}
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        CredentialId, ErrorCode, IntentionId, Priority, ReportTypeId, RetryCounters,
    };

    fn intention(id: i64, retry_id: Option<i64>, status: IntentionStatus) -> FetchIntention {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        FetchIntention {
            id: IntentionId(id),
            harvest_id: HarvestId(1),
            credential_id: CredentialId(1),
            report_type_id: ReportTypeId(1),
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            not_before: now,
            priority: Priority::Normal,
            scheduler: None,
            when_processed: (status != IntentionStatus::Planned).then_some(now),
            status,
            error_code: (status == IntentionStatus::Error).then(|| ErrorCode::new("1011")),
            attempt_id: None,
            retry: RetryCounters::default(),
            retry_id: retry_id.map(IntentionId),
            duplicate_of: None,
        }
    }

    #[test]
    fn test_lineage_counts_once() {
        let intentions = vec![
            intention(1, Some(1), IntentionStatus::Error),
            intention(2, Some(1), IntentionStatus::Error),
            intention(3, Some(1), IntentionStatus::Error),
            intention(4, Some(1), IntentionStatus::Planned),
            intention(5, None, IntentionStatus::Success),
        ];

        let stats = HarvestStats::from_intentions(&intentions);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.finished, 1);
        assert_eq!(stats.planned, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn test_finished_chain_reports_latest_status() {
        let intentions = vec![
            intention(7, Some(7), IntentionStatus::Error),
            intention(9, Some(7), IntentionStatus::Success),
            intention(10, None, IntentionStatus::Broken),
        ];

        let stats = HarvestStats::from_intentions(&intentions);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.finished, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.broken, 1);
    }
}
