//! Domain records shared by the store and the scheduling components.

mod credential;
mod harvest;
mod ids;
mod intention;
mod scheduler;

pub use credential::{Credential, CredentialReport, ReportType};
pub use harvest::{Automatic, Harvest, HarvestStats};
pub use ids::{AutomaticId, CredentialId, HarvestId, IntentionId, OrganizationId, ReportTypeId};
pub use intention::{
    ErrorCode, FetchIntention, IntentionStatus, NewIntention, Outcome, Priority, RequestKey,
    RetryCounters,
};
pub use scheduler::Scheduler;
