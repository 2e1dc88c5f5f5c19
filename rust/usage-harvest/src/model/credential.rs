use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{CredentialId, OrganizationId, ReportTypeId};

/// Access to one provider endpoint on behalf of one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,
    pub organization_id: OrganizationId,
    /// Endpoint URL; intentions are arbitrated per distinct value.
    pub url: String,
    pub enabled: bool,
    /// Set when the provider rejected the credential itself.
    pub broken: bool,
    /// Extra request parameters (customer id, requestor id, api key...).
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl Credential {
    /// Whether intentions for this credential may run at all.
    /// Enabled and not broken.
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.broken
    }
}

/// A report kind a provider can serve, e.g. `TR` or `DR`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportType {
    pub id: ReportTypeId,
    pub code: String,
}

/// Which report types should be harvested for a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialReport {
    pub credential_id: CredentialId,
    pub report_type_id: ReportTypeId,
    pub enabled: bool,
    /// Set when the provider rejected this report for this credential.
    pub broken: bool,
}

impl CredentialReport {
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.broken
    }
}
