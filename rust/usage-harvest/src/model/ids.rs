//! Strongly typed row identifiers.

use std::fmt;

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Raw database value.
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.0))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                i64::column_result(value).map(Self)
            }
        }
    };
}

row_id!(
    /// Identifier of a [`FetchIntention`](super::FetchIntention).
    IntentionId
);
row_id!(
    /// Identifier of a [`Harvest`](super::Harvest).
    HarvestId
);
row_id!(
    /// Identifier of an [`Automatic`](super::Automatic) plan.
    AutomaticId
);
row_id!(
    /// Identifier of a provider [`Credential`](super::Credential).
    CredentialId
);
row_id!(
    /// Identifier of a [`ReportType`](super::ReportType).
    ReportTypeId
);
row_id!(
    /// Identifier of an organization owning credentials.
    OrganizationId
);
