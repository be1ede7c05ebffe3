//! # Data Models
//!
//! SeaORM entities for credentials, accounts, relationship edges and sync
//! history, plus the string-backed domain enums stored in their columns.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

pub mod account;
pub mod account_relationship;
pub mod credential;
pub mod sync_history;

pub use account::Entity as Account;
pub use account_relationship::Entity as AccountRelationship;
pub use credential::Entity as Credential;
pub use sync_history::Entity as SyncHistory;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "ads-connect".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Returned when a stored column value does not name a known variant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} value '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
        )]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_enum! {
    /// Category of an external Amazon Ads account.
    AccountCategory, "account category" {
        Advertising => "advertising",
        Dsp => "dsp",
        Amc => "amc",
    }
}

string_enum! {
    /// Lifecycle status of an account as reported upstream.
    AccountStatus, "account status" {
        Active => "active",
        Disabled => "disabled",
        Partial => "partial",
        Pending => "pending",
        Error => "error",
    }
}

string_enum! {
    /// Synchronization state of a single account record.
    AccountSyncStatus, "account sync status" {
        Pending => "pending",
        InProgress => "in_progress",
        Completed => "completed",
        Failed => "failed",
    }
}

string_enum! {
    /// Kind of a directed relationship edge between two accounts.
    RelationshipKind, "relationship kind" {
        AdvertisingToDsp => "advertising_to_dsp",
        AdvertisingToAmc => "advertising_to_amc",
        DspToAmc => "dsp_to_amc",
    }
}

string_enum! {
    /// Outcome of one category within a sync pass.
    CategoryOutcome, "category outcome" {
        Success => "success",
        Partial => "partial",
        Failed => "failed",
        NoAccess => "no_access",
    }
}

string_enum! {
    /// Overall status of a sync pass.
    SyncStatus, "sync status" {
        Running => "running",
        Success => "success",
        Partial => "partial",
    }
}

impl RelationshipKind {
    /// Categories the (parent, child) endpoints of this edge must belong to.
    pub fn endpoints(&self) -> (AccountCategory, AccountCategory) {
        match self {
            RelationshipKind::AdvertisingToDsp => (AccountCategory::Advertising, AccountCategory::Dsp),
            RelationshipKind::AdvertisingToAmc => (AccountCategory::Advertising, AccountCategory::Amc),
            RelationshipKind::DspToAmc => (AccountCategory::Dsp, AccountCategory::Amc),
        }
    }

    /// Edge kind linking a parent of `parent` category to a child of `child` category.
    pub fn between(parent: AccountCategory, child: AccountCategory) -> Option<Self> {
        RelationshipKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.endpoints() == (parent, child))
    }
}

impl SyncStatus {
    /// Overall status is success only when every requested category succeeded.
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a CategoryOutcome>) -> Self {
        let mut saw_any = false;
        for outcome in outcomes {
            saw_any = true;
            if *outcome != CategoryOutcome::Success {
                return SyncStatus::Partial;
            }
        }
        if saw_any {
            SyncStatus::Success
        } else {
            SyncStatus::Partial
        }
    }
}
