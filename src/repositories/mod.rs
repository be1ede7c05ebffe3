//! # Repository Layer
//!
//! SeaORM-backed stores for credentials, accounts, relationship edges and
//! sync history.

pub mod account;
pub mod credential;
pub mod relationship;
pub mod sync_history;

pub use account::AccountRepository;
pub use credential::{CredentialInput, CredentialStore};
pub use relationship::{RelatedAccount, RelatedAccounts, RelationshipGraph};
pub use sync_history::SyncHistoryRepository;
