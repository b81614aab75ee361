//! Local account directory: users, email ownership, federated links.

pub mod store;
pub mod types;

pub use store::DirectoryStore;
pub use types::{
    Disposition, EmailRecord, FederatedLink, LocalUser, Reconciled, ReconciliationContext,
};
