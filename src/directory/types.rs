//! Local account records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Local account a federated identity resolves to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalUser {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    /// Lowercased address of the primary email record.
    pub primary_email: String,
    pub created_at: DateTime<Utc>,
}

/// Email ownership record. Addresses are globally unique across users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailRecord {
    /// Lowercased address, the record key.
    pub address: String,
    pub user_id: Uuid,
    pub verified: bool,
    pub primary: bool,
}

/// Binding between one tenant identity and a local user.
/// Unique per (slug, external_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederatedLink {
    pub slug: String,
    pub external_id: String,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// How an inbound assertion relates to the local account base.
///
/// `LinkTo` carries the already-authenticated user from a linking preflight;
/// `Fresh` is an ordinary login with no prior session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconciliationContext {
    Fresh,
    LinkTo(Uuid),
}

/// Which path of the reconciliation decision table resolved the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The (slug, external_id) link already existed.
    ExistingLink,
    /// Linked to the user named by the linking context.
    LinkedToExisting,
    /// No email record existed; a new account was provisioned.
    ProvisionedNew,
    /// An unverified email record was upgraded and linked.
    VerifiedExisting,
}

/// Outcome of a reconciliation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Resolved {
        user_id: Uuid,
        disposition: Disposition,
    },
    /// A verified email record already belongs to another account. The
    /// attempt leaves no trace in the store.
    Conflict,
}
