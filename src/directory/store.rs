//! Account directory backed by redb.
//!
//! Holds users, email ownership records, and federated links, and runs the
//! reconciliation decision table inside a single write transaction. redb
//! serializes writers, so the email-uniqueness and link-uniqueness checks
//! cannot race; a conflict returns before commit and leaves the store
//! untouched.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::PathBuf;
use tracing::{debug, info};
use uuid::Uuid;

use super::types::{
    Disposition, EmailRecord, FederatedLink, LocalUser, Reconciled, ReconciliationContext,
};
use crate::sp::AssertedIdentity;

/// Users keyed by UUID string (value: MessagePack bytes).
const USERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("users");

/// Email records keyed by lowercased address.
const EMAILS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("emails");

/// Federated links keyed by slug + external id.
const LINKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("federated_links");

/// Separator for the composite link key. Never appears in slugs or NameIDs.
fn link_key(slug: &str, external_id: &str) -> String {
    format!("{}\u{1f}{}", slug, external_id)
}

pub struct DirectoryStore {
    db: Database,
}

impl DirectoryStore {
    /// Open or create a directory store at the given path.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(&path)
            .with_context(|| format!("Failed to open directory database: {:?}", path))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(USERS_TABLE)?;
            let _ = write_txn.open_table(EMAILS_TABLE)?;
            let _ = write_txn.open_table(LINKS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Run the reconciliation decision table for one validated identity.
    ///
    /// All lookups and mutations happen in one write transaction. A
    /// `Conflict` outcome drops the transaction uncommitted.
    pub fn reconcile(
        &self,
        slug: &str,
        identity: &AssertedIdentity,
        ctx: ReconciliationContext,
    ) -> Result<Reconciled> {
        let address = identity.email.to_lowercase();
        let key = link_key(slug, &identity.external_id);
        let now = Utc::now();

        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut users = write_txn.open_table(USERS_TABLE)?;
            let mut emails = write_txn.open_table(EMAILS_TABLE)?;
            let mut links = write_txn.open_table(LINKS_TABLE)?;

            let existing_link = match links.get(key.as_str())? {
                Some(value) => Some(
                    rmp_serde::from_slice::<FederatedLink>(value.value())
                        .context("Failed to deserialize federated link")?,
                ),
                None => None,
            };

            if let Some(link) = existing_link {
                Reconciled::Resolved {
                    user_id: link.user_id,
                    disposition: Disposition::ExistingLink,
                }
            } else if let ReconciliationContext::LinkTo(user_id) = ctx {
                if users.get(user_id.to_string().as_str())?.is_none() {
                    bail!("linking context names unknown user {}", user_id);
                }
                insert_link(&mut links, slug, &identity.external_id, user_id)?;
                Reconciled::Resolved {
                    user_id,
                    disposition: Disposition::LinkedToExisting,
                }
            } else {
                let email_record = match emails.get(address.as_str())? {
                    Some(value) => Some(
                        rmp_serde::from_slice::<EmailRecord>(value.value())
                            .context("Failed to deserialize email record")?,
                    ),
                    None => None,
                };

                match email_record {
                    None => {
                        let user = LocalUser {
                            id: Uuid::new_v4(),
                            first_name: identity.first_name.clone(),
                            last_name: identity.last_name.clone(),
                            primary_email: address.clone(),
                            created_at: now,
                        };
                        let user_data =
                            rmp_serde::to_vec_named(&user).context("Failed to serialize user")?;
                        users.insert(user.id.to_string().as_str(), user_data.as_slice())?;

                        let record = EmailRecord {
                            address: address.clone(),
                            user_id: user.id,
                            verified: true,
                            primary: true,
                        };
                        let email_data = rmp_serde::to_vec_named(&record)
                            .context("Failed to serialize email record")?;
                        emails.insert(address.as_str(), email_data.as_slice())?;

                        insert_link(&mut links, slug, &identity.external_id, user.id)?;
                        Reconciled::Resolved {
                            user_id: user.id,
                            disposition: Disposition::ProvisionedNew,
                        }
                    }
                    Some(record) if !record.verified => {
                        // The assertion proves control of the address, which
                        // upgrades the unclaimed record in place.
                        let upgraded = EmailRecord {
                            verified: true,
                            primary: true,
                            ..record
                        };
                        let email_data = rmp_serde::to_vec_named(&upgraded)
                            .context("Failed to serialize email record")?;
                        emails.insert(address.as_str(), email_data.as_slice())?;

                        insert_link(&mut links, slug, &identity.external_id, upgraded.user_id)?;
                        Reconciled::Resolved {
                            user_id: upgraded.user_id,
                            disposition: Disposition::VerifiedExisting,
                        }
                    }
                    Some(_verified) => Reconciled::Conflict,
                }
            }
        };

        match outcome {
            Reconciled::Conflict => {
                // Dropping the uncommitted transaction discards any writes.
                drop(write_txn);
                info!(slug = %slug, "Reconciliation refused: verified email owned by another account");
            }
            Reconciled::Resolved {
                user_id,
                disposition,
            } => {
                write_txn.commit()?;
                debug!(slug = %slug, user_id = %user_id, ?disposition, "Identity reconciled");
            }
        }

        Ok(outcome)
    }

    /// Seed an account with an email record, bypassing reconciliation.
    /// Administrative path for pre-provisioned users and tests.
    pub fn create_user(
        &self,
        first_name: &str,
        last_name: &str,
        email: &str,
        verified: bool,
    ) -> Result<LocalUser> {
        let address = email.to_lowercase();
        let user = LocalUser {
            id: Uuid::new_v4(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            primary_email: address.clone(),
            created_at: Utc::now(),
        };

        let write_txn = self.db.begin_write()?;
        {
            let mut users = write_txn.open_table(USERS_TABLE)?;
            let mut emails = write_txn.open_table(EMAILS_TABLE)?;

            if emails.get(address.as_str())?.is_some() {
                bail!("email address already registered: {}", address);
            }

            let user_data = rmp_serde::to_vec_named(&user).context("Failed to serialize user")?;
            users.insert(user.id.to_string().as_str(), user_data.as_slice())?;

            let record = EmailRecord {
                address: address.clone(),
                user_id: user.id,
                verified,
                primary: true,
            };
            let email_data =
                rmp_serde::to_vec_named(&record).context("Failed to serialize email record")?;
            emails.insert(address.as_str(), email_data.as_slice())?;
        }
        write_txn.commit()?;

        Ok(user)
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<LocalUser>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS_TABLE)?;
        match table.get(id.to_string().as_str())? {
            Some(value) => Ok(Some(
                rmp_serde::from_slice(value.value()).context("Failed to deserialize user")?,
            )),
            None => Ok(None),
        }
    }

    pub fn get_email(&self, address: &str) -> Result<Option<EmailRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(EMAILS_TABLE)?;
        match table.get(address.to_lowercase().as_str())? {
            Some(value) => Ok(Some(
                rmp_serde::from_slice(value.value())
                    .context("Failed to deserialize email record")?,
            )),
            None => Ok(None),
        }
    }

    pub fn get_link(&self, slug: &str, external_id: &str) -> Result<Option<FederatedLink>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LINKS_TABLE)?;
        match table.get(link_key(slug, external_id).as_str())? {
            Some(value) => Ok(Some(
                rmp_serde::from_slice(value.value())
                    .context("Failed to deserialize federated link")?,
            )),
            None => Ok(None),
        }
    }

    /// Number of user accounts, for metrics and tests.
    pub fn user_count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS_TABLE)?;
        Ok(table.len()? as usize)
    }
}

fn insert_link(
    links: &mut redb::Table<'_, &'static str, &'static [u8]>,
    slug: &str,
    external_id: &str,
    user_id: Uuid,
) -> Result<()> {
    let link = FederatedLink {
        slug: slug.to_string(),
        external_id: external_id.to_string(),
        user_id,
        created_at: Utc::now(),
    };
    let data = rmp_serde::to_vec_named(&link).context("Failed to serialize federated link")?;
    links.insert(link_key(slug, external_id).as_str(), data.as_slice())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_store() -> (DirectoryStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = DirectoryStore::open(dir.path().join("directory.redb")).unwrap();
        (store, dir)
    }

    fn identity(email: &str) -> AssertedIdentity {
        AssertedIdentity {
            external_id: email.to_string(),
            email: email.to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
        }
    }

    #[test]
    fn unknown_email_provisions_account() {
        let (store, _dir) = test_store();
        let outcome = store
            .reconcile("saml2.acme", &identity("ada@example.com"), ReconciliationContext::Fresh)
            .unwrap();

        let Reconciled::Resolved { user_id, disposition } = outcome else {
            panic!("expected resolution, got {:?}", outcome);
        };
        assert_eq!(disposition, Disposition::ProvisionedNew);

        let user = store.get_user(user_id).unwrap().unwrap();
        assert_eq!(user.first_name, "Ada");
        assert_eq!(user.primary_email, "ada@example.com");

        let email = store.get_email("ada@example.com").unwrap().unwrap();
        assert!(email.verified);
        assert!(email.primary);
        assert_eq!(email.user_id, user_id);

        let link = store.get_link("saml2.acme", "ada@example.com").unwrap().unwrap();
        assert_eq!(link.user_id, user_id);
    }

    #[test]
    fn repeat_login_is_idempotent() {
        let (store, _dir) = test_store();
        let first = store
            .reconcile("saml2.acme", &identity("ada@example.com"), ReconciliationContext::Fresh)
            .unwrap();
        let second = store
            .reconcile("saml2.acme", &identity("ada@example.com"), ReconciliationContext::Fresh)
            .unwrap();

        let Reconciled::Resolved { user_id: first_id, .. } = first else {
            panic!();
        };
        let Reconciled::Resolved { user_id: second_id, disposition } = second else {
            panic!();
        };
        assert_eq!(first_id, second_id);
        assert_eq!(disposition, Disposition::ExistingLink);
        assert_eq!(store.user_count().unwrap(), 1);
    }

    #[test]
    fn verified_email_of_other_account_conflicts_without_side_effects() {
        let (store, _dir) = test_store();
        let owner = store
            .create_user("Grace", "Hopper", "grace@example.com", true)
            .unwrap();

        let outcome = store
            .reconcile("saml2.acme", &identity("grace@example.com"), ReconciliationContext::Fresh)
            .unwrap();
        assert_eq!(outcome, Reconciled::Conflict);

        // Nothing changed: no link, no new user, email untouched.
        assert!(store.get_link("saml2.acme", "grace@example.com").unwrap().is_none());
        assert_eq!(store.user_count().unwrap(), 1);
        let email = store.get_email("grace@example.com").unwrap().unwrap();
        assert_eq!(email.user_id, owner.id);
        assert!(email.verified);
    }

    #[test]
    fn unverified_email_is_upgraded_and_linked() {
        let (store, _dir) = test_store();
        let owner = store
            .create_user("Grace", "Hopper", "grace@example.com", false)
            .unwrap();

        let outcome = store
            .reconcile("saml2.acme", &identity("grace@example.com"), ReconciliationContext::Fresh)
            .unwrap();

        let Reconciled::Resolved { user_id, disposition } = outcome else {
            panic!("expected resolution, got {:?}", outcome);
        };
        assert_eq!(user_id, owner.id);
        assert_eq!(disposition, Disposition::VerifiedExisting);
        assert_eq!(store.user_count().unwrap(), 1);

        let email = store.get_email("grace@example.com").unwrap().unwrap();
        assert!(email.verified);
        assert!(email.primary);
    }

    #[test]
    fn linking_context_binds_identity_to_named_user() {
        let (store, _dir) = test_store();
        let owner = store
            .create_user("Grace", "Hopper", "grace@example.com", true)
            .unwrap();

        // Same identity that would otherwise conflict links cleanly.
        let outcome = store
            .reconcile(
                "saml2.acme",
                &identity("grace@example.com"),
                ReconciliationContext::LinkTo(owner.id),
            )
            .unwrap();
        let Reconciled::Resolved { user_id, disposition } = outcome else {
            panic!("expected resolution, got {:?}", outcome);
        };
        assert_eq!(user_id, owner.id);
        assert_eq!(disposition, Disposition::LinkedToExisting);

        // Later fresh logins resolve through the new link.
        let outcome = store
            .reconcile("saml2.acme", &identity("grace@example.com"), ReconciliationContext::Fresh)
            .unwrap();
        let Reconciled::Resolved { user_id, disposition } = outcome else {
            panic!("expected resolution, got {:?}", outcome);
        };
        assert_eq!(user_id, owner.id);
        assert_eq!(disposition, Disposition::ExistingLink);
    }

    #[test]
    fn linking_to_unknown_user_fails() {
        let (store, _dir) = test_store();
        let result = store.reconcile(
            "saml2.acme",
            &identity("ada@example.com"),
            ReconciliationContext::LinkTo(Uuid::new_v4()),
        );
        assert!(result.is_err());
        assert!(store.get_link("saml2.acme", "ada@example.com").unwrap().is_none());
    }

    #[test]
    fn email_lookup_is_case_insensitive() {
        let (store, _dir) = test_store();
        store.create_user("Grace", "Hopper", "Grace@Example.COM", true).unwrap();

        let outcome = store
            .reconcile("saml2.acme", &identity("grace@example.com"), ReconciliationContext::Fresh)
            .unwrap();
        assert_eq!(outcome, Reconciled::Conflict);
    }

    #[test]
    fn duplicate_seed_email_is_rejected() {
        let (store, _dir) = test_store();
        store.create_user("Grace", "Hopper", "grace@example.com", true).unwrap();
        let result = store.create_user("Other", "User", "grace@example.com", true);
        assert!(result.is_err());
        assert_eq!(store.user_count().unwrap(), 1);
    }
}
