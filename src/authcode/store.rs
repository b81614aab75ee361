//! Single-use auth codes backed by redb.
//!
//! A code is minted after a successful login or during a linking preflight,
//! handed to the browser, and redeemed exactly once. Redemption removes the
//! code in the same write transaction that reads it; redb serializes
//! writers, so two concurrent redemptions of the same code cannot both
//! succeed.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};
use uuid::Uuid;

/// Pending codes keyed by the code string (value: MessagePack bytes).
const CODES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("auth_codes");

/// Default code lifetime in seconds.
pub const DEFAULT_CODE_TTL_SECS: u64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAuthCode {
    pub code: String,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingAuthCode {
    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

pub struct AuthCodeStore {
    db: Database,
    ttl_secs: u64,
}

impl AuthCodeStore {
    /// Open or create an auth code store at the given path.
    pub fn open(path: PathBuf, ttl_secs: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(&path)
            .with_context(|| format!("Failed to open auth code database: {:?}", path))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(CODES_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db, ttl_secs })
    }

    /// Mint a fresh code for a user.
    pub fn issue(&self, user_id: Uuid) -> Result<String> {
        let code = generate_code();
        let now = Utc::now();
        let pending = PendingAuthCode {
            code: code.clone(),
            user_id,
            created_at: now,
            expires_at: now + Duration::seconds(self.ttl_secs as i64),
        };
        let data =
            rmp_serde::to_vec_named(&pending).context("Failed to serialize auth code")?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(CODES_TABLE)?;
            table.insert(code.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;

        debug!(user_id = %user_id, expires_at = %pending.expires_at, "Issued auth code");
        Ok(code)
    }

    /// Redeem a code, destroying it. Returns the user it was minted for, or
    /// `None` when the code is unknown, expired, or already redeemed.
    pub fn redeem(&self, code: &str) -> Result<Option<Uuid>> {
        let write_txn = self.db.begin_write()?;
        let redeemed = {
            let mut table = write_txn.open_table(CODES_TABLE)?;
            // The removed-value guard borrows the table; decode to an owned
            // value before the table goes out of scope.
            let pending = match table.remove(code)? {
                Some(value) => Some(
                    rmp_serde::from_slice::<PendingAuthCode>(value.value())
                        .context("Failed to deserialize auth code")?,
                ),
                None => None,
            };
            pending.filter(|p| !p.is_expired()).map(|p| p.user_id)
        };
        write_txn.commit()?;

        match redeemed {
            Some(user_id) => debug!(user_id = %user_id, "Auth code redeemed"),
            None => debug!("Auth code redemption refused"),
        }
        Ok(redeemed)
    }

    /// Remove expired codes. Returns the number removed.
    pub fn evict_expired(&self) -> Result<usize> {
        let expired: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(CODES_TABLE)?;
            let mut codes = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                match rmp_serde::from_slice::<PendingAuthCode>(value.value()) {
                    Ok(pending) if pending.is_expired() => codes.push(key.value().to_string()),
                    Err(e) => {
                        warn!(error = %e, "Failed to deserialize auth code, marking for deletion");
                        codes.push(key.value().to_string());
                    }
                    _ => {}
                }
            }
            codes
        };

        let evicted = expired.len();
        if evicted > 0 {
            let write_txn = self.db.begin_write()?;
            {
                let mut table = write_txn.open_table(CODES_TABLE)?;
                for code in &expired {
                    table.remove(code.as_str())?;
                }
            }
            write_txn.commit()?;
        }

        Ok(evicted)
    }

    /// Number of pending codes, for metrics.
    pub fn pending_count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CODES_TABLE)?;
        Ok(table.len()? as usize)
    }
}

/// 32 random bytes, hex encoded.
fn generate_code() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
