//! Tenant configuration store backed by redb.
//!
//! Configurations are created by an administrator and read on every login
//! redirect; cached metadata may be refreshed out-of-band. Nothing here
//! mutates during a login flow.

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, info};

use super::types::TenantConfig;

/// Tenant configs keyed by slug (value: MessagePack bytes).
const TENANTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("saml_tenants");

/// Config store with an in-memory read cache over persistent storage.
pub struct ConfigStore {
    db: Database,
    cache: RwLock<HashMap<String, TenantConfig>>,
}

impl ConfigStore {
    /// Open or create a config store at the given path.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(&path)
            .with_context(|| format!("Failed to open config database: {:?}", path))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(TENANTS_TABLE)?;
        }
        write_txn.commit()?;

        let cache = Self::load_all(&db)?;
        debug!(tenants = cache.len(), "Loaded tenant configs into cache");

        Ok(Self {
            db,
            cache: RwLock::new(cache),
        })
    }

    /// Insert or replace a tenant configuration.
    pub fn upsert(&self, config: TenantConfig) -> Result<()> {
        let data = rmp_serde::to_vec_named(&config).context("Failed to serialize tenant config")?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TENANTS_TABLE)?;
            table.insert(config.slug.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;

        info!(slug = %config.slug, signed = config.use_signed_authn_request, "Tenant config stored");

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(config.slug.clone(), config);
        }
        Ok(())
    }

    /// Look up a tenant configuration by slug.
    pub fn get(&self, slug: &str) -> Result<Option<TenantConfig>> {
        if let Ok(cache) = self.cache.read() {
            if let Some(config) = cache.get(slug) {
                return Ok(Some(config.clone()));
            }
        }

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TENANTS_TABLE)?;
        match table.get(slug)? {
            Some(value) => {
                let config: TenantConfig = rmp_serde::from_slice(value.value())
                    .context("Failed to deserialize tenant config")?;
                if let Ok(mut cache) = self.cache.write() {
                    cache.insert(slug.to_string(), config.clone());
                }
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }

    /// Replace the cached IdP metadata for a tenant. Called by the
    /// out-of-band metadata refresher, never during a login flow.
    pub fn update_metadata(&self, slug: &str, metadata_xml: String) -> Result<bool> {
        let Some(mut config) = self.get(slug)? else {
            return Ok(false);
        };
        config.cached_metadata = metadata_xml;
        self.upsert(config)?;
        Ok(true)
    }

    /// All configured slugs, for startup logging.
    pub fn slugs(&self) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TENANTS_TABLE)?;
        let mut slugs = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            slugs.push(key.value().to_string());
        }
        Ok(slugs)
    }

    fn load_all(db: &Database) -> Result<HashMap<String, TenantConfig>> {
        let mut configs = HashMap::new();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(TENANTS_TABLE)?;
        for entry in table.iter()? {
            let (key, value) = entry?;
            match rmp_serde::from_slice::<TenantConfig>(value.value()) {
                Ok(config) => {
                    configs.insert(key.value().to_string(), config);
                }
                Err(e) => {
                    tracing::warn!(slug = key.value(), error = %e, "Skipping undecodable tenant config");
                }
            }
        }
        Ok(configs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_store() -> (ConfigStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("configs.redb")).unwrap();
        (store, dir)
    }

    fn test_config(slug: &str) -> TenantConfig {
        TenantConfig {
            slug: slug.to_string(),
            metadata_conf_url: "https://idp.example.com/metadata".to_string(),
            cached_metadata: "<EntityDescriptor/>".to_string(),
            use_signed_authn_request: false,
        }
    }

    #[test]
    fn upsert_and_get() {
        let (store, _dir) = test_store();
        store.upsert(test_config("saml2.acme")).unwrap();

        let found = store.get("saml2.acme").unwrap().unwrap();
        assert_eq!(found.slug, "saml2.acme");
        assert!(store.get("saml2.missing").unwrap().is_none());
    }

    #[test]
    fn update_metadata_changes_fingerprint() {
        let (store, _dir) = test_store();
        store.upsert(test_config("saml2.acme")).unwrap();
        let before = store.get("saml2.acme").unwrap().unwrap().client_fingerprint();

        assert!(store
            .update_metadata("saml2.acme", "<EntityDescriptor entityID=\"x\"/>".to_string())
            .unwrap());
        let after = store.get("saml2.acme").unwrap().unwrap().client_fingerprint();
        assert_ne!(before, after);

        assert!(!store
            .update_metadata("saml2.none", String::new())
            .unwrap());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("configs.redb");
        {
            let store = ConfigStore::open(path.clone()).unwrap();
            store.upsert(test_config("saml2.acme")).unwrap();
        }
        let store = ConfigStore::open(path).unwrap();
        assert!(store.get("saml2.acme").unwrap().is_some());
        assert_eq!(store.slugs().unwrap(), vec!["saml2.acme".to_string()]);
    }
}
