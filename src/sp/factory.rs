//! Slug-keyed SP client cache.
//!
//! Clients are cheap to look up but not to build (metadata parse, key
//! checks), so the factory holds one per tenant and rebuilds only when the
//! config fingerprint changes. A metadata refresh therefore takes effect on
//! the next login without a restart.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use super::client::{SpClient, SpSettings};
use crate::config::{ConfigStore, TenantConfig};
use crate::error::AuthError;

struct CachedClient {
    fingerprint: String,
    client: Arc<SpClient>,
}

pub struct SpClientFactory {
    configs: Arc<ConfigStore>,
    settings: SpSettings,
    cache: RwLock<HashMap<String, CachedClient>>,
}

impl SpClientFactory {
    pub fn new(configs: Arc<ConfigStore>, settings: SpSettings) -> Self {
        Self {
            configs,
            settings,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a slug to its SP client and current tenant config.
    pub fn client_for(&self, slug: &str) -> Result<(Arc<SpClient>, TenantConfig), AuthError> {
        let config = self
            .configs
            .get(slug)?
            .ok_or_else(|| AuthError::ConfigNotFound(slug.to_string()))?;
        let fingerprint = config.client_fingerprint();

        if let Ok(cache) = self.cache.read() {
            if let Some(cached) = cache.get(slug) {
                if cached.fingerprint == fingerprint {
                    return Ok((Arc::clone(&cached.client), config));
                }
            }
        }

        let client = Arc::new(SpClient::from_config(&config, &self.settings)?);
        debug!(slug = %slug, fingerprint = %fingerprint, "Cached new SP client");

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(
                slug.to_string(),
                CachedClient {
                    fingerprint,
                    client: Arc::clone(&client),
                },
            );
        }

        Ok((client, config))
    }
}
