//! Tenant SAML configuration and service-level settings.

pub mod store;
pub mod types;

pub use store::ConfigStore;
pub use types::{HostApp, InvalidLinkCodePolicy, ServiceConfig, TenantConfig};
