//! SAML service provider clients, one per tenant.

pub mod client;
pub mod factory;
pub mod signing;

pub use client::{AssertedIdentity, SpClient, SpSettings};
pub use factory::SpClientFactory;
pub use signing::SigningKeypair;
