//! SAML2 federated-login bridge.
//!
//! Per-tenant SAML service provider clients, identity reconciliation with
//! auto-provisioning, and a single-use auth-code handoff back to the host
//! application.

pub mod authcode;
pub mod config;
pub mod directory;
pub mod error;
pub mod http;
pub mod provision;
pub mod sp;
pub mod token;
