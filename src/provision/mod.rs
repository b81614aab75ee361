//! Identity reconciliation driver.
//!
//! Takes a validated assertion, runs the directory decision table, and
//! turns the outcome into the redirect the browser is sent to: a success
//! redirect carrying a fresh bearer token, or a failure redirect carrying
//! an error code and the provider slug.

use tracing::info;
use uuid::Uuid;

use crate::config::HostApp;
use crate::directory::{DirectoryStore, Reconciled, ReconciliationContext};
use crate::error::{AuthError, AuthErrorCode};
use crate::sp::AssertedIdentity;
use crate::token::TokenService;

/// Final outcome of an assertion landing at the ACS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Success { user_id: Uuid, redirect: String },
    Conflict { redirect: String },
}

impl LoginOutcome {
    pub fn redirect(&self) -> &str {
        match self {
            LoginOutcome::Success { redirect, .. } => redirect,
            LoginOutcome::Conflict { redirect } => redirect,
        }
    }
}

/// Resolve a validated identity to a local account and build the handoff
/// redirect.
///
/// All directory reads and writes happen in one transaction; a conflict
/// leaves no trace. Linking logins land on the connect redirect, ordinary
/// logins on the login redirect, both with `authToken` appended.
pub fn auto_provision(
    directory: &DirectoryStore,
    tokens: &dyn TokenService,
    host_app: &HostApp,
    slug: &str,
    identity: &AssertedIdentity,
    ctx: ReconciliationContext,
) -> Result<LoginOutcome, AuthError> {
    let outcome = directory.reconcile(slug, identity, ctx)?;

    match outcome {
        Reconciled::Conflict => Ok(LoginOutcome::Conflict {
            redirect: error_redirect(host_app, AuthErrorCode::EmailConflict, slug),
        }),
        Reconciled::Resolved {
            user_id,
            disposition,
        } => {
            let token = tokens.issue(user_id)?;
            let base = match ctx {
                ReconciliationContext::LinkTo(_) => host_app.connect_redirect(),
                ReconciliationContext::Fresh => &host_app.ui_login_redirect,
            };
            info!(slug = %slug, user_id = %user_id, ?disposition, "Login resolved");
            Ok(LoginOutcome::Success {
                user_id,
                redirect: append_param(base, "authToken", &token),
            })
        }
    }
}

/// Failure redirect with `authError` and `provider` parameters.
pub fn error_redirect(host_app: &HostApp, code: AuthErrorCode, slug: &str) -> String {
    let url = append_param(&host_app.ui_signup_failure_redirect, "authError", code.as_str());
    append_param(&url, "provider", slug)
}

fn append_param(base: &str, name: &str, value: &str) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{}{}{}={}", base, separator, name, urlencoding::encode(value))
}
