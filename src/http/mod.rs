//! HTTP front-end over the login core.
//!
//! Thin glue: handlers resolve the tenant client, run the flow, and map
//! every outcome to the response the browser or API caller expects. All
//! decisions live in the core modules.

use axum::extract::{Form, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::authcode::AuthCodeStore;
use crate::config::{HostApp, InvalidLinkCodePolicy};
use crate::directory::{DirectoryStore, ReconciliationContext};
use crate::error::{AuthError, AuthErrorCode};
use crate::provision::{auto_provision, error_redirect};
use crate::sp::SpClientFactory;
use crate::token::TokenService;

pub struct AppState {
    pub factory: SpClientFactory,
    pub directory: DirectoryStore,
    pub codes: Arc<AuthCodeStore>,
    pub tokens: Arc<dyn TokenService>,
    pub host_app: HostApp,
    pub on_invalid_link_code: InvalidLinkCodePolicy,
    /// External base URL of this service, for login URLs handed to clients.
    pub external_base_url: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/account/sociallogin", get(social_login))
        .route("/account/saml2/{slug}/", get(login_page))
        .route("/account/saml2/acs/{slug}/", post(assertion_consumer))
        .route("/v2/api/user/socialaccount/connect", get(connect_preflight))
        .with_state(state)
}

/// 302 redirect. The flow contract promises Found, not See Other.
fn found(location: &str) -> Response {
    (
        StatusCode::FOUND,
        [(header::LOCATION, location.to_string())],
    )
        .into_response()
}

fn error_response(err: &AuthError) -> Response {
    match err {
        AuthError::ConfigNotFound(slug) => (
            StatusCode::NOT_FOUND,
            format!("no SAML configuration for provider '{}'", slug),
        )
            .into_response(),
        AuthError::Token(_) => StatusCode::UNAUTHORIZED.into_response(),
        _ => {
            warn!(error = %err, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Deserialize)]
struct SocialLoginParams {
    provider: Option<String>,
    #[serde(rename = "authCode")]
    auth_code: Option<String>,
}

/// Dispatch to the per-tenant login endpoint, carrying a linking auth code
/// through when present.
async fn social_login(Query(params): Query<SocialLoginParams>) -> Response {
    let Some(provider) = params.provider else {
        return (StatusCode::BAD_REQUEST, "missing provider parameter").into_response();
    };
    let mut location = format!("/account/saml2/{}/", provider);
    if let Some(code) = params.auth_code {
        location.push_str(&format!("?authCode={}", urlencoding::encode(&code)));
    }
    found(&location)
}

#[derive(Deserialize)]
struct LoginPageParams {
    #[serde(rename = "authCode")]
    auth_code: Option<String>,
}

/// Self-submitting form that sends the browser to the IdP.
async fn login_page(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Query(params): Query<LoginPageParams>,
) -> Response {
    let client = match state.factory.client_for(&slug) {
        Ok((client, _)) => client,
        Err(err) => return error_response(&err),
    };

    let relay_state = params.auth_code.map(|code| format!("authcode={}", code));
    match client.login_form(relay_state.as_deref()) {
        Ok(form) => Html(form).into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Deserialize)]
struct AcsForm {
    #[serde(rename = "SAMLResponse")]
    saml_response: String,
    #[serde(rename = "RelayState")]
    relay_state: Option<String>,
}

/// Assertion consumer service: validate, reconcile, redirect.
async fn assertion_consumer(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Form(form): Form<AcsForm>,
) -> Response {
    let client = match state.factory.client_for(&slug) {
        Ok((client, _)) => client,
        Err(err) => return error_response(&err),
    };

    let identity = match client.consume(&form.saml_response) {
        Ok(identity) => identity,
        Err(err) => {
            info!(slug = %slug, error = %err, "Assertion rejected");
            return found(&error_redirect(
                &state.host_app,
                AuthErrorCode::AssertionInvalid,
                &slug,
            ));
        }
    };

    let ctx = match resolve_context(
        form.relay_state.as_deref(),
        &state.codes,
        state.on_invalid_link_code,
    ) {
        Ok(ctx) => ctx,
        Err(AuthError::InvalidCode) => {
            info!(slug = %slug, "Linking auth code rejected");
            return found(&error_redirect(
                &state.host_app,
                AuthErrorCode::InvalidLinkCode,
                &slug,
            ));
        }
        Err(err) => return error_response(&err),
    };

    match auto_provision(
        &state.directory,
        state.tokens.as_ref(),
        &state.host_app,
        &slug,
        &identity,
        ctx,
    ) {
        Ok(outcome) => found(outcome.redirect()),
        Err(err) => error_response(&err),
    }
}

/// Map the echoed `RelayState` to a reconciliation context.
///
/// `authcode=<code>` marks a linking flow; the code is redeemed here,
/// exactly once. What happens when redemption fails is a deployment policy.
fn resolve_context(
    relay_state: Option<&str>,
    codes: &AuthCodeStore,
    policy: InvalidLinkCodePolicy,
) -> Result<ReconciliationContext, AuthError> {
    let Some(code) = relay_state.and_then(|s| s.strip_prefix("authcode=")) else {
        return Ok(ReconciliationContext::Fresh);
    };
    match codes.redeem(code)? {
        Some(user_id) => Ok(ReconciliationContext::LinkTo(user_id)),
        None => match policy {
            InvalidLinkCodePolicy::Fail => Err(AuthError::InvalidCode),
            InvalidLinkCodePolicy::Continue => Ok(ReconciliationContext::Fresh),
        },
    }
}

#[derive(Deserialize)]
struct ConnectParams {
    provider: Option<String>,
}

fn bearer_user(state: &AppState, headers: &HeaderMap) -> Result<Uuid, AuthError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| AuthError::Token("missing bearer token".to_string()))?;
    let user_id = state.tokens.verify(token)?;
    if state.directory.get_user(user_id)?.is_none() {
        return Err(AuthError::Token("token names an unknown user".to_string()));
    }
    Ok(user_id)
}

/// Linking preflight: mint an auth code for the authenticated user and hand
/// back the login URL that carries it.
async fn connect_preflight(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<ConnectParams>,
) -> Response {
    let user_id = match bearer_user(&state, &headers) {
        Ok(user_id) => user_id,
        Err(err) => return error_response(&err),
    };

    let Some(provider) = params.provider else {
        return (StatusCode::BAD_REQUEST, "missing provider parameter").into_response();
    };
    if let Err(err) = state.factory.client_for(&provider) {
        return error_response(&err);
    }

    let code = match state.codes.issue(user_id) {
        Ok(code) => code,
        Err(err) => return error_response(&AuthError::Storage(err)),
    };

    let url = format!(
        "{}/account/sociallogin?provider={}&authCode={}",
        state.external_base_url.trim_end_matches('/'),
        urlencoding::encode(&provider),
        code
    );
    Json(json!({ "result": { "url": url } })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authcode::DEFAULT_CODE_TTL_SECS;
    use crate::config::ConfigStore;
    use crate::sp::client::test_support::test_tenant;
    use crate::sp::SpSettings;
    use crate::token::JwtTokenService;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn test_state(policy: InvalidLinkCodePolicy) -> (Arc<AppState>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let configs = Arc::new(ConfigStore::open(dir.path().join("configs.redb")).unwrap());
        configs.upsert(test_tenant("saml2.acme", false)).unwrap();

        let settings = SpSettings {
            sp_entity_id: "https://badges.example.com".to_string(),
            acs_base_url: "https://badges.example.com".to_string(),
            signing: None,
        };

        let state = AppState {
            factory: SpClientFactory::new(configs, settings),
            directory: DirectoryStore::open(dir.path().join("directory.redb")).unwrap(),
            codes: Arc::new(
                AuthCodeStore::open(dir.path().join("codes.redb"), DEFAULT_CODE_TTL_SECS).unwrap(),
            ),
            tokens: Arc::new(JwtTokenService::new(
                b"test-secret-that-is-long-enough",
                "https://badges.example.com".to_string(),
                3600,
            )),
            host_app: HostApp {
                ui_login_redirect: "https://app.example.com/auth/success".to_string(),
                ui_signup_failure_redirect: "https://app.example.com/auth/fail".to_string(),
                ui_connect_redirect: None,
            },
            on_invalid_link_code: policy,
            external_base_url: "https://badges.example.com".to_string(),
        };
        (Arc::new(state), dir)
    }

    async fn get(app: Router, uri: &str) -> Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .into_response()
    }

    fn location(response: &Response) -> String {
        response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn social_login_dispatches_to_provider() {
        let (state, _dir) = test_state(InvalidLinkCodePolicy::Fail);
        let response = get(
            router(state),
            "/account/sociallogin?provider=saml2.acme",
        )
        .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/account/saml2/saml2.acme/");
    }

    #[tokio::test]
    async fn social_login_forwards_auth_code() {
        let (state, _dir) = test_state(InvalidLinkCodePolicy::Fail);
        let response = get(
            router(state),
            "/account/sociallogin?provider=saml2.acme&authCode=abc123",
        )
        .await;
        assert_eq!(
            location(&response),
            "/account/saml2/saml2.acme/?authCode=abc123"
        );
    }

    #[tokio::test]
    async fn login_page_renders_form() {
        let (state, _dir) = test_state(InvalidLinkCodePolicy::Fail);
        let response = get(router(state), "/account/saml2/saml2.acme/").await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let html = String::from_utf8(body.to_vec()).unwrap();
        assert!(html.contains(r#"<form action="https://idp.example.com/sso/post" method="post">"#));
        assert!(html.contains(r#"name="SAMLRequest""#));
    }

    #[tokio::test]
    async fn login_page_threads_auth_code_into_relay_state() {
        let (state, _dir) = test_state(InvalidLinkCodePolicy::Fail);
        let response = get(
            router(state),
            "/account/saml2/saml2.acme/?authCode=abc123",
        )
        .await;
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let html = String::from_utf8(body.to_vec()).unwrap();
        assert!(html.contains(r#"name="RelayState" value="authcode=abc123""#));
    }

    #[tokio::test]
    async fn unknown_provider_is_not_found() {
        let (state, _dir) = test_state(InvalidLinkCodePolicy::Fail);
        let response = get(router(state), "/account/saml2/saml2.nope/").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_assertion_redirects_with_error() {
        let (state, _dir) = test_state(InvalidLinkCodePolicy::Fail);
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/account/saml2/acs/saml2.acme/")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("SAMLResponse=bm90LXNhbWw%3D"))
                    .unwrap(),
            )
            .await
            .unwrap()
            .into_response();

        assert_eq!(response.status(), StatusCode::FOUND);
        let location = location(&response);
        assert!(location.contains("authError=assertion_invalid"));
        assert!(location.contains("provider=saml2.acme"));
    }

    #[tokio::test]
    async fn connect_requires_bearer_token() {
        let (state, _dir) = test_state(InvalidLinkCodePolicy::Fail);
        let response = get(
            router(state),
            "/v2/api/user/socialaccount/connect?provider=saml2.acme",
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn connect_returns_login_url_with_auth_code() {
        let (state, _dir) = test_state(InvalidLinkCodePolicy::Fail);
        let user = state
            .directory
            .create_user("Grace", "Hopper", "grace@example.com", true)
            .unwrap();
        let token = state.tokens.issue(user.id).unwrap();

        let response = router(Arc::clone(&state))
            .oneshot(
                Request::builder()
                    .uri("/v2/api/user/socialaccount/connect?provider=saml2.acme")
                    .header(header::AUTHORIZATION, format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let url = json["result"]["url"].as_str().unwrap();
        assert!(url.starts_with(
            "https://badges.example.com/account/sociallogin?provider=saml2.acme&authCode="
        ));

        // The embedded code redeems to the authenticated user.
        let code = url.split("authCode=").nth(1).unwrap();
        assert_eq!(state.codes.redeem(code).unwrap(), Some(user.id));
    }

    #[tokio::test]
    async fn connect_with_unknown_provider_is_not_found() {
        let (state, _dir) = test_state(InvalidLinkCodePolicy::Fail);
        let user = state
            .directory
            .create_user("Grace", "Hopper", "grace@example.com", true)
            .unwrap();
        let token = state.tokens.issue(user.id).unwrap();

        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/v2/api/user/socialaccount/connect?provider=saml2.nope")
                    .header(header::AUTHORIZATION, format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn relay_state_resolution_honors_policy() {
        let (state, _dir) = test_state(InvalidLinkCodePolicy::Fail);

        // No relay state: ordinary login.
        assert_eq!(
            resolve_context(None, &state.codes, InvalidLinkCodePolicy::Fail).unwrap(),
            ReconciliationContext::Fresh
        );
        // Relay state without the linking marker is ignored.
        assert_eq!(
            resolve_context(Some("/dashboard"), &state.codes, InvalidLinkCodePolicy::Fail).unwrap(),
            ReconciliationContext::Fresh
        );

        // Valid code becomes a linking context, exactly once.
        let user_id = Uuid::new_v4();
        state
            .directory
            .create_user("Grace", "Hopper", "grace@example.com", true)
            .unwrap();
        let code = state.codes.issue(user_id).unwrap();
        let relay = format!("authcode={}", code);
        assert_eq!(
            resolve_context(Some(&relay), &state.codes, InvalidLinkCodePolicy::Fail).unwrap(),
            ReconciliationContext::LinkTo(user_id)
        );

        // The code is spent now: fail policy aborts, continue degrades.
        let err =
            resolve_context(Some(&relay), &state.codes, InvalidLinkCodePolicy::Fail).unwrap_err();
        assert!(matches!(err, AuthError::InvalidCode));
        assert_eq!(
            resolve_context(Some(&relay), &state.codes, InvalidLinkCodePolicy::Continue).unwrap(),
            ReconciliationContext::Fresh
        );
    }
}
