//! HTTP server for the relying party
//!
//! Routes:
//! - the OIDC challenge, provider callback and completion endpoints
//! - login, logout and access-denied pages
//! - protected session views under the API prefix and `/account/profile`
//! - `/health`

use crate::auth::{AuthContext, CookiePolicy, SigninManager, TicketSigninManager, TicketStore};
use crate::cache::{Cache, MemoryCache};
use crate::config::Settings;
use crate::error::{PipelineError, Result};
use crate::middleware::{
    authenticate, challenge, require_authentication, session_layer, validate_session,
    AuthChallenge,
};
use crate::oidc::{
    capture_callback, CallbackOutcome, CorrelationKey, OidcProvider, OidcResponseGenerator,
    PendingAuthorization, ResponseCapture, ResponseMode, SessionResponseGenerator,
    PENDING_AUTHORIZATION, SESSION_DETAILS,
};
use crate::params::{html_escape, Parameters, SENSITIVE_FIELDS};
use crate::session::{Session, SessionLocks};
use axum::extract::{Query, RawQuery, State};
use axum::http::{header, StatusCode, Uri};
use axum::middleware::from_fn_with_state;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Shared state of all handlers and middleware
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub cache: Arc<dyn Cache>,
    pub provider: Arc<OidcProvider>,
    pub capture: Arc<ResponseCapture>,
    pub generator: Arc<dyn OidcResponseGenerator>,
    pub signin: Arc<dyn SigninManager>,
    pub tickets: TicketStore,
    pub session_locks: Arc<SessionLocks>,
}

impl AppState {
    /// State backed by an in-process cache
    pub fn new(settings: Settings) -> Result<Self> {
        Self::with_cache(settings, Arc::new(MemoryCache::new()))
    }

    pub fn with_cache(settings: Settings, cache: Arc<dyn Cache>) -> Result<Self> {
        let provider = OidcProvider::new(settings.provider.clone(), settings.idp_timeout)?;
        let tickets = TicketStore::new(cache.clone(), settings.cookie_ttl);
        let capture = Arc::new(ResponseCapture::new(cache.clone(), settings.capture_ttl));

        Ok(Self {
            generator: Arc::new(SessionResponseGenerator::new(
                capture.clone(),
                tickets.clone(),
            )),
            signin: Arc::new(TicketSigninManager::new(tickets.clone())),
            provider: Arc::new(provider),
            settings: Arc::new(settings),
            cache,
            capture,
            tickets,
            session_locks: Arc::new(SessionLocks::new()),
        })
    }

    pub fn session_cookie(&self) -> CookiePolicy {
        CookiePolicy::new(self.settings.session_cookie_name(), self.settings.cookie_ttl)
    }

    pub fn auth_cookie(&self) -> CookiePolicy {
        CookiePolicy::new(self.settings.auth_cookie_name(), self.settings.cookie_ttl)
    }
}

pub fn router(state: AppState) -> Router {
    let paths = state.settings.paths.clone();
    let api_session = format!("{}/session", state.settings.api_prefix.trim_end_matches('/'));

    let protected = Router::new()
        .route(&api_session, get(session_details))
        .route("/account/profile", get(profile))
        .route_layer(from_fn_with_state(state.clone(), require_authentication));

    Router::new()
        .route("/health", get(health))
        .route(&paths.challenge, get(start_challenge))
        .route(&paths.callback, get(callback_query).post(callback_form))
        .route(&paths.complete, get(complete))
        .route(&paths.logout, post(logout))
        .route(&paths.login, get(login_page))
        .route(&paths.access_denied, get(access_denied_page))
        .merge(protected)
        .layer(from_fn_with_state(state.clone(), validate_session))
        .layer(from_fn_with_state(state.clone(), authenticate))
        .layer(from_fn_with_state(state.clone(), session_layer))
        .with_state(state)
}

/// Router for a process whose configuration did not validate.
///
/// `/health` keeps answering so the failure is visible to health checks;
/// every other request fails with the deferred configuration error.
pub fn unconfigured_router(reason: String) -> Router {
    let reason = Arc::new(reason);
    Router::new()
        .route(
            "/health",
            get(|| async {
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "status": "misconfigured" })),
                )
            }),
        )
        .fallback(move || {
            let reason = reason.clone();
            async move { PipelineError::Config(reason.to_string()) }
        })
}

/// Serve `app` until the listener fails
pub async fn serve(addr: SocketAddr, app: Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

fn redirect(location: String) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct ChallengeQuery {
    return_to: Option<String>,
    response_mode: Option<String>,
}

/// Start an authorization code flow at the provider
async fn start_challenge(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Query(query): Query<ChallengeQuery>,
) -> Result<Response> {
    let return_to = query.return_to.unwrap_or_else(|| "/".to_string());
    if !state.settings.is_allowed_return_url(&return_to) {
        return Err(PipelineError::BadRequest(format!(
            "Return URL not allowed: {}",
            return_to
        )));
    }
    let response_mode = match query.response_mode.as_deref() {
        Some(mode) => mode.parse().map_err(PipelineError::BadRequest)?,
        None => ResponseMode::default(),
    };

    let pending = PendingAuthorization::new(return_to, response_mode);
    let url = state.provider.authorization_url(&pending).await?;
    session.set(&PENDING_AUTHORIZATION, &pending).await?;

    info!(
        "Redirecting to {} for sign-in (response mode {:?})",
        state.provider.name(),
        pending.response_mode
    );
    Ok(redirect(url))
}

async fn callback_query(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    uri: Uri,
    RawQuery(query): RawQuery,
) -> Result<Response> {
    let fields = Parameters::parse(query.as_deref().unwrap_or_default());
    handle_callback(&state, &session, &uri, fields).await
}

async fn callback_form(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    uri: Uri,
    body: String,
) -> Result<Response> {
    handle_callback(&state, &session, &uri, Parameters::parse(&body)).await
}

async fn handle_callback(
    state: &AppState,
    session: &Session,
    uri: &Uri,
    fields: Parameters,
) -> Result<Response> {
    match capture_callback(&state.provider, &state.capture, session, fields).await? {
        CallbackOutcome::Captured(key) => {
            let query: Parameters = [("key", key.as_str())].into_iter().collect();
            Ok(redirect(format!(
                "{}?{}",
                state.settings.paths.complete,
                query.to_query_string()
            )))
        }
        CallbackOutcome::Denied(_) => Ok(challenge(
            &state.settings,
            uri,
            AuthChallenge::AccessDenied,
            StatusCode::OK.into_response(),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct CompleteQuery {
    key: String,
}

/// Redeem a correlation key into a signed-in session
async fn complete(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<CompleteQuery>,
) -> Result<Response> {
    let key = CorrelationKey::from(query.key.as_str());
    match state
        .generator
        .create_id_token_action_result(&key, true, &session, &auth)
        .await
    {
        Ok(action) => Ok(action.into_response()),
        // Never return to the spent key after signing in again
        Err(PipelineError::CaptureNotFound) => Ok(challenge(
            &state.settings,
            &Uri::from_static("/"),
            AuthChallenge::Login,
            StatusCode::OK.into_response(),
        )),
        Err(e) => Err(e),
    }
}

async fn logout(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Response> {
    state.signin.sign_out(&auth, &session).await?;
    Ok(redirect("/".to_string()))
}

#[derive(Debug, Deserialize)]
struct LoginQuery {
    #[serde(rename = "ReturnUrl")]
    return_url: Option<String>,
}

async fn login_page(State(state): State<AppState>, Query(query): Query<LoginQuery>) -> Html<String> {
    let return_to = query
        .return_url
        .filter(|target| state.settings.is_allowed_return_url(target))
        .unwrap_or_else(|| "/".to_string());
    let challenge: Parameters = [("return_to", return_to.as_str())].into_iter().collect();
    let href = format!(
        "{}?{}",
        state.settings.paths.challenge,
        challenge.to_query_string()
    );

    Html(format!(
        r#"<!DOCTYPE html>
<html>
    <head><title>Sign in - {app}</title></head>
    <body>
        <h1>Sign in</h1>
        <p><a href="{href}">Sign in with {provider}</a></p>
    </body>
</html>
"#,
        app = html_escape(&state.settings.application_name),
        href = html_escape(&href),
        provider = html_escape(state.provider.name()),
    ))
}

async fn access_denied_page() -> (StatusCode, Html<&'static str>) {
    (
        StatusCode::FORBIDDEN,
        Html(
            r#"<!DOCTYPE html>
<html>
    <head><title>Access denied</title></head>
    <body>
        <h1>Access denied</h1>
        <p>The identity provider did not grant access. <a href="/">Home</a></p>
    </body>
</html>
"#,
        ),
    )
}

/// Ticket and session details of the signed-in user; token values redacted
async fn session_details(
    Extension(session): Extension<Session>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<serde_json::Value>> {
    let ticket = auth
        .ticket()
        .await
        .ok_or_else(|| PipelineError::Auth("Not signed in".to_string()))?;
    let details = session
        .get(&SESSION_DETAILS)
        .await?
        .ok_or_else(|| PipelineError::Auth("No session details".to_string()))?;
    let fields: Parameters = details.oidc.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

    Ok(Json(json!({
        "subject": ticket.subject,
        "login_provider": details.login_provider,
        "session_id": ticket.session_id,
        "expires_at": ticket.expires_at,
        "oidc": fields.to_scrubbed_dictionary(SENSITIVE_FIELDS),
    })))
}

async fn profile(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Html<String>> {
    let ticket = auth
        .ticket()
        .await
        .ok_or_else(|| PipelineError::Auth("Not signed in".to_string()))?;
    let details = session.get_or_default(&SESSION_DETAILS).await?;
    let fields: Parameters = details.oidc.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

    let rows: String = fields
        .to_scrubbed_dictionary(SENSITIVE_FIELDS)
        .iter()
        .map(|(name, value)| {
            format!(
                "            <tr><td>{}</td><td>{}</td></tr>\n",
                html_escape(name),
                html_escape(value)
            )
        })
        .collect();

    Ok(Html(format!(
        r#"<!DOCTYPE html>
<html>
    <head><title>Profile</title></head>
    <body>
        <h1>{subject}</h1>
        <p>Signed in via {provider}</p>
        <table>
{rows}        </table>
        <form method="post" action="{logout}"><button type="submit">Sign out</button></form>
    </body>
</html>
"#,
        subject = html_escape(&ticket.subject),
        provider = html_escape(&details.login_provider),
        rows = rows,
        logout = html_escape(&state.settings.paths.logout),
    )))
}
