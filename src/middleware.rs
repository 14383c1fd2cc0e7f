//! Request pipeline middleware
//!
//! Layers run outermost first: [`session_layer`] resolves the session,
//! [`authenticate`] resolves the authentication ticket and [`validate_session`]
//! checks that the two still agree. Protected routes add
//! [`require_authentication`].

use crate::auth::{AuthContext, AuthTicket, CookieChange, CookiePolicy};
use crate::config::Settings;
use crate::error::{PipelineError, Result};
use crate::oidc::SESSION_DETAILS;
use crate::params::Parameters;
use crate::serializer::{JsonSerializer, Serializer};
use crate::server::AppState;
use crate::session::{Session, SessionId, SessionSnapshot};
use axum::extract::{Request, State};
use axum::http::{header, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use tracing::{debug, error, warn};

const SESSION_PREFIX: &str = "session:";

/// Kind of challenge issued to a request that may not proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthChallenge {
    Login,
    AccessDenied,
}

/// Whether `path` lies under `prefix`, compared per segment and ignoring case
pub fn is_api_path(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() || path.len() < prefix.len() {
        return false;
    }
    let (head, rest) = path.split_at(prefix.len());
    head.eq_ignore_ascii_case(prefix) && (rest.is_empty() || rest.starts_with('/'))
}

/// Apply a challenge to `response`.
///
/// API requests keep the response and only have a `200` turned into `401`
/// (login) or `403` (access denied); any other status is left alone. Browser
/// requests are redirected to the login page, carrying the requested target
/// as `ReturnUrl`, or to the access-denied page.
pub fn challenge(
    settings: &Settings,
    uri: &Uri,
    kind: AuthChallenge,
    mut response: Response,
) -> Response {
    if is_api_path(&settings.api_prefix, uri.path()) {
        if response.status() == StatusCode::OK {
            *response.status_mut() = match kind {
                AuthChallenge::Login => StatusCode::UNAUTHORIZED,
                AuthChallenge::AccessDenied => StatusCode::FORBIDDEN,
            };
        }
        return response;
    }

    let location = match kind {
        AuthChallenge::Login => {
            let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
            let query: Parameters = [("ReturnUrl", target)].into_iter().collect();
            format!("{}?{}", settings.paths.login, query.to_query_string())
        }
        AuthChallenge::AccessDenied => settings.paths.access_denied.clone(),
    };
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

/// Load the session named by the session cookie and persist it after the handler.
///
/// A modified session that cannot be stored fails the whole request, so no
/// cookie is handed out for state that was never saved.
pub async fn session_layer(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let policy = state.session_cookie();
    let session = load_session(&state, policy.read(request.headers())).await;
    request.extensions_mut().insert(session.clone());

    let mut response = next.run(request).await;

    if let Some(snapshot) = session.snapshot().await {
        if let Err(e) = persist_session(&state, &snapshot).await {
            error!("Failed to persist session {}: {}", snapshot.id, e);
            if snapshot.modified {
                return PipelineError::Server(format!("Session {} was not saved", snapshot.id))
                    .into_response();
            }
        }
        if snapshot.created {
            CookiePolicy::append(response.headers_mut(), policy.issue(snapshot.id.as_str()));
        }
    }
    response
}

async fn load_session(state: &AppState, cookie: Option<String>) -> Session {
    let Some(id) = cookie.as_deref().and_then(SessionId::parse) else {
        return Session::new();
    };

    match state.cache.get(&session_key(&id)).await {
        Ok(Some(text)) => match JsonSerializer.deserialize::<HashMap<String, String>>(&text) {
            Ok(entries) => Session::existing(id, entries),
            Err(e) => {
                warn!("Discarding unreadable session {}: {}", id, e);
                Session::new()
            }
        },
        Ok(None) => {
            debug!("Session {} expired or unknown", id);
            Session::new()
        }
        Err(e) => {
            warn!("Failed to load session {}: {}", id, e);
            Session::new()
        }
    }
}

/// Merge this request's changes into the stored session; an untouched one
/// only has its TTL slid
async fn persist_session(state: &AppState, snapshot: &SessionSnapshot) -> Result<()> {
    let key = session_key(&snapshot.id);
    let ttl = state.settings.cookie_ttl;
    if !snapshot.modified {
        return state.cache.touch(&key, ttl).await.map(|_| ());
    }

    let _guard = state.session_locks.lock(&snapshot.id).await;
    let mut entries = match state.cache.get(&key).await? {
        Some(text) => JsonSerializer.deserialize::<HashMap<String, String>>(&text)?,
        None => HashMap::new(),
    };
    snapshot.apply(&mut entries);
    let text = JsonSerializer.serialize(&entries, false)?;
    state.cache.set(&key, text, ttl).await
}

fn session_key(id: &SessionId) -> String {
    format!("{}{}", SESSION_PREFIX, id)
}

/// Resolve the authentication cookie into an [`AuthContext`]
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let policy = state.auth_cookie();
    let auth = match policy.read(request.headers()) {
        Some(ticket_id) => resolve_ticket(&state, &ticket_id).await,
        None => AuthContext::anonymous(),
    };
    request.extensions_mut().insert(auth.clone());

    let mut response = next.run(request).await;

    match auth.take_change().await {
        Some(CookieChange::Issue(ticket_id)) => {
            CookiePolicy::append(response.headers_mut(), policy.issue(&ticket_id));
        }
        Some(CookieChange::Expire) => {
            CookiePolicy::append(response.headers_mut(), policy.expire());
        }
        None => {}
    }
    response
}

async fn resolve_ticket(state: &AppState, ticket_id: &str) -> AuthContext {
    let ticket = match state.tickets.load(ticket_id).await {
        Ok(ticket) => ticket,
        Err(e) => {
            warn!("Failed to load authentication ticket: {}", e);
            None
        }
    };

    let Some(mut ticket) = ticket else {
        debug!("Authentication ticket expired or unknown");
        let auth = AuthContext::anonymous();
        auth.record_change(CookieChange::Expire).await;
        return auth;
    };

    let ttl = state.tickets.ttl();
    if !ticket.needs_renewal(ttl) {
        return AuthContext::authenticated(ticket);
    }

    ticket.renew(ttl);
    match state.tickets.save(&ticket).await {
        Ok(()) => {
            debug!("Renewed authentication ticket for {}", ticket.subject);
            let change = CookieChange::Issue(ticket.id.clone());
            let auth = AuthContext::authenticated(ticket);
            auth.record_change(change).await;
            auth
        }
        Err(e) => {
            warn!("Failed to renew authentication ticket: {}", e);
            AuthContext::authenticated(ticket)
        }
    }
}

/// Sign out and challenge authenticated requests whose session no longer matches
pub async fn validate_session(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let auth = request.extensions().get::<AuthContext>().cloned();
    let session = request.extensions().get::<Session>().cloned();
    let (Some(auth), Some(session)) = (auth, session) else {
        return next.run(request).await;
    };
    let Some(ticket) = auth.ticket().await else {
        return next.run(request).await;
    };

    let Some(reason) = incoherence(&ticket, &session).await else {
        return next.run(request).await;
    };

    warn!("Rejecting session of {}: {}", ticket.subject, reason);
    if let Err(e) = state.signin.sign_out(&auth, &session).await {
        error!("Sign-out failed: {}", e);
    }
    challenge(
        &state.settings,
        request.uri(),
        AuthChallenge::Login,
        StatusCode::OK.into_response(),
    )
}

/// Why `ticket` and `session` disagree, if they do
async fn incoherence(ticket: &AuthTicket, session: &Session) -> Option<String> {
    match session.id().await {
        None => return Some("session no longer exists".to_string()),
        Some(id) if id != ticket.session_id => {
            return Some("ticket belongs to another session".to_string())
        }
        Some(_) => {}
    }

    match session.get(&SESSION_DETAILS).await {
        Ok(Some(details)) if details.login_provider == ticket.login_provider => None,
        Ok(Some(details)) => Some(format!(
            "session details are for provider {}",
            details.login_provider
        )),
        Ok(None) => Some("session details are missing".to_string()),
        Err(e) => Some(format!("session details are unreadable: {}", e)),
    }
}

/// Gate for routes that need a signed-in user
pub async fn require_authentication(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let auth = request.extensions().get::<AuthContext>().cloned();
    let authenticated = match auth {
        Some(auth) => auth.is_authenticated().await,
        None => false,
    };

    if authenticated {
        next.run(request).await
    } else {
        challenge(
            &state.settings,
            request.uri(),
            AuthChallenge::Login,
            StatusCode::OK.into_response(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, MemoryCache};
    use crate::config::ProviderSettings;
    use crate::oidc::OpenIdConnectSessionDetails;
    use axum::body::Body;
    use axum::middleware::from_fn_with_state;
    use axum::routing::get;
    use axum::Router;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    const VISITS: crate::session::SessionKey<u32> = crate::session::SessionKey::new("test.visits");
    const NOTE: crate::session::SessionKey<String> = crate::session::SessionKey::new("test.note");

    /// Cache whose session writes always fail
    struct SessionWritesFail(MemoryCache);

    #[async_trait::async_trait]
    impl Cache for SessionWritesFail {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.0.get(key).await
        }

        async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
            if key.starts_with(SESSION_PREFIX) {
                return Err(PipelineError::Io(std::io::Error::other(
                    "session store unavailable",
                )));
            }
            self.0.set(key, value, ttl).await
        }

        async fn remove(&self, key: &str) -> Result<()> {
            self.0.remove(key).await
        }

        async fn take(&self, key: &str) -> Result<Option<String>> {
            self.0.take(key).await
        }

        async fn touch(&self, key: &str, ttl: Duration) -> Result<bool> {
            self.0.touch(key, ttl).await
        }
    }

    fn details() -> OpenIdConnectSessionDetails {
        OpenIdConnectSessionDetails {
            login_provider: "oidc".to_string(),
            oidc: Default::default(),
        }
    }

    fn settings() -> Settings {
        Settings::new(
            "Test",
            ProviderSettings {
                name: "oidc".to_string(),
                issuer_url: "http://127.0.0.1:1".to_string(),
                client_id: "client".to_string(),
                client_secret: None,
                scopes: vec!["openid".to_string()],
                redirect_url: "http://localhost:5000/signin-oidc".to_string(),
            },
        )
    }

    fn state() -> (AppState, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        let state = AppState::with_cache(settings(), cache.clone()).unwrap();
        (state, cache)
    }

    fn app(state: AppState) -> Router {
        Router::new()
            .route("/api/resource", get(|| async { "ok" }))
            .route("/account/page", get(|| async { "page" }))
            .route(
                "/visit",
                get(|axum::Extension(session): axum::Extension<Session>| async move {
                    let visits = session.get_or_default(&VISITS).await.unwrap() + 1;
                    session.set(&VISITS, &visits).await.unwrap();
                    visits.to_string()
                }),
            )
            .layer(from_fn_with_state(state.clone(), validate_session))
            .layer(from_fn_with_state(state.clone(), authenticate))
            .layer(from_fn_with_state(state.clone(), session_layer))
            .with_state(state)
    }

    fn get_with_cookies(uri: &str, cookies: &str) -> Request {
        axum::http::Request::builder()
            .uri(uri)
            .header(header::COOKIE, cookies)
            .body(Body::empty())
            .unwrap()
    }

    fn set_cookies(response: &Response) -> Vec<String> {
        response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    /// Store a session with details and a ticket bound to it
    async fn signed_in(state: &AppState, cache: &MemoryCache) -> (SessionId, AuthTicket) {
        let id = SessionId::generate();
        let entries: HashMap<String, String> = [(
            SESSION_DETAILS.name().to_string(),
            JsonSerializer.serialize(&details(), false).unwrap(),
        )]
        .into_iter()
        .collect();
        cache
            .set(
                &session_key(&id),
                JsonSerializer.serialize(&entries, false).unwrap(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let ticket = AuthTicket::new("alice", "oidc", id.clone(), state.tickets.ttl());
        state.tickets.save(&ticket).await.unwrap();
        (id, ticket)
    }

    #[test]
    fn test_is_api_path() {
        assert!(is_api_path("/api", "/api"));
        assert!(is_api_path("/api", "/api/resource"));
        assert!(is_api_path("/api", "/API/Resource"));
        assert!(is_api_path("/api/", "/api/resource"));
        assert!(!is_api_path("/api", "/apiary"));
        assert!(!is_api_path("/api", "/account/api"));
        assert!(!is_api_path("/api", "/"));
    }

    #[test]
    fn test_api_challenge_rewrites_only_ok() {
        let settings = settings();
        let uri: Uri = "/api/resource".parse().unwrap();

        let login = challenge(&settings, &uri, AuthChallenge::Login, StatusCode::OK.into_response());
        assert_eq!(login.status(), StatusCode::UNAUTHORIZED);

        let denied = challenge(
            &settings,
            &uri,
            AuthChallenge::AccessDenied,
            StatusCode::OK.into_response(),
        );
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let not_found = challenge(
            &settings,
            &uri,
            AuthChallenge::Login,
            StatusCode::NOT_FOUND.into_response(),
        );
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_browser_challenge_redirects() {
        let settings = settings();
        let uri: Uri = "/account/page?tab=1".parse().unwrap();

        let login = challenge(&settings, &uri, AuthChallenge::Login, StatusCode::OK.into_response());
        assert_eq!(login.status(), StatusCode::FOUND);
        assert_eq!(
            login.headers()[header::LOCATION],
            "/account/login?ReturnUrl=%2Faccount%2Fpage%3Ftab%3D1"
        );

        let denied = challenge(
            &settings,
            &uri,
            AuthChallenge::AccessDenied,
            StatusCode::OK.into_response(),
        );
        assert_eq!(denied.status(), StatusCode::FOUND);
        assert_eq!(denied.headers()[header::LOCATION], "/account/access-denied");
    }

    #[tokio::test]
    async fn test_session_cookie_issued_and_persisted() {
        let (state, cache) = state();
        let app = app(state);

        let response = app
            .clone()
            .oneshot(axum::http::Request::builder().uri("/visit").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let cookies = set_cookies(&response);
        assert_eq!(cookies.len(), 1);
        assert!(cookies[0].starts_with("Test.Session="));
        assert!(cookies[0].contains("HttpOnly"));
        let id = cookies[0]
            .trim_start_matches("Test.Session=")
            .split(';')
            .next()
            .unwrap()
            .to_string();
        assert_eq!(cache.live_entries().await, 1);

        // Second visit reuses the session and issues no new cookie
        let response = app
            .oneshot(get_with_cookies("/visit", &format!("Test.Session={}", id)))
            .await
            .unwrap();
        assert!(set_cookies(&response).is_empty());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"2");
    }

    #[tokio::test]
    async fn test_concurrent_requests_keep_each_others_writes() {
        let (state, cache) = state();
        let id = SessionId::generate();
        let stored: HashMap<String, String> =
            [(VISITS.name().to_string(), "1".to_string())].into_iter().collect();
        cache
            .set(
                &session_key(&id),
                JsonSerializer.serialize(&stored, false).unwrap(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let app = Router::new()
            .route(
                "/slow-note",
                get(|axum::Extension(session): axum::Extension<Session>| async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    session.set(&NOTE, &"x".to_string()).await.unwrap();
                    "noted"
                }),
            )
            .route(
                "/details",
                get(|axum::Extension(session): axum::Extension<Session>| async move {
                    session.set(&SESSION_DETAILS, &details()).await.unwrap();
                    "stored"
                }),
            )
            .layer(from_fn_with_state(state.clone(), session_layer))
            .with_state(state);

        let cookies = format!("Test.Session={}", id);
        let (slow, fast) = tokio::join!(
            app.clone().oneshot(get_with_cookies("/slow-note", &cookies)),
            async {
                // Loads after the slow request did, finishes long before it
                tokio::time::sleep(Duration::from_millis(20)).await;
                app.clone()
                    .oneshot(get_with_cookies("/details", &cookies))
                    .await
            }
        );
        assert_eq!(slow.unwrap().status(), StatusCode::OK);
        assert_eq!(fast.unwrap().status(), StatusCode::OK);

        let text = cache.get(&session_key(&id)).await.unwrap().unwrap();
        let entries: HashMap<String, String> = JsonSerializer.deserialize(&text).unwrap();
        assert_eq!(entries.get(NOTE.name()).map(String::as_str), Some("\"x\""));
        assert!(entries.contains_key(SESSION_DETAILS.name()));
        assert_eq!(entries.get(VISITS.name()).map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_unsaved_session_fails_request_without_cookies() {
        let state =
            AppState::with_cache(settings(), Arc::new(SessionWritesFail(MemoryCache::new())))
                .unwrap();
        let app = Router::new()
            .route(
                "/sign-in",
                get(
                    |axum::Extension(session): axum::Extension<Session>,
                     axum::Extension(auth): axum::Extension<AuthContext>| async move {
                        let id = session.session_id().await;
                        session.set(&SESSION_DETAILS, &details()).await.unwrap();
                        auth.sign_in(AuthTicket::new("alice", "oidc", id, Duration::from_secs(60)))
                            .await;
                        "signed in"
                    },
                ),
            )
            .layer(from_fn_with_state(state.clone(), authenticate))
            .layer(from_fn_with_state(state.clone(), session_layer))
            .with_state(state);

        let response = app
            .oneshot(axum::http::Request::builder().uri("/sign-in").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(set_cookies(&response).is_empty());
    }

    #[tokio::test]
    async fn test_untouched_request_creates_no_session() {
        let (state, cache) = state();
        let response = app(state)
            .oneshot(axum::http::Request::builder().uri("/account/page").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(set_cookies(&response).is_empty());
        assert_eq!(cache.live_entries().await, 0);
    }

    #[tokio::test]
    async fn test_coherent_session_passes() {
        let (state, cache) = state();
        let (id, ticket) = signed_in(&state, &cache).await;
        let cookies = format!("Test.Session={}; Test.Identity.Application={}", id, ticket.id);

        let response = app(state)
            .oneshot(get_with_cookies("/api/resource", &cookies))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(set_cookies(&response).is_empty());
    }

    #[tokio::test]
    async fn test_incoherent_session_on_api_is_unauthorized() {
        let (state, cache) = state();
        let (_, ticket) = signed_in(&state, &cache).await;
        // Ticket without its session cookie
        let cookies = format!("Test.Identity.Application={}", ticket.id);

        let response = app(state.clone())
            .oneshot(get_with_cookies("/api/resource", &cookies))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let cookies = set_cookies(&response);
        assert!(cookies
            .iter()
            .any(|c| c.starts_with("Test.Identity.Application=;") && c.contains("Max-Age=0")));
        assert_eq!(state.tickets.load(&ticket.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incoherent_session_in_browser_redirects_to_login() {
        let (state, cache) = state();
        let (_, ticket) = signed_in(&state, &cache).await;
        let other = SessionId::generate();
        let cookies = format!("Test.Session={}; Test.Identity.Application={}", other, ticket.id);

        let response = app(state)
            .oneshot(get_with_cookies("/account/page", &cookies))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "/account/login?ReturnUrl=%2Faccount%2Fpage"
        );
    }

    #[tokio::test]
    async fn test_unknown_ticket_cookie_is_expired() {
        let (state, _) = state();
        let response = app(state)
            .oneshot(get_with_cookies("/account/page", "Test.Identity.Application=bogus"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let cookies = set_cookies(&response);
        assert_eq!(cookies.len(), 1);
        assert!(cookies[0].contains("Max-Age=0"));
    }

    #[tokio::test]
    async fn test_ticket_renewed_after_half_ttl() {
        let (state, cache) = state();
        let (id, mut ticket) = signed_in(&state, &cache).await;
        ticket.expires_at = chrono::Utc::now() + chrono::Duration::seconds(10);
        state.tickets.save(&ticket).await.unwrap();
        let cookies = format!("Test.Session={}; Test.Identity.Application={}", id, ticket.id);

        let response = app(state.clone())
            .oneshot(get_with_cookies("/api/resource", &cookies))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let cookies = set_cookies(&response);
        assert!(cookies
            .iter()
            .any(|c| c.starts_with(&format!("Test.Identity.Application={};", ticket.id))));
        let renewed = state.tickets.load(&ticket.id).await.unwrap().unwrap();
        assert!(renewed.expires_at > ticket.expires_at);
    }

    #[tokio::test]
    async fn test_require_authentication() {
        let (state, _) = state();
        let app = Router::new()
            .route("/api/private", get(|| async { "secret" }))
            .route("/account/private", get(|| async { "secret" }))
            .route_layer(from_fn_with_state(state.clone(), require_authentication))
            .layer(from_fn_with_state(state.clone(), authenticate))
            .with_state(state);

        let api = app
            .clone()
            .oneshot(axum::http::Request::builder().uri("/api/private").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(api.status(), StatusCode::UNAUTHORIZED);

        let browser = app
            .oneshot(axum::http::Request::builder().uri("/account/private").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(browser.status(), StatusCode::FOUND);
        assert_eq!(
            browser.headers()[header::LOCATION],
            "/account/login?ReturnUrl=%2Faccount%2Fprivate"
        );
    }
}
