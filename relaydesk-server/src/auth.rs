//! Web session authentication.
//!
//! - Every browser gets a random session key in a private cookie
//!   ([`browser_session`]). OIDC tokens are stored per (user, browser key).
//! - `/auth/login` → provider → `/auth/callback` signs the user in and sets
//!   the private user cookie.
//! - [`require_login`] guards the dashboard: it resolves the user, refreshes
//!   an expired token, and otherwise sends the browser to `/auth/login`
//!   remembering where it was going.

use std::time::Instant;

use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Json, Router};
use axum_extra::extract::PrivateCookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use serde::Deserialize;

use crate::db::UserRow;
use crate::oidc::{OidcError, PROVIDER, TokenSet, decode_id_token_claims, generate_random_string, urlencod};
use crate::state::{AppState, OAUTH_PENDING_TTL, OAuthPending};

pub const BROWSER_COOKIE: &str = "relaydesk_browser";
pub const USER_COOKIE: &str = "relaydesk_user";

/// Browser session key for the current request.
#[derive(Debug, Clone)]
pub struct BrowserSession(pub String);

/// The signed-in dashboard user.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: UserRow,
    pub browser_key: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/auth/login", get(auth_login))
        .route("/auth/callback", get(auth_callback))
        .route("/auth/logout", get(auth_logout))
        .route("/auth/error", get(auth_error))
}

// ── Origin and cookies ─────────────────────────────────────────────────

/// External origin (`scheme://host`): the configured public URL, else the
/// forwarded headers set by the proxy, else `Host`.
pub fn public_origin(state: &AppState, headers: &HeaderMap) -> String {
    if let Some(url) = &state.config.public_url {
        return url.trim_end_matches('/').to_string();
    }
    derive_web_origin(headers)
}

fn derive_web_origin(headers: &HeaderMap) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let host = header("x-forwarded-host")
        .or_else(|| header("host"))
        .unwrap_or_else(|| "127.0.0.1:5000".to_string());
    let scheme = header("x-forwarded-proto").unwrap_or_else(|| {
        if host.starts_with("127.") || host.starts_with("localhost") || host.starts_with("192.168.") || host.starts_with("10.") {
            "http".to_string()
        } else {
            "https".to_string()
        }
    });
    format!("{scheme}://{host}")
}

fn private_cookie(name: &'static str, value: String, secure: bool) -> Cookie<'static> {
    Cookie::build((name, value))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(time::Duration::days(31))
        .build()
}

fn removal_cookie(name: &'static str) -> Cookie<'static> {
    Cookie::build((name, "")).path("/").build()
}

/// Accept only same-origin targets for post-login redirects.
pub fn safe_next(next: Option<&str>, origin: &str) -> String {
    match next {
        Some(n) if n.starts_with('/') && !n.starts_with("//") => n.to_string(),
        Some(n) if n == origin || n.starts_with(&format!("{origin}/")) => n.to_string(),
        _ => "/".to_string(),
    }
}

/// Where to send the user after signing in: the request itself for a
/// top-level navigation, else the page that issued it.
pub fn next_navigation_url(headers: &HeaderMap, request_url: &str) -> String {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let navigation =
        header("sec-fetch-mode") == Some("navigate") && header("sec-fetch-dest") == Some("document");
    if navigation {
        return request_url.to_string();
    }
    header("referer")
        .map(str::to_string)
        .unwrap_or_else(|| request_url.to_string())
}

// ── Middleware ─────────────────────────────────────────────────────────

/// Ensure the browser has a session key and expose it to handlers.
pub async fn browser_session(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    mut req: Request,
    next: Next,
) -> Response {
    let (jar, key) = match jar.get(BROWSER_COOKIE) {
        Some(c) => {
            let key = c.value().to_string();
            (jar, key)
        }
        None => {
            let key = generate_random_string(16);
            let secure = public_origin(&state, req.headers()).starts_with("https://");
            (jar.add(private_cookie(BROWSER_COOKIE, key.clone(), secure)), key)
        }
    };
    req.extensions_mut().insert(BrowserSession(key));
    let resp = next.run(req).await;
    (jar, resp).into_response()
}

enum AuthFailure {
    /// No usable sign-in; go through the provider again.
    SignIn,
    Upstream(String),
}

/// Guard for dashboard routes. API paths answer 401 instead of redirecting.
pub async fn require_login(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    mut req: Request,
    next: Next,
) -> Response {
    let browser_key = req
        .extensions()
        .get::<BrowserSession>()
        .map(|b| b.0.clone())
        .unwrap_or_default();
    let user_id = jar.get(USER_COOKIE).map(|c| c.value().to_string());

    match resolve_user(&state, user_id.as_deref(), &browser_key).await {
        Ok(user) => {
            req.extensions_mut().insert(AuthUser { user, browser_key });
            next.run(req).await
        }
        Err(AuthFailure::Upstream(msg)) => (StatusCode::BAD_GATEWAY, msg).into_response(),
        Err(AuthFailure::SignIn) => {
            if req.uri().path().starts_with("/api/") {
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(serde_json::json!({"error": "authentication required"})),
                )
                    .into_response();
            }
            let origin = public_origin(&state, req.headers());
            let path_and_query = req
                .uri()
                .path_and_query()
                .map(|p| p.as_str())
                .unwrap_or("/");
            let request_url = format!("{origin}{path_and_query}");
            let next_url = next_navigation_url(req.headers(), &request_url);
            Redirect::to(&format!("/auth/login?next={}", urlencod(&next_url))).into_response()
        }
    }
}

async fn resolve_user(
    state: &AppState,
    user_id: Option<&str>,
    browser_key: &str,
) -> Result<UserRow, AuthFailure> {
    let user_id = user_id.ok_or(AuthFailure::SignIn)?;
    let (user, token) = {
        let db = state.db.lock();
        let user = db.get_user(user_id).map_err(|e| {
            tracing::error!(error = %e, "user lookup failed");
            AuthFailure::Upstream("database error".into())
        })?;
        let token = db.get_token(user_id, browser_key, PROVIDER).map_err(|e| {
            tracing::error!(error = %e, "token lookup failed");
            AuthFailure::Upstream("database error".into())
        })?;
        (user, token)
    };
    let user = user.ok_or(AuthFailure::SignIn)?;
    let token: TokenSet = token
        .and_then(|t| serde_json::from_value(t).ok())
        .ok_or(AuthFailure::SignIn)?;

    if !token.is_expired(chrono::Utc::now().timestamp()) {
        return Ok(user);
    }
    let refresh_token = token.refresh_token.as_deref().ok_or(AuthFailure::SignIn)?;
    match state.oidc.refresh(refresh_token).await {
        Ok(fresh) => {
            let json = serde_json::to_value(&fresh).unwrap_or_default();
            if let Err(e) = state.db.lock().set_token(user_id, browser_key, PROVIDER, &json) {
                tracing::warn!(error = %e, "could not store refreshed token");
            }
            tracing::debug!(user = %user_id, "access token refreshed");
            Ok(user)
        }
        Err(OidcError::InvalidGrant(reason)) => {
            tracing::info!(user = %user_id, %reason, "refresh rejected; signing in again");
            Err(AuthFailure::SignIn)
        }
        Err(e) => {
            tracing::warn!(user = %user_id, error = %e, "token refresh failed");
            Err(AuthFailure::Upstream(format!("Could not refresh sign-in: {e}")))
        }
    }
}

// ── Routes ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct AuthLoginQuery {
    next: Option<String>,
}

async fn auth_login(
    headers: HeaderMap,
    Query(q): Query<AuthLoginQuery>,
    State(state): State<AppState>,
) -> Redirect {
    state.sweep_oauth_pending();
    let origin = public_origin(&state, &headers);
    let redirect_uri = format!("{origin}/auth/callback");
    let request = state.oidc.authorization_request(&redirect_uri);

    state.oauth_pending.lock().insert(
        request.state.clone(),
        OAuthPending {
            code_verifier: request.code_verifier,
            redirect_uri,
            next_url: q.next,
            created_at: Instant::now(),
        },
    );
    tracing::info!("OIDC login started, redirecting to provider");
    Redirect::temporary(&request.url)
}

#[derive(Deserialize)]
struct AuthCallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

async fn auth_callback(
    headers: HeaderMap,
    Query(q): Query<AuthCallbackQuery>,
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    axum::Extension(browser): axum::Extension<BrowserSession>,
) -> Result<(PrivateCookieJar, Redirect), (StatusCode, String)> {
    if let Some(error) = &q.error {
        let desc = q.error_description.as_deref().unwrap_or("unknown error");
        tracing::warn!(%error, description = %desc, "provider returned an error");
        return Ok((jar, Redirect::to("/auth/error")));
    }
    let code = q
        .code
        .as_deref()
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "Missing code".to_string()))?;
    let oauth_state = q
        .state
        .as_deref()
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "Missing state".to_string()))?;

    let pending = state
        .oauth_pending
        .lock()
        .remove(oauth_state)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "Unknown or expired login state".to_string()))?;
    if pending.created_at.elapsed() > OAUTH_PENDING_TTL {
        return Err((StatusCode::BAD_REQUEST, "Login attempt expired".to_string()));
    }

    let token = match state
        .oidc
        .exchange_code(code, &pending.redirect_uri, &pending.code_verifier)
        .await
    {
        Ok(token) => token,
        Err(e) => {
            tracing::warn!(error = %e, "code exchange failed");
            return Ok((jar, Redirect::to("/auth/error")));
        }
    };
    let claims = match token.id_token.as_deref().map(decode_id_token_claims) {
        Some(Ok(claims)) => claims,
        Some(Err(e)) => {
            tracing::warn!(error = %e, "unusable id token");
            return Ok((jar, Redirect::to("/auth/error")));
        }
        None => {
            tracing::warn!("token response without id_token");
            return Ok((jar, Redirect::to("/auth/error")));
        }
    };

    let user = UserRow {
        id: claims.sub,
        email: claims.email,
        first_name: claims.first_name,
        last_name: claims.last_name,
        profile_image_url: claims.profile_image_url,
        ..Default::default()
    };
    let token_json = serde_json::to_value(&token)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Token encoding failed: {e}")))?;
    let user = {
        let db = state.db.lock();
        let user = db
            .upsert_user(&user)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Could not save user: {e}")))?;
        db.set_token(&user.id, &browser.0, PROVIDER, &token_json)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Could not save token: {e}")))?;
        user
    };

    let origin = public_origin(&state, &headers);
    let secure = origin.starts_with("https://");
    tracing::info!(user = %user.id, "dashboard sign-in");
    let jar = jar.add(private_cookie(USER_COOKIE, user.id.clone(), secure));
    let next = safe_next(pending.next_url.as_deref(), &origin);
    Ok((jar, Redirect::to(&next)))
}

async fn auth_logout(
    headers: HeaderMap,
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    axum::Extension(browser): axum::Extension<BrowserSession>,
) -> (PrivateCookieJar, Redirect) {
    if let Some(user_id) = jar.get(USER_COOKIE).map(|c| c.value().to_string()) {
        if let Err(e) = state.db.lock().delete_token(&user_id, &browser.0, PROVIDER) {
            tracing::warn!(user = %user_id, error = %e, "could not delete token on logout");
        }
        tracing::info!(user = %user_id, "dashboard sign-out");
    }
    let jar = jar.remove(removal_cookie(USER_COOKIE));
    let origin = public_origin(&state, &headers);
    let url = state.oidc.end_session_url(&format!("{origin}/"));
    (jar, Redirect::to(&url))
}

async fn auth_error() -> (StatusCode, Html<&'static str>) {
    (
        StatusCode::FORBIDDEN,
        Html(
            "<!DOCTYPE html><html><head><title>Access denied</title></head>\
             <body><h1>403: Sign-in failed</h1>\
             <p>The identity provider did not complete the sign-in.</p>\
             <p><a href=\"/auth/login\">Try again</a></p></body></html>",
        ),
    )
}
