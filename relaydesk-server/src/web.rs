//! HTTP surface: dashboard pages, bot login flow, JSON API.
//!
//! Every bot-login call is a blocking bridge call into the bot loop, so it is
//! run through `spawn_blocking` and bounded by the orchestrator's timeouts.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Extension, Form, Json, Router};
use axum_extra::extract::PrivateCookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use relaydesk_bot::{LoginError, LoginOutcome};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::auth::{self, AuthUser};
use crate::oidc::urlencod;
use crate::state::AppState;

const FLASH_COOKIE: &str = "relaydesk_flash";

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/", get(index))
        .route("/bot/login", get(bot_login_form).post(bot_login_submit))
        .route("/bot/verify", get(bot_verify_form).post(bot_verify_submit))
        .route("/api/bot/status", get(api_bot_status))
        .route("/api/bot/login", post(api_bot_login))
        .route("/api/bot/verify", post(api_bot_verify))
        .route_layer(from_fn_with_state(state.clone(), auth::require_login));

    Router::new()
        .route("/health", get(health))
        .merge(auth::routes())
        .merge(protected)
        .layer(from_fn_with_state(state.clone(), auth::browser_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        // Outermost so every response gets them.
        .layer(from_fn(security_headers))
}

async fn security_headers(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    use axum::http::HeaderValue;
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert(
        "Referrer-Policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    if !headers.contains_key("content-security-policy") {
        headers.insert(
            "Content-Security-Policy",
            HeaderValue::from_static(
                "default-src 'self'; style-src 'self' 'unsafe-inline'; img-src 'self' https: data:; frame-ancestors 'none'; base-uri 'self'; form-action 'self'",
            ),
        );
    }
    resp
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

// ── Flash messages ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlashKind {
    Success,
    Info,
    Error,
}

impl FlashKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Info => "info",
            Self::Error => "error",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "info" => Self::Info,
            _ => Self::Error,
        }
    }
}

fn set_flash(jar: PrivateCookieJar, kind: FlashKind, message: &str) -> PrivateCookieJar {
    let cookie = Cookie::build((FLASH_COOKIE, format!("{}|{message}", kind.as_str())))
        .http_only(true)
        .same_site(SameSite::Lax)
        .path("/")
        .build();
    jar.add(cookie)
}

fn take_flash(jar: PrivateCookieJar) -> (PrivateCookieJar, Option<(FlashKind, String)>) {
    let Some(cookie) = jar.get(FLASH_COOKIE) else {
        return (jar, None);
    };
    let flash = cookie
        .value()
        .split_once('|')
        .map(|(kind, msg)| (FlashKind::parse(kind), msg.to_string()));
    let jar = jar.remove(Cookie::build((FLASH_COOKIE, "")).path("/").build());
    (jar, flash)
}

fn redirect_with(
    jar: PrivateCookieJar,
    kind: FlashKind,
    message: &str,
    to: &str,
) -> (PrivateCookieJar, Redirect) {
    (set_flash(jar, kind, message), Redirect::to(to))
}

// ── Rendering ──────────────────────────────────────────────────────────

pub fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

fn page(title: &str, user: &AuthUser, flash: Option<(FlashKind, String)>, body: &str) -> Html<String> {
    let flash_html = flash
        .map(|(kind, msg)| {
            format!(
                r#"<div class="flash flash-{}">{}</div>"#,
                kind.as_str(),
                html_escape(&msg)
            )
        })
        .unwrap_or_default();
    Html(format!(
        r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>{title} · relaydesk</title>
<style>body{{font-family:sans-serif;max-width:46rem;margin:2rem auto}}.flash{{padding:.5rem;margin:1rem 0}}.flash-error{{background:#fdd}}.flash-success{{background:#dfd}}.flash-info{{background:#def}}pre{{background:#f4f4f4;padding:.5rem;overflow-x:auto}}</style>
</head><body>
<nav><a href="/">Dashboard</a> · <a href="/bot/login">Bot login</a> · {name} · <a href="/auth/logout">Sign out</a></nav>
{flash_html}
<h1>{title}</h1>
{body}
</body></html>"#,
        title = html_escape(title),
        name = html_escape(&user.user.display_name()),
    ))
}

// ── Dashboard ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct BotStatus {
    connected: bool,
    identity: String,
    pending_logins: usize,
    scheduler_ticks: Option<u64>,
    events_loaded: usize,
}

fn bot_status(state: &AppState) -> BotStatus {
    let client = state.orchestrator.get_authenticated_client();
    BotStatus {
        connected: state.orchestrator.is_connected(),
        identity: state.orchestrator.current_identity(),
        pending_logins: state.orchestrator.pending_sessions(),
        scheduler_ticks: client.and_then(|c| c.scheduler_ticks()),
        events_loaded: state.events.len(),
    }
}

async fn index(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    jar: PrivateCookieJar,
) -> (PrivateCookieJar, Html<String>) {
    let (jar, flash) = take_flash(jar);
    let status = bot_status(&state);
    let bot = if status.identity.is_empty() {
        if status.connected {
            "Connected (no username)".to_string()
        } else {
            "Not connected".to_string()
        }
    } else {
        format!("@{}", status.identity)
    };
    let log = state
        .orchestrator
        .event_log()
        .recent(20)
        .iter()
        .map(|l| html_escape(l))
        .collect::<Vec<_>>()
        .join("\n");
    let body = format!(
        r#"<ul>
<li>Platform connected: <strong>{connected}</strong></li>
<li>Bot: <strong>{bot}</strong></li>
<li>Logins in progress: {pending}</li>
<li>Events loaded: {events}</li>
</ul>
<h2>Recent activity</h2>
<pre>{log}</pre>"#,
        connected = if status.connected { "yes" } else { "no" },
        bot = html_escape(&bot),
        pending = status.pending_logins,
        events = status.events_loaded,
    );
    (jar, page("Dashboard", &user, flash, &body))
}

// ── Bot login (forms) ──────────────────────────────────────────────────

async fn bot_login_form(
    Extension(user): Extension<AuthUser>,
    jar: PrivateCookieJar,
) -> (PrivateCookieJar, Html<String>) {
    let (jar, flash) = take_flash(jar);
    let body = r#"<form method="post" action="/bot/login">
<label>Phone number <input name="phone" type="tel" placeholder="+8801000000" required></label>
<button type="submit">Send code</button>
</form>"#;
    (jar, page("Bot login", &user, flash, body))
}

#[derive(Deserialize)]
struct LoginForm {
    #[serde(default)]
    phone: String,
}

async fn run_start_login(state: &AppState, phone: String) -> Result<String, LoginError> {
    let orchestrator = state.orchestrator.clone();
    tokio::task::spawn_blocking(move || orchestrator.start_login(&phone))
        .await
        .unwrap_or_else(|e| Err(LoginError::Bridge(format!("login task failed: {e}"))))
}

async fn run_verify_code(
    state: &AppState,
    session_id: String,
    code: String,
    password: Option<String>,
) -> Result<LoginOutcome, LoginError> {
    let orchestrator = state.orchestrator.clone();
    tokio::task::spawn_blocking(move || {
        orchestrator.verify_code(&session_id, &code, password.as_deref())
    })
    .await
    .unwrap_or_else(|e| Err(LoginError::Bridge(format!("verify task failed: {e}"))))
}

async fn bot_login_submit(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    jar: PrivateCookieJar,
    Form(form): Form<LoginForm>,
) -> (PrivateCookieJar, Redirect) {
    let phone = form.phone.trim().to_string();
    if phone.is_empty() {
        return redirect_with(jar, FlashKind::Error, "Phone number is required.", "/bot/login");
    }
    tracing::info!(user = %user.user.id, "bot login requested from dashboard");
    match run_start_login(&state, phone).await {
        Ok(session_id) => redirect_with(
            jar,
            FlashKind::Success,
            "Code sent to phone. Enter it on the next screen.",
            &format!("/bot/verify?session_id={}", urlencod(&session_id)),
        ),
        Err(e) => redirect_with(
            jar,
            FlashKind::Error,
            &format!("Failed to start bot login: {e}"),
            "/bot/login",
        ),
    }
}

#[derive(Deserialize)]
struct VerifyQuery {
    session_id: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

async fn bot_verify_form(
    Query(q): Query<VerifyQuery>,
    Extension(user): Extension<AuthUser>,
    jar: PrivateCookieJar,
) -> Response {
    let Some(session_id) = q.session_id.filter(|s| !s.is_empty()) else {
        return redirect_with(
            jar,
            FlashKind::Error,
            "Missing login session. Start login first.",
            "/bot/login",
        )
        .into_response();
    };
    let (jar, flash) = take_flash(jar);
    let password_hint = if q.password.as_deref() == Some("1") {
        "<p>This account has two-factor authentication enabled. Enter its password.</p>"
    } else {
        ""
    };
    let body = format!(
        r#"{password_hint}<form method="post" action="/bot/verify">
<input type="hidden" name="session_id" value="{sid}">
<label>Code <input name="code" inputmode="numeric" autocomplete="one-time-code"></label>
<label>Two-factor password (if enabled) <input name="password" type="password" autocomplete="current-password"></label>
<button type="submit">Verify</button>
</form>"#,
        sid = html_escape(&session_id),
    );
    (jar, page("Verify bot login", &user, flash, &body)).into_response()
}

#[derive(Deserialize)]
struct VerifyForm {
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    password: String,
}

async fn bot_verify_submit(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    Form(form): Form<VerifyForm>,
) -> (PrivateCookieJar, Redirect) {
    let session_id = form.session_id.trim().to_string();
    if session_id.is_empty() {
        return redirect_with(
            jar,
            FlashKind::Error,
            "Missing login session. Start login first.",
            "/bot/login",
        );
    }
    let verify_url = format!("/bot/verify?session_id={}", urlencod(&session_id));
    let code = form.code.trim().to_string();
    let password = Some(form.password.trim().to_string()).filter(|p| !p.is_empty());
    if code.is_empty() && password.is_none() {
        return redirect_with(
            jar,
            FlashKind::Error,
            "Please provide the verification code.",
            &verify_url,
        );
    }

    match run_verify_code(&state, session_id, code, password).await {
        Ok(LoginOutcome::Authorized { identity }) => {
            let msg = if identity.is_empty() {
                "Bot login successful. Bot connected.".to_string()
            } else {
                format!("Bot login successful. Connected as @{identity}.")
            };
            redirect_with(jar, FlashKind::Success, &msg, "/")
        }
        Ok(LoginOutcome::PasswordRequired) => redirect_with(
            jar,
            FlashKind::Info,
            "Code accepted. Enter the two-factor password to finish.",
            &format!("{verify_url}&password=1"),
        ),
        Err(e @ LoginError::InvalidCredentials) => redirect_with(
            jar,
            FlashKind::Error,
            &format!("Verification failed: {e}"),
            &format!("{verify_url}&password=1"),
        ),
        Err(e) if e.retains_session() => redirect_with(
            jar,
            FlashKind::Error,
            &format!("Verification failed: {e}"),
            &verify_url,
        ),
        Err(e) => redirect_with(
            jar,
            FlashKind::Error,
            &format!("Verification failed: {e}"),
            "/bot/login",
        ),
    }
}

// ── JSON API ───────────────────────────────────────────────────────────

fn api_error(e: &LoginError) -> Response {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(serde_json::json!({
            "error": e.to_string(),
            "session_retained": e.retains_session(),
        })),
    )
        .into_response()
}

async fn api_bot_status(State(state): State<AppState>) -> Json<BotStatus> {
    Json(bot_status(&state))
}

#[derive(Deserialize)]
struct ApiLoginRequest {
    phone: String,
}

async fn api_bot_login(
    State(state): State<AppState>,
    Json(req): Json<ApiLoginRequest>,
) -> Response {
    let phone = req.phone.trim().to_string();
    if phone.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "phone number is required"})),
        )
            .into_response();
    }
    match run_start_login(&state, phone).await {
        Ok(session_id) => Json(serde_json::json!({"session_id": session_id})).into_response(),
        Err(e) => api_error(&e),
    }
}

#[derive(Deserialize)]
struct ApiVerifyRequest {
    session_id: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    password: Option<String>,
}

async fn api_bot_verify(
    State(state): State<AppState>,
    Json(req): Json<ApiVerifyRequest>,
) -> Response {
    match run_verify_code(&state, req.session_id, req.code, req.password).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => api_error(&e),
    }
}
