//! HTTP router and upgrade demux: the single ordered pipeline every request
//! outside an upgrade runs through, short-circuiting on the first handler
//! that reports *handled*. Served through `axum` as one explicit ordered
//! function returning an explicit `handled | not_handled | error` sum at
//! each step, rather than a `tower::Layer` stack.

pub mod external;
pub mod upgrade;
pub mod viewer;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, Request};
use axum::response::{IntoResponse, Response};

use crate::auth::{AuthResult, Authorizer, Credential};
use crate::browser::BrowserLauncher;
use crate::config::Config;
use crate::display::DisplaySupervisor;
use crate::error::AppError;
use crate::hooks::{HookOutcome, HooksState};
use crate::proxy::FramebufferTarget;
use crate::registry::ClientRegistry;

use external::{ExternalHandlers, ExternalOutcome};
use viewer::ViewerOutcome;

/// Everything the router needs to serve one request. Constructed once at
/// startup and shared via `axum`'s `State` extractor.
pub struct AppState {
    pub config: Arc<Config>,
    pub authorizer: Arc<Authorizer>,
    pub registry: Arc<ClientRegistry>,
    pub hooks: Option<Arc<HooksState>>,
    pub framebuffer_target: Option<Arc<FramebufferTarget>>,
    pub display_supervisor: Option<Arc<DisplaySupervisor>>,
    pub browser_launcher: Option<Arc<BrowserLauncher>>,
    pub external: ExternalHandlers,
}

/// Assembles the single fallback-routed `axum::Router`. Every path and
/// method is handled by `handle_request`'s explicit ordered chain rather
/// than per-route registration.
pub fn build_router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .fallback(handle_request)
        .with_state(state)
}

async fn handle_request(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    // Step 1: upgrade requests bypass the rest of the HTTP chain entirely.
    if upgrade::is_upgrade_request(req.headers()) {
        return upgrade::dispatch(state, remote, req).await;
    }

    let method = req.method().clone();
    let uri = req.uri().clone();
    let path = uri.path().to_string();

    // Step 2: hooks. Short-circuits before any other auth so a valid hook
    // call never trips the gateway's general-purpose 401s.
    if let Some(hooks_base) = state.config.hooks.as_ref().map(|h| h.base_path.clone()) {
        if path.starts_with(&hooks_base) {
            if let Some(hooks) = &state.hooks {
                let client_key = client_key(&state, remote, req.headers());
                let (parts, body) = req.into_parts();
                return match hooks
                    .handle(parts.method, &parts.uri, &parts.headers, body, &client_key)
                    .await
                {
                    HookOutcome::Response(resp) => resp,
                    // The prefix check above and the one inside `handle`
                    // agree by construction; this arm exists only so the
                    // match is total.
                    HookOutcome::NotHandled => AppError::NotFound.into_response(),
                };
            }
        }
    }

    // Steps 3-4: tool invocation, then Slack — both external, optional.
    let req = match state.external.tool_invocation.try_handle(req).await {
        ExternalOutcome::Handled(resp) => return resp,
        ExternalOutcome::NotHandled(req) => req,
    };
    let req = match state.external.slack.try_handle(req).await {
        ExternalOutcome::Handled(resp) => return resp,
        ExternalOutcome::NotHandled(req) => req,
    };

    // Step 5: plugin-provided channels, full-authorizer-gated by prefix
    // before the plugin handler ever sees the request.
    if path.starts_with(&state.config.channels_prefix) {
        if let Some(resp) = authorize_full(&state, remote, req.headers()).await {
            return resp;
        }
    }
    let req = match state.external.plugin.try_handle(req).await {
        ExternalOutcome::Handled(resp) => return resp,
        ExternalOutcome::NotHandled(req) => req,
    };

    // Step 6: optional protocol-translating endpoints.
    let req = if state.config.openai_compat_enabled {
        match state.external.openai_compat.try_handle(req).await {
            ExternalOutcome::Handled(resp) => return resp,
            ExternalOutcome::NotHandled(req) => req,
        }
    } else {
        req
    };
    let req = if state.config.responses_compat_enabled {
        match state.external.responses_compat.try_handle(req).await {
            ExternalOutcome::Handled(resp) => return resp,
            ExternalOutcome::NotHandled(req) => req,
        }
    } else {
        req
    };

    // Step 7: the framebuffer viewer subtree, fully machine-scope-gated.
    if state.config.viewer_enabled {
        let viewer_base = state.config.viewer_base.as_str();
        if let Some(after) = path.strip_prefix(viewer_base) {
            if after.is_empty() {
                if method == Method::GET {
                    return viewer::redirect_to_trailing_slash(viewer_base, &uri);
                }
            } else if let Some(rel) = after.strip_prefix('/') {
                if let Some(resp) = authorize_machine_scoped(&state, remote, req.headers()).await
                {
                    return resp;
                }
                match viewer::handle(
                    rel,
                    &method,
                    &uri,
                    state.config.viewer_web_root.as_ref(),
                    state.display_supervisor.as_ref(),
                    state.browser_launcher.as_ref(),
                )
                .await
                {
                    ViewerOutcome::Response(resp) => return resp,
                    ViewerOutcome::NotHandled => {}
                }
            }
        }
    }

    // Step 8: canvas host, machine-scope-gated when the path is in its
    // subtree. Only the HTTP surface reaches this point — the WS upgrade
    // path is demuxed earlier in `upgrade::dispatch`.
    let req = if state.config.canvas_enabled && path.starts_with(&state.config.canvas_base) {
        if let Some(resp) = authorize_machine_scoped(&state, remote, req.headers()).await {
            return resp;
        }
        match state.external.canvas_http.try_handle(req).await {
            ExternalOutcome::Handled(resp) => return resp,
            ExternalOutcome::NotHandled(req) => req,
        }
    } else {
        req
    };

    // Step 9: control UI and avatar handlers, both external and optional.
    let req = match state.external.control_ui.try_handle(req).await {
        ExternalOutcome::Handled(resp) => return resp,
        ExternalOutcome::NotHandled(req) => req,
    };
    let _req = match state.external.avatar.try_handle(req).await {
        ExternalOutcome::Handled(resp) => return resp,
        ExternalOutcome::NotHandled(req) => req,
    };

    // Step 10: fallback.
    AppError::NotFound.into_response()
}

async fn authorize_full(state: &AppState, remote: SocketAddr, headers: &HeaderMap) -> Option<Response> {
    let credential = credential_from_headers(headers);
    match state.authorizer.authorize(headers, remote.ip(), &credential).await {
        AuthResult::Ok => None,
        AuthResult::Unauthorized => Some(AppError::Unauthorized.into_response()),
        AuthResult::RateLimited { retry_after_ms } => {
            Some(AppError::RateLimited { retry_after_ms }.into_response())
        }
    }
}

async fn authorize_machine_scoped(
    state: &AppState,
    remote: SocketAddr,
    headers: &HeaderMap,
) -> Option<Response> {
    let credential = credential_from_headers(headers);
    match state
        .authorizer
        .authorize_machine_scoped(headers, remote.ip(), &credential)
        .await
    {
        AuthResult::Ok => None,
        AuthResult::Unauthorized => Some(AppError::Unauthorized.into_response()),
        AuthResult::RateLimited { retry_after_ms } => {
            Some(AppError::RateLimited { retry_after_ms }.into_response())
        }
    }
}

fn client_key(state: &AppState, remote: SocketAddr, headers: &HeaderMap) -> String {
    crate::net::resolve_client_ip(remote.ip(), headers, &state.config.trusted_proxies).to_string()
}

/// Extracts the general-purpose credential from a request: the bearer
/// token from `Authorization`, and a password from a `X-Gateway-Password`
/// header (the spec names a token/password pair but leaves the password
/// transport unspecified for non-hook endpoints; recorded as an open
/// decision in DESIGN.md).
pub fn credential_from_headers(headers: &HeaderMap) -> Credential {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::to_string);
    let password = headers
        .get("x-gateway-password")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    Credential { token, password }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                v.parse().unwrap(),
            );
        }
        h
    }

    #[test]
    fn credential_extracts_bearer_token_and_password_header() {
        let h = headers(&[
            ("authorization", "Bearer abc123"),
            ("x-gateway-password", "hunter2"),
        ]);
        let cred = credential_from_headers(&h);
        assert_eq!(cred.token.as_deref(), Some("abc123"));
        assert_eq!(cred.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn credential_is_empty_with_no_relevant_headers() {
        let cred = credential_from_headers(&HeaderMap::new());
        assert!(cred.token.is_none());
        assert!(cred.password.is_none());
    }
}
