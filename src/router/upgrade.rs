//! Upgrade dispatcher: demuxes `Upgrade: websocket` requests to the
//! framebuffer proxy, the canvas host, or the main WebSocket server, before
//! any of the ordinary HTTP handler chain runs.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::FromRequestParts;
use axum::http::{HeaderMap, Request};
use axum::response::{IntoResponse, Response};

use crate::auth::AuthResult;
use crate::error::AppError;
use crate::proxy;

use super::{credential_from_headers, AppState};

pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let has_upgrade = headers
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let has_connection_upgrade = headers
        .get(axum::http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    has_upgrade && has_connection_upgrade
}

/// Dispatches one upgrade request. Takes the full request (not just parts)
/// because `WebSocketUpgrade` is extracted from it directly; axum refuses
/// to actually switch protocols until `on_upgrade` is called, so declining
/// here (e.g. a failed canvas or main-server auth check) is just returning
/// a normal HTTP response — no raw-socket teardown is needed on this side
/// of the extractor.
pub async fn dispatch<B>(state: Arc<AppState>, remote: SocketAddr, req: Request<B>) -> Response
where
    B: Send + 'static,
{
    let (mut parts, _body) = req.into_parts();
    let path = parts.uri.path().to_string();

    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    if state.config.viewer_enabled && path == framebuffer_ws_path(&state.config.viewer_base) {
        let target = state
            .framebuffer_target
            .clone()
            .expect("framebuffer_target is set whenever viewer_enabled is true");
        return ws.on_upgrade(move |socket| async move {
            proxy::run_session(socket, target, remote).await;
        });
    }

    if state.config.canvas_enabled && path == state.config.canvas_ws_path {
        let credential = credential_from_headers(&parts.headers);
        match state
            .authorizer
            .authorize_machine_scoped(&parts.headers, remote.ip(), &credential)
            .await
        {
            AuthResult::Ok => {
                let entry = register_sibling(&state, &parts.headers, remote);
                let state_for_canvas = state.clone();
                return ws.on_upgrade(move |socket| async move {
                    let _entry = entry;
                    state_for_canvas
                        .external
                        .canvas_host
                        .handle_socket(socket, remote)
                        .await;
                });
            }
            AuthResult::Unauthorized => return AppError::Unauthorized.into_response(),
            AuthResult::RateLimited { retry_after_ms } => {
                return AppError::RateLimited { retry_after_ms }.into_response()
            }
        }
    }

    // Everything else reaches the main application WebSocket server; from
    // the core's perspective any connection handed off here is a
    // long-lived authenticated sibling, so it joins the registry for the
    // lifetime of the handoff future, same as the canvas path above.
    let credential = credential_from_headers(&parts.headers);
    match state
        .authorizer
        .authorize(&parts.headers, remote.ip(), &credential)
        .await
    {
        AuthResult::Ok => {
            let entry = register_sibling(&state, &parts.headers, remote);
            ws.on_upgrade(move |socket| async move {
                let _entry = entry;
                state.external.main_ws_server.handle_socket(socket, remote).await;
            })
        }
        AuthResult::Unauthorized => AppError::Unauthorized.into_response(),
        AuthResult::RateLimited { retry_after_ms } => {
            AppError::RateLimited { retry_after_ms }.into_response()
        }
    }
}

/// Inserts a registry entry for the resolved client IP, returning the RAII
/// handle that releases it when the connection's handling future finishes
/// (whether by clean close or error) — this is the "close handler removes"
/// half of the registry's invariant, expressed as a drop guard rather than
/// an explicit close callback since the connection handler is opaque here.
fn register_sibling(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    remote: SocketAddr,
) -> crate::registry::RegistryEntry {
    let ip = crate::net::resolve_client_ip(remote.ip(), headers, &state.config.trusted_proxies);
    state.registry.register(ip)
}

fn framebuffer_ws_path(viewer_base: &str) -> String {
    format!("{viewer_base}/ws")
}
