//! Framebuffer viewer HTTP subtree: the HTML shell, the supervisor status
//! API, and static asset serving for the bundled noVNC-style viewer
//! library. Everything here is reached only after machine-scoped
//! authorization.
//!
//! Static asset serving resolves the request path against the web root and
//! rejects anything that walks back out of it via `..`, then derives the
//! response content type from the file extension.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::browser::BrowserLauncher;
use crate::display::DisplaySupervisor;

const VIEWER_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>relaygate viewer</title></head>
<body>
<canvas id="screen"></canvas>
<script src="novnc/app.js"></script>
</body>
</html>
"#;

pub enum ViewerOutcome {
    NotHandled,
    Response(Response),
}

/// `rel`, relative to `{vnc}/`, with the leading `api/`/`novnc/` segment
/// still attached where relevant.
pub async fn handle(
    rel: &str,
    method: &axum::http::Method,
    uri: &Uri,
    web_root: Option<&PathBuf>,
    display_supervisor: Option<&Arc<DisplaySupervisor>>,
    browser_launcher: Option<&Arc<BrowserLauncher>>,
) -> ViewerOutcome {
    use axum::http::Method;

    if rel.is_empty() {
        return match *method {
            Method::GET => ViewerOutcome::Response(html_response()),
            _ => ViewerOutcome::Response(method_not_allowed()),
        };
    }

    if rel == "api/status" && *method == Method::GET {
        return ViewerOutcome::Response(status_response(browser_launcher).await);
    }

    if let Some(action) = rel.strip_prefix("api/") {
        if *method == Method::POST && matches!(action, "start" | "stop" | "restart") {
            return ViewerOutcome::Response(
                control_response(action, display_supervisor, browser_launcher).await,
            );
        }
    }

    if let Some(asset_rel) = rel.strip_prefix("novnc/") {
        if *method != Method::GET {
            return ViewerOutcome::Response(method_not_allowed());
        }
        let Some(root) = web_root else {
            return ViewerOutcome::Response(not_found());
        };
        return ViewerOutcome::Response(serve_asset(root, asset_rel, uri));
    }

    ViewerOutcome::NotHandled
}

/// `GET {vnc}` (no trailing slash) redirects to `{vnc}/`, preserving the
/// query string.
pub fn redirect_to_trailing_slash(viewer_base: &str, uri: &Uri) -> Response {
    let mut location = format!("{viewer_base}/");
    if let Some(q) = uri.query() {
        location.push('?');
        location.push_str(q);
    }
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, location)],
    )
        .into_response()
}

fn html_response() -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        VIEWER_HTML,
    )
        .into_response()
}

async fn status_response(browser_launcher: Option<&Arc<BrowserLauncher>>) -> Response {
    let status = match browser_launcher {
        Some(launcher) => launcher.status().await,
        None => crate::browser::BrowserStatus::default(),
    };
    axum::Json(json!({
        "running": status.running,
        "pid": status.pid,
        "cdpPort": status.cdp_port,
        "tabs": status.tabs,
        "stealth": status.stealth,
    }))
    .into_response()
}

async fn control_response(
    action: &str,
    display_supervisor: Option<&Arc<DisplaySupervisor>>,
    browser_launcher: Option<&Arc<BrowserLauncher>>,
) -> Response {
    let result: anyhow::Result<()> = async {
        match action {
            "start" => {
                if let Some(supervisor) = display_supervisor {
                    supervisor.start().await?;
                }
                if let Some(launcher) = browser_launcher {
                    launcher.start().await?;
                }
            }
            "stop" => {
                if let Some(launcher) = browser_launcher {
                    launcher.stop().await;
                }
                if let Some(supervisor) = display_supervisor {
                    supervisor.stop().await;
                }
            }
            "restart" => {
                if let Some(launcher) = browser_launcher {
                    launcher.stop().await;
                }
                if let Some(supervisor) = display_supervisor {
                    supervisor.restart().await?;
                }
                if let Some(launcher) = browser_launcher {
                    launcher.start().await?;
                }
            }
            _ => unreachable!("caller only dispatches start/stop/restart"),
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => axum::Json(json!({ "ok": true })).into_response(),
        Err(err) => {
            tracing::error!(%err, action, "viewer supervisor control action failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

fn serve_asset(web_root: &Path, rel: &str, uri: &Uri) -> Response {
    let Some(safe) = sanitize_asset_path(rel) else {
        return not_found();
    };

    let fs_path = web_root.join(&safe);
    let Ok(canonical_root) = std::fs::canonicalize(web_root) else {
        return not_found();
    };
    let Ok(canonical) = std::fs::canonicalize(&fs_path) else {
        return not_found();
    };
    if !canonical.starts_with(&canonical_root) {
        tracing::warn!(path = %uri, "rejected viewer asset path escaping bundled root");
        return not_found();
    }

    match std::fs::read(&canonical) {
        Ok(bytes) => {
            let content_type = detect_content_type(&canonical);
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, content_type),
                    (header::CACHE_CONTROL, "public, max-age=300"),
                ],
                bytes,
            )
                .into_response()
        }
        Err(_) => not_found(),
    }
}

/// `rel` is served iff it does not contain NUL, does not start with `../`
/// after normalization, is not `..`, and the resolved path stays under the
/// bundled root (the root check happens in the caller, which has the
/// actual filesystem root to canonicalize against).
fn sanitize_asset_path(rel: &str) -> Option<PathBuf> {
    if rel.contains('\0') {
        return None;
    }
    let mut safe = PathBuf::new();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(seg) => safe.push(seg),
            Component::ParentDir | Component::Prefix(_) | Component::RootDir => return None,
            Component::CurDir => {}
        }
    }
    if safe.as_os_str().is_empty() {
        return None;
    }
    Some(safe)
}

fn detect_content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()).unwrap_or("") {
        "js" => "application/javascript",
        "css" => "text/css; charset=utf-8",
        "json" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "ttf" => "font/ttf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}

fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "GET")],
        "method not allowed",
    )
        .into_response()
}
