//! Leaf handlers that are external collaborators in the real system (tool
//! invocation, Slack, plugin channels, protocol translation, canvas host,
//! control UI, avatar resolution) but must be invoked by the router with a
//! uniform "returns handled?" contract. This module is the boundary the
//! router calls through and the no-op defaults a gateway without any of
//! them configured falls back to.
//!
//! Each handler is a boxed future behind a plain trait object rather than
//! `async-trait`, the same shape used for the wake/dispatch traits
//! elsewhere in this crate.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::ws::WebSocket;
use axum::http::Request;

use crate::hooks::BoxFuture;

/// Outcome of offering a request to an external HTTP-shaped leaf handler.
/// `NotHandled` hands the request back unconsumed so the router can try the
/// next handler in the chain.
pub enum ExternalOutcome {
    Handled(axum::response::Response),
    NotHandled(Request<Body>),
}

/// An HTTP-shaped external leaf handler: tool invocation, Slack, plugin
/// channels, OpenAI/Responses-style protocol translation, control UI,
/// avatar resolution all implement this the same way.
pub trait ExternalHandler: Send + Sync {
    fn try_handle<'a>(&'a self, req: Request<Body>) -> BoxFuture<'a, ExternalOutcome>;
}

/// The default for any external handler slot the operator hasn't wired up:
/// always declines immediately, handing the request back untouched.
pub struct NoopExternalHandler;

impl ExternalHandler for NoopExternalHandler {
    fn try_handle<'a>(&'a self, req: Request<Body>) -> BoxFuture<'a, ExternalOutcome> {
        Box::pin(async move { ExternalOutcome::NotHandled(req) })
    }
}

/// The canvas/UI host handler: protocol-opaque to the core past the
/// machine-scoped auth gate.
pub trait CanvasHost: Send + Sync {
    fn handle_socket<'a>(&'a self, socket: WebSocket, remote: SocketAddr) -> BoxFuture<'a, ()>;
}

pub struct NoopCanvasHost;

impl CanvasHost for NoopCanvasHost {
    fn handle_socket<'a>(&'a self, socket: WebSocket, _remote: SocketAddr) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let _ = socket.close().await;
        })
    }
}

/// Everything that isn't the framebuffer or canvas path lands here: the
/// main application WebSocket server.
pub trait MainWebSocketServer: Send + Sync {
    fn handle_socket<'a>(&'a self, socket: WebSocket, remote: SocketAddr) -> BoxFuture<'a, ()>;
}

pub struct NoopMainWebSocketServer;

impl MainWebSocketServer for NoopMainWebSocketServer {
    fn handle_socket<'a>(&'a self, socket: WebSocket, _remote: SocketAddr) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let _ = socket.close().await;
        })
    }
}

/// All the optional, externally-provided leaf handlers in router order. A
/// gateway that only wants hooks + framebuffer viewer leaves every field at
/// its `Noop*` default.
pub struct ExternalHandlers {
    pub tool_invocation: Box<dyn ExternalHandler>,
    pub slack: Box<dyn ExternalHandler>,
    pub plugin: Box<dyn ExternalHandler>,
    pub openai_compat: Box<dyn ExternalHandler>,
    pub responses_compat: Box<dyn ExternalHandler>,
    pub canvas_http: Box<dyn ExternalHandler>,
    pub control_ui: Box<dyn ExternalHandler>,
    pub avatar: Box<dyn ExternalHandler>,
    pub canvas_host: Box<dyn CanvasHost>,
    pub main_ws_server: Box<dyn MainWebSocketServer>,
}

impl Default for ExternalHandlers {
    fn default() -> Self {
        Self {
            tool_invocation: Box::new(NoopExternalHandler),
            slack: Box::new(NoopExternalHandler),
            plugin: Box::new(NoopExternalHandler),
            openai_compat: Box::new(NoopExternalHandler),
            responses_compat: Box::new(NoopExternalHandler),
            canvas_http: Box::new(NoopExternalHandler),
            control_ui: Box::new(NoopExternalHandler),
            avatar: Box::new(NoopExternalHandler),
            canvas_host: Box::new(NoopCanvasHost),
            main_ws_server: Box::new(NoopMainWebSocketServer),
        }
    }
}
