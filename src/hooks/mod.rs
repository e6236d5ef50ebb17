//! Webhook ingress pipeline. Runs before any other authorization-bearing
//! handler in the router so a valid hook call never trips the gateway's
//! general-purpose 401s.

pub mod mapping;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use crate::body::read_json_body;
use crate::config::HooksConfig;
use crate::crypto::constant_time_eq;
use crate::error::AppError;
use crate::ratelimit::{AuthRateLimiter, RateLimitOutcome};

use mapping::{Action, MappingInput, MappingOutcome, MappingRule};

const HOOK_BODY_READ_TIMEOUT: Duration = Duration::from_secs(5);
const HOOK_TOKEN_HEADER: &str = "x-hook-token";

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeMode {
    Now,
    NextHeartbeat,
}

#[derive(Debug, Clone)]
pub struct WakeRequest {
    pub text: String,
    pub mode: WakeMode,
}

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub message: String,
    pub name: String,
    pub agent_id: Option<String>,
    pub wake_mode: WakeMode,
    pub session_key: Option<String>,
    pub deliver: bool,
    pub channel: Option<String>,
    pub to: Option<String>,
    pub model: Option<String>,
    pub thinking: Option<bool>,
    pub timeout_seconds: Option<u64>,
    pub allow_unsafe_external_content: bool,
}

/// Downstream collaborator that actually wakes a session. External to the
/// core; the gateway only normalizes and dispatches.
pub trait WakeSink: Send + Sync {
    fn wake(&self, req: WakeRequest) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Downstream collaborator that runs an agent turn and hands back a run id.
pub trait AgentDispatch: Send + Sync {
    fn dispatch(&self, req: AgentRequest) -> BoxFuture<'_, anyhow::Result<String>>;
}

pub enum HookOutcome {
    NotHandled,
    Response(Response),
}

pub struct HooksState {
    config: HooksConfig,
    failure_limiter: Arc<AuthRateLimiter>,
    mapping_rules: Vec<Box<dyn MappingRule>>,
    wake_sink: Arc<dyn WakeSink>,
    agent_dispatch: Arc<dyn AgentDispatch>,
}

impl HooksState {
    pub fn new(
        config: HooksConfig,
        failure_limiter: Arc<AuthRateLimiter>,
        mapping_rules: Vec<Box<dyn MappingRule>>,
        wake_sink: Arc<dyn WakeSink>,
        agent_dispatch: Arc<dyn AgentDispatch>,
    ) -> Self {
        Self {
            config,
            failure_limiter,
            mapping_rules,
            wake_sink,
            agent_dispatch,
        }
    }

    pub async fn handle(
        &self,
        method: Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Body,
        client_key: &str,
    ) -> HookOutcome {
        let path = uri.path();
        if !path.starts_with(self.config.base_path.as_str()) {
            return HookOutcome::NotHandled;
        }

        if uri
            .query()
            .map(|q| q.split('&').any(|pair| pair.split('=').next() == Some("token")))
            .unwrap_or(false)
        {
            return respond(AppError::BadRequest(
                "hook tokens must travel in `Authorization: Bearer <token>` or the \
                 `X-Hook-Token` header, not the query string"
                    .to_string(),
            ));
        }

        match extract_token(headers) {
            Some(token) if constant_time_eq(token.as_bytes(), self.config.secret.as_bytes()) => {
                self.failure_limiter.clear(client_key).await;
            }
            _ => {
                return match self
                    .failure_limiter
                    .record_failure(client_key, Instant::now())
                    .await
                {
                    RateLimitOutcome::Throttled { retry_after_ms } => {
                        respond(AppError::RateLimited { retry_after_ms })
                    }
                    RateLimitOutcome::Ok => respond(AppError::Unauthorized),
                };
            }
        }

        if method != Method::POST {
            return respond(AppError::MethodNotAllowed);
        }

        let sub_path = path[self.config.base_path.len()..].trim_start_matches('/');
        if sub_path.is_empty() {
            return respond(AppError::NotFound);
        }

        let payload: serde_json::Value =
            match read_json_body(body, self.config.max_body_bytes, HOOK_BODY_READ_TIMEOUT).await {
                Ok(v) => v,
                Err(err) => return respond(err),
            };

        match sub_path {
            "wake" => self.handle_wake(&payload).await,
            "agent" => self.handle_agent(&payload).await,
            other => self.handle_mapping(other, &payload, headers, uri).await,
        }
    }

    async fn handle_wake(&self, payload: &serde_json::Value) -> HookOutcome {
        let req = match normalize_wake(payload) {
            Ok(req) => req,
            Err(err) => return respond(err),
        };
        let mode = req.mode;
        if let Err(err) = self.wake_sink.wake(req).await {
            tracing::error!(%err, "wake dispatch failed");
            return respond(AppError::Internal(err));
        }
        let mode_str = match mode {
            WakeMode::Now => "now",
            WakeMode::NextHeartbeat => "next-heartbeat",
        };
        json_ok(StatusCode::OK, json!({ "ok": true, "mode": mode_str }))
    }

    async fn handle_agent(&self, payload: &serde_json::Value) -> HookOutcome {
        let req = match self.normalize_agent(payload) {
            Ok(req) => req,
            Err(err) => return respond(err),
        };
        match self.agent_dispatch.dispatch(req).await {
            Ok(run_id) => json_ok(
                StatusCode::ACCEPTED,
                json!({ "ok": true, "runId": run_id }),
            ),
            Err(err) => {
                tracing::error!(%err, "agent dispatch failed");
                respond(AppError::Internal(err))
            }
        }
    }

    async fn handle_mapping(
        &self,
        sub_path: &str,
        payload: &serde_json::Value,
        headers: &HeaderMap,
        uri: &Uri,
    ) -> HookOutcome {
        let url_owned = uri.to_string();
        let input = MappingInput {
            payload,
            headers,
            url: url_owned.as_str(),
            path: sub_path,
        };

        for rule in &self.mapping_rules {
            match rule.evaluate(&input) {
                MappingOutcome::NoMatch => continue,
                MappingOutcome::Drop => return (StatusCode::NO_CONTENT, ()).into_response().into(),
                MappingOutcome::Error(err) => {
                    tracing::error!(error = %err, sub_path, "mapping rule evaluation failed");
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        axum::Json(json!({ "ok": false, "error": err })),
                    )
                        .into_response()
                        .into();
                }
                MappingOutcome::Action(Action::Wake(req)) => {
                    let mode = req.mode;
                    if let Err(err) = self.wake_sink.wake(req).await {
                        tracing::error!(%err, "mapped wake dispatch failed");
                        return respond(AppError::Internal(err));
                    }
                    let mode_str = match mode {
                        WakeMode::Now => "now",
                        WakeMode::NextHeartbeat => "next-heartbeat",
                    };
                    return json_ok(StatusCode::OK, json!({ "ok": true, "mode": mode_str }));
                }
                MappingOutcome::Action(Action::Agent(req)) => {
                    return match self.agent_dispatch.dispatch(req).await {
                        Ok(run_id) => json_ok(
                            StatusCode::ACCEPTED,
                            json!({ "ok": true, "runId": run_id }),
                        ),
                        Err(err) => {
                            tracing::error!(%err, "mapped agent dispatch failed");
                            respond(AppError::Internal(err))
                        }
                    };
                }
            }
        }

        respond(AppError::NotFound)
    }

    fn normalize_agent(&self, payload: &serde_json::Value) -> Result<AgentRequest, AppError> {
        let body: AgentBody = serde_json::from_value(payload.clone())
            .map_err(|err| AppError::BadRequest(format!("invalid agent payload: {err}")))?;

        if let Some(agent_id) = &body.agent_id {
            if !self.config.agent_allowlist.is_empty()
                && !self.config.agent_allowlist.iter().any(|a| a == agent_id)
            {
                return Err(AppError::BadRequest(format!(
                    "agent id `{agent_id}` is not permitted by policy"
                )));
            }
        }

        let session_key = body
            .session_key
            .clone()
            .or_else(|| self.config.default_session_key.clone());
        let session_key = match session_key {
            Some(key) => Some(key),
            None => {
                return Err(AppError::BadRequest(
                    "no session key provided and no default session key configured".to_string(),
                ));
            }
        };

        let wake_mode = match body.wake_mode.as_deref() {
            None | Some("now") => WakeMode::Now,
            Some("next-heartbeat") => WakeMode::NextHeartbeat,
            Some(other) => {
                return Err(AppError::BadRequest(format!("unknown wakeMode: {other}")))
            }
        };

        Ok(AgentRequest {
            message: body.message,
            name: body.name,
            agent_id: body.agent_id,
            wake_mode,
            session_key,
            deliver: body.deliver,
            channel: body.channel,
            to: body.to,
            model: body.model,
            thinking: body.thinking,
            timeout_seconds: body.timeout_seconds,
            allow_unsafe_external_content: body.allow_unsafe_external_content.unwrap_or(false),
        })
    }
}

#[derive(Deserialize)]
struct WakeBody {
    text: String,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Deserialize)]
struct AgentBody {
    message: String,
    name: String,
    #[serde(rename = "agentId", default)]
    agent_id: Option<String>,
    #[serde(rename = "wakeMode", default)]
    wake_mode: Option<String>,
    #[serde(rename = "sessionKey", default)]
    session_key: Option<String>,
    #[serde(default)]
    deliver: bool,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    thinking: Option<bool>,
    #[serde(rename = "timeoutSeconds", default)]
    timeout_seconds: Option<u64>,
    #[serde(rename = "allowUnsafeExternalContent", default)]
    allow_unsafe_external_content: Option<bool>,
}

fn normalize_wake(payload: &serde_json::Value) -> Result<WakeRequest, AppError> {
    let body: WakeBody = serde_json::from_value(payload.clone())
        .map_err(|err| AppError::BadRequest(format!("invalid wake payload: {err}")))?;
    let mode = match body.mode.as_deref() {
        None | Some("now") => WakeMode::Now,
        Some("next-heartbeat") => WakeMode::NextHeartbeat,
        Some(other) => return Err(AppError::BadRequest(format!("unknown mode: {other}"))),
    };
    Ok(WakeRequest {
        text: body.text,
        mode,
    })
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(s) = auth.to_str() {
            if let Some(token) = s.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    headers
        .get(HOOK_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn respond(err: AppError) -> HookOutcome {
    HookOutcome::Response(err.into_response())
}

fn json_ok(status: StatusCode, body: serde_json::Value) -> HookOutcome {
    HookOutcome::Response((status, axum::Json(body)).into_response())
}

impl From<Response> for HookOutcome {
    fn from(resp: Response) -> Self {
        HookOutcome::Response(resp)
    }
}
