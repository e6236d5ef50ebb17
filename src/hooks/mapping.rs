//! Declarative mapping rules: convert an arbitrary hook payload into a
//! normalized action or an explicit drop signal.

use axum::http::HeaderMap;

use super::{AgentRequest, WakeRequest};

pub struct MappingInput<'a> {
    pub payload: &'a serde_json::Value,
    pub headers: &'a HeaderMap,
    pub url: &'a str,
    pub path: &'a str,
}

pub enum Action {
    Wake(WakeRequest),
    Agent(AgentRequest),
}

pub enum MappingOutcome {
    NoMatch,
    Action(Action),
    Drop,
    /// The rule matched but could not produce a normalized action (e.g. a
    /// malformed payload shape it claims to own). Surfaced as `500 {ok:
    /// false, error}` rather than falling through to the next rule, since a
    /// matched-but-broken rule is a configuration bug, not a non-match.
    Error(String),
}

pub trait MappingRule: Send + Sync {
    fn evaluate(&self, input: &MappingInput<'_>) -> MappingOutcome;
}

/// Matches requests whose sub-path equals a fixed string and that carry a
/// `text` field, mapping them straight onto a `wake` action. The simplest
/// possible rule shape; real deployments compose richer rules the same way.
pub struct FixedPathWakeRule {
    pub sub_path: String,
}

impl MappingRule for FixedPathWakeRule {
    fn evaluate(&self, input: &MappingInput<'_>) -> MappingOutcome {
        if input.path != self.sub_path {
            return MappingOutcome::NoMatch;
        }
        match input.payload.get("text").and_then(|v| v.as_str()) {
            Some(text) => MappingOutcome::Action(Action::Wake(WakeRequest {
                text: text.to_string(),
                mode: super::WakeMode::Now,
            })),
            None => MappingOutcome::NoMatch,
        }
    }
}
