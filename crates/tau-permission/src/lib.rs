//! Human-in-the-loop permission arbitration for side-effecting tool actions.
//!
//! A tool calls [`PermissionService::request`] before acting. Policy
//! short-circuits (skip-all, auto-approved sessions, allow-listed tools and
//! persistent grants) answer immediately; everything else is published to UI
//! subscribers and the caller waits until [`PermissionService::grant`],
//! [`PermissionService::deny`] or its cancellation token decides.
use std::{
    collections::{BTreeMap, HashSet},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tau_core::{bool_from_env, list_from_env, EnvConfigError};
use tau_pubsub::BrokerConfig;
use thiserror::Error;

mod service;
#[cfg(test)]
mod tests;

pub use service::PermissionService;

pub const PERMISSION_SKIP_REQUESTS_ENV: &str = "TAU_PERMISSION_SKIP_REQUESTS";
pub const PERMISSION_ALLOWED_TOOLS_ENV: &str = "TAU_PERMISSION_ALLOWED_TOOLS";

/// What a tool submits when it needs approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatePermissionRequest {
    pub session_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub action: String,
    pub description: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// A request awaiting a decision, as published to UI subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub action: String,
    pub description: String,
    pub params: Value,
    /// Directory the grant applies to.
    pub path: PathBuf,
}

/// Why a request reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    User,
    Persistent,
    Cancelled,
    Shutdown,
}

/// Resolved outcome of a published request, kept for audit and history views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionNotification {
    #[serde(flatten)]
    pub request: PermissionRequest,
    pub granted: bool,
    pub reason: DecisionReason,
}

/// Denial surfaced to tools, distinct from technical failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("permission denied for {tool_name} ({action}) in session {session_id}")]
pub struct PermissionDenied {
    pub session_id: String,
    pub tool_name: String,
    pub action: String,
}

/// Startup policy for a [`PermissionService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionConfig {
    pub working_dir: PathBuf,
    pub skip_requests: bool,
    /// Entries are either `tool` or `tool:action`.
    pub allowed_tools: Vec<String>,
    pub broker: BrokerConfig,
}

impl PermissionConfig {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            skip_requests: false,
            allowed_tools: Vec::new(),
            broker: BrokerConfig::default(),
        }
    }

    pub fn from_env_map(
        env: &BTreeMap<String, String>,
        working_dir: impl Into<PathBuf>,
    ) -> Result<Self, EnvConfigError> {
        Ok(Self {
            skip_requests: bool_from_env(env, PERMISSION_SKIP_REQUESTS_ENV, false)?,
            allowed_tools: list_from_env(env, PERMISSION_ALLOWED_TOOLS_ENV),
            broker: BrokerConfig::from_env_map(env)?,
            working_dir: working_dir.into(),
        })
    }

    fn allowed_tool_set(&self) -> HashSet<String> {
        self.allowed_tools
            .iter()
            .map(|entry| entry.trim().to_string())
            .filter(|entry| !entry.is_empty())
            .collect()
    }
}
