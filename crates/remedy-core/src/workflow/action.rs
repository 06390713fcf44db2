//! Action executor port.
//!
//! Cluster mutations (pod restart, deployment scale, ...) live outside the
//! engine. The engine sees them only through `ActionExecutor`: a named,
//! parameterized operation against a target that returns a JSON result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use remedy_types::plan::{ActionKind, ActionTarget};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A single dispatch to the external executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub workflow_id: Uuid,
    pub stage_id: String,
    pub action: ActionKind,
    pub target: ActionTarget,
    pub parameters: HashMap<String, Value>,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Errors reported by the executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    /// Rate limiting, connection resets, API server unavailability. Retried.
    #[error("transient executor error: {0}")]
    Transient(String),

    /// The action itself failed. Never retried.
    #[error("action failed: {0}")]
    Permanent(String),
}

impl ActionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ActionError::Transient(_))
    }
}

/// Trait for the external action executor.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods,
/// consistent with the project's Rust 2024 edition approach.
pub trait ActionExecutor: Send + Sync {
    /// Action kinds this executor can perform. Plans using anything else are
    /// rejected at validation time.
    fn supported_actions(&self) -> Vec<ActionKind> {
        ActionKind::ALL.to_vec()
    }

    fn execute(
        &self,
        request: ActionRequest,
    ) -> impl Future<Output = Result<Value, ActionError>> + Send;
}

impl<T: ActionExecutor> ActionExecutor for Arc<T> {
    fn supported_actions(&self) -> Vec<ActionKind> {
        (**self).supported_actions()
    }

    fn execute(
        &self,
        request: ActionRequest,
    ) -> impl Future<Output = Result<Value, ActionError>> + Send {
        (**self).execute(request)
    }
}
