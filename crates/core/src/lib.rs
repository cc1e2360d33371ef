//! Blitz core types and errors

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// One stateful set scheduled for a nuke pass.
///
/// The controller keeps one pod per ordinal slot, so the managed pod names
/// are fully determined by the set name and its replica count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub namespace: String,
    pub replicas: i32,
}

impl Target {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, replicas: i32) -> Self {
        Self { name: name.into(), namespace: namespace.into(), replicas }
    }

    /// Name of the pod in the given ordinal slot.
    pub fn pod_name(&self, ordinal: i32) -> String {
        format!("{}-{}", self.name, ordinal)
    }

    /// All managed pod names, in ordinal order (`<name>-0..N-1`).
    pub fn pod_names(&self) -> Vec<String> {
        (0..self.replicas.max(0)).map(|i| self.pod_name(i)).collect()
    }
}

/// An addressable node backing one stateful set, as returned by discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeHandle {
    pub name: String,
    /// Base URL of the node's live status endpoint.
    pub status_url: String,
}

/// Outcome counts for one orchestrator invocation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    /// Targets that went through the full task + restore cycle.
    pub processed: usize,
    /// Targets excluded up front (unresolvable name or zero replicas).
    pub skipped: usize,
    /// Targets whose restore phase reported an error; the live spec of those
    /// sets needs operator attention.
    pub rollback_failures: usize,
}

/// Errors surfaced by the blitz crates. The orchestration layer wraps these
/// with the stateful-set name and phase before reporting them upward.
#[derive(Debug, thiserror::Error)]
pub enum BlitzError {
    #[error("config: {0}")]
    Config(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("exhausted: {0}")]
    Exhausted(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("discovery not configured")]
    NotConfigured,
    #[error("internal: {0}")]
    Internal(String),
}

pub type BlitzResult<T> = Result<T, BlitzError>;
