//! Neighborhood targeting: non-repeating random selection and task-arg
//! decoration for nodes that report an address-space depth.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Mutex;

use blitz_core::{BlitzError, BlitzResult, NodeHandle};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;
use tracing::warn;

/// Flag appended to a task command to aim it at one neighborhood.
pub const TARGET_NEIGHBORHOOD_FLAG: &str = "--target-neighborhood";

/// Draws random integers from closed ranges without ever repeating a value.
///
/// State is per instance; two selectors never interfere. Not synchronized —
/// wrap in a mutex when shared.
pub struct RandomSelector {
    rng: StdRng,
    used: HashSet<u64>,
}

impl RandomSelector {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_os_rng())
    }

    pub fn from_rng(rng: StdRng) -> Self {
        Self { rng, used: HashSet::new() }
    }

    /// Deterministic instance for reproducible runs and tests.
    pub fn seeded(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    /// Returns a value in `[low, high]` this instance has not returned
    /// before. Fails with [`BlitzError::Exhausted`] once every value of the
    /// range has been handed out.
    pub fn next(&mut self, low: u64, high: u64) -> BlitzResult<u64> {
        if low > high {
            return Err(BlitzError::Config(format!("empty selection range [{low}, {high}]")));
        }
        let span = high - low + 1;
        let used_in_range = self.used.iter().filter(|v| (low..=high).contains(v)).count() as u64;
        if used_in_range >= span {
            return Err(BlitzError::Exhausted(format!(
                "all {span} values in [{low}, {high}] already drawn"
            )));
        }
        loop {
            let v = self.rng.random_range(low..=high);
            if self.used.insert(v) {
                return Ok(v);
            }
        }
    }
}

impl Default for RandomSelector {
    fn default() -> Self {
        Self::new()
    }
}

/// Live status of a node, as reported by its own API.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeStatus {
    pub depth: u32,
}

/// Queries a node's live status endpoint.
#[async_trait::async_trait]
pub trait StatusClient: Send + Sync {
    async fn status(&self, node: &NodeHandle) -> BlitzResult<NodeStatus>;
}

/// HTTP status client against `<status_url>/status`.
pub struct HttpStatusClient {
    http: reqwest::Client,
}

impl HttpStatusClient {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }
}

impl Default for HttpStatusClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StatusClient for HttpStatusClient {
    async fn status(&self, node: &NodeHandle) -> BlitzResult<NodeStatus> {
        let url = format!("{}/status", node.status_url.trim_end_matches('/'));
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| BlitzError::Internal(format!("status of node {}: {e}", node.name)))?;
        resp.json::<NodeStatus>()
            .await
            .map_err(|e| BlitzError::Internal(format!("status of node {}: {e}", node.name)))
    }
}

/// Computes the task command to run on one node's stateful set.
#[async_trait::async_trait]
pub trait TaskArgsProvider: Send + Sync {
    /// Whether the returned args vary per node.
    fn randomized(&self) -> bool;

    /// Returns the command to run; `base` is never mutated.
    async fn task_args(&self, node: &NodeHandle, base: &[String]) -> BlitzResult<Vec<String>>;
}

/// Targeting disabled: hands the base command back untouched.
pub struct PassthroughArgs;

#[async_trait::async_trait]
impl TaskArgsProvider for PassthroughArgs {
    fn randomized(&self) -> bool {
        false
    }

    async fn task_args(&self, _node: &NodeHandle, base: &[String]) -> BlitzResult<Vec<String>> {
        Ok(base.to_vec())
    }
}

/// Aims each node's task at a randomly drawn neighborhood of its reported
/// depth. Falls back to the plain command (with a warning) when the node
/// reports depth zero or the selector runs dry; those are operational
/// conditions, not reasons to abort a fleet run.
pub struct NeighborhoodArgs<S> {
    status: S,
    selector: Mutex<RandomSelector>,
}

impl<S: StatusClient> NeighborhoodArgs<S> {
    pub fn new(status: S, selector: RandomSelector) -> Self {
        Self { status, selector: Mutex::new(selector) }
    }
}

#[async_trait::async_trait]
impl<S: StatusClient> TaskArgsProvider for NeighborhoodArgs<S> {
    fn randomized(&self) -> bool {
        true
    }

    async fn task_args(&self, node: &NodeHandle, base: &[String]) -> BlitzResult<Vec<String>> {
        let status = self.status.status(node).await?;
        if status.depth == 0 {
            warn!(node = %node.name, "node reports depth zero; running task without a neighborhood target");
            return Ok(base.to_vec());
        }
        if status.depth > 63 {
            return Err(BlitzError::Config(format!(
                "node {}: depth {} out of range",
                node.name, status.depth
            )));
        }
        let high = (1u64 << status.depth) - 1;
        let drawn = {
            let mut selector = self.selector.lock().unwrap_or_else(|p| p.into_inner());
            selector.next(0, high)
        };
        match drawn {
            Ok(value) => {
                let mut args = base.to_vec();
                args.push(format!(
                    "{TARGET_NEIGHBORHOOD_FLAG}={value:0width$b}",
                    width = status.depth as usize
                ));
                Ok(args)
            }
            Err(BlitzError::Exhausted(msg)) => {
                warn!(node = %node.name, depth = status.depth, %msg, "neighborhoods exhausted; running task without a target");
                Ok(base.to_vec())
            }
            Err(e) => Err(e),
        }
    }
}
