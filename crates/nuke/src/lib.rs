//! Blitz nuke orchestration: temporarily repurpose every pod of a fleet of
//! stateful sets to run a one-shot task, wait for the task to finish, and put
//! every touched set back into its original shape — whether or not the task,
//! the waits, or the control plane cooperated.

#![forbid(unsafe_code)]

mod mutate;
mod recreate;
#[cfg(test)]
mod testutil;

pub use mutate::{apply_maintenance, apply_restore, StsSnapshot, ON_DELETE};
pub use recreate::recreate_and_wait;

pub use blitz_core::{RunSummary, Target};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use blitz_core::{BlitzError, NodeHandle};
use blitz_kubehub::{ClusterCtl, NodeDiscovery};
use blitz_neighborhood::TaskArgsProvider;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Sequences snapshot → maintenance → recreate-and-await-task → restore →
/// recreate-and-await-ready over each target. Targets run one at a time to
/// bound control-plane load and keep the log readable; only the pod phase of
/// a single target fans out.
pub struct Orchestrator {
    ctl: Arc<dyn ClusterCtl>,
    provider: Arc<dyn TaskArgsProvider>,
    namespace: String,
    task_args: Vec<String>,
    image_override: Option<String>,
}

impl Orchestrator {
    pub fn new(
        ctl: Arc<dyn ClusterCtl>,
        provider: Arc<dyn TaskArgsProvider>,
        namespace: impl Into<String>,
        task_args: Vec<String>,
    ) -> Self {
        Self {
            ctl,
            provider,
            namespace: namespace.into(),
            task_args,
            image_override: None,
        }
    }

    /// Image to set while restoring, instead of keeping the live one.
    pub fn with_image_override(mut self, image: impl Into<String>) -> Self {
        self.image_override = Some(image.into());
        self
    }

    /// Nukes every stateful set backing a discovered node, in discovery
    /// order. The args provider is consulted once per target before its task
    /// phase.
    pub async fn run<D>(
        &self,
        cancel: &CancellationToken,
        discovery: &D,
        restart_args: &[String],
    ) -> Result<RunSummary>
    where
        D: NodeDiscovery + ?Sized,
    {
        ensure_restart_args(restart_args)?;
        let nodes = discovery.nodes().await.context("node discovery")?;
        let namespace = discovery.namespace();
        info!(count = nodes.len(), namespace = %namespace, "discovered nodes");
        let mut summary = RunSummary::default();
        for node in &nodes {
            let Some(target) = self.resolve(namespace, &node.name).await? else {
                summary.skipped += 1;
                continue;
            };
            if self.provider.randomized() && target.replicas > 1 {
                warn!(
                    statefulset = %target.name,
                    replicas = target.replicas,
                    "randomized neighborhood will be shared by every replica of this set"
                );
            }
            let rollback_failed =
                self.update_and_rollback(cancel, &target, Some(node), restart_args).await?;
            summary.processed += 1;
            if rollback_failed {
                summary.rollback_failures += 1;
            }
        }
        Ok(summary)
    }

    /// Nukes explicitly named stateful sets with the configured task command,
    /// in the given order. Repeated names are only processed once.
    pub async fn nuke_by_names(
        &self,
        cancel: &CancellationToken,
        names: &[String],
        restart_args: &[String],
    ) -> Result<RunSummary> {
        ensure_restart_args(restart_args)?;
        let mut seen = HashSet::new();
        let mut summary = RunSummary::default();
        for name in names {
            if !seen.insert(name.as_str()) {
                warn!(statefulset = %name, "duplicate name; already nuked in this run");
                continue;
            }
            let Some(target) = self.resolve(&self.namespace, name).await? else {
                summary.skipped += 1;
                continue;
            };
            let rollback_failed =
                self.update_and_rollback(cancel, &target, None, restart_args).await?;
            summary.processed += 1;
            if rollback_failed {
                summary.rollback_failures += 1;
            }
        }
        Ok(summary)
    }

    /// Looks a stateful set up and decides whether it is worth processing.
    /// Unresolvable names and empty sets are excluded, never fatal.
    async fn resolve(&self, namespace: &str, name: &str) -> Result<Option<Target>> {
        let sts = match self.ctl.get_stateful_set(namespace, name).await {
            Ok(sts) => sts,
            Err(BlitzError::NotFound(_)) => {
                warn!(statefulset = %name, "not found; skipping");
                return Ok(None);
            }
            Err(e) => return Err(e).with_context(|| format!("statefulset {name}: resolve")),
        };
        let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        if replicas == 0 {
            warn!(statefulset = %name, "zero replicas; skipping");
            return Ok(None);
        }
        Ok(Some(Target::new(name, namespace, replicas)))
    }

    /// Runs the task phase for one target, then restores it unconditionally.
    /// Returns whether the restore phase reported errors; a task-phase error
    /// is surfaced only after both restore steps have run, so the caller
    /// never sees a set left in maintenance mode without a restore attempt.
    async fn update_and_rollback(
        &self,
        cancel: &CancellationToken,
        target: &Target,
        node: Option<&NodeHandle>,
        restart_args: &[String],
    ) -> Result<bool> {
        let t0 = Instant::now();
        counter!("nuke_targets_total", 1u64);
        info!(statefulset = %target.name, replicas = target.replicas, "nuke starting");

        let sts = self
            .ctl
            .get_stateful_set(&target.namespace, &target.name)
            .await
            .with_context(|| format!("statefulset {}: fetch for snapshot", target.name))?;
        let snapshot = StsSnapshot::capture(&sts)
            .with_context(|| format!("statefulset {}: snapshot", target.name))?;

        let task_args = match node {
            Some(node) => self
                .provider
                .task_args(node, &self.task_args)
                .await
                .with_context(|| format!("statefulset {}: task args", target.name))?,
            None => self.task_args.clone(),
        };

        apply_maintenance(self.ctl.as_ref(), cancel, target, &task_args)
            .await
            .with_context(|| format!("statefulset {}: maintenance update", target.name))?;

        // Task phase. From here on, the restore below runs no matter how
        // this exits.
        let task_result = recreate_and_wait(self.ctl.as_ref(), cancel, target, |pod| {
            let ctl = self.ctl.as_ref();
            let namespace = &target.namespace;
            async move {
                ctl.wait_for_pod_recreated_and_task_complete(cancel, namespace, &pod).await
            }
        })
        .await;
        if let Err(e) = &task_result {
            counter!("nuke_task_failures_total", 1u64);
            warn!(statefulset = %target.name, error = %e, "task phase failed; restoring anyway");
        }

        // Restoration runs on a detached token: a fired cancellation must not
        // leave the set stuck in maintenance mode. Errors here are reported,
        // not raised — raising would mask the task-phase error and there is
        // no further fallback anyway.
        let rollback_cancel = CancellationToken::new();
        let mut rollback_failed = false;
        if let Err(e) = apply_restore(
            self.ctl.as_ref(),
            &rollback_cancel,
            target,
            &snapshot,
            restart_args,
            self.image_override.as_deref(),
        )
        .await
        {
            error!(statefulset = %target.name, error = %e, "rollback: restore update failed");
            rollback_failed = true;
        }
        if let Err(e) = recreate_and_wait(self.ctl.as_ref(), &rollback_cancel, target, |pod| {
            let ctl = self.ctl.as_ref();
            let namespace = &target.namespace;
            let rollback_cancel = &rollback_cancel;
            async move { ctl.wait_for_pod_running(rollback_cancel, namespace, &pod).await }
        })
        .await
        {
            error!(statefulset = %target.name, error = %e, "rollback: pod recreation failed");
            rollback_failed = true;
        }
        if rollback_failed {
            counter!("nuke_rollback_failures_total", 1u64);
        }

        task_result.with_context(|| format!("statefulset {}: task phase", target.name))?;
        histogram!("nuke_target_duration_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(statefulset = %target.name, took_ms = %t0.elapsed().as_millis(), "nuke complete");
        Ok(rollback_failed)
    }
}

fn ensure_restart_args(restart_args: &[String]) -> Result<()> {
    if restart_args.is_empty() {
        bail!(BlitzError::Config("restart command must not be empty".into()));
    }
    Ok(())
}
