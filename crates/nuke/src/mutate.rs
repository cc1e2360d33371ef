//! Stateful-set spec capture and the maintenance/restore mutations.

use std::time::Duration;

use blitz_core::{BlitzError, BlitzResult, Target};
use blitz_kubehub::ClusterCtl;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{Container, Probe};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Update-strategy type that defers pod replacement to manual deletion.
pub const ON_DELETE: &str = "OnDelete";

pub(crate) const CONFLICT_RETRY_LIMIT: u32 = 5;
const CONFLICT_BACKOFF: Duration = Duration::from_millis(250);

/// Pre-mutation copy of the spec fields a nuke touches. Captured once per
/// target pass and handed unchanged to the restore step.
#[derive(Debug, Clone)]
pub struct StsSnapshot {
    pub update_strategy: Option<StatefulSetUpdateStrategy>,
    pub command: Option<Vec<String>>,
    pub readiness_probe: Option<Probe>,
    pub image: Option<String>,
    pub replicas: Option<i32>,
}

impl StsSnapshot {
    pub fn capture(sts: &StatefulSet) -> BlitzResult<Self> {
        let name = sts.metadata.name.as_deref().unwrap_or("<unnamed>");
        let container = sts
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers.first())
            .ok_or_else(|| {
                BlitzError::Config(format!("statefulset {name}: pod template has no containers"))
            })?;
        Ok(Self {
            update_strategy: sts.spec.as_ref().and_then(|s| s.update_strategy.clone()),
            command: container.command.clone(),
            readiness_probe: container.readiness_probe.clone(),
            image: container.image.clone(),
            replicas: sts.spec.as_ref().and_then(|s| s.replicas),
        })
    }
}

fn primary_container<'a>(sts: &'a mut StatefulSet, target: &Target) -> BlitzResult<&'a mut Container> {
    sts.spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .and_then(|p| p.containers.first_mut())
        .ok_or_else(|| {
            BlitzError::Config(format!(
                "statefulset {}: pod template has no containers",
                target.name
            ))
        })
}

/// Puts the set into maintenance mode: pods are only replaced when deleted,
/// readiness gating is off, and the primary container runs the one-shot task.
pub async fn apply_maintenance<C>(
    ctl: &C,
    cancel: &CancellationToken,
    target: &Target,
    task_args: &[String],
) -> BlitzResult<()>
where
    C: ClusterCtl + ?Sized,
{
    update_with_retry(ctl, cancel, target, |sts| {
        if let Some(spec) = sts.spec.as_mut() {
            spec.update_strategy = Some(StatefulSetUpdateStrategy {
                type_: Some(ON_DELETE.to_string()),
                rolling_update: None,
            });
        }
        let container = primary_container(sts, target)?;
        container.command = Some(task_args.to_vec());
        container.readiness_probe = None;
        Ok(())
    })
    .await
}

/// Puts the set back into its normal shape: strategy, replicas and readiness
/// probe from the snapshot, the caller's restart command (which may differ
/// from the snapshot's), and optionally a different image.
pub async fn apply_restore<C>(
    ctl: &C,
    cancel: &CancellationToken,
    target: &Target,
    snapshot: &StsSnapshot,
    restart_args: &[String],
    image_override: Option<&str>,
) -> BlitzResult<()>
where
    C: ClusterCtl + ?Sized,
{
    update_with_retry(ctl, cancel, target, |sts| {
        if let Some(spec) = sts.spec.as_mut() {
            spec.update_strategy = snapshot.update_strategy.clone();
            spec.replicas = snapshot.replicas;
        }
        let container = primary_container(sts, target)?;
        container.command = Some(restart_args.to_vec());
        container.readiness_probe = snapshot.readiness_probe.clone();
        if let Some(image) = image_override {
            container.image = Some(image.to_string());
        }
        Ok(())
    })
    .await
}

/// Fetch-mutate-write against the latest server-side object, retrying the
/// whole cycle on optimistic-concurrency conflicts up to a bounded budget.
/// The server's version check is the only concurrency guard.
async fn update_with_retry<C, F>(
    ctl: &C,
    cancel: &CancellationToken,
    target: &Target,
    mutate: F,
) -> BlitzResult<()>
where
    C: ClusterCtl + ?Sized,
    F: Fn(&mut StatefulSet) -> BlitzResult<()>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(BlitzError::Cancelled(format!("update of statefulset {}", target.name)));
        }
        let mut sts = ctl.get_stateful_set(&target.namespace, &target.name).await?;
        mutate(&mut sts)?;
        match ctl.update_stateful_set(&target.namespace, &sts).await {
            Ok(_) => return Ok(()),
            Err(BlitzError::Conflict(msg)) => {
                attempt += 1;
                if attempt >= CONFLICT_RETRY_LIMIT {
                    return Err(BlitzError::Conflict(msg));
                }
                warn!(statefulset = %target.name, attempt, "stale write; refetching");
                tokio::time::sleep(CONFLICT_BACKOFF * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}
