//! In-memory `ClusterCtl` double for coordinator and orchestrator tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use blitz_core::{BlitzError, BlitzResult};
use blitz_kubehub::ClusterCtl;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, Probe};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio_util::sync::CancellationToken;

/// A stateful set as the test cluster would serve it: RollingUpdate strategy,
/// a readiness probe, and a long-running server command.
pub(crate) fn sts_fixture(name: &str, replicas: i32) -> StatefulSet {
    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("testing".to_string()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: None,
            }),
            template: PodTemplateSpec {
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: name.to_string(),
                        command: Some(vec!["run".to_string(), "server".to_string()]),
                        image: Some("registry.example/worker:1.2.3".to_string()),
                        readiness_probe: Some(Probe::default()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) struct MockCluster {
    pub stss: Mutex<HashMap<String, StatefulSet>>,
    /// Every successful write, in order.
    pub updates: Mutex<Vec<StatefulSet>>,
    /// Upcoming update calls to reject with a conflict.
    pub conflicts: AtomicUsize,
    pub gets: AtomicUsize,
    /// Delete attempts, in order.
    pub deletes: Mutex<Vec<String>>,
    /// Waits that resolved successfully, in completion order.
    pub wait_log: Mutex<Vec<String>>,
    wait_delays: Mutex<HashMap<String, Duration>>,
    task_failures: Mutex<HashMap<String, String>>,
    ready_failures: Mutex<HashMap<String, String>>,
    fail_deletes: Mutex<HashMap<String, String>>,
    absent_pods: Mutex<HashSet<String>>,
    delete_delay: Mutex<Duration>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self {
            stss: Mutex::new(HashMap::new()),
            updates: Mutex::new(Vec::new()),
            conflicts: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
            deletes: Mutex::new(Vec::new()),
            wait_log: Mutex::new(Vec::new()),
            wait_delays: Mutex::new(HashMap::new()),
            task_failures: Mutex::new(HashMap::new()),
            ready_failures: Mutex::new(HashMap::new()),
            fail_deletes: Mutex::new(HashMap::new()),
            absent_pods: Mutex::new(HashSet::new()),
            delete_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn with_sts(self, sts: StatefulSet) -> Self {
        let name = sts.metadata.name.clone().expect("fixture has a name");
        self.stss.lock().unwrap().insert(name, sts);
        self
    }

    /// Current server-side copy, for assertions.
    pub fn sts(&self, name: &str) -> StatefulSet {
        self.stss.lock().unwrap().get(name).cloned().expect("statefulset exists")
    }

    pub fn set_wait_delay(&self, pod: &str, delay: Duration) {
        self.wait_delays.lock().unwrap().insert(pod.to_string(), delay);
    }

    pub fn fail_task_wait(&self, pod: &str, msg: &str) {
        self.task_failures.lock().unwrap().insert(pod.to_string(), msg.to_string());
    }

    pub fn fail_ready_wait(&self, pod: &str, msg: &str) {
        self.ready_failures.lock().unwrap().insert(pod.to_string(), msg.to_string());
    }

    pub fn fail_delete(&self, pod: &str, msg: &str) {
        self.fail_deletes.lock().unwrap().insert(pod.to_string(), msg.to_string());
    }

    pub fn mark_absent(&self, pod: &str) {
        self.absent_pods.lock().unwrap().insert(pod.to_string());
    }

    pub fn set_delete_delay(&self, delay: Duration) {
        *self.delete_delay.lock().unwrap() = delay;
    }

    async fn wait(
        &self,
        cancel: &CancellationToken,
        pod: &str,
        failures: &Mutex<HashMap<String, String>>,
    ) -> BlitzResult<()> {
        let delay = self
            .wait_delays
            .lock()
            .unwrap()
            .get(pod)
            .copied()
            .unwrap_or(Duration::from_millis(1));
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(BlitzError::Cancelled(format!("wait for pod {pod}")));
            }
            _ = tokio::time::sleep(delay) => {}
        }
        if let Some(msg) = failures.lock().unwrap().get(pod) {
            return Err(BlitzError::Internal(msg.clone()));
        }
        self.wait_log.lock().unwrap().push(pod.to_string());
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterCtl for MockCluster {
    async fn get_stateful_set(&self, _namespace: &str, name: &str) -> BlitzResult<StatefulSet> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.stss
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| BlitzError::NotFound(format!("statefulset {name}")))
    }

    async fn update_stateful_set(
        &self,
        _namespace: &str,
        sts: &StatefulSet,
    ) -> BlitzResult<StatefulSet> {
        if self.conflicts.load(Ordering::SeqCst) > 0 {
            self.conflicts.fetch_sub(1, Ordering::SeqCst);
            return Err(BlitzError::Conflict("synthetic version mismatch".to_string()));
        }
        let name = sts.metadata.name.clone().expect("update carries a name");
        self.stss.lock().unwrap().insert(name, sts.clone());
        self.updates.lock().unwrap().push(sts.clone());
        Ok(sts.clone())
    }

    async fn delete_pod(&self, _namespace: &str, name: &str) -> BlitzResult<bool> {
        let delay = *self.delete_delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        if let Some(msg) = self.fail_deletes.lock().unwrap().get(name) {
            return Err(BlitzError::Internal(msg.clone()));
        }
        self.deletes.lock().unwrap().push(name.to_string());
        Ok(!self.absent_pods.lock().unwrap().contains(name))
    }

    async fn wait_for_pod_running(
        &self,
        cancel: &CancellationToken,
        _namespace: &str,
        name: &str,
    ) -> BlitzResult<()> {
        self.wait(cancel, name, &self.ready_failures).await
    }

    async fn wait_for_pod_recreated_and_task_complete(
        &self,
        cancel: &CancellationToken,
        _namespace: &str,
        name: &str,
    ) -> BlitzResult<()> {
        self.wait(cancel, name, &self.task_failures).await
    }
}
