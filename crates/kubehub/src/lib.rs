//! Blitz kube integration – control-plane client and node discovery

#![forbid(unsafe_code)]

use blitz_core::{BlitzError, BlitzResult, NodeHandle};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    runtime::wait::await_condition,
    Client,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default port of a node's status endpoint.
pub const DEFAULT_STATUS_PORT: u16 = 1635;

pub async fn get_kube_client() -> BlitzResult<Client> {
    Client::try_default()
        .await
        .map_err(|e| BlitzError::Internal(format!("kube client: {e}")))
}

fn classify(err: kube::Error, what: &str) -> BlitzError {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => {
            BlitzError::Conflict(format!("{what}: {}", ae.message))
        }
        kube::Error::Api(ae) if ae.code == 404 => BlitzError::NotFound(what.to_string()),
        e => BlitzError::Internal(format!("{what}: {e}")),
    }
}

/// Imperative control-plane operations the nuke orchestration needs.
///
/// `update_stateful_set` is an optimistic-concurrency write: the object's
/// resourceVersion travels with it, and a stale version fails with
/// [`BlitzError::Conflict`] so callers can refetch and retry. Both waits only
/// accept a pod whose uid differs from the one observed at call time: a
/// maintenance-mode pod carries no readiness probe and reports Ready, so a
/// plain condition check would fire before the pod was ever replaced.
#[async_trait::async_trait]
pub trait ClusterCtl: Send + Sync {
    async fn get_stateful_set(&self, namespace: &str, name: &str) -> BlitzResult<StatefulSet>;

    async fn update_stateful_set(
        &self,
        namespace: &str,
        sts: &StatefulSet,
    ) -> BlitzResult<StatefulSet>;

    /// Returns whether the pod existed.
    async fn delete_pod(&self, namespace: &str, name: &str) -> BlitzResult<bool>;

    /// Blocks until the pod has been recreated and reports Ready.
    async fn wait_for_pod_running(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        name: &str,
    ) -> BlitzResult<()>;

    /// Blocks until the pod has been recreated and its one-shot command ran
    /// to completion.
    async fn wait_for_pod_recreated_and_task_complete(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        name: &str,
    ) -> BlitzResult<()>;
}

/// Default implementation backed by kube-rs typed APIs.
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> BlitzResult<Self> {
        Ok(Self::new(get_kube_client().await?))
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn stateful_sets(&self, namespace: &str) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn wait_recreated(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        name: &str,
        settled: fn(&Pod) -> bool,
        what: &str,
    ) -> BlitzResult<()> {
        let api = self.pods(namespace);
        let initial_uid = api
            .get_opt(name)
            .await
            .map_err(|e| classify(e, &format!("pod {namespace}/{name}")))?
            .and_then(|p| p.metadata.uid);
        debug!(pod = %name, uid = ?initial_uid, condition = %what, "waiting for recreation");
        let cond = move |obj: Option<&Pod>| match obj {
            Some(pod) => {
                let recreated = match (initial_uid.as_deref(), pod.metadata.uid.as_deref()) {
                    (Some(old), Some(new)) => old != new,
                    _ => true,
                };
                recreated && settled(pod)
            }
            None => false,
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                Err(BlitzError::Cancelled(format!("wait for pod {namespace}/{name} ({what})")))
            }
            res = await_condition(api, name, cond) => match res {
                Ok(_) => Ok(()),
                Err(e) => Err(BlitzError::Internal(format!("watch pod {namespace}/{name}: {e}"))),
            }
        }
    }
}

fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false)
}

fn task_finished(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() == Some("Succeeded") {
        return true;
    }
    status
        .container_statuses
        .as_ref()
        .map(|cs| {
            cs.iter().any(|c| {
                c.state
                    .as_ref()
                    .and_then(|s| s.terminated.as_ref())
                    .map(|t| t.exit_code == 0)
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

#[async_trait::async_trait]
impl ClusterCtl for KubeCluster {
    async fn get_stateful_set(&self, namespace: &str, name: &str) -> BlitzResult<StatefulSet> {
        self.stateful_sets(namespace)
            .get(name)
            .await
            .map_err(|e| classify(e, &format!("statefulset {namespace}/{name}")))
    }

    async fn update_stateful_set(
        &self,
        namespace: &str,
        sts: &StatefulSet,
    ) -> BlitzResult<StatefulSet> {
        let name = sts
            .metadata
            .name
            .clone()
            .ok_or_else(|| BlitzError::Config("statefulset without a name".into()))?;
        self.stateful_sets(namespace)
            .replace(&name, &PostParams::default(), sts)
            .await
            .map_err(|e| classify(e, &format!("statefulset {namespace}/{name}")))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> BlitzResult<bool> {
        match self.pods(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(classify(e, &format!("delete pod {namespace}/{name}"))),
        }
    }

    async fn wait_for_pod_running(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        name: &str,
    ) -> BlitzResult<()> {
        self.wait_recreated(cancel, namespace, name, pod_ready, "ready").await
    }

    async fn wait_for_pod_recreated_and_task_complete(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        name: &str,
    ) -> BlitzResult<()> {
        self.wait_recreated(cancel, namespace, name, task_finished, "task complete").await
    }
}

/// Turns a logical cluster into a list of addressable nodes.
#[async_trait::async_trait]
pub trait NodeDiscovery: Send + Sync {
    async fn nodes(&self) -> BlitzResult<Vec<NodeHandle>>;
    fn namespace(&self) -> &str;
}

/// Discovers nodes by listing stateful sets matching a label selector; each
/// set is assumed to front one node, reachable through its governing service.
pub struct LabelDiscovery {
    client: Client,
    namespace: String,
    selector: String,
    status_port: u16,
}

impl LabelDiscovery {
    pub fn new(client: Client, namespace: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            selector: selector.into(),
            status_port: DEFAULT_STATUS_PORT,
        }
    }

    pub fn with_status_port(mut self, port: u16) -> Self {
        self.status_port = port;
        self
    }
}

fn status_url(name: &str, namespace: &str, port: u16) -> String {
    format!("http://{name}-0.{name}.{namespace}.svc:{port}")
}

#[async_trait::async_trait]
impl NodeDiscovery for LabelDiscovery {
    async fn nodes(&self) -> BlitzResult<Vec<NodeHandle>> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.namespace);
        let lp = ListParams::default().labels(&self.selector);
        let list = api
            .list(&lp)
            .await
            .map_err(|e| classify(e, &format!("list statefulsets in {}", self.namespace)))?;
        let mut out = Vec::new();
        for sts in list.items {
            if let Some(name) = sts.metadata.name {
                out.push(NodeHandle {
                    status_url: status_url(&name, &self.namespace, self.status_port),
                    name,
                });
            }
        }
        // Stable order regardless of list order
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }
}

/// Placeholder wired in when no discovery mode was configured; always fails
/// with the sentinel so callers can tell "not wired up" from "empty".
pub struct NotConfigured;

#[async_trait::async_trait]
impl NodeDiscovery for NotConfigured {
    async fn nodes(&self) -> BlitzResult<Vec<NodeHandle>> {
        Err(BlitzError::NotConfigured)
    }

    fn namespace(&self) -> &str {
        ""
    }
}
