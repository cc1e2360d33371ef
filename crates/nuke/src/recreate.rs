//! Pod recreation: strictly ordered deletion overlapped with per-pod waits.

use std::future::Future;

use blitz_core::{BlitzError, BlitzResult, Target};
use blitz_kubehub::ClusterCtl;
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Deletes every managed pod of `target` in ordinal order while concurrently
/// waiting, through `wait_for`, for each pod to reach the caller's condition.
///
/// Deletion stays sequential: deleting out of order on an ordinal-ordered
/// controller leaves recreation order undefined. The waits are independent
/// and overlap freely. Everything runs in one failure domain: the first
/// error (wait or delete) wins, the remaining futures are dropped, and the
/// winner's error is returned. The deleter checks the cancellation token
/// before every deletion.
pub async fn recreate_and_wait<C, W, Fut>(
    ctl: &C,
    cancel: &CancellationToken,
    target: &Target,
    wait_for: W,
) -> BlitzResult<()>
where
    C: ClusterCtl + ?Sized,
    W: Fn(String) -> Fut,
    Fut: Future<Output = BlitzResult<()>>,
{
    let pods = target.pod_names();
    let waits = try_join_all(pods.iter().cloned().map(&wait_for));
    let deleter = async {
        for pod in &pods {
            if cancel.is_cancelled() {
                return Err(BlitzError::Cancelled(format!("deletion of pod {pod}")));
            }
            let existed = ctl.delete_pod(&target.namespace, pod).await?;
            if existed {
                debug!(pod = %pod, "pod deleted");
            } else {
                warn!(pod = %pod, "pod already gone; nothing to delete");
            }
        }
        Ok(())
    };
    tokio::try_join!(deleter, waits)?;
    Ok(())
}
