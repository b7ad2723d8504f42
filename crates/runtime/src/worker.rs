//! Worker pool: pull keys, reconcile under a deadline, translate the outcome
//! into queue actions.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use keel_core::{Action, ReconcileError, Request, ResourceKey};
use metrics::{counter, histogram};
use tracing::{debug, error, info, warn};

use crate::queue::WorkQueue;
use crate::Reconciler;

fn panic_message(p: &(dyn Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// One reconcile call. Panics and deadline expiry become errors.
pub async fn reconcile_once(reconciler: &dyn Reconciler, req: &Request, timeout: Duration) -> Result<Action, ReconcileError> {
    let fut = AssertUnwindSafe(reconciler.reconcile(req)).catch_unwind();
    match tokio::time::timeout(timeout, fut).await {
        Err(_) => Err(ReconcileError::Timeout(timeout)),
        Ok(Err(panic)) => Err(ReconcileError::Panicked(panic_message(panic.as_ref()))),
        Ok(Ok(res)) => res,
    }
}

pub(crate) async fn run_worker(
    id: usize,
    controller: Arc<str>,
    queue: Arc<WorkQueue<ResourceKey>>,
    reconciler: Arc<dyn Reconciler>,
    timeout: Duration,
) {
    debug!(controller = %controller, worker = id, "worker started");
    while let Some(key) = queue.get().await {
        let req = Request::new(key.clone());
        let t0 = Instant::now();
        let res = reconcile_once(reconciler.as_ref(), &req, timeout).await;
        let took_ms = t0.elapsed().as_secs_f64() * 1000.0;
        histogram!("reconcile_ms", took_ms, "controller" => controller.to_string());
        match res {
            Ok(Action::Done) => {
                counter!("reconcile_total", 1u64, "controller" => controller.to_string(), "result" => "done");
                debug!(controller = %controller, key = %key, took_ms, "reconciled");
                queue.forget(&key);
            }
            Ok(Action::Requeue) => {
                counter!("reconcile_total", 1u64, "controller" => controller.to_string(), "result" => "requeue");
                queue.add(key.clone());
            }
            Ok(Action::RequeueAfter(d)) => {
                counter!("reconcile_total", 1u64, "controller" => controller.to_string(), "result" => "requeue_after");
                queue.forget(&key);
                queue.add_after(key.clone(), d);
            }
            Err(e) => {
                counter!("reconcile_total", 1u64, "controller" => controller.to_string(), "result" => "error");
                let attempts = queue.num_requeues(&key) + 1;
                match &e {
                    ReconcileError::Panicked(_) => error!(controller = %controller, key = %key, attempts, error = %e, "reconcile panicked"),
                    _ if e.is_permanent() => warn!(controller = %controller, key = %key, attempts, error = %e, "reconcile rejected desired state"),
                    _ => warn!(controller = %controller, key = %key, attempts, error = %e, "reconcile failed"),
                }
                queue.add_rate_limited(key.clone());
            }
        }
        queue.done(&key);
    }
    info!(controller = %controller, worker = id, "worker stopped");
}
