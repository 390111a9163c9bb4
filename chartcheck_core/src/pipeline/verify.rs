use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;

use super::{recv_or_cancel, run_cancelable, send_outcome};
use crate::exec::CommandExecutor;
use crate::types::{ImageRef, Outcome, VerifyResult};

#[derive(Clone)]
struct CachedVerification {
    exists: bool,
    error: Option<String>,
}

/// Single-flight dedup cache for registry inspections, shared by every S4
/// worker. Two maps under one lock, slow work done outside the lock -
/// spec.md §4.4's exact shape: "leader-elects per key, one slow call per
/// key, all waiters observe the leader's result".
pub struct VerifyCache {
    cache: RwLock<HashMap<String, CachedVerification>>,
    pending: RwLock<HashMap<String, Arc<Notify>>>,
}

impl VerifyCache {
    pub fn new() -> Self {
        VerifyCache {
            cache: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve `image`, running the inspection at most once regardless of
    /// how many callers ask for it concurrently. Racing the wait for
    /// another worker's in-flight inspection against `cancel` means a
    /// cancelled caller never blocks on a leader that has already returned
    /// its (possibly cancelled) result into the cache.
    async fn resolve<E: CommandExecutor>(
        &self,
        executor: &E,
        image: &str,
        timeout: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> CachedVerification {
        loop {
            if let Some(hit) = self.cache.read().unwrap().get(image) {
                return hit.clone();
            }

            let waiter = self.pending.read().unwrap().get(image).cloned();
            if let Some(notify) = waiter {
                tokio::select! {
                    biased;
                    changed = cancel.changed() => {
                        let _ = changed;
                        return CachedVerification {
                            exists: false,
                            error: Some(format!("verification of {} cancelled", image)),
                        };
                    }
                    _ = notify.notified() => {}
                }
                continue; // leader finished (or a race resolved) - re-check cache
            }

            let became_leader = {
                let mut pending = self.pending.write().unwrap();
                if pending.contains_key(image) {
                    false
                } else if self.cache.read().unwrap().contains_key(image) {
                    false
                } else {
                    pending.insert(image.to_string(), Arc::new(Notify::new()));
                    true
                }
            };
            if !became_leader {
                continue;
            }

            let result = inspect(executor, image, timeout, cancel).await;

            self.cache
                .write()
                .unwrap()
                .insert(image.to_string(), result.clone());
            let notify = self.pending.write().unwrap().remove(image);
            if let Some(notify) = notify {
                notify.notify_waiters();
            }
            return result;
        }
    }
}

/// Runs the registry inspection under both a fixed deadline and the
/// pipeline's cancellation signal - spec.md §4.4: "pipeline cancellation
/// propagates through the parent context and cancels all in-flight
/// inspections". `run_cancelable` races the subprocess against `cancel`;
/// `tokio::time::timeout` wraps that race with the 2-minute deadline so
/// either one can return first.
async fn inspect<E: CommandExecutor>(
    executor: &E,
    image: &str,
    timeout: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> CachedVerification {
    let args = vec![
        "manifest".to_string(),
        "inspect".to_string(),
        image.to_string(),
    ];
    match tokio::time::timeout(timeout, run_cancelable(executor, "docker", &args, cancel)).await {
        Ok(Ok(output)) if output.success => CachedVerification {
            exists: true,
            error: None,
        },
        Ok(Ok(output)) => CachedVerification {
            exists: false,
            error: Some(format!(
                "docker manifest inspect exited non-zero: {}",
                output.combined()
            )),
        },
        Ok(Err(e)) => CachedVerification {
            exists: false,
            error: Some(format!("failed to invoke docker manifest inspect: {}", e)),
        },
        Err(_) => CachedVerification {
            exists: false,
            error: Some(format!(
                "verification of {} timed out after {:?}",
                image, timeout
            )),
        },
    }
}

/// S4 ImageVerifier: confirms an image exists in its registry, deduplicated
/// across every ImageRef that names it.
pub fn spawn<E: CommandExecutor + 'static>(
    workers: usize,
    executor: Arc<E>,
    cache: Arc<VerifyCache>,
    timeout: Duration,
    input: Arc<Mutex<mpsc::Receiver<ImageRef>>>,
    cancel: watch::Receiver<bool>,
    results: mpsc::Sender<Outcome>,
    buffer: usize,
) -> (mpsc::Receiver<VerifyResult>, Vec<JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers.max(1) {
        let input = input.clone();
        let executor = executor.clone();
        let cache = cache.clone();
        let tx = tx.clone();
        let results = results.clone();
        let mut cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            while let Some(image_ref) = recv_or_cancel(&input, &mut cancel).await {
                debug!("[verify#{}] {}", worker_id, image_ref.image);
                let verified = cache
                    .resolve(executor.as_ref(), &image_ref.image, timeout, &mut cancel)
                    .await;
                let result = VerifyResult {
                    chart: image_ref.chart,
                    image: image_ref.image,
                    exists: verified.exists,
                    error: verified.error,
                };
                let delivered_downstream = tx.send(result.clone()).await.is_ok();
                let delivered_outcome =
                    send_outcome(&results, Outcome::Verified(result)).await;
                if !delivered_downstream && !delivered_outcome {
                    break;
                }
            }
        }));
    }
    drop(tx);
    (rx, handles)
}
