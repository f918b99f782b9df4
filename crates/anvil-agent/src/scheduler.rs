//! Single-flight operation markers, one per instance.
//!
//! A marker is taken synchronously with [`OperationScheduler::acquire`] and held by
//! an [`OperationGuard`]; dropping the guard (on success, error, cancellation or
//! panic unwinding) clears it.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use anvil_process::InstanceId;
use tokio::{sync::watch, task::JoinHandle};

use crate::error::{AnvilError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Install,
    Start,
    Stop,
    Delete,
    CreateWorld,
    ChangeWorld,
    CopyWorld,
    ImportWorld,
    Backup,
    Restore,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Install => "install",
            OperationKind::Start => "start",
            OperationKind::Stop => "stop",
            OperationKind::Delete => "delete",
            OperationKind::CreateWorld => "create_world",
            OperationKind::ChangeWorld => "change_world",
            OperationKind::CopyWorld => "copy_world",
            OperationKind::ImportWorld => "import_world",
            OperationKind::Backup => "backup",
            OperationKind::Restore => "restore",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct CancelSignal {
    flag: Arc<AtomicBool>,
    tx: watch::Sender<bool>,
}

impl CancelSignal {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    fn fire(&self) {
        self.flag.store(true, Ordering::Relaxed);
        self.tx.send_replace(true);
    }
}

#[derive(Debug)]
struct InFlight {
    kind: OperationKind,
    token: u64,
    cancel: Arc<CancelSignal>,
}

type Markers = Arc<Mutex<HashMap<InstanceId, InFlight>>>;

#[derive(Debug, Default)]
pub struct OperationScheduler {
    markers: Markers,
    next_token: AtomicU64,
}

impl OperationScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the instance's marker or fail with `OperationInProgress` naming the holder.
    pub fn acquire(&self, instance_id: &InstanceId, kind: OperationKind) -> Result<OperationGuard> {
        let mut markers = lock(&self.markers);
        if let Some(existing) = markers.get(instance_id) {
            return Err(AnvilError::OperationInProgress {
                instance_id: instance_id.clone(),
                operation: existing.kind,
            });
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(CancelSignal::new());
        markers.insert(
            instance_id.clone(),
            InFlight {
                kind,
                token,
                cancel: cancel.clone(),
            },
        );
        tracing::debug!(instance_id = %instance_id, operation = %kind, "operation started");
        Ok(OperationGuard {
            markers: self.markers.clone(),
            instance_id: instance_id.clone(),
            kind,
            token,
            cancel,
        })
    }

    /// Acquire now, then run `op` as a background task that owns the guard.
    pub fn run_exclusive<T, F, Fut>(
        &self,
        instance_id: &InstanceId,
        kind: OperationKind,
        op: F,
    ) -> Result<OperationTicket<T>>
    where
        T: Send + 'static,
        F: FnOnce(OperationGuard) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let guard = self.acquire(instance_id, kind)?;
        Ok(self.spawn_with(guard, op))
    }

    /// Move an already-held guard into a background task.
    pub fn spawn_with<T, F, Fut>(&self, guard: OperationGuard, op: F) -> OperationTicket<T>
    where
        T: Send + 'static,
        F: FnOnce(OperationGuard) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let instance_id = guard.instance_id.clone();
        let kind = guard.kind;
        let fut = op(guard);
        let id = instance_id.clone();
        let handle = tokio::spawn(async move {
            let res = fut.await;
            if let Err(e) = &res {
                tracing::warn!(instance_id = %id, operation = %kind, error = %e, "operation failed");
            }
            res
        });
        OperationTicket {
            instance_id,
            kind,
            handle,
        }
    }

    pub fn in_flight(&self, instance_id: &InstanceId) -> Option<OperationKind> {
        lock(&self.markers).get(instance_id).map(|m| m.kind)
    }

    /// Signal the in-flight operation to abort; returns its kind if there was one.
    pub fn cancel(&self, instance_id: &InstanceId) -> Option<OperationKind> {
        let markers = lock(&self.markers);
        let m = markers.get(instance_id)?;
        m.cancel.fire();
        tracing::info!(instance_id = %instance_id, operation = %m.kind, "cancellation requested");
        Some(m.kind)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Proof of holding an instance's operation marker.
#[derive(Debug)]
pub struct OperationGuard {
    markers: Markers,
    instance_id: InstanceId,
    kind: OperationKind,
    token: u64,
    cancel: Arc<CancelSignal>,
}

impl OperationGuard {
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.flag.load(Ordering::Relaxed)
    }

    /// Shared flag for blocking work that polls for cancellation.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.flag.clone()
    }

    /// Run `fut` until it finishes or the operation is cancelled, whichever comes first.
    pub async fn run_cancellable<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let mut rx = self.cancel.tx.subscribe();
        let cancelled = async move { rx.wait_for(|c| *c).await.is_ok() };
        tokio::select! {
            biased;
            true = cancelled => Err(AnvilError::Cancelled),
            res = fut => res,
        }
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let mut markers = lock(&self.markers);
        if markers
            .get(&self.instance_id)
            .is_some_and(|m| m.token == self.token)
        {
            markers.remove(&self.instance_id);
            tracing::debug!(instance_id = %self.instance_id, operation = %self.kind, "operation finished");
        }
    }
}

/// Acknowledgement of a background operation.
#[derive(Debug)]
pub struct OperationTicket<T> {
    pub instance_id: InstanceId,
    pub kind: OperationKind,
    handle: JoinHandle<Result<T>>,
}

impl<T> OperationTicket<T> {
    pub async fn wait(self) -> Result<T> {
        match self.handle.await {
            Ok(res) => res,
            Err(e) => Err(anyhow::anyhow!("{} task aborted: {e}", self.kind).into()),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(s: &str) -> InstanceId {
        InstanceId::from(s)
    }

    #[test]
    fn second_acquire_is_rejected_until_release() {
        let s = OperationScheduler::new();
        let g = s.acquire(&id("a"), OperationKind::Backup).unwrap();
        let err = s.acquire(&id("a"), OperationKind::Restore).unwrap_err();
        assert!(matches!(
            err,
            AnvilError::OperationInProgress {
                operation: OperationKind::Backup,
                ..
            }
        ));
        // Other instances are independent.
        let other = s.acquire(&id("b"), OperationKind::Start).unwrap();
        assert_eq!(s.in_flight(&id("a")), Some(OperationKind::Backup));

        drop(g);
        drop(other);
        assert_eq!(s.in_flight(&id("a")), None);
        assert!(s.acquire(&id("a"), OperationKind::Restore).is_ok());
    }

    #[tokio::test]
    async fn marker_is_cleared_on_error_and_panic() {
        let s = OperationScheduler::new();
        let t = s
            .run_exclusive(&id("a"), OperationKind::Install, |_g| async {
                Err::<(), _>(AnvilError::InvalidArgument("boom".to_string()))
            })
            .unwrap();
        assert!(t.wait().await.is_err());
        assert_eq!(s.in_flight(&id("a")), None);

        let t = s
            .run_exclusive(&id("a"), OperationKind::Install, |_g| async {
                if true {
                    panic!("operation panicked");
                }
                Ok::<(), AnvilError>(())
            })
            .unwrap();
        assert!(matches!(t.wait().await, Err(AnvilError::Internal(_))));
        assert_eq!(s.in_flight(&id("a")), None);
    }

    #[tokio::test]
    async fn cancel_aborts_a_pending_operation() {
        let s = OperationScheduler::new();
        let t = s
            .run_exclusive(&id("a"), OperationKind::Backup, |g| async move {
                g.run_cancellable(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(1)
                })
                .await
            })
            .unwrap();
        assert_eq!(t.kind, OperationKind::Backup);
        assert_eq!(s.cancel(&id("a")), Some(OperationKind::Backup));
        assert!(matches!(t.wait().await, Err(AnvilError::Cancelled)));
        assert_eq!(s.in_flight(&id("a")), None);
        assert_eq!(s.cancel(&id("a")), None);
    }

    #[tokio::test]
    async fn cancel_before_await_is_not_lost() {
        let s = OperationScheduler::new();
        let g = s.acquire(&id("a"), OperationKind::Restore).unwrap();
        s.cancel(&id("a"));
        assert!(g.is_cancelled());
        assert!(g.cancel_flag().load(Ordering::Relaxed));
        let res = g.run_cancellable(std::future::pending::<Result<()>>()).await;
        assert!(matches!(res, Err(AnvilError::Cancelled)));
    }

    #[tokio::test]
    async fn completed_operation_returns_its_value() {
        let s = OperationScheduler::new();
        let t = s
            .run_exclusive(&id("a"), OperationKind::CopyWorld, |g| async move {
                g.run_cancellable(async { Ok("done") }).await
            })
            .unwrap();
        assert_eq!(t.wait().await.unwrap(), "done");
    }
}
