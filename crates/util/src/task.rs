use std::future::Future;
use std::panic::Location;
use std::sync::{Arc, LazyLock};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub trait FutureOutputExt {
    fn cancelled() -> Self;
}

impl FutureOutputExt for () {
    fn cancelled() -> Self {}
}

impl<T> FutureOutputExt for anyhow::Result<T> {
    fn cancelled() -> Self {
        Err(anyhow::anyhow!("Cancelled due to graceful shutdown"))
    }
}

/// Spawns a future on the `tokio` runtime through a
/// [`tokio_util::task::TaskTracker`]. This ensures that upon graceful shutdown
/// the future will have already completed or will be cancelled in an orderly
/// fashion.
#[track_caller]
pub fn spawn<F>(future: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: FutureOutputExt + Send + 'static,
{
    let Handle {
        task_tracker,
        cancellation_token,
        registry,
    } = HANDLE.clone();

    spawn_tracked(
        &task_tracker,
        cancellation_token,
        registry,
        format!("spawn {}", Location::caller()),
        future,
    )
}

fn spawn_tracked<F>(
    task_tracker: &TaskTracker,
    cancellation_token: CancellationToken,
    registry: Arc<dashmap::DashSet<String>>,
    key: String,
    future: F,
) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: FutureOutputExt + Send + 'static,
{
    registry.insert(key.clone());

    task_tracker.spawn(async move {
        let x = tokio::select! {
            _ = cancellation_token.cancelled() => {
                F::Output::cancelled()
            }
            res = future => {
                res
            }
        };

        registry.remove(&key);

        x
    })
}

/// Returns a [`CancellationToken`] that can be used to check for graceful
/// shutdown.
pub fn cancellation_token() -> CancellationToken {
    HANDLE.clone().cancellation_token
}

pub mod tracker {
    use super::*;

    /// Close the task tracker and then **cancel all tracked futures**. See
    /// [`TaskTracker::close`] and [`CancellationToken::cancel`].
    pub fn close() {
        let Handle {
            task_tracker,
            cancellation_token,
            ..
        } = HANDLE.clone();
        task_tracker.close();
        cancellation_token.cancel();
    }

    /// Wait until task tracker is both closed and empty. See
    /// [`TaskTracker::wait`].
    pub async fn wait() {
        let Handle { task_tracker, .. } = HANDLE.clone();
        task_tracker.wait().await;
    }

    /// Logs the tasks that are still running, useful when shutdown hangs.
    pub fn log_registry() {
        let Handle { registry, .. } = HANDLE.clone();
        tracing::warn!("running tasks: {:#?}", registry);
    }
}

/// A group of tasks that live and die together, such as the routines serving
/// one peer.
///
/// The group's token is a child of the global shutdown token, so the group is
/// also cancelled on graceful shutdown. Cancelling the group never affects
/// anything outside of it.
#[derive(Clone)]
pub struct TaskGroup {
    name: Arc<str>,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl TaskGroup {
    /// Must be called from within a `tokio` runtime.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        let group = Self {
            name: name.into(),
            tracker: TaskTracker::new(),
            token: HANDLE.cancellation_token.child_token(),
        };
        // Keep graceful shutdown waiting for the tasks of the group.
        let (tracker, token) = (group.tracker.clone(), group.token.clone());
        HANDLE.task_tracker.spawn(async move {
            token.cancelled().await;
            tracker.close();
            tracker.wait().await;
        });
        group
    }

    /// Spawns a task that is dropped at its next await point once the group
    /// is cancelled.
    #[track_caller]
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: FutureOutputExt + Send + 'static,
    {
        let key = format!("{} {}", self.name, Location::caller());
        spawn_tracked(
            &self.tracker,
            self.token.clone(),
            HANDLE.registry.clone(),
            key,
            future,
        )
    }

    /// Spawns a task that is never dropped by cancellation. It must watch
    /// [`TaskGroup::token`] itself and return at a point where stopping is
    /// safe. The group's [`wait`](TaskGroup::wait) still waits for it.
    #[track_caller]
    pub fn spawn_cooperative<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let key = format!("{} {}", self.name, Location::caller());
        let registry = HANDLE.registry.clone();
        registry.insert(key.clone());
        self.tracker.spawn(async move {
            let output = future.await;
            registry.remove(&key);
            output
        })
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancels every task of the group. Calling it more than once has no
    /// further effect.
    pub fn cancel(&self) {
        self.tracker.close();
        self.token.cancel();
    }

    /// Waits until the group is cancelled and all its tasks have finished.
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }
}

#[derive(Clone)]
struct Handle {
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
    registry: Arc<dashmap::DashSet<String>>,
}

static HANDLE: LazyLock<Handle> = LazyLock::new(|| Handle {
    task_tracker: TaskTracker::new(),
    cancellation_token: CancellationToken::new(),
    registry: Arc::new(dashmap::DashSet::new()),
});

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn cancelling_a_group_stops_only_its_tasks() {
        let group = TaskGroup::new("peer-a");
        let other = TaskGroup::new("peer-b");

        let cancelled = group.spawn(async {
            std::future::pending::<()>().await;
        });
        let survivor = other.spawn(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            anyhow::Ok(7)
        });

        group.cancel();
        group.wait().await;
        cancelled.await.unwrap();
        assert!(group.is_cancelled());

        assert_eq!(survivor.await.unwrap().unwrap(), 7);
        assert!(!other.is_cancelled());
    }

    #[tokio::test]
    async fn cooperative_tasks_finish_their_work_after_cancel() {
        let group = TaskGroup::new("state-machine");
        let token = group.token().clone();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let task = group.spawn_cooperative(async move {
            started_tx.send(()).unwrap();
            // A unit of work spanning an await, cancelled half way through.
            tokio::time::sleep(Duration::from_millis(50)).await;
            let finished = true;
            token.cancelled().await;
            finished
        });

        started_rx.await.unwrap();
        group.cancel();
        group.wait().await;
        assert!(task.await.unwrap());
    }
}
