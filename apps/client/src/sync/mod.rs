//! Per-feature synchronization: fetch, optimistic mutation, change merge.
//!
//! Every feature owns a [`LiveView`] and one reconciliation task that reads
//! its [`Subscription`]. Features never talk to each other.

pub mod comments;
pub mod feed;
pub mod friends;
pub mod likes;
pub mod notifications;
pub mod optimistic;
pub mod stories;
pub mod thread;

use std::future::Future;
use std::sync::Arc;

use shared_proto::realtime::RowChange;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::api::Backend;
use crate::config::SyncConfig;
use crate::error::AppResult;
use crate::notify::{report, Toaster};
use crate::realtime::{ChangeFeed, Subscription};

/// Ports and settings shared by every feature of one signed-in user.
#[derive(Clone)]
pub struct SyncContext {
    pub backend: Arc<dyn Backend>,
    pub feed: Arc<dyn ChangeFeed>,
    pub toaster: Toaster,
    pub user_id: Uuid,
    pub config: SyncConfig,
}

/// Observable view-state. Writers mutate in place; readers get snapshots.
pub struct LiveView<S> {
    tx: Arc<watch::Sender<S>>,
}

impl<S> Clone for LiveView<S> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<S: Clone> LiveView<S> {
    pub fn new(initial: S) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn update(&self, f: impl FnOnce(&mut S)) {
        self.tx.send_modify(f);
    }

    /// Mutates in place; observers are woken only when `f` returns `true`.
    pub fn update_if(&self, f: impl FnOnce(&mut S) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }

    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.tx.borrow())
    }

    pub fn snapshot(&self) -> S {
        self.tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<S> {
        self.tx.subscribe()
    }
}

/// Outcome of merging one change into view-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    Applied,
    Refetch,
    Ignored,
}

/// Aborts the wrapped task when dropped.
pub struct TaskGuard(JoinHandle<()>);

impl TaskGuard {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self(handle)
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// First fetch of a feature. A failure is reported and the feature starts
/// unloaded; the next change or refresh loads it.
pub(crate) async fn load_initial<F>(
    ctx: &SyncContext,
    component: &'static str,
    title: &str,
    load: F,
) -> bool
where
    F: Future<Output = AppResult<()>>,
{
    match load.await {
        Ok(()) => true,
        Err(err) => {
            report(&ctx.toaster, component, title, &err);
            false
        }
    }
}

/// Runs `merge` on every change and `refetch` whenever merge asks for it.
pub fn spawn_reconcile<M, R, Fut>(
    component: &'static str,
    mut subscription: Subscription,
    mut merge: M,
    refetch: R,
) -> TaskGuard
where
    M: FnMut(RowChange) -> Merge + Send + 'static,
    R: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = AppResult<()>> + Send,
{
    TaskGuard::new(tokio::spawn(async move {
        while let Some(change) = subscription.recv().await {
            let table = change.table.clone();
            match merge(change) {
                Merge::Applied => {
                    tracing::debug!(component, table = %table, "change merged");
                }
                Merge::Refetch => {
                    if let Err(err) = refetch().await {
                        tracing::warn!(component, table = %table, error = %err, "refetch after change failed");
                    }
                }
                Merge::Ignored => {}
            }
        }
        tracing::debug!(component, "change stream closed");
    }))
}
