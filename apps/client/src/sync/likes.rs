//! Debounced like toggling on top of the feed view.
//!
//! A toggle shows immediately and restarts the post's timer. When the timer
//! fires, at most one insert or delete is sent, and only if the shown state
//! differs from the last confirmed one.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::feed::FeedState;
use super::optimistic::Optimistic;
use super::{LiveView, SyncContext};
use crate::api::posts;
use crate::error::{AppError, AppResult};
use crate::notify::report;

const COMPONENT: &str = "feed.likes";

struct Slot {
    liked: Optimistic<bool>,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    ctx: SyncContext,
    view: LiveView<FeedState>,
    slots: Mutex<HashMap<Uuid, Slot>>,
}

#[derive(Clone)]
pub struct LikeToggler {
    inner: Arc<Inner>,
}

impl LikeToggler {
    pub fn new(ctx: SyncContext, view: LiveView<FeedState>) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                view,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Flips the like on `post_id` and returns the new shown state.
    pub async fn toggle(&self, post_id: Uuid) -> AppResult<bool> {
        let inner = &self.inner;
        let mut slots = inner.slots.lock().await;

        let shown = inner
            .view
            .read(|state| state.get(post_id).map(|p| p.liked_by_me));
        let Some(shown) = shown else {
            let err = AppError::validation("Post not found");
            report(&inner.ctx.toaster, COMPONENT, "Could not update like", &err);
            return Err(err);
        };

        let slot = slots.entry(post_id).or_insert_with(|| Slot {
            liked: Optimistic::new(shown),
            timer: None,
        });
        let next = !*slot.liked.current();
        slot.liked.apply(next);
        inner.show(post_id, next);

        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        let task = self.inner.clone();
        slot.timer = Some(tokio::spawn(async move { task.on_timer(post_id).await }));

        Ok(next)
    }

    /// Posts with a toggle not yet confirmed by the backend.
    pub async fn pending(&self) -> usize {
        self.inner.slots.lock().await.len()
    }
}

impl Inner {
    /// Writes `liked` into the view, moving the counter with it.
    fn show(&self, post_id: Uuid, liked: bool) {
        self.view.update_if(|state| {
            let Some(entry) = state.get_mut(post_id) else {
                return false;
            };
            if entry.liked_by_me == liked {
                return false;
            }
            entry.liked_by_me = liked;
            entry.like_count = if liked {
                entry.like_count.saturating_add(1)
            } else {
                entry.like_count.saturating_sub(1)
            };
            true
        });
    }

    async fn on_timer(self: Arc<Self>, post_id: Uuid) {
        tokio::time::sleep(self.ctx.config.like_debounce).await;

        let target = {
            let mut slots = self.slots.lock().await;
            let Some(slot) = slots.get_mut(&post_id) else {
                return;
            };
            slot.timer = None;
            if slot.liked.is_flushing() {
                // The call in flight re-checks when it completes.
                return;
            }
            match slot.liked.begin_flush() {
                Some(target) => target,
                None => {
                    tracing::debug!(component = COMPONENT, post_id = %post_id, "toggles cancelled out");
                    slots.remove(&post_id);
                    return;
                }
            }
        };

        self.persist(post_id, target).await;
    }

    async fn persist(&self, post_id: Uuid, mut target: bool) {
        let me = self.ctx.user_id;
        loop {
            let backend = self.ctx.backend.as_ref();
            let result = if target {
                posts::insert_like(backend, me, post_id).await.map(|_| ())
            } else {
                posts::delete_like(backend, me, post_id).await
            };

            let mut slots = self.slots.lock().await;
            let Some(slot) = slots.get_mut(&post_id) else {
                return;
            };

            match result {
                Ok(()) => {
                    slot.liked.confirm();
                    tracing::debug!(component = COMPONENT, post_id = %post_id, liked = target, "like persisted");
                    if slot.timer.is_some() {
                        return;
                    }
                    match slot.liked.begin_flush() {
                        Some(next) => target = next,
                        None => {
                            slots.remove(&post_id);
                            return;
                        }
                    }
                }
                Err(err) => {
                    let restored = *slot.liked.confirmed();
                    slot.liked.compensate();
                    if let Some(timer) = slot.timer.take() {
                        timer.abort();
                    }
                    slots.remove(&post_id);
                    drop(slots);

                    self.show(post_id, restored);
                    report(&self.ctx.toaster, COMPONENT, "Could not update like", &err);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ToastVariant;
    use crate::sync::feed::FeedSync;
    use crate::testing::{context, settle, ManualFeed, MemoryBackend};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        backend: Arc<MemoryBackend>,
        feed: FeedSync,
        post_id: Uuid,
    }

    async fn fixture(existing_likes: usize) -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let (me, ana) = (Uuid::new_v4(), Uuid::new_v4());
        let row = backend.seed(
            "posts",
            json!({ "author_id": ana, "content": "like me", "visibility": "public" }),
        );
        let post_id: Uuid = serde_json::from_value(row["id"].clone()).expect("id");
        for _ in 0..existing_likes {
            backend.seed("likes", json!({ "user_id": Uuid::new_v4(), "post_id": post_id }));
        }

        let feed = FeedSync::start(context(backend.clone(), ManualFeed::new(), me)).await;
        Fixture {
            backend,
            feed,
            post_id,
        }
    }

    fn shown(fx: &Fixture) -> (bool, u32) {
        fx.feed.view().read(|s| {
            let p = s.get(fx.post_id).expect("post");
            (p.liked_by_me, p.like_count)
        })
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_toggles_collapse_into_one_call() {
        let fx = fixture(0).await;
        let likes = fx.feed.likes();

        likes.toggle(fx.post_id).await.expect("toggle");
        tokio::time::sleep(Duration::from_millis(100)).await;
        likes.toggle(fx.post_id).await.expect("toggle");
        tokio::time::sleep(Duration::from_millis(100)).await;
        likes.toggle(fx.post_id).await.expect("toggle");

        assert_eq!(shown(&fx), (true, 1));
        assert_eq!(fx.backend.calls("insert", "likes"), 0);

        tokio::time::sleep(Duration::from_millis(350)).await;
        settle().await;

        assert_eq!(fx.backend.calls("insert", "likes"), 1);
        assert_eq!(fx.backend.calls("delete", "likes"), 0);
        assert_eq!(fx.backend.rows("likes").len(), 1);
        assert_eq!(likes.pending().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn toggling_back_to_baseline_sends_nothing() {
        let fx = fixture(3).await;
        let likes = fx.feed.likes();

        likes.toggle(fx.post_id).await.expect("toggle");
        likes.toggle(fx.post_id).await.expect("toggle");
        assert_eq!(shown(&fx), (false, 3));

        tokio::time::sleep(Duration::from_millis(350)).await;
        settle().await;

        assert_eq!(fx.backend.calls("insert", "likes"), 0);
        assert_eq!(fx.backend.calls("delete", "likes"), 0);
        assert_eq!(likes.pending().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_persist_restores_count_and_flag() {
        let fx = fixture(2).await;
        let likes = fx.feed.likes();
        let mut toasts = fx.feed_toasts();
        fx.backend.fail("insert", "likes");

        likes.toggle(fx.post_id).await.expect("toggle");
        assert_eq!(shown(&fx), (true, 3));

        tokio::time::sleep(Duration::from_millis(350)).await;
        settle().await;

        assert_eq!(fx.backend.calls("insert", "likes"), 1);
        assert_eq!(shown(&fx), (false, 2));
        let toast = toasts.recv().await.expect("toast");
        assert_eq!(toast.variant, ToastVariant::Destructive);
        assert_eq!(toast.title, "Could not update like");
    }

    #[tokio::test(start_paused = true)]
    async fn unlike_after_confirmed_like_deletes() {
        let fx = fixture(0).await;
        let likes = fx.feed.likes();

        likes.toggle(fx.post_id).await.expect("like");
        tokio::time::sleep(Duration::from_millis(350)).await;
        settle().await;
        assert_eq!(fx.backend.rows("likes").len(), 1);

        likes.toggle(fx.post_id).await.expect("unlike");
        tokio::time::sleep(Duration::from_millis(350)).await;
        settle().await;

        assert_eq!(fx.backend.calls("delete", "likes"), 1);
        assert!(fx.backend.rows("likes").is_empty());
        assert_eq!(shown(&fx), (false, 0));
    }

    impl Fixture {
        fn feed_toasts(&self) -> tokio::sync::broadcast::Receiver<crate::notify::Toast> {
            self.feed.toaster().subscribe()
        }
    }
}
