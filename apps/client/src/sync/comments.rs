use chrono::Utc;
use shared_proto::models::{Comment, Table};
use shared_proto::realtime::{ChangeEvent, ChangeFilter};
use uuid::Uuid;
use validator::Validate;

use super::{load_initial, spawn_reconcile, LiveView, Merge, SyncContext, TaskGuard};
use crate::api::posts;
use crate::error::{AppError, AppResult};
use crate::notify::report;
use crate::validation::CommentDraft;

const COMPONENT: &str = "comments.sync";

#[derive(Debug, Clone, PartialEq)]
pub struct ThreadComment {
    pub comment: Comment,
    /// Shown locally, not yet stored by the backend.
    pub pending: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommentsState {
    pub comments: Vec<ThreadComment>,
    pub loaded: bool,
}

impl CommentsState {
    pub fn contains(&self, id: Uuid) -> bool {
        self.comments.iter().any(|c| c.comment.id == id)
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.comments.iter().position(|c| c.comment.id == id)
    }

    pub fn merge(&mut self, event: ChangeEvent<Comment>) -> Merge {
        match event {
            ChangeEvent::Insert(comment) => {
                if self.contains(comment.id) {
                    return Merge::Ignored;
                }
                self.comments.push(ThreadComment {
                    comment,
                    pending: false,
                });
                Merge::Applied
            }
            ChangeEvent::Update(comment) => match self.position(comment.id) {
                Some(index) => {
                    let entry = &mut self.comments[index].comment;
                    entry.content = comment.content;
                    Merge::Applied
                }
                None => Merge::Ignored,
            },
            ChangeEvent::Delete(row) => match row.id.and_then(|id| self.position(id)) {
                Some(index) => {
                    self.comments.remove(index);
                    Merge::Applied
                }
                None => Merge::Ignored,
            },
        }
    }

    /// Swaps the draft for the stored row, unless the change feed got there
    /// first, in which case the draft is simply dropped.
    fn settle_draft(&mut self, draft_id: Uuid, stored: Comment) {
        let Some(index) = self.position(draft_id) else {
            return;
        };
        if self.contains(stored.id) {
            self.comments.remove(index);
            return;
        }
        let author = self.comments[index].comment.author.clone();
        self.comments[index] = ThreadComment {
            comment: Comment {
                author: stored.author.clone().or(author),
                ..stored
            },
            pending: false,
        };
    }
}

/// Comments of one post.
pub struct CommentThread {
    ctx: SyncContext,
    post_id: Uuid,
    view: LiveView<CommentsState>,
    _reconcile: TaskGuard,
}

impl CommentThread {
    pub async fn start(ctx: SyncContext, post_id: Uuid) -> Self {
        let subscription = ctx
            .feed
            .subscribe(ChangeFilter::table(Comment::NAME).eq("post_id", post_id));

        let view = LiveView::new(CommentsState::default());
        load_initial(
            &ctx,
            COMPONENT,
            "Could not load comments",
            refresh_into(&ctx, post_id, &view),
        )
        .await;

        let merge_view = view.clone();
        let refetch_ctx = ctx.clone();
        let refetch_view = view.clone();
        let reconcile = spawn_reconcile(
            COMPONENT,
            subscription,
            move |change| match change.decode::<Comment>() {
                Ok(_) if !merge_view.read(|s| s.loaded) => Merge::Refetch,
                Ok(event) => {
                    let mut outcome = Merge::Ignored;
                    merge_view.update_if(|state| {
                        outcome = state.merge(event);
                        outcome == Merge::Applied
                    });
                    outcome
                }
                Err(err) => {
                    tracing::warn!(component = COMPONENT, error = %err, "undecodable comment change");
                    Merge::Ignored
                }
            },
            move || {
                let ctx = refetch_ctx.clone();
                let view = refetch_view.clone();
                async move { refresh_into(&ctx, post_id, &view).await }
            },
        );

        Self {
            ctx,
            post_id,
            view,
            _reconcile: reconcile,
        }
    }

    pub fn view(&self) -> LiveView<CommentsState> {
        self.view.clone()
    }

    pub async fn refresh(&self) -> AppResult<()> {
        refresh_into(&self.ctx, self.post_id, &self.view)
            .await
            .map_err(|err| {
                report(&self.ctx.toaster, COMPONENT, "Could not load comments", &err);
                err
            })
    }

    pub async fn add_comment(&self, content: &str) -> AppResult<Comment> {
        let draft = CommentDraft {
            content: content.to_string(),
        };
        if let Err(err) = draft.validate() {
            let err = AppError::from(err);
            report(&self.ctx.toaster, COMPONENT, "Could not add comment", &err);
            return Err(err);
        }

        let draft_id = Uuid::new_v4();
        let local = Comment {
            id: draft_id,
            post_id: self.post_id,
            author_id: self.ctx.user_id,
            content: content.trim().to_string(),
            created_at: Utc::now(),
            author: None,
        };
        self.view.update(|state| {
            state.comments.push(ThreadComment {
                comment: local,
                pending: true,
            })
        });

        match posts::insert_comment(
            self.ctx.backend.as_ref(),
            self.post_id,
            self.ctx.user_id,
            content,
        )
        .await
        {
            Ok(stored) => {
                let confirmed = stored.clone();
                self.view.update(|state| state.settle_draft(draft_id, confirmed));
                tracing::debug!(component = COMPONENT, comment_id = %stored.id, "comment stored");
                Ok(stored)
            }
            Err(err) => {
                self.view.update_if(|state| match state.position(draft_id) {
                    Some(index) => {
                        state.comments.remove(index);
                        true
                    }
                    None => false,
                });
                report(&self.ctx.toaster, COMPONENT, "Could not add comment", &err);
                Err(err)
            }
        }
    }

    /// Author-only; removed at once and restored if the backend refuses.
    pub async fn delete_comment(&self, comment_id: Uuid) -> AppResult<()> {
        let mut removed = None;
        let owned = self.view.read(|state| {
            state
                .comments
                .iter()
                .find(|c| c.comment.id == comment_id)
                .map(|c| c.comment.author_id == self.ctx.user_id && !c.pending)
        });
        if owned != Some(true) {
            let err = AppError::validation("Only the author can delete this comment");
            report(&self.ctx.toaster, COMPONENT, "Could not delete comment", &err);
            return Err(err);
        }

        self.view.update_if(|state| match state.position(comment_id) {
            Some(index) => {
                removed = Some((index, state.comments.remove(index)));
                true
            }
            None => false,
        });

        if let Err(err) = posts::delete_comment(self.ctx.backend.as_ref(), comment_id).await {
            if let Some((index, entry)) = removed {
                self.view.update_if(|state| {
                    if state.contains(comment_id) {
                        return false;
                    }
                    let index = index.min(state.comments.len());
                    state.comments.insert(index, entry);
                    true
                });
            }
            report(&self.ctx.toaster, COMPONENT, "Could not delete comment", &err);
            return Err(err);
        }
        Ok(())
    }
}

async fn refresh_into(
    ctx: &SyncContext,
    post_id: Uuid,
    view: &LiveView<CommentsState>,
) -> AppResult<()> {
    let comments = posts::fetch_comments(ctx.backend.as_ref(), post_id).await?;
    view.update(|state| {
        // Drafts still waiting on the backend survive a refetch.
        let drafts = state
            .comments
            .drain(..)
            .filter(|c| c.pending)
            .collect::<Vec<_>>();
        state.comments = comments
            .into_iter()
            .map(|comment| ThreadComment {
                comment,
                pending: false,
            })
            .collect();
        state.comments.extend(drafts);
        state.loaded = true;
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Backend;
    use crate::testing::{context, settle, wait_for, ManualFeed, MemoryBackend};
    use serde_json::json;
    use shared_proto::realtime::RowChange;
    use std::sync::Arc;

    fn post_id(backend: &MemoryBackend) -> Uuid {
        let row = backend.seed(
            "posts",
            json!({ "author_id": Uuid::new_v4(), "content": "p", "visibility": "public" }),
        );
        serde_json::from_value(row["id"].clone()).expect("id")
    }

    #[tokio::test]
    async fn loads_oldest_first_for_one_post() {
        let backend = Arc::new(MemoryBackend::new());
        let (post, other) = (post_id(&backend), post_id(&backend));
        let ana = Uuid::new_v4();
        backend.seed("comments", json!({ "post_id": post, "author_id": ana, "content": "first" }));
        backend.seed("comments", json!({ "post_id": other, "author_id": ana, "content": "elsewhere" }));
        backend.seed("comments", json!({ "post_id": post, "author_id": ana, "content": "second" }));

        let thread = CommentThread::start(context(backend, ManualFeed::new(), Uuid::new_v4()), post).await;
        let contents = thread.view().read(|s| {
            s.comments
                .iter()
                .map(|c| c.comment.content.clone())
                .collect::<Vec<_>>()
        });
        assert_eq!(contents, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn change_reloads_thread_that_started_offline() {
        let backend = Arc::new(MemoryBackend::new());
        let changes = ManualFeed::new();
        let post = post_id(&backend);
        let author = Uuid::new_v4();
        backend.seed("comments", json!({ "post_id": post, "author_id": author, "content": "old" }));
        backend.set_offline(true);

        let ctx = context(backend.clone(), changes.clone(), Uuid::new_v4());
        let thread = CommentThread::start(ctx, post).await;
        assert!(!thread.view().read(|s| s.loaded));

        backend.set_offline(false);
        let row = backend.seed(
            "comments",
            json!({ "post_id": post, "author_id": author, "content": "new" }),
        );
        changes.publish(RowChange::insert("comments", &row).expect("change"));

        let state = wait_for(&thread.view(), |s| s.loaded).await;
        let contents = state
            .comments
            .iter()
            .map(|c| c.comment.content.as_str())
            .collect::<Vec<_>>();
        assert_eq!(contents, vec!["old", "new"]);
    }

    #[tokio::test]
    async fn own_comment_appears_once_despite_echo() {
        let backend = Arc::new(MemoryBackend::new());
        let changes = ManualFeed::new();
        backend.echo_to(changes.clone());
        let post = post_id(&backend);
        let me = Uuid::new_v4();

        let thread = CommentThread::start(context(backend.clone(), changes, me), post).await;
        let stored = thread.add_comment("  nice shot ").await.expect("add");
        settle().await;

        let state = thread.view().snapshot();
        assert_eq!(state.comments.len(), 1);
        assert_eq!(state.comments[0].comment.id, stored.id);
        assert_eq!(state.comments[0].comment.content, "nice shot");
        assert!(!state.comments[0].pending);
    }

    #[tokio::test]
    async fn failed_comment_removes_draft() {
        let backend = Arc::new(MemoryBackend::new());
        let post = post_id(&backend);
        let thread = CommentThread::start(context(backend.clone(), ManualFeed::new(), Uuid::new_v4()), post).await;

        backend.fail("insert", "comments");
        assert!(thread.add_comment("lost").await.is_err());
        assert!(thread.view().read(|s| s.comments.is_empty()));
    }

    #[tokio::test]
    async fn blank_comment_never_reaches_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let post = post_id(&backend);
        let thread = CommentThread::start(context(backend.clone(), ManualFeed::new(), Uuid::new_v4()), post).await;

        assert!(thread.add_comment("   ").await.is_err());
        assert_eq!(backend.calls("insert", "comments"), 0);
    }

    #[tokio::test]
    async fn foreign_insert_and_delete_are_merged() {
        let backend = Arc::new(MemoryBackend::new());
        let changes = ManualFeed::new();
        backend.echo_to(changes.clone());
        let post = post_id(&backend);
        let thread = CommentThread::start(context(backend.clone(), changes, Uuid::new_v4()), post).await;
        let view = thread.view();

        let row = backend
            .insert("comments", json!({ "post_id": post, "author_id": Uuid::new_v4(), "content": "hey" }))
            .await
            .expect("insert");
        wait_for(&view, |s| s.comments.len() == 1).await;

        backend
            .delete(
                "comments",
                &crate::api::query::Query::new().eq("id", row["id"].as_str().expect("id")),
            )
            .await
            .expect("delete");
        wait_for(&view, |s| s.comments.is_empty()).await;
    }

    #[tokio::test]
    async fn only_author_deletes() {
        let backend = Arc::new(MemoryBackend::new());
        let post = post_id(&backend);
        let me = Uuid::new_v4();
        let theirs = backend.seed(
            "comments",
            json!({ "post_id": post, "author_id": Uuid::new_v4(), "content": "not mine" }),
        );
        let thread = CommentThread::start(context(backend.clone(), ManualFeed::new(), me), post).await;

        let id: Uuid = serde_json::from_value(theirs["id"].clone()).expect("id");
        assert!(thread.delete_comment(id).await.is_err());
        assert_eq!(backend.calls("delete", "comments"), 0);

        let mine = thread.add_comment("mine").await.expect("add");
        thread.delete_comment(mine.id).await.expect("delete own");
        assert!(!thread.view().read(|s| s.contains(mine.id)));
    }
}
