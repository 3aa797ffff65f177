use std::collections::HashMap;

use shared_proto::models::{Comment, Like, Post, Table, Visibility};
use shared_proto::realtime::{ChangeEvent, ChangeFilter, EventFilter, RowChange};
use uuid::Uuid;

use super::likes::LikeToggler;
use super::{load_initial, spawn_reconcile, LiveView, Merge, SyncContext, TaskGuard};
use crate::api::posts;
use crate::error::{AppError, AppResult};
use crate::notify::{report, Toaster};
use crate::realtime::Subscription;
use crate::validation::{validate_post_content, MediaUpload};

const COMPONENT: &str = "feed.sync";

#[derive(Debug, Clone, PartialEq)]
pub struct FeedPost {
    pub post: Post,
    pub like_count: u32,
    pub comment_count: u32,
    pub liked_by_me: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedState {
    pub posts: Vec<FeedPost>,
    pub loaded: bool,
}

impl FeedState {
    pub fn get(&self, post_id: Uuid) -> Option<&FeedPost> {
        self.posts.iter().find(|p| p.post.id == post_id)
    }

    pub fn get_mut(&mut self, post_id: Uuid) -> Option<&mut FeedPost> {
        self.posts.iter_mut().find(|p| p.post.id == post_id)
    }

    fn position(&self, post_id: Uuid) -> Option<usize> {
        self.posts.iter().position(|p| p.post.id == post_id)
    }

    /// Puts `post` at the top, or refreshes it in place when already known.
    fn upsert_post(&mut self, post: Post) {
        match self.get_mut(post.id) {
            Some(existing) => existing.post = keep_author(post, &existing.post),
            None => self.posts.insert(
                0,
                FeedPost {
                    post,
                    like_count: 0,
                    comment_count: 0,
                    liked_by_me: false,
                },
            ),
        }
    }

    pub fn merge_post(&mut self, event: ChangeEvent<Post>) -> Merge {
        match event {
            ChangeEvent::Insert(post) => {
                if self.get(post.id).is_some() {
                    return Merge::Ignored;
                }
                self.upsert_post(post);
                Merge::Applied
            }
            ChangeEvent::Update(post) => match self.get_mut(post.id) {
                Some(existing) => {
                    existing.post = keep_author(post, &existing.post);
                    Merge::Applied
                }
                None => Merge::Ignored,
            },
            ChangeEvent::Delete(row) => {
                let Some(id) = row.id else {
                    return Merge::Refetch;
                };
                match self.position(id) {
                    Some(index) => {
                        self.posts.remove(index);
                        Merge::Applied
                    }
                    None => Merge::Ignored,
                }
            }
        }
    }

    /// Like changes by `me` are ignored; the like toggler already showed them.
    pub fn merge_like(&mut self, me: Uuid, event: ChangeEvent<Like>) -> Merge {
        let (post_id, user_id, delta) = match event {
            ChangeEvent::Insert(like) => (like.post_id, Some(like.user_id), 1i64),
            ChangeEvent::Update(_) => return Merge::Ignored,
            ChangeEvent::Delete(row) => match row.uuid_field("post_id") {
                Some(post_id) => (post_id, row.uuid_field("user_id"), -1),
                None => return Merge::Refetch,
            },
        };
        match user_id {
            Some(user) if user == me => return Merge::Ignored,
            Some(_) => {}
            // A delete without the row image cannot be attributed.
            None => return Merge::Refetch,
        }
        match self.get_mut(post_id) {
            Some(entry) => {
                entry.like_count = shift(entry.like_count, delta);
                Merge::Applied
            }
            None => Merge::Ignored,
        }
    }

    pub fn merge_comment(&mut self, event: ChangeEvent<Comment>) -> Merge {
        let (post_id, delta) = match event {
            ChangeEvent::Insert(comment) => (comment.post_id, 1i64),
            ChangeEvent::Update(_) => return Merge::Ignored,
            ChangeEvent::Delete(row) => match row.uuid_field("post_id") {
                Some(post_id) => (post_id, -1),
                None => return Merge::Refetch,
            },
        };
        match self.get_mut(post_id) {
            Some(entry) => {
                entry.comment_count = shift(entry.comment_count, delta);
                Merge::Applied
            }
            None => Merge::Ignored,
        }
    }
}

fn shift(count: u32, delta: i64) -> u32 {
    (count as i64 + delta).clamp(0, u32::MAX as i64) as u32
}

/// Change rows never carry the joined author; keep the one already loaded.
fn keep_author(mut post: Post, previous: &Post) -> Post {
    if post.author.is_none() {
        post.author = previous.author.clone();
    }
    post
}

pub struct PostDraft {
    pub content: String,
    pub media: Option<MediaUpload>,
    pub visibility: Visibility,
}

/// The post feed of one signed-in user.
pub struct FeedSync {
    ctx: SyncContext,
    view: LiveView<FeedState>,
    likes: LikeToggler,
    _reconcile: TaskGuard,
}

impl FeedSync {
    /// Subscribes, loads the first page and starts merging changes. A failed
    /// first load leaves the feed unloaded until the next change or refresh.
    pub async fn start(ctx: SyncContext) -> Self {
        let subscription = Subscription::merge(vec![
            ctx.feed.subscribe(ChangeFilter::table(Post::NAME)),
            ctx.feed.subscribe(ChangeFilter::table(Like::NAME)),
            ctx.feed
                .subscribe(ChangeFilter::table(Comment::NAME).event(EventFilter::Insert)),
            ctx.feed
                .subscribe(ChangeFilter::table(Comment::NAME).event(EventFilter::Delete)),
        ]);

        let view = LiveView::new(FeedState::default());
        load_initial(&ctx, COMPONENT, "Could not load posts", refresh_into(&ctx, &view)).await;

        let me = ctx.user_id;
        let merge_view = view.clone();
        let refetch_ctx = ctx.clone();
        let refetch_view = view.clone();
        let reconcile = spawn_reconcile(
            COMPONENT,
            subscription,
            move |change| {
                if !merge_view.read(|s| s.loaded) {
                    return Merge::Refetch;
                }
                merge_change(&merge_view, me, change)
            },
            move || {
                let ctx = refetch_ctx.clone();
                let view = refetch_view.clone();
                async move { refresh_into(&ctx, &view).await }
            },
        );

        Self {
            likes: LikeToggler::new(ctx.clone(), view.clone()),
            ctx,
            view,
            _reconcile: reconcile,
        }
    }

    pub fn view(&self) -> LiveView<FeedState> {
        self.view.clone()
    }

    pub fn likes(&self) -> &LikeToggler {
        &self.likes
    }

    pub fn toaster(&self) -> &Toaster {
        &self.ctx.toaster
    }

    pub async fn refresh(&self) -> AppResult<()> {
        refresh_into(&self.ctx, &self.view).await.map_err(|err| {
            report(&self.ctx.toaster, COMPONENT, "Could not load posts", &err);
            err
        })
    }

    pub async fn create_post(&self, draft: PostDraft) -> AppResult<Post> {
        let result = self.try_create_post(draft).await;
        if let Err(err) = &result {
            report(&self.ctx.toaster, COMPONENT, "Could not create post", err);
        }
        result
    }

    async fn try_create_post(&self, draft: PostDraft) -> AppResult<Post> {
        validate_post_content(&draft.content, draft.media.is_some())?;
        if let Some(media) = &draft.media {
            media.validate()?;
        }

        let backend = self.ctx.backend.as_ref();
        let media = match &draft.media {
            Some(upload) => Some(posts::upload_post_media(backend, self.ctx.user_id, upload).await?),
            None => None,
        };
        let post =
            posts::insert_post(backend, self.ctx.user_id, &draft.content, media, draft.visibility)
                .await?;

        tracing::info!(component = COMPONENT, post_id = %post.id, "post created");
        let stored = post.clone();
        self.view.update(|state| state.upsert_post(stored));
        Ok(post)
    }

    pub async fn update_post(
        &self,
        post_id: Uuid,
        content: &str,
        visibility: Visibility,
    ) -> AppResult<Post> {
        let result = self.try_update_post(post_id, content, visibility).await;
        if let Err(err) = &result {
            report(&self.ctx.toaster, COMPONENT, "Could not update post", err);
        }
        result
    }

    async fn try_update_post(
        &self,
        post_id: Uuid,
        content: &str,
        visibility: Visibility,
    ) -> AppResult<Post> {
        self.ensure_author(post_id)?;
        let has_media = self.view.read(|state| {
            state
                .get(post_id)
                .map(|p| p.post.image_url.is_some() || p.post.video_url.is_some())
                .unwrap_or(false)
        });
        validate_post_content(content, has_media)?;

        let post =
            posts::update_post_content(self.ctx.backend.as_ref(), post_id, content, visibility)
                .await?;
        let stored = post.clone();
        self.view.update(|state| state.upsert_post(stored));
        Ok(post)
    }

    /// Removes the post at once and puts it back if the backend refuses.
    pub async fn delete_post(&self, post_id: Uuid) -> AppResult<()> {
        if let Err(err) = self.ensure_author(post_id) {
            report(&self.ctx.toaster, COMPONENT, "Could not delete post", &err);
            return Err(err);
        }

        let mut removed = None;
        self.view.update_if(|state| match state.position(post_id) {
            Some(index) => {
                removed = Some((index, state.posts.remove(index)));
                true
            }
            None => false,
        });

        if let Err(err) = posts::delete_post(self.ctx.backend.as_ref(), post_id).await {
            if let Some((index, entry)) = removed {
                self.view.update_if(|state| {
                    if state.get(post_id).is_some() {
                        return false;
                    }
                    let index = index.min(state.posts.len());
                    state.posts.insert(index, entry);
                    true
                });
            }
            report(&self.ctx.toaster, COMPONENT, "Could not delete post", &err);
            return Err(err);
        }

        tracing::info!(component = COMPONENT, post_id = %post_id, "post deleted");
        Ok(())
    }

    fn ensure_author(&self, post_id: Uuid) -> AppResult<()> {
        let author = self.view.read(|state| state.get(post_id).map(|p| p.post.author_id));
        match author {
            Some(author) if author == self.ctx.user_id => Ok(()),
            Some(_) => Err(AppError::validation("Only the author can change this post")),
            None => Err(AppError::validation("Post not found")),
        }
    }
}

fn merge_change(view: &LiveView<FeedState>, me: Uuid, change: RowChange) -> Merge {
    let mut outcome = Merge::Ignored;
    let decoded = match change.table.as_str() {
        Post::NAME => change.decode::<Post>().map(|event| {
            view.update_if(|state| {
                outcome = state.merge_post(event);
                outcome == Merge::Applied
            });
        }),
        Like::NAME => change.decode::<Like>().map(|event| {
            view.update_if(|state| {
                outcome = state.merge_like(me, event);
                outcome == Merge::Applied
            });
        }),
        Comment::NAME => change.decode::<Comment>().map(|event| {
            view.update_if(|state| {
                outcome = state.merge_comment(event);
                outcome == Merge::Applied
            });
        }),
        _ => Ok(()),
    };
    if let Err(err) = decoded {
        tracing::warn!(component = COMPONENT, table = %change.table, error = %err, "undecodable change");
    }
    outcome
}

async fn refresh_into(ctx: &SyncContext, view: &LiveView<FeedState>) -> AppResult<()> {
    let posts = load(ctx).await?;
    tracing::debug!(component = COMPONENT, count = posts.len(), "feed loaded");
    view.update(|state| {
        state.posts = posts;
        state.loaded = true;
    });
    Ok(())
}

async fn load(ctx: &SyncContext) -> AppResult<Vec<FeedPost>> {
    let backend = ctx.backend.as_ref();
    let posts = posts::fetch_feed(backend, ctx.config.feed_page_size).await?;
    let ids = posts.iter().map(|p| p.id).collect::<Vec<_>>();
    let likes = posts::fetch_likes_for(backend, &ids).await?;
    let comments = posts::fetch_comments_for(backend, &ids).await?;

    let mut like_counts: HashMap<Uuid, u32> = HashMap::new();
    let mut mine: HashMap<Uuid, bool> = HashMap::new();
    for like in &likes {
        *like_counts.entry(like.post_id).or_default() += 1;
        if like.user_id == ctx.user_id {
            mine.insert(like.post_id, true);
        }
    }
    let mut comment_counts: HashMap<Uuid, u32> = HashMap::new();
    for comment in &comments {
        *comment_counts.entry(comment.post_id).or_default() += 1;
    }

    Ok(posts
        .into_iter()
        .map(|post| FeedPost {
            like_count: like_counts.get(&post.id).copied().unwrap_or(0),
            comment_count: comment_counts.get(&post.id).copied().unwrap_or(0),
            liked_by_me: mine.get(&post.id).copied().unwrap_or(false),
            post,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Backend;
    use crate::notify::ToastVariant;
    use crate::testing::{context, settle, wait_for, ManualFeed, MemoryBackend};
    use serde_json::json;
    use std::sync::Arc;

    fn seed_post(backend: &MemoryBackend, author: Uuid, content: &str) -> Uuid {
        let row = backend.seed(
            "posts",
            json!({ "author_id": author, "content": content, "visibility": "public" }),
        );
        serde_json::from_value(row["id"].clone()).expect("id")
    }

    #[tokio::test]
    async fn unreachable_first_load_recovers_on_next_change() {
        let backend = Arc::new(MemoryBackend::new());
        let changes = ManualFeed::new();
        let ana = Uuid::new_v4();
        seed_post(&backend, ana, "written while we were away");
        backend.set_offline(true);
        let ctx = context(backend.clone(), changes.clone(), Uuid::new_v4());
        let mut toasts = ctx.toaster.subscribe();

        let feed = FeedSync::start(ctx).await;
        assert!(!feed.view().read(|s| s.loaded));
        assert_eq!(toasts.recv().await.expect("toast").variant, ToastVariant::Destructive);

        backend.set_offline(false);
        let row = backend.seed(
            "posts",
            json!({ "author_id": ana, "content": "fresh", "visibility": "public" }),
        );
        changes.publish(RowChange::insert("posts", &row).expect("change"));

        let state = wait_for(&feed.view(), |s| s.loaded).await;
        assert_eq!(state.posts.len(), 2);
        assert_eq!(state.posts[0].post.content, "fresh");
    }

    #[tokio::test]
    async fn dropping_the_feed_releases_its_subscriptions() {
        let changes = ManualFeed::new();
        let feed = FeedSync::start(context(
            Arc::new(MemoryBackend::new()),
            changes.clone(),
            Uuid::new_v4(),
        ))
        .await;
        assert_eq!(changes.live_subscriptions(), 4);

        drop(feed);
        settle().await;
        assert_eq!(changes.live_subscriptions(), 0);
    }

    #[tokio::test]
    async fn start_loads_newest_first_with_counts() {
        let backend = Arc::new(MemoryBackend::new());
        let (me, ana) = (Uuid::new_v4(), Uuid::new_v4());
        let older = seed_post(&backend, ana, "older");
        let newer = seed_post(&backend, ana, "newer");
        backend.seed("likes", json!({ "user_id": me, "post_id": older }));
        backend.seed("likes", json!({ "user_id": ana, "post_id": older }));
        backend.seed("comments", json!({ "post_id": newer, "author_id": ana, "content": "hey" }));

        let feed = FeedSync::start(context(backend, ManualFeed::new(), me)).await;
        let state = feed.view().snapshot();

        assert!(state.loaded);
        assert_eq!(state.posts[0].post.id, newer);
        assert_eq!(state.posts[0].comment_count, 1);
        let first = state.get(older).expect("older");
        assert_eq!(first.like_count, 2);
        assert!(first.liked_by_me);
    }

    #[tokio::test]
    async fn realtime_changes_are_merged() {
        let backend = Arc::new(MemoryBackend::new());
        let changes = ManualFeed::new();
        backend.echo_to(changes.clone());
        let (me, ana) = (Uuid::new_v4(), Uuid::new_v4());
        let existing = seed_post(&backend, ana, "hello");

        let feed = FeedSync::start(context(backend.clone(), changes.clone(), me)).await;
        let view = feed.view();

        let fresh = backend
            .insert("posts", json!({ "author_id": ana, "content": "fresh", "visibility": "public" }))
            .await
            .expect("insert");
        let state = wait_for(&view, |s| s.posts.len() == 2).await;
        assert_eq!(state.posts[0].post.content, "fresh");

        backend
            .insert("likes", json!({ "user_id": ana, "post_id": existing }))
            .await
            .expect("like");
        wait_for(&view, |s| s.get(existing).map(|p| p.like_count) == Some(1)).await;

        backend
            .insert("likes", json!({ "user_id": me, "post_id": existing }))
            .await
            .expect("own like");
        settle().await;
        assert_eq!(view.read(|s| s.get(existing).map(|p| p.like_count)), Some(1));

        let fresh_id = fresh["id"].clone();
        backend
            .delete("posts", &crate::api::query::Query::new().eq("id", fresh_id.as_str().expect("id")))
            .await
            .expect("delete");
        let state = wait_for(&view, |s| s.posts.len() == 1).await;
        assert_eq!(state.posts[0].post.id, existing);
    }

    #[tokio::test]
    async fn duplicate_insert_is_ignored() {
        let mut state = FeedState::default();
        let post: Post = serde_json::from_value(json!({
            "id": Uuid::new_v4(),
            "author_id": Uuid::new_v4(),
            "content": "once",
            "created_at": "2026-10-19T10:00:00Z"
        }))
        .expect("post");

        assert_eq!(state.merge_post(ChangeEvent::Insert(post.clone())), Merge::Applied);
        assert_eq!(state.merge_post(ChangeEvent::Insert(post)), Merge::Ignored);
        assert_eq!(state.posts.len(), 1);
    }

    #[tokio::test]
    async fn failed_delete_restores_post_and_toasts() {
        let backend = Arc::new(MemoryBackend::new());
        let me = Uuid::new_v4();
        let first = seed_post(&backend, me, "first");
        let second = seed_post(&backend, me, "second");

        let ctx = context(backend.clone(), ManualFeed::new(), me);
        let mut toasts = ctx.toaster.subscribe();
        let feed = FeedSync::start(ctx).await;

        backend.fail("delete", "posts");
        assert!(feed.delete_post(first).await.is_err());

        let ids = feed
            .view()
            .read(|s| s.posts.iter().map(|p| p.post.id).collect::<Vec<_>>());
        assert_eq!(ids, vec![second, first]);
        let toast = toasts.recv().await.expect("toast");
        assert_eq!(toast.variant, ToastVariant::Destructive);
    }

    #[tokio::test]
    async fn only_author_may_delete() {
        let backend = Arc::new(MemoryBackend::new());
        let (me, ana) = (Uuid::new_v4(), Uuid::new_v4());
        let theirs = seed_post(&backend, ana, "not mine");

        let feed = FeedSync::start(context(backend.clone(), ManualFeed::new(), me)).await;

        assert!(feed.delete_post(theirs).await.is_err());
        assert_eq!(backend.calls("delete", "posts"), 0);
        assert!(feed.view().read(|s| s.get(theirs).is_some()));
    }

    #[tokio::test]
    async fn invalid_media_is_rejected_before_upload() {
        let backend = Arc::new(MemoryBackend::new());
        let feed = FeedSync::start(context(backend.clone(), ManualFeed::new(), Uuid::new_v4())).await;

        let draft = PostDraft {
            content: "look".to_string(),
            media: Some(MediaUpload {
                file_name: "notes.pdf".to_string(),
                content_type: "application/pdf".to_string(),
                bytes: vec![1, 2, 3],
            }),
            visibility: Visibility::Public,
        };

        let err = feed.create_post(draft).await.expect_err("rejected");
        assert_eq!(err.code, crate::error::AppErrorCode::Validation);
        assert_eq!(backend.calls("upload", "posts"), 0);
        assert_eq!(backend.calls("insert", "posts"), 0);
    }

    #[tokio::test]
    async fn create_post_with_image_splices_at_top() {
        let backend = Arc::new(MemoryBackend::new());
        let me = Uuid::new_v4();
        seed_post(&backend, me, "earlier");
        let feed = FeedSync::start(context(backend.clone(), ManualFeed::new(), me)).await;

        let post = feed
            .create_post(PostDraft {
                content: "sunset".to_string(),
                media: Some(MediaUpload {
                    file_name: "sunset.png".to_string(),
                    content_type: "image/png".to_string(),
                    bytes: vec![0; 16],
                }),
                visibility: Visibility::Friends,
            })
            .await
            .expect("create");

        assert!(post
            .image_url
            .as_deref()
            .is_some_and(|url| url.starts_with("memory://posts/")));
        let state = feed.view().snapshot();
        assert_eq!(state.posts[0].post.id, post.id);
        assert_eq!(state.posts[0].post.visibility, Visibility::Friends);
    }
}
