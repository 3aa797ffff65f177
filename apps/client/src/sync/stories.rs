use chrono::{DateTime, Utc};
use shared_proto::models::{Story, StoryPhoto, Table};
use shared_proto::realtime::ChangeFilter;
use uuid::Uuid;

use super::{load_initial, spawn_reconcile, LiveView, Merge, SyncContext, TaskGuard};
use crate::api::stories;
use crate::error::{AppError, AppResult};
use crate::notify::report;
use crate::validation::{MediaKind, MediaUpload};

const COMPONENT: &str = "stories.sync";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoriesState {
    pub stories: Vec<Story>,
    pub loaded: bool,
}

impl StoriesState {
    pub fn by_user(&self, user_id: Uuid) -> Option<&Story> {
        self.stories.iter().find(|s| s.user_id == user_id)
    }

    /// Drops stories that expired since the last fetch.
    pub fn prune(&mut self, now: DateTime<Utc>) -> bool {
        let before = self.stories.len();
        self.stories.retain(|s| !s.is_expired(now));
        self.stories.len() != before
    }
}

/// One photo picked for a story.
pub struct StoryUpload {
    pub media: MediaUpload,
    pub caption: Option<String>,
}

/// Active stories of everyone visible to the user, refreshed on change and
/// on a fixed poll.
pub struct StoryList {
    ctx: SyncContext,
    view: LiveView<StoriesState>,
    _reconcile: TaskGuard,
    _poller: TaskGuard,
}

impl StoryList {
    pub async fn start(ctx: SyncContext) -> Self {
        let subscription = ctx.feed.subscribe(ChangeFilter::table(Story::NAME));

        let view = LiveView::new(StoriesState::default());
        load_initial(&ctx, COMPONENT, "Could not load stories", reload(&ctx, &view)).await;

        let refetch_ctx = ctx.clone();
        let refetch_view = view.clone();
        let reconcile = spawn_reconcile(
            COMPONENT,
            subscription,
            |_| Merge::Refetch,
            move || {
                let ctx = refetch_ctx.clone();
                let view = refetch_view.clone();
                async move { reload(&ctx, &view).await }
            },
        );

        let poller = {
            let ctx = ctx.clone();
            let view = view.clone();
            TaskGuard::new(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(ctx.config.story_poll_interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    view.update_if(|state| state.prune(Utc::now()));
                    if let Err(err) = reload(&ctx, &view).await {
                        tracing::warn!(component = COMPONENT, error = %err, "story poll failed");
                    }
                }
            }))
        };

        Self {
            ctx,
            view,
            _reconcile: reconcile,
            _poller: poller,
        }
    }

    pub fn view(&self) -> LiveView<StoriesState> {
        self.view.clone()
    }

    pub async fn refresh(&self) -> AppResult<()> {
        reload(&self.ctx, &self.view).await.map_err(|err| {
            report(&self.ctx.toaster, COMPONENT, "Could not load stories", &err);
            err
        })
    }

    /// Adds photos to the user's active story, or starts a new one.
    pub async fn upload(&self, photos: Vec<StoryUpload>) -> AppResult<Story> {
        let result = self.try_upload(photos).await;
        if let Err(err) = &result {
            report(&self.ctx.toaster, COMPONENT, "Could not upload story", err);
        }
        result
    }

    async fn try_upload(&self, photos: Vec<StoryUpload>) -> AppResult<Story> {
        if photos.is_empty() {
            return Err(AppError::validation("Pick at least one photo"));
        }
        for photo in &photos {
            if photo.media.validate()? != MediaKind::Image {
                return Err(AppError::validation("Stories only accept images"));
            }
        }

        let backend = self.ctx.backend.as_ref();
        let me = self.ctx.user_id;
        let now = Utc::now();

        let mut uploaded = Vec::with_capacity(photos.len());
        for photo in &photos {
            let url = stories::upload_story_photo(backend, me, &photo.media).await?;
            uploaded.push(StoryPhoto {
                url,
                caption: photo
                    .caption
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string),
                added_at: now,
            });
        }

        let story = match stories::find_active_story(backend, me, now).await? {
            Some(active) => {
                stories::add_photos_to_story(backend, active.id, &uploaded).await?;
                tracing::info!(component = COMPONENT, story_id = %active.id, added = uploaded.len(), "photos added to story");
                stories::find_active_story(backend, me, now)
                    .await?
                    .ok_or_else(|| AppError::protocol("Story vanished after update"))?
            }
            None => {
                let story = stories::insert_story(backend, me, &uploaded, now).await?;
                tracing::info!(component = COMPONENT, story_id = %story.id, "story created");
                story
            }
        };

        reload(&self.ctx, &self.view).await?;
        Ok(story)
    }
}

async fn reload(ctx: &SyncContext, view: &LiveView<StoriesState>) -> AppResult<()> {
    let active = stories::fetch_active_stories(ctx.backend.as_ref(), Utc::now()).await?;
    view.update(|state| {
        state.stories = active;
        state.loaded = true;
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, settle, ManualFeed, MemoryBackend};
    use chrono::Duration;
    use serde_json::json;
    use std::sync::Arc;

    fn seed_story(backend: &MemoryBackend, user: Uuid, created: DateTime<Utc>) -> Uuid {
        let row = backend.seed(
            "stories",
            json!({
                "user_id": user,
                "photos": [{ "url": "memory://stories/x.png", "added_at": created }],
                "created_at": created,
                "expires_at": stories::expiry_for(created),
            }),
        );
        serde_json::from_value(row["id"].clone()).expect("id")
    }

    fn png() -> MediaUpload {
        MediaUpload {
            file_name: "a.png".to_string(),
            content_type: "image/png".to_string(),
            bytes: vec![7; 32],
        }
    }

    #[tokio::test]
    async fn expired_story_never_appears() {
        let backend = Arc::new(MemoryBackend::new());
        let now = Utc::now();
        let fresh = seed_story(&backend, Uuid::new_v4(), now - Duration::hours(2));
        seed_story(&backend, Uuid::new_v4(), now - Duration::hours(30));

        let list = StoryList::start(context(backend, ManualFeed::new(), Uuid::new_v4())).await;
        let state = list.view().snapshot();
        assert_eq!(state.stories.len(), 1);
        assert_eq!(state.stories[0].id, fresh);
    }

    #[test]
    fn prune_drops_stories_past_expiry() {
        let now = Utc::now();
        let story = |expires_at| Story {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            photos: Vec::new(),
            created_at: now - Duration::hours(23),
            expires_at,
            author: None,
        };
        let mut state = StoriesState {
            stories: vec![story(now - Duration::seconds(1)), story(now + Duration::hours(1))],
            loaded: true,
        };

        assert!(state.prune(now));
        assert_eq!(state.stories.len(), 1);
        assert!(!state.prune(now));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_picks_up_new_stories() {
        let backend = Arc::new(MemoryBackend::new());
        let list = StoryList::start(context(backend.clone(), ManualFeed::new(), Uuid::new_v4())).await;
        assert!(list.view().read(|s| s.stories.is_empty()));

        seed_story(&backend, Uuid::new_v4(), Utc::now());
        tokio::time::sleep(std::time::Duration::from_secs(61)).await;
        settle().await;

        assert_eq!(list.view().read(|s| s.stories.len()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_loads_stories_after_offline_start() {
        let backend = Arc::new(MemoryBackend::new());
        seed_story(&backend, Uuid::new_v4(), Utc::now());
        backend.set_offline(true);
        let list = StoryList::start(context(backend.clone(), ManualFeed::new(), Uuid::new_v4())).await;
        assert!(!list.view().read(|s| s.loaded));

        backend.set_offline(false);
        tokio::time::sleep(std::time::Duration::from_secs(61)).await;
        settle().await;

        let state = list.view().snapshot();
        assert!(state.loaded);
        assert_eq!(state.stories.len(), 1);
    }

    #[tokio::test]
    async fn upload_creates_then_extends_story() {
        let backend = Arc::new(MemoryBackend::new());
        let me = Uuid::new_v4();
        let list = StoryList::start(context(backend.clone(), ManualFeed::new(), me)).await;

        let created = list
            .upload(vec![StoryUpload {
                media: png(),
                caption: Some(" beach ".to_string()),
            }])
            .await
            .expect("first upload");
        assert_eq!(created.photos.len(), 1);
        assert_eq!(created.photos[0].caption.as_deref(), Some("beach"));
        assert!(created.expires_at > Utc::now() + Duration::hours(23));

        let extended = list
            .upload(vec![StoryUpload {
                media: png(),
                caption: None,
            }])
            .await
            .expect("second upload");
        assert_eq!(extended.id, created.id);
        assert_eq!(extended.photos.len(), 2);
        assert_eq!(backend.calls("rpc", "add_photos_to_story"), 1);
        assert_eq!(backend.rows("stories").len(), 1);
        assert_eq!(list.view().read(|s| s.by_user(me).map(|s| s.photos.len())), Some(2));
    }

    #[tokio::test]
    async fn videos_are_rejected_before_upload() {
        let backend = Arc::new(MemoryBackend::new());
        let list = StoryList::start(context(backend.clone(), ManualFeed::new(), Uuid::new_v4())).await;

        let video = MediaUpload {
            file_name: "clip.mp4".to_string(),
            content_type: "video/mp4".to_string(),
            bytes: vec![1; 64],
        };
        let err = list
            .upload(vec![StoryUpload { media: png(), caption: None }, StoryUpload { media: video, caption: None }])
            .await
            .expect_err("rejected");
        assert_eq!(err.code, crate::error::AppErrorCode::Validation);
        assert_eq!(backend.calls("upload", "stories"), 0);
    }
}
