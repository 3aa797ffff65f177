use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use shared_proto::models::{Story, StoryPhoto};
use uuid::Uuid;

use super::query::{Filter, Query};
use super::{fetch_rows, insert_row, Backend};
use crate::config::STORY_TTL_HOURS;
use crate::error::{AppError, AppResult};
use crate::protocol;
use crate::validation::{MediaKind, MediaUpload};

pub const STORY_SELECT: &str = "*,author:profiles(*)";

#[derive(Debug, Serialize)]
struct NewStory<'a> {
    user_id: Uuid,
    photos: &'a [StoryPhoto],
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct AddPhotosArgs<'a> {
    story_id: Uuid,
    photos: &'a [StoryPhoto],
}

pub fn expiry_for(created_at: DateTime<Utc>) -> DateTime<Utc> {
    created_at + Duration::hours(STORY_TTL_HOURS)
}

/// Stories that have not expired at `now`. Rows the backend still returns
/// past their expiry (clock skew, cleanup not yet run) are dropped here too.
pub async fn fetch_active_stories(backend: &dyn Backend, now: DateTime<Utc>) -> AppResult<Vec<Story>> {
    let query = Query::new()
        .select(STORY_SELECT)
        .filter("expires_at", Filter::Gt(now.to_rfc3339()))
        .order_by("created_at", false);
    let stories = fetch_rows::<Story>(backend, &query).await?;
    Ok(stories.into_iter().filter(|s| !s.is_expired(now)).collect())
}

pub async fn find_active_story(
    backend: &dyn Backend,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> AppResult<Option<Story>> {
    let query = Query::new()
        .eq("user_id", user_id)
        .filter("expires_at", Filter::Gt(now.to_rfc3339()))
        .order_by("created_at", false)
        .limit(1);
    Ok(fetch_rows::<Story>(backend, &query)
        .await?
        .into_iter()
        .find(|s| !s.is_expired(now)))
}

pub async fn upload_story_photo(
    backend: &dyn Backend,
    user_id: Uuid,
    media: &MediaUpload,
) -> AppResult<String> {
    if media.validate()? != MediaKind::Image {
        return Err(AppError::validation("Stories only accept images"));
    }
    let path = format!(
        "{}/{}-{}.{}",
        user_id,
        Utc::now().timestamp_millis(),
        Uuid::new_v4(),
        media.extension()
    );
    backend
        .upload(
            protocol::BUCKET_STORIES,
            &path,
            media.bytes.clone(),
            &media.content_type,
        )
        .await
}

pub async fn insert_story(
    backend: &dyn Backend,
    user_id: Uuid,
    photos: &[StoryPhoto],
    now: DateTime<Utc>,
) -> AppResult<Story> {
    let row = NewStory {
        user_id,
        photos,
        created_at: now,
        expires_at: expiry_for(now),
    };
    insert_row(backend, serde_json::to_value(row)?).await
}

pub async fn add_photos_to_story(
    backend: &dyn Backend,
    story_id: Uuid,
    photos: &[StoryPhoto],
) -> AppResult<()> {
    let args = serde_json::to_value(AddPhotosArgs { story_id, photos })?;
    backend
        .rpc(protocol::RPC_ADD_PHOTOS_TO_STORY, args)
        .await?;
    Ok(())
}
