use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use shared_proto::models::{Comment, Like, Post, Table, Visibility};
use uuid::Uuid;

use super::query::Query;
use super::{fetch_rows, insert_row, update_rows, Backend};
use crate::error::{AppError, AppResult};
use crate::protocol;
use crate::validation::{MediaKind, MediaUpload};

pub const POST_SELECT: &str = "*,author:profiles(*)";
pub const COMMENT_SELECT: &str = "*,author:profiles(*)";

#[derive(Debug, Serialize)]
struct NewPost<'a> {
    author_id: Uuid,
    content: &'a str,
    image_url: Option<String>,
    video_url: Option<String>,
    visibility: Visibility,
}

#[derive(Debug, Serialize)]
struct NewComment<'a> {
    post_id: Uuid,
    author_id: Uuid,
    content: &'a str,
}

pub async fn fetch_feed(backend: &dyn Backend, limit: u32) -> AppResult<Vec<Post>> {
    let query = Query::new()
        .select(POST_SELECT)
        .order_by("created_at", false)
        .limit(limit);
    fetch_rows(backend, &query).await
}

pub async fn fetch_post(backend: &dyn Backend, post_id: Uuid) -> AppResult<Option<Post>> {
    let query = Query::new().select(POST_SELECT).eq("id", post_id).limit(1);
    Ok(fetch_rows::<Post>(backend, &query).await?.into_iter().next())
}

pub async fn fetch_likes_for(backend: &dyn Backend, post_ids: &[Uuid]) -> AppResult<Vec<Like>> {
    if post_ids.is_empty() {
        return Ok(Vec::new());
    }
    fetch_rows(backend, &Query::new().is_in("post_id", post_ids)).await
}

/// Comment rows for several posts, without the author join; used for counts.
pub async fn fetch_comments_for(
    backend: &dyn Backend,
    post_ids: &[Uuid],
) -> AppResult<Vec<Comment>> {
    if post_ids.is_empty() {
        return Ok(Vec::new());
    }
    fetch_rows(backend, &Query::new().is_in("post_id", post_ids)).await
}

pub async fn fetch_comments(backend: &dyn Backend, post_id: Uuid) -> AppResult<Vec<Comment>> {
    let query = Query::new()
        .select(COMMENT_SELECT)
        .eq("post_id", post_id)
        .order_by("created_at", true);
    fetch_rows(backend, &query).await
}

pub async fn upload_post_media(
    backend: &dyn Backend,
    author_id: Uuid,
    media: &MediaUpload,
) -> AppResult<(MediaKind, String)> {
    let kind = media.validate()?;
    let path = format!(
        "{}/{}-{}.{}",
        author_id,
        Utc::now().timestamp_millis(),
        Uuid::new_v4(),
        media.extension()
    );
    let url = backend
        .upload(
            protocol::BUCKET_POSTS,
            &path,
            media.bytes.clone(),
            &media.content_type,
        )
        .await?;
    Ok((kind, url))
}

pub async fn insert_post(
    backend: &dyn Backend,
    author_id: Uuid,
    content: &str,
    media: Option<(MediaKind, String)>,
    visibility: Visibility,
) -> AppResult<Post> {
    let (image_url, video_url) = match media {
        Some((MediaKind::Image, url)) => (Some(url), None),
        Some((MediaKind::Video, url)) => (None, Some(url)),
        None => (None, None),
    };

    let row = NewPost {
        author_id,
        content: content.trim(),
        image_url,
        video_url,
        visibility,
    };
    insert_row(backend, serde_json::to_value(row)?).await
}

pub async fn update_post_content(
    backend: &dyn Backend,
    post_id: Uuid,
    content: &str,
    visibility: Visibility,
) -> AppResult<Post> {
    update_rows::<Post>(
        backend,
        &Query::new().eq("id", post_id).select(POST_SELECT),
        json!({ "content": content.trim(), "visibility": visibility }),
    )
    .await?
    .into_iter()
    .next()
    .ok_or_else(|| AppError::validation("Post not found"))
}

pub async fn delete_post(backend: &dyn Backend, post_id: Uuid) -> AppResult<()> {
    backend
        .delete(Post::NAME, &Query::new().eq("id", post_id))
        .await
}

pub async fn insert_like(backend: &dyn Backend, user_id: Uuid, post_id: Uuid) -> AppResult<Like> {
    insert_row(backend, json!({ "user_id": user_id, "post_id": post_id })).await
}

pub async fn delete_like(backend: &dyn Backend, user_id: Uuid, post_id: Uuid) -> AppResult<()> {
    backend
        .delete(
            Like::NAME,
            &Query::new().eq("user_id", user_id).eq("post_id", post_id),
        )
        .await
}

pub async fn insert_comment(
    backend: &dyn Backend,
    post_id: Uuid,
    author_id: Uuid,
    content: &str,
) -> AppResult<Comment> {
    let row = NewComment {
        post_id,
        author_id,
        content: content.trim(),
    };
    insert_row(backend, serde_json::to_value(row)?).await
}

pub async fn delete_comment(backend: &dyn Backend, comment_id: Uuid) -> AppResult<()> {
    backend
        .delete(Comment::NAME, &Query::new().eq("id", comment_id))
        .await
}
