use serde_json::json;
use shared_proto::models::Notification;
use uuid::Uuid;

use super::query::Query;
use super::{fetch_rows, update_rows, Backend};
use crate::error::AppResult;

pub const NOTIFICATION_SELECT: &str = "*,actor:profiles!notifications_actor_id_fkey(*)";

pub async fn fetch_notifications(
    backend: &dyn Backend,
    me: Uuid,
    limit: u32,
) -> AppResult<Vec<Notification>> {
    let query = Query::new()
        .select(NOTIFICATION_SELECT)
        .eq("user_id", me)
        .order_by("created_at", false)
        .limit(limit);
    fetch_rows(backend, &query).await
}

pub async fn mark_read(backend: &dyn Backend, me: Uuid, ids: &[Uuid]) -> AppResult<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let query = Query::new().eq("user_id", me).is_in("id", ids);
    update_rows::<Notification>(backend, &query, json!({ "read": true })).await?;
    Ok(())
}

pub async fn mark_all_read(backend: &dyn Backend, me: Uuid) -> AppResult<()> {
    let query = Query::new().eq("user_id", me).eq("read", false);
    update_rows::<Notification>(backend, &query, json!({ "read": true })).await?;
    Ok(())
}
