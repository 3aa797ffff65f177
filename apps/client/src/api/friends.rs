use serde_json::json;
use shared_proto::models::{FriendRequest, FriendStatus, Table};
use uuid::Uuid;

use super::query::{Filter, Query};
use super::{fetch_rows, insert_row, update_rows, Backend};
use crate::error::{AppError, AppResult};

pub const RELATION_SELECT: &str = "*,sender:profiles!friend_requests_sender_id_fkey(*),receiver:profiles!friend_requests_receiver_id_fkey(*)";

fn eq(column: &str, value: Uuid) -> (String, Filter) {
    (column.to_string(), Filter::Eq(value.to_string()))
}

/// Every relationship row where `me` is either party.
pub async fn fetch_relationships(backend: &dyn Backend, me: Uuid) -> AppResult<Vec<FriendRequest>> {
    let query = Query::new()
        .select(RELATION_SELECT)
        .any_of(vec![eq("sender_id", me)])
        .any_of(vec![eq("receiver_id", me)])
        .order_by("created_at", false);
    fetch_rows(backend, &query).await
}

pub async fn find_relationship(
    backend: &dyn Backend,
    a: Uuid,
    b: Uuid,
) -> AppResult<Option<FriendRequest>> {
    let query = Query::new()
        .any_of(vec![eq("sender_id", a), eq("receiver_id", b)])
        .any_of(vec![eq("sender_id", b), eq("receiver_id", a)])
        .limit(1);
    Ok(fetch_rows::<FriendRequest>(backend, &query)
        .await?
        .into_iter()
        .next())
}

pub async fn send_request(backend: &dyn Backend, me: Uuid, receiver: Uuid) -> AppResult<FriendRequest> {
    if me == receiver {
        return Err(AppError::validation("Cannot add yourself"));
    }

    if let Some(existing) = find_relationship(backend, me, receiver).await? {
        let message = match existing.status {
            FriendStatus::Accepted => "You are already friends",
            FriendStatus::Pending => "Friend request already exists",
        };
        return Err(AppError::validation(message));
    }

    insert_row(
        backend,
        json!({
            "sender_id": me,
            "receiver_id": receiver,
            "status": FriendStatus::Pending,
        }),
    )
    .await
}

/// Only the receiver of a pending request may accept it.
pub async fn accept_request(backend: &dyn Backend, me: Uuid, request_id: Uuid) -> AppResult<FriendRequest> {
    let query = Query::new()
        .eq("id", request_id)
        .eq("receiver_id", me)
        .eq("status", FriendStatus::Pending.as_str());
    update_rows::<FriendRequest>(backend, &query, json!({ "status": FriendStatus::Accepted }))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| AppError::validation("Friend request not found"))
}

pub async fn delete_relationship(backend: &dyn Backend, request_id: Uuid) -> AppResult<()> {
    backend
        .delete(FriendRequest::NAME, &Query::new().eq("id", request_id))
        .await
}
