use serde::Serialize;
use serde_json::json;
use shared_proto::models::Message;
use uuid::Uuid;

use super::query::{Filter, Query};
use super::{fetch_rows, insert_row, update_rows, Backend};
use crate::error::AppResult;

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    sender_id: Uuid,
    receiver_id: Uuid,
    content: &'a str,
}

fn eq(column: &str, value: Uuid) -> (String, Filter) {
    (column.to_string(), Filter::Eq(value.to_string()))
}

/// The newest `limit` messages between `me` and `peer`, oldest first.
pub async fn fetch_conversation(
    backend: &dyn Backend,
    me: Uuid,
    peer: Uuid,
    limit: u32,
) -> AppResult<Vec<Message>> {
    let query = Query::new()
        .any_of(vec![eq("sender_id", me), eq("receiver_id", peer)])
        .any_of(vec![eq("sender_id", peer), eq("receiver_id", me)])
        .order_by("created_at", false)
        .limit(limit);

    let mut messages = fetch_rows::<Message>(backend, &query).await?;
    messages.reverse();
    Ok(messages)
}

pub async fn insert_message(
    backend: &dyn Backend,
    sender_id: Uuid,
    receiver_id: Uuid,
    content: &str,
) -> AppResult<Message> {
    let row = SendMessageRequest {
        sender_id,
        receiver_id,
        content,
    };
    insert_row(backend, serde_json::to_value(row)?).await
}

/// Marks everything `peer` sent to `me` as read.
pub async fn mark_conversation_read(
    backend: &dyn Backend,
    me: Uuid,
    peer: Uuid,
) -> AppResult<Vec<Message>> {
    let query = Query::new()
        .eq("sender_id", peer)
        .eq("receiver_id", me)
        .eq("read", false);
    update_rows(backend, &query, json!({ "read": true })).await
}
