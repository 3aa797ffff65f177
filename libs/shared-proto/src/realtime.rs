//! Realtime change-feed types shared by the socket client and the
//! per-feature reconciliation loops.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const PHOENIX_TOPIC: &str = "phoenix";
pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";
pub const EVENT_ACCESS_TOKEN: &str = "access_token";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventFilter {
    #[serde(rename = "*")]
    All,
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl EventFilter {
    pub fn accepts(self, kind: ChangeKind) -> bool {
        matches!(
            (self, kind),
            (EventFilter::All, _)
                | (EventFilter::Insert, ChangeKind::Insert)
                | (EventFilter::Update, ChangeKind::Update)
                | (EventFilter::Delete, ChangeKind::Delete)
        )
    }
}

/// Which rows of which table a subscription wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeFilter {
    pub table: String,
    pub event: EventFilter,
    pub column_eq: Option<(String, String)>,
}

impl ChangeFilter {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            event: EventFilter::All,
            column_eq: None,
        }
    }

    pub fn event(mut self, event: EventFilter) -> Self {
        self.event = event;
        self
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl ToString) -> Self {
        self.column_eq = Some((column.into(), value.to_string()));
        self
    }

    /// Server-side filter expression, e.g. `post_id=eq.42`.
    pub fn filter_expr(&self) -> Option<String> {
        self.column_eq
            .as_ref()
            .map(|(column, value)| format!("{}=eq.{}", column, value))
    }

    /// Topic name used when joining the channel for this filter.
    pub fn topic(&self) -> String {
        match &self.column_eq {
            Some((column, value)) => format!("realtime:{}:{}:{}", self.table, column, value),
            None => format!("realtime:{}", self.table),
        }
    }

    pub fn matches(&self, change: &RowChange) -> bool {
        if change.table != self.table || !self.event.accepts(change.kind) {
            return false;
        }

        let Some((column, expected)) = &self.column_eq else {
            return true;
        };

        let row = match change.kind {
            ChangeKind::Delete => &change.old_record,
            ChangeKind::Insert | ChangeKind::Update => &change.record,
        };

        match row.get(column) {
            Some(Value::String(actual)) => actual == expected,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == *expected,
        }
    }

    pub fn to_join_config(&self) -> PostgresChangesConfig {
        PostgresChangesConfig {
            event: self.event,
            schema: "public".to_string(),
            table: self.table.clone(),
            filter: self.filter_expr(),
        }
    }
}

/// An untyped row-level change as delivered by the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub table: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default)]
    pub record: Value,
    #[serde(default)]
    pub old_record: Value,
}

fn default_schema() -> String {
    "public".to_string()
}

impl RowChange {
    pub fn insert<T: Serialize>(table: &str, row: &T) -> serde_json::Result<Self> {
        Ok(Self {
            kind: ChangeKind::Insert,
            table: table.to_string(),
            schema: default_schema(),
            record: serde_json::to_value(row)?,
            old_record: Value::Null,
        })
    }

    pub fn update<T: Serialize>(table: &str, row: &T) -> serde_json::Result<Self> {
        let record = serde_json::to_value(row)?;
        Ok(Self {
            kind: ChangeKind::Update,
            table: table.to_string(),
            schema: default_schema(),
            old_record: record.clone(),
            record,
        })
    }

    pub fn delete<T: Serialize>(table: &str, row: &T) -> serde_json::Result<Self> {
        Ok(Self {
            kind: ChangeKind::Delete,
            table: table.to_string(),
            schema: default_schema(),
            record: Value::Null,
            old_record: serde_json::to_value(row)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<ChangeEvent<T>> {
        Ok(match self.kind {
            ChangeKind::Insert => ChangeEvent::Insert(T::deserialize(&self.record)?),
            ChangeKind::Update => ChangeEvent::Update(T::deserialize(&self.record)?),
            ChangeKind::Delete => ChangeEvent::Delete(DeletedRow {
                id: self
                    .old_record
                    .get("id")
                    .and_then(Value::as_str)
                    .and_then(|raw| Uuid::parse_str(raw).ok()),
                old: self.old_record.clone(),
            }),
        })
    }
}

/// A typed change. Deletes only reliably carry the primary key.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<T> {
    Insert(T),
    Update(T),
    Delete(DeletedRow),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeletedRow {
    pub id: Option<Uuid>,
    pub old: Value,
}

impl DeletedRow {
    pub fn field(&self, column: &str) -> Option<&str> {
        self.old.get(column).and_then(Value::as_str)
    }

    pub fn uuid_field(&self, column: &str) -> Option<Uuid> {
        self.field(column).and_then(|raw| Uuid::parse_str(raw).ok())
    }
}

/// One websocket frame of the realtime protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgresChangesConfig {
    pub event: EventFilter,
    pub schema: String,
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPayload {
    pub config: JoinConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinConfig {
    pub postgres_changes: Vec<PostgresChangesConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresChangesPayload {
    pub data: RowChange,
}
