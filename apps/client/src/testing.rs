//! In-memory backend ports for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use shared_proto::auth::{AuthEvent, AuthUser, Session};
use shared_proto::realtime::{ChangeFilter, RowChange};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::api::query::Query;
use crate::api::{AuthApi, Backend};
use crate::config::SyncConfig;
use crate::error::{AppError, AppResult};
use crate::protocol;
use crate::notify::Toaster;
use crate::realtime::{ChangeFeed, Subscription};
use crate::sync::{LiveView, SyncContext};

/// Tables held as JSON rows; filters are evaluated with [`Query::apply`].
#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    failing: Mutex<HashSet<String>>,
    rejecting: Mutex<HashSet<String>>,
    offline: AtomicBool,
    calls: Mutex<Vec<String>>,
    echo: Mutex<Option<ManualFeed>>,
    clock: Mutex<i64>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes every write as a change event on `feed`.
    pub fn echo_to(&self, feed: ManualFeed) {
        *self.echo.lock().expect("echo lock") = Some(feed);
    }

    pub fn seed(&self, table: &str, row: Value) -> Value {
        let row = self.stamp(row);
        self.tables
            .lock()
            .expect("tables lock")
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        row
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .lock()
            .expect("tables lock")
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Makes `op` on `table` fail with a network error until [`heal`](Self::heal).
    pub fn fail(&self, op: &str, table: &str) {
        self.failing
            .lock()
            .expect("failing lock")
            .insert(format!("{}:{}", op, table));
    }

    /// Makes `op` on `table` fail the way a backend refusing the row does.
    pub fn reject(&self, op: &str, table: &str) {
        self.rejecting
            .lock()
            .expect("rejecting lock")
            .insert(format!("{}:{}", op, table));
    }

    pub fn heal(&self) {
        self.failing.lock().expect("failing lock").clear();
        self.rejecting.lock().expect("rejecting lock").clear();
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self, op: &str, table: &str) -> usize {
        let key = format!("{}:{}", op, table);
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|c| **c == key)
            .count()
    }

    fn enter(&self, op: &str, table: &str) -> AppResult<()> {
        let key = format!("{}:{}", op, table);
        self.calls.lock().expect("calls lock").push(key.clone());
        if self.offline.load(Ordering::SeqCst) {
            return Err(AppError::network("Network request failed").with_details("offline"));
        }
        if self.failing.lock().expect("failing lock").contains(&key) {
            return Err(AppError::network(format!("{}: backend unavailable", key)));
        }
        if self.rejecting.lock().expect("rejecting lock").contains(&key) {
            return Err(AppError::validation(format!("{}: rejected by backend", key)));
        }
        Ok(())
    }

    /// Fills `id` and a strictly increasing `created_at` when absent.
    fn stamp(&self, mut row: Value) -> Value {
        let mut clock = self.clock.lock().expect("clock lock");
        *clock += 1;
        let created_at = Utc::now() + Duration::milliseconds(*clock);
        if let Some(object) = row.as_object_mut() {
            object
                .entry("id")
                .or_insert_with(|| json!(Uuid::new_v4()));
            object
                .entry("created_at")
                .or_insert_with(|| json!(created_at));
        }
        row
    }

    fn publish(&self, change: RowChange) {
        if let Some(feed) = self.echo.lock().expect("echo lock").as_ref() {
            feed.publish(change);
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn select(&self, table: &str, query: &Query) -> AppResult<Vec<Value>> {
        self.enter("select", table)?;
        Ok(query.apply(self.rows(table)))
    }

    async fn insert(&self, table: &str, row: Value) -> AppResult<Value> {
        self.enter("insert", table)?;
        let stored = self.seed(table, row);
        if let Ok(change) = RowChange::insert(table, &stored) {
            self.publish(change);
        }
        Ok(stored)
    }

    async fn update(&self, table: &str, query: &Query, patch: Value) -> AppResult<Vec<Value>> {
        self.enter("update", table)?;
        let mut updated = Vec::new();
        {
            let mut tables = self.tables.lock().expect("tables lock");
            for row in tables.entry(table.to_string()).or_default().iter_mut() {
                if !query.matches(row) {
                    continue;
                }
                if let (Some(target), Some(fields)) = (row.as_object_mut(), patch.as_object()) {
                    for (key, value) in fields {
                        target.insert(key.clone(), value.clone());
                    }
                }
                updated.push(row.clone());
            }
        }
        for row in &updated {
            if let Ok(change) = RowChange::update(table, row) {
                self.publish(change);
            }
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, query: &Query) -> AppResult<()> {
        self.enter("delete", table)?;
        let removed = {
            let mut tables = self.tables.lock().expect("tables lock");
            let rows = tables.entry(table.to_string()).or_default();
            let (removed, kept): (Vec<Value>, Vec<Value>) =
                rows.drain(..).partition(|row| query.matches(row));
            *rows = kept;
            removed
        };
        for row in &removed {
            if let Ok(change) = RowChange::delete(table, row) {
                self.publish(change);
            }
        }
        Ok(())
    }

    async fn rpc(&self, function: &str, args: Value) -> AppResult<Value> {
        self.enter("rpc", function)?;
        if function != protocol::RPC_ADD_PHOTOS_TO_STORY {
            return Err(AppError::validation(format!("unknown function {}", function)));
        }

        let story_id = args["story_id"].clone();
        let photos = args["photos"].as_array().cloned().unwrap_or_default();
        let mut tables = self.tables.lock().expect("tables lock");
        let story = tables
            .entry("stories".to_string())
            .or_default()
            .iter_mut()
            .find(|row| row["id"] == story_id)
            .ok_or_else(|| AppError::validation("story not found"))?;
        if let Some(existing) = story["photos"].as_array_mut() {
            existing.extend(photos);
        } else {
            story["photos"] = Value::Array(photos);
        }
        Ok(Value::Null)
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        _bytes: Vec<u8>,
        _content_type: &str,
    ) -> AppResult<String> {
        self.enter("upload", bucket)?;
        Ok(format!("memory://{}/{}", bucket, path))
    }
}

/// Change feed driven by hand (or by [`MemoryBackend::echo_to`]).
#[derive(Clone, Default)]
pub struct ManualFeed {
    subscribers: Arc<Mutex<Vec<(ChangeFilter, mpsc::UnboundedSender<RowChange>)>>>,
}

impl ManualFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, change: RowChange) {
        let mut subscribers = self.subscribers.lock().expect("subscribers lock");
        subscribers.retain(|(filter, tx)| {
            if tx.is_closed() {
                return false;
            }
            if filter.matches(&change) {
                let _ = tx.send(change.clone());
            }
            true
        });
    }

    pub fn live_subscriptions(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscribers lock")
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .count()
    }
}

impl ChangeFeed for ManualFeed {
    fn subscribe(&self, filter: ChangeFilter) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("subscribers lock")
            .push((filter, tx));
        Subscription::new(rx, None)
    }
}

pub fn session_for(user_id: Uuid, refresh_token: &str) -> Session {
    Session {
        access_token: format!("access-{}", Uuid::new_v4()),
        refresh_token: refresh_token.to_string(),
        expires_at: Utc::now().timestamp() + 3600,
        user: AuthUser {
            id: user_id,
            email: Some("user@example.com".to_string()),
        },
    }
}

/// Auth port with a scripted outcome: one password and one refresh token
/// are accepted.
pub struct FakeAuth {
    pub user_id: Uuid,
    pub password: String,
    accepted_refresh: Mutex<Option<String>>,
    session: Mutex<Option<Session>>,
    unreachable: AtomicBool,
    events: broadcast::Sender<AuthEvent>,
}

impl FakeAuth {
    pub fn new(user_id: Uuid) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            user_id,
            password: "secret-password".to_string(),
            accepted_refresh: Mutex::new(None),
            session: Mutex::new(None),
            unreachable: AtomicBool::new(false),
            events,
        }
    }

    pub fn accept_refresh(&self, token: &str) {
        *self.accepted_refresh.lock().expect("refresh lock") = Some(token.to_string());
    }

    /// Token exchanges fail as if the auth endpoint could not be reached.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_live(&self, session: Option<Session>) {
        *self.session.lock().expect("session lock") = session;
    }

    pub fn emit(&self, event: AuthEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl AuthApi for FakeAuth {
    async fn sign_up(&self, _email: &str, password: &str) -> AppResult<Option<Session>> {
        if password.len() < 6 {
            return Err(AppError::validation("Password should be at least 6 characters"));
        }
        let session = session_for(self.user_id, "signup-refresh");
        self.set_live(Some(session.clone()));
        self.emit(AuthEvent::SignedIn(session.clone()));
        Ok(Some(session))
    }

    async fn sign_in(&self, _email: &str, password: &str) -> AppResult<Session> {
        if password != self.password {
            return Err(AppError::auth("Invalid login credentials"));
        }
        let session = session_for(self.user_id, "password-refresh");
        self.set_live(Some(session.clone()));
        self.emit(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> AppResult<()> {
        self.set_live(None);
        self.emit(AuthEvent::SignedOut);
        Ok(())
    }

    async fn get_session(&self) -> AppResult<Option<Session>> {
        Ok(self.session.lock().expect("session lock").clone())
    }

    async fn set_session(&self, _access_token: &str, refresh_token: &str) -> AppResult<Session> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AppError::network("Network request failed"));
        }
        let accepted = self.accepted_refresh.lock().expect("refresh lock").clone();
        if accepted.as_deref() != Some(refresh_token) {
            return Err(AppError::auth("Invalid Refresh Token"));
        }
        let session = session_for(self.user_id, refresh_token);
        self.set_live(Some(session.clone()));
        self.emit(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    fn subscribe_auth(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

pub fn context(backend: Arc<MemoryBackend>, feed: ManualFeed, user_id: Uuid) -> SyncContext {
    SyncContext {
        backend,
        feed: Arc::new(feed),
        toaster: Toaster::default(),
        user_id,
        config: SyncConfig::default(),
    }
}

/// Waits until `view` satisfies `pred` and returns that snapshot.
pub async fn wait_for<S: Clone>(view: &LiveView<S>, pred: impl Fn(&S) -> bool) -> S {
    let mut rx = view.watch();
    let state = tokio::time::timeout(StdDuration::from_secs(5), rx.wait_for(|s| pred(s)))
        .await
        .expect("view never reached expected state")
        .expect("view closed");
    let snapshot = (*state).clone();
    snapshot
}

/// Lets spawned tasks drain their queues.
pub async fn settle() {
    tokio::time::sleep(StdDuration::from_millis(30)).await;
}
