//! Two-party message thread with an offline outbox.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared_proto::models::{Message, Table};
use shared_proto::realtime::{ChangeEvent, ChangeFilter};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{load_initial, spawn_reconcile, LiveView, Merge, SyncContext, TaskGuard};
use crate::api::messages;
use crate::connectivity::Connectivity;
use crate::error::{AppError, AppResult};
use crate::messaging::domain::{DeliveryStatus, OutboxMessage};
use crate::messaging::service::MessagingService;
use crate::notify::report;
use crate::realtime::Subscription;
use crate::validation::validate_message_content;

const COMPONENT: &str = "messages.thread";

#[derive(Debug, Clone, PartialEq)]
pub struct ThreadMessage {
    /// Backend id once stored; the local queue id before that.
    pub id: Uuid,
    pub client_id: Option<Uuid>,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub last_error: Option<String>,
}

impl ThreadMessage {
    pub fn is_pending(&self) -> bool {
        self.status.is_pending()
    }

    fn stored(message: Message) -> Self {
        Self {
            id: message.id,
            client_id: None,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            content: message.content,
            read: message.read,
            created_at: message.created_at,
            status: DeliveryStatus::Sent,
            last_error: None,
        }
    }

    fn queued(item: &OutboxMessage) -> Self {
        let created_at = DateTime::parse_from_rfc3339(&item.created_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        Self {
            id: item.client_id,
            client_id: Some(item.client_id),
            sender_id: item.sender_id,
            receiver_id: item.receiver_id,
            content: item.content.clone(),
            read: false,
            created_at,
            status: item.status(),
            last_error: item.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadState {
    pub messages: Vec<ThreadMessage>,
    pub loaded: bool,
}

impl ThreadState {
    pub fn pending(&self) -> impl Iterator<Item = &ThreadMessage> {
        self.messages.iter().filter(|m| m.is_pending())
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    fn position_queued(&self, client_id: Uuid) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.client_id == Some(client_id) && m.is_pending())
    }

    pub fn merge(&mut self, me: Uuid, peer: Uuid, event: ChangeEvent<Message>) -> Merge {
        match event {
            ChangeEvent::Insert(message) => {
                if !message.is_between(me, peer) || self.position(message.id).is_some() {
                    return Merge::Ignored;
                }
                self.messages.push(ThreadMessage::stored(message));
                Merge::Applied
            }
            ChangeEvent::Update(message) => match self.position(message.id) {
                Some(index) => {
                    let entry = &mut self.messages[index];
                    entry.read = message.read;
                    entry.content = message.content;
                    Merge::Applied
                }
                None => Merge::Ignored,
            },
            ChangeEvent::Delete(row) => match row.id.and_then(|id| self.position(id)) {
                Some(index) => {
                    self.messages.remove(index);
                    Merge::Applied
                }
                None => Merge::Ignored,
            },
        }
    }

    /// Replaces the queued row by the stored one. The change feed may have
    /// delivered the stored row already; then the queued row just goes.
    fn confirm(&mut self, client_id: Uuid, stored: Message) {
        let Some(index) = self.position_queued(client_id) else {
            return;
        };
        if self.position(stored.id).is_some() {
            self.messages.remove(index);
        } else {
            self.messages[index] = ThreadMessage::stored(stored);
        }
    }

    fn mark_failed(&mut self, client_id: Uuid, error: &str) {
        if let Some(index) = self.position_queued(client_id) {
            let entry = &mut self.messages[index];
            entry.status = DeliveryStatus::Failed;
            entry.last_error = Some(error.to_string());
        }
    }
}

struct Inner {
    ctx: SyncContext,
    peer: Uuid,
    outbox: MessagingService,
    connectivity: Connectivity,
    view: LiveView<ThreadState>,
    flushing: Mutex<()>,
    /// History could not be fetched; refetched after the next flush.
    history_stale: AtomicBool,
}

/// Conversation between the signed-in user and `peer`.
pub struct MessageThread {
    inner: Arc<Inner>,
    _reconcile: TaskGuard,
    _flusher: TaskGuard,
}

impl MessageThread {
    pub async fn start(
        ctx: SyncContext,
        outbox: MessagingService,
        connectivity: Connectivity,
        peer: Uuid,
    ) -> Self {
        let me = ctx.user_id;
        let subscription = Subscription::merge(vec![
            ctx.feed
                .subscribe(ChangeFilter::table(Message::NAME).eq("receiver_id", me)),
            // Read flags set by the peer on my messages.
            ctx.feed
                .subscribe(ChangeFilter::table(Message::NAME).eq("sender_id", me)),
        ]);

        let inner = Arc::new(Inner {
            ctx,
            peer,
            outbox,
            connectivity,
            view: LiveView::new(ThreadState::default()),
            flushing: Mutex::new(()),
            history_stale: AtomicBool::new(false),
        });
        load_initial(&inner.ctx, COMPONENT, "Could not load messages", inner.reload()).await;

        let merge_view = inner.view.clone();
        let refetch = inner.clone();
        let reconcile = spawn_reconcile(
            COMPONENT,
            subscription,
            move |change| match change.decode::<Message>() {
                Ok(event) => {
                    let mut outcome = Merge::Ignored;
                    merge_view.update_if(|state| {
                        outcome = state.merge(me, peer, event);
                        outcome == Merge::Applied
                    });
                    outcome
                }
                Err(err) => {
                    tracing::warn!(component = COMPONENT, error = %err, "undecodable message change");
                    Merge::Ignored
                }
            },
            move || {
                let inner = refetch.clone();
                async move { inner.reload().await }
            },
        );

        let flusher = {
            let inner = inner.clone();
            let mut online = inner.connectivity.subscribe();
            TaskGuard::new(tokio::spawn(async move {
                loop {
                    let is_online = *online.borrow_and_update();
                    if is_online {
                        inner.flush().await;
                    }
                    if online.changed().await.is_err() {
                        break;
                    }
                }
            }))
        };

        Self {
            inner,
            _reconcile: reconcile,
            _flusher: flusher,
        }
    }

    pub fn view(&self) -> LiveView<ThreadState> {
        self.inner.view.clone()
    }

    pub fn peer(&self) -> Uuid {
        self.inner.peer
    }

    /// Shows the message at once as pending and queues it. It is sent right
    /// away when online, otherwise on the next reconnect.
    pub async fn send(&self, content: &str) -> AppResult<ThreadMessage> {
        let inner = &self.inner;
        if let Err(err) = validate_message_content(content) {
            report(&inner.ctx.toaster, COMPONENT, "Could not send message", &err);
            return Err(err);
        }

        let item = match inner
            .outbox
            .create_pending_message(inner.ctx.user_id, inner.peer, content.trim().to_string())
            .await
        {
            Ok(item) => item,
            Err(err) => {
                let err = AppError::from(err);
                report(&inner.ctx.toaster, COMPONENT, "Could not send message", &err);
                return Err(err);
            }
        };

        let local = ThreadMessage::queued(&item);
        let shown = local.clone();
        inner.view.update(|state| state.messages.push(shown));

        if !inner.connectivity.is_online() {
            tracing::info!(component = COMPONENT, client_id = %item.client_id, "offline, message queued");
            return Ok(local);
        }

        let _guard = inner.flushing.lock().await;
        match inner.deliver(&item).await {
            Ok(stored) => Ok(ThreadMessage::stored(stored)),
            Err(_) => Ok(inner
                .view
                .read(|state| state.position_queued(item.client_id).map(|i| state.messages[i].clone()))
                .unwrap_or(local)),
        }
    }

    /// Sends every queued message of this thread, oldest first.
    pub async fn flush(&self) {
        self.inner.flush().await;
    }

    /// Drops a queued message, typically one whose attempts ran out.
    pub async fn discard(&self, client_id: Uuid) -> AppResult<()> {
        let inner = &self.inner;
        let _guard = inner.flushing.lock().await;
        if let Err(err) = inner.outbox.discard(client_id).await {
            let err = AppError::from(err);
            report(&inner.ctx.toaster, COMPONENT, "Could not discard message", &err);
            return Err(err);
        }
        inner.view.update_if(|state| match state.position_queued(client_id) {
            Some(index) => {
                state.messages.remove(index);
                true
            }
            None => false,
        });
        Ok(())
    }

    pub async fn mark_read(&self) -> AppResult<usize> {
        let inner = &self.inner;
        let updated = messages::mark_conversation_read(
            inner.ctx.backend.as_ref(),
            inner.ctx.user_id,
            inner.peer,
        )
        .await
        .map_err(|err| {
            report(&inner.ctx.toaster, COMPONENT, "Could not mark messages read", &err);
            err
        })?;

        let ids = updated.iter().map(|m| m.id).collect::<Vec<_>>();
        inner.view.update_if(|state| {
            let mut changed = false;
            for message in state.messages.iter_mut().filter(|m| ids.contains(&m.id)) {
                changed |= !message.read;
                message.read = true;
            }
            changed
        });
        Ok(updated.len())
    }
}

impl Inner {
    /// Queued rows always show. Without a backend, stored rows from the last
    /// successful fetch are kept and history is marked stale.
    async fn reload(&self) -> AppResult<()> {
        let me = self.ctx.user_id;
        let queued = self.outbox.pending_for_thread(me, self.peer).await?;
        let history = match messages::fetch_conversation(
            self.ctx.backend.as_ref(),
            me,
            self.peer,
            self.ctx.config.history_limit,
        )
        .await
        {
            Ok(history) => Some(history),
            Err(err) if err.is_network() => {
                tracing::warn!(component = COMPONENT, peer = %self.peer, error = %err, "history unavailable, showing queued messages");
                None
            }
            Err(err) => return Err(err),
        };
        self.history_stale.store(history.is_none(), Ordering::SeqCst);

        tracing::debug!(component = COMPONENT, peer = %self.peer, queued = queued.len(), "thread loaded");
        self.view.update(|state| {
            let mut rows: Vec<ThreadMessage> = match history {
                Some(history) => history.into_iter().map(ThreadMessage::stored).collect(),
                None => state.messages.drain(..).filter(|m| !m.is_pending()).collect(),
            };
            rows.extend(queued.iter().map(ThreadMessage::queued));
            state.messages = rows;
            state.loaded = true;
        });
        Ok(())
    }

    async fn flush(&self) {
        let _guard = self.flushing.lock().await;
        let queued = match self
            .outbox
            .pending_for_thread(self.ctx.user_id, self.peer)
            .await
        {
            Ok(queued) => queued,
            Err(err) => {
                report(&self.ctx.toaster, COMPONENT, "Could not read queued messages", &AppError::from(err));
                return;
            }
        };

        let max_attempts = self.ctx.config.max_send_attempts;
        if !queued.is_empty() {
            tracing::info!(component = COMPONENT, count = queued.len(), "flushing queued messages");
        }
        for item in &queued {
            if item.exhausted(max_attempts) {
                tracing::debug!(component = COMPONENT, client_id = %item.client_id, attempts = item.attempts, "send attempts exhausted");
                continue;
            }
            if let Err(err) = self.deliver(item).await {
                if err.is_network() {
                    return;
                }
            }
        }

        if self.history_stale.load(Ordering::SeqCst) {
            if let Err(err) = self.reload().await {
                tracing::warn!(component = COMPONENT, peer = %self.peer, error = %err, "history refetch failed");
            }
        }
    }

    /// One insert attempt for a queued message.
    async fn deliver(&self, item: &OutboxMessage) -> AppResult<Message> {
        let result = messages::insert_message(
            self.ctx.backend.as_ref(),
            item.sender_id,
            item.receiver_id,
            &item.content,
        )
        .await;

        match result {
            Ok(stored) => {
                if let Err(err) = self.outbox.mark_send_success(item.client_id).await {
                    // Left queued, it would be sent twice.
                    tracing::error!(component = COMPONENT, client_id = %item.client_id, error = %err, "could not clear sent message");
                }
                let confirmed = stored.clone();
                self.view
                    .update(|state| state.confirm(item.client_id, confirmed));
                tracing::debug!(component = COMPONENT, message_id = %stored.id, "message sent");
                Ok(stored)
            }
            Err(err) => {
                let recorded = if err.is_network() {
                    self.outbox
                        .mark_send_interrupted(item.client_id, &err.message)
                        .await
                } else {
                    self.outbox.mark_send_failed(item.client_id, &err.message).await
                };
                if let Err(store_err) = recorded {
                    tracing::error!(component = COMPONENT, error = %store_err, "could not record send failure");
                }
                self.view
                    .update(|state| state.mark_failed(item.client_id, &err.message));
                report(&self.ctx.toaster, COMPONENT, "Could not send message", &err);
                Err(err)
            }
        }
    }
}
