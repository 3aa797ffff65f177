use std::sync::Arc;

use shared_proto::models::{Notification, NotificationKind, Table};
use shared_proto::realtime::{ChangeEvent, ChangeFilter};
use uuid::Uuid;

use super::{load_initial, spawn_reconcile, LiveView, Merge, SyncContext, TaskGuard};
use crate::api::notifications;
use crate::error::{AppError, AppResult};
use crate::notify::{report, Notifier};

const COMPONENT: &str = "notifications.sync";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationsState {
    pub items: Vec<Notification>,
    pub loaded: bool,
}

impl NotificationsState {
    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|n| !n.read).count()
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.items.iter().position(|n| n.id == id)
    }

    /// Newest first, at most `limit` rows; returns the inserted row when it
    /// was not already known.
    pub fn merge(
        &mut self,
        event: ChangeEvent<Notification>,
        limit: usize,
    ) -> (Merge, Option<Notification>) {
        match event {
            ChangeEvent::Insert(item) => {
                if self.position(item.id).is_some() {
                    return (Merge::Ignored, None);
                }
                self.items.insert(0, item.clone());
                self.items.truncate(limit);
                (Merge::Applied, Some(item))
            }
            ChangeEvent::Update(item) => match self.position(item.id) {
                Some(index) => {
                    let entry = &mut self.items[index];
                    entry.read = item.read;
                    (Merge::Applied, None)
                }
                None => (Merge::Ignored, None),
            },
            ChangeEvent::Delete(row) => match row.id.and_then(|id| self.position(id)) {
                Some(index) => {
                    self.items.remove(index);
                    (Merge::Applied, None)
                }
                None => (Merge::Ignored, None),
            },
        }
    }

    /// Sets `read` on the given ids, returning the ids that actually changed.
    fn set_read(&mut self, ids: &[Uuid], read: bool) -> Vec<Uuid> {
        let mut changed = Vec::new();
        for item in self.items.iter_mut().filter(|n| ids.contains(&n.id)) {
            if item.read != read {
                item.read = read;
                changed.push(item.id);
            }
        }
        changed
    }
}

/// Route focused when the notification is clicked.
pub fn target_route(item: &Notification) -> String {
    match (item.kind, item.post_id) {
        (NotificationKind::Like | NotificationKind::Comment, Some(post_id)) => {
            format!("/post/{}", post_id)
        }
        (NotificationKind::Message, _) => "/messages".to_string(),
        (NotificationKind::FriendRequest | NotificationKind::FriendAccepted, _) => {
            "/friends".to_string()
        }
        _ => "/".to_string(),
    }
}

pub fn describe(item: &Notification) -> String {
    let actor = item
        .actor
        .as_ref()
        .map(|p| p.name.as_str())
        .filter(|name| !name.is_empty())
        .unwrap_or("Someone");
    let action = match item.kind {
        NotificationKind::Like => "liked your post",
        NotificationKind::Comment => "commented on your post",
        NotificationKind::FriendRequest => "sent you a friend request",
        NotificationKind::FriendAccepted => "accepted your friend request",
        NotificationKind::Message => "sent you a message",
    };
    format!("{} {}", actor, action)
}

/// The signed-in user's notifications.
pub struct NotificationInbox {
    ctx: SyncContext,
    view: LiveView<NotificationsState>,
    _reconcile: TaskGuard,
}

impl NotificationInbox {
    pub async fn start(ctx: SyncContext, notifier: Arc<Notifier>) -> Self {
        let subscription = ctx
            .feed
            .subscribe(ChangeFilter::table(Notification::NAME).eq("user_id", ctx.user_id));

        let view = LiveView::new(NotificationsState::default());
        load_initial(&ctx, COMPONENT, "Could not load notifications", reload(&ctx, &view)).await;

        let limit = ctx.config.notification_limit as usize;
        let merge_view = view.clone();
        let refetch_ctx = ctx.clone();
        let refetch_view = view.clone();
        let reconcile = spawn_reconcile(
            COMPONENT,
            subscription,
            move |change| match change.decode::<Notification>() {
                Ok(event) => {
                    let mut outcome = (Merge::Ignored, None);
                    merge_view.update_if(|state| {
                        outcome = state.merge(event, limit);
                        outcome.0 == Merge::Applied
                    });
                    if let (_, Some(fresh)) = &outcome {
                        let notifier = notifier.clone();
                        let (body, target) = (describe(fresh), target_route(fresh));
                        let title = fresh.kind.title();
                        tokio::spawn(async move {
                            let delivery = notifier.raise(title, &body, &target).await;
                            tracing::debug!(component = COMPONENT, ?delivery, route = %target, "notification raised");
                        });
                    }
                    // An inbox that never loaded takes the whole list instead.
                    if merge_view.read(|s| s.loaded) {
                        outcome.0
                    } else {
                        Merge::Refetch
                    }
                }
                Err(err) => {
                    tracing::warn!(component = COMPONENT, error = %err, "undecodable notification change");
                    Merge::Ignored
                }
            },
            move || {
                let ctx = refetch_ctx.clone();
                let view = refetch_view.clone();
                async move { reload(&ctx, &view).await }
            },
        );

        Self {
            ctx,
            view,
            _reconcile: reconcile,
        }
    }

    pub fn view(&self) -> LiveView<NotificationsState> {
        self.view.clone()
    }

    pub fn unread_count(&self) -> usize {
        self.view.read(NotificationsState::unread_count)
    }

    pub async fn refresh(&self) -> AppResult<()> {
        reload(&self.ctx, &self.view).await.map_err(|err| {
            report(&self.ctx.toaster, COMPONENT, "Could not load notifications", &err);
            err
        })
    }

    pub async fn mark_read(&self, id: Uuid) -> AppResult<()> {
        if self.view.read(|state| state.position(id).is_none()) {
            let err = AppError::validation("Notification not found");
            report(&self.ctx.toaster, COMPONENT, "Could not update notification", &err);
            return Err(err);
        }
        self.mark(vec![id], false).await
    }

    pub async fn mark_all_read(&self) -> AppResult<()> {
        let unread = self.view.read(|state| {
            state
                .items
                .iter()
                .filter(|n| !n.read)
                .map(|n| n.id)
                .collect::<Vec<_>>()
        });
        if unread.is_empty() {
            return Ok(());
        }
        self.mark(unread, true).await
    }

    async fn mark(&self, ids: Vec<Uuid>, all: bool) -> AppResult<()> {
        let mut changed = Vec::new();
        self.view.update_if(|state| {
            changed = state.set_read(&ids, true);
            !changed.is_empty()
        });
        if changed.is_empty() {
            return Ok(());
        }

        let backend = self.ctx.backend.as_ref();
        let result = if all {
            notifications::mark_all_read(backend, self.ctx.user_id).await
        } else {
            notifications::mark_read(backend, self.ctx.user_id, &changed).await
        };

        if let Err(err) = result {
            self.view.update_if(|state| !state.set_read(&changed, false).is_empty());
            report(&self.ctx.toaster, COMPONENT, "Could not update notification", &err);
            return Err(err);
        }
        Ok(())
    }
}

async fn reload(ctx: &SyncContext, view: &LiveView<NotificationsState>) -> AppResult<()> {
    let items = notifications::fetch_notifications(
        ctx.backend.as_ref(),
        ctx.user_id,
        ctx.config.notification_limit,
    )
    .await?;
    view.update(|state| {
        state.items = items;
        state.loaded = true;
    });
    Ok(())
}
