use chrono::{DateTime, Utc};
use shared_proto::models::{FriendRequest, FriendStatus, Profile, Table};
use shared_proto::realtime::ChangeFilter;
use uuid::Uuid;

use super::{load_initial, spawn_reconcile, LiveView, Merge, SyncContext, TaskGuard};
use crate::api::{friends, profiles};
use crate::error::{AppError, AppResult};
use crate::notify::report;
use crate::realtime::Subscription;

const COMPONENT: &str = "friends.sync";
const SEARCH_LIMIT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    Friend,
    /// Pending, sent to me.
    Incoming,
    /// Pending, sent by me.
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationAction {
    Accept,
    Decline,
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub request_id: Uuid,
    pub kind: RelationKind,
    pub other_id: Uuid,
    pub other: Option<Profile>,
    pub since: DateTime<Utc>,
}

impl Relation {
    pub fn classify(me: Uuid, row: &FriendRequest) -> Self {
        let kind = match row.status {
            FriendStatus::Accepted => RelationKind::Friend,
            FriendStatus::Pending if row.receiver_id == me => RelationKind::Incoming,
            FriendStatus::Pending => RelationKind::Outgoing,
        };
        let other = if row.sender_id == me {
            row.receiver.clone()
        } else {
            row.sender.clone()
        };
        Self {
            request_id: row.id,
            kind,
            other_id: row.other_party(me),
            other,
            since: row.created_at,
        }
    }

    pub fn actions(&self) -> &'static [RelationAction] {
        match self.kind {
            RelationKind::Friend => &[RelationAction::Remove],
            RelationKind::Incoming => &[RelationAction::Accept, RelationAction::Decline],
            RelationKind::Outgoing => &[],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FriendsState {
    pub friends: Vec<Relation>,
    pub incoming: Vec<Relation>,
    pub outgoing: Vec<Relation>,
    pub loaded: bool,
}

impl FriendsState {
    pub fn from_rows(me: Uuid, rows: &[FriendRequest]) -> Self {
        let mut state = Self {
            loaded: true,
            ..Self::default()
        };
        for row in rows.iter().filter(|r| r.involves(me)) {
            let relation = Relation::classify(me, row);
            match relation.kind {
                RelationKind::Friend => state.friends.push(relation),
                RelationKind::Incoming => state.incoming.push(relation),
                RelationKind::Outgoing => state.outgoing.push(relation),
            }
        }
        state
    }

    pub fn find(&self, request_id: Uuid) -> Option<&Relation> {
        self.friends
            .iter()
            .chain(&self.incoming)
            .chain(&self.outgoing)
            .find(|r| r.request_id == request_id)
    }

    pub fn relation_with(&self, user_id: Uuid) -> Option<&Relation> {
        self.friends
            .iter()
            .chain(&self.incoming)
            .chain(&self.outgoing)
            .find(|r| r.other_id == user_id)
    }
}

/// Friends, incoming and outgoing requests of one user. Any relationship
/// change involving the user reloads the whole graph.
pub struct FriendGraph {
    ctx: SyncContext,
    view: LiveView<FriendsState>,
    _reconcile: TaskGuard,
}

impl FriendGraph {
    pub async fn start(ctx: SyncContext) -> Self {
        let me = ctx.user_id;
        let subscription = Subscription::merge(vec![
            ctx.feed
                .subscribe(ChangeFilter::table(FriendRequest::NAME).eq("sender_id", me)),
            ctx.feed
                .subscribe(ChangeFilter::table(FriendRequest::NAME).eq("receiver_id", me)),
        ]);

        let view = LiveView::new(FriendsState::default());
        load_initial(&ctx, COMPONENT, "Could not load friends", reload(&ctx, &view)).await;

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

        Self {
            ctx,
            view,
            _reconcile: reconcile,
        }
    }

    pub fn view(&self) -> LiveView<FriendsState> {
        self.view.clone()
    }

    pub async fn refresh(&self) -> AppResult<()> {
        self.guarded("Could not load friends", reload(&self.ctx, &self.view))
            .await
    }

    pub async fn send_request(&self, receiver: Uuid) -> AppResult<()> {
        self.guarded("Could not send friend request", async {
            let row = friends::send_request(self.ctx.backend.as_ref(), self.ctx.user_id, receiver)
                .await?;
            tracing::info!(component = COMPONENT, request_id = %row.id, "friend request sent");
            reload(&self.ctx, &self.view).await
        })
        .await
    }

    pub async fn accept(&self, request_id: Uuid) -> AppResult<()> {
        self.guarded("Could not accept friend request", async {
            self.expect_kind(request_id, RelationKind::Incoming)?;
            friends::accept_request(self.ctx.backend.as_ref(), self.ctx.user_id, request_id)
                .await?;
            reload(&self.ctx, &self.view).await
        })
        .await
    }

    pub async fn decline(&self, request_id: Uuid) -> AppResult<()> {
        self.guarded("Could not decline friend request", async {
            self.expect_kind(request_id, RelationKind::Incoming)?;
            friends::delete_relationship(self.ctx.backend.as_ref(), request_id).await?;
            reload(&self.ctx, &self.view).await
        })
        .await
    }

    pub async fn remove_friend(&self, friend_id: Uuid) -> AppResult<()> {
        self.guarded("Could not remove friend", async {
            let request_id = self
                .view
                .read(|state| {
                    state
                        .relation_with(friend_id)
                        .filter(|r| r.kind == RelationKind::Friend)
                        .map(|r| r.request_id)
                })
                .ok_or_else(|| AppError::validation("Not a friend"))?;
            friends::delete_relationship(self.ctx.backend.as_ref(), request_id).await?;
            reload(&self.ctx, &self.view).await
        })
        .await
    }

    pub async fn search(&self, prefix: &str) -> AppResult<Vec<Profile>> {
        self.guarded(
            "Could not search users",
            profiles::search_profiles(self.ctx.backend.as_ref(), self.ctx.user_id, prefix, SEARCH_LIMIT),
        )
        .await
    }

    fn expect_kind(&self, request_id: Uuid, kind: RelationKind) -> AppResult<()> {
        let found = self.view.read(|state| state.find(request_id).map(|r| r.kind));
        if found == Some(kind) {
            Ok(())
        } else {
            Err(AppError::validation("Friend request not found"))
        }
    }

    async fn guarded<T>(
        &self,
        title: &str,
        op: impl std::future::Future<Output = AppResult<T>>,
    ) -> AppResult<T> {
        op.await.map_err(|err| {
            report(&self.ctx.toaster, COMPONENT, title, &err);
            err
        })
    }
}

async fn reload(ctx: &SyncContext, view: &LiveView<FriendsState>) -> AppResult<()> {
    let rows = friends::fetch_relationships(ctx.backend.as_ref(), ctx.user_id).await?;
    let next = FriendsState::from_rows(ctx.user_id, &rows);
    tracing::debug!(
        component = COMPONENT,
        friends = next.friends.len(),
        incoming = next.incoming.len(),
        outgoing = next.outgoing.len(),
        "friend graph loaded"
    );
    view.update(|state| *state = next);
    Ok(())
}
