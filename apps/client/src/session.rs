//! Session guard: decides whether protected routes may render, and keeps a
//! local mirror of the token pair so a restart can restore the session.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use shared_proto::auth::{AuthEvent, Session};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::api::AuthApi;
use crate::error::AppResult;
use crate::protocol::LOGIN_ROUTE;
use crate::storage::LocalStore;
use crate::sync::{LiveView, TaskGuard};

const COMPONENT: &str = "session";
pub const MIRROR_KEY: &str = "session_mirror";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Loading,
    Authenticated(Session),
    Unauthenticated,
}

impl SessionState {
    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionState::Authenticated(session) => Some(session),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Render,
    Wait,
    RedirectToLogin { from: String },
}

impl RouteDecision {
    pub fn redirect_target(&self) -> Option<String> {
        match self {
            RouteDecision::RedirectToLogin { from } => {
                let from: String = url::form_urlencoded::byte_serialize(from.as_bytes()).collect();
                Some(format!("{}?from={}", LOGIN_ROUTE, from))
            }
            _ => None,
        }
    }
}

/// Persisted copy of the token pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMirror {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    pub user_id: Uuid,
    pub saved_at: i64,
}

impl TokenMirror {
    pub fn from_session(session: &Session) -> Self {
        Self {
            access_token: session.access_token.clone(),
            refresh_token: session.refresh_token.clone(),
            expires_at: session.expires_at,
            user_id: session.user_id(),
            saved_at: Utc::now().timestamp(),
        }
    }
}

pub struct SessionGuard {
    auth: Arc<dyn AuthApi>,
    state: LiveView<SessionState>,
    _task: TaskGuard,
}

impl SessionGuard {
    /// Starts in `Loading` and resolves in the background.
    pub fn start(auth: Arc<dyn AuthApi>, store: LocalStore) -> Self {
        let state = LiveView::new(SessionState::Loading);
        // Subscribe first so events raised by the restore itself are seen.
        let events = auth.subscribe_auth();

        let task = {
            let auth = auth.clone();
            let state = state.clone();
            tokio::spawn(async move {
                let resolved = resolve(auth.as_ref(), &store).await;
                set_state(&state, resolved);
                watch_events(auth.as_ref(), &store, &state, events).await;
            })
        };

        Self {
            auth,
            state,
            _task: TaskGuard::new(task),
        }
    }

    pub fn view(&self) -> LiveView<SessionState> {
        self.state.clone()
    }

    pub fn current(&self) -> SessionState {
        self.state.snapshot()
    }

    pub fn auth(&self) -> Arc<dyn AuthApi> {
        self.auth.clone()
    }

    /// Waits until the initial resolution has finished.
    pub async fn ready(&self) -> SessionState {
        let mut rx = self.state.watch();
        let state = match rx.wait_for(|s| *s != SessionState::Loading).await {
            Ok(state) => state.clone(),
            Err(_) => SessionState::Unauthenticated,
        };
        state
    }

    pub fn route(&self, requested_path: &str) -> RouteDecision {
        self.state.read(|state| decide(state, requested_path))
    }
}

pub fn decide(state: &SessionState, requested_path: &str) -> RouteDecision {
    match state {
        SessionState::Authenticated(_) => RouteDecision::Render,
        SessionState::Loading => RouteDecision::Wait,
        SessionState::Unauthenticated => RouteDecision::RedirectToLogin {
            from: requested_path.to_string(),
        },
    }
}

fn set_state(view: &LiveView<SessionState>, next: SessionState) {
    view.update_if(|state| {
        if *state == next {
            return false;
        }
        *state = next;
        true
    });
}

async fn resolve(auth: &dyn AuthApi, store: &LocalStore) -> SessionState {
    match auth.get_session().await {
        Ok(Some(session)) => {
            write_mirror(store, &session).await;
            return SessionState::Authenticated(session);
        }
        Ok(None) => {}
        Err(err) => {
            tracing::warn!(component = COMPONENT, error = %err, "session lookup failed");
        }
    }

    match restore(auth, store).await {
        Ok(Some(session)) => {
            tracing::info!(component = COMPONENT, user_id = %session.user_id(), "session restored from mirror");
            SessionState::Authenticated(session)
        }
        Ok(None) => SessionState::Unauthenticated,
        // Unreachable backend: the mirror stays for the next start.
        Err(err) if err.is_network() => {
            tracing::warn!(component = COMPONENT, error = %err, "session restore deferred, backend unreachable");
            SessionState::Unauthenticated
        }
        Err(err) => {
            tracing::warn!(component = COMPONENT, error = %err, "session restore failed");
            clear_mirror(store).await;
            SessionState::Unauthenticated
        }
    }
}

async fn restore(auth: &dyn AuthApi, store: &LocalStore) -> AppResult<Option<Session>> {
    let Some(mirror) = store.get_json::<TokenMirror>(MIRROR_KEY).await? else {
        return Ok(None);
    };
    let session = auth
        .set_session(&mirror.access_token, &mirror.refresh_token)
        .await?;
    Ok(Some(session))
}

async fn watch_events(
    auth: &dyn AuthApi,
    store: &LocalStore,
    state: &LiveView<SessionState>,
    mut events: tokio::sync::broadcast::Receiver<AuthEvent>,
) {
    loop {
        match events.recv().await {
            Ok(AuthEvent::SignedIn(session)) | Ok(AuthEvent::TokenRefreshed(session)) => {
                write_mirror(store, &session).await;
                set_state(state, SessionState::Authenticated(session));
            }
            Ok(AuthEvent::SignedOut) => {
                clear_mirror(store).await;
                set_state(state, SessionState::Unauthenticated);
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(component = COMPONENT, skipped, "auth events lagged, re-reading session");
                let next = match auth.get_session().await {
                    Ok(Some(session)) => SessionState::Authenticated(session),
                    _ => SessionState::Unauthenticated,
                };
                set_state(state, next);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn write_mirror(store: &LocalStore, session: &Session) {
    if let Err(err) = store
        .set_json(MIRROR_KEY, &TokenMirror::from_session(session))
        .await
    {
        tracing::warn!(component = COMPONENT, error = %err, "failed to persist session mirror");
    }
}

async fn clear_mirror(store: &LocalStore) {
    if let Err(err) = store.remove(MIRROR_KEY).await {
        tracing::warn!(component = COMPONENT, error = %err, "failed to clear session mirror");
    }
}
