//! Application-wide state with typed actions.

use serde::{Deserialize, Serialize};
use shared_proto::auth::Session;

use crate::error::AppResult;
use crate::session::SessionState;
use crate::storage::LocalStore;
use crate::sync::{LiveView, TaskGuard};

pub const THEME_KEY: &str = "theme";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppState {
    pub session: Option<Session>,
    pub theme: Theme,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SessionChanged(Option<Session>),
    SetTheme(Theme),
}

/// Applies `action`; returns whether anything changed.
pub fn reduce(state: &mut AppState, action: Action) -> bool {
    match action {
        Action::SessionChanged(session) => {
            if state.session == session {
                return false;
            }
            state.session = session;
            true
        }
        Action::SetTheme(theme) => {
            if state.theme == theme {
                return false;
            }
            state.theme = theme;
            true
        }
    }
}

#[derive(Clone)]
pub struct AppStore {
    state: LiveView<AppState>,
    local: LocalStore,
}

impl AppStore {
    /// Loads the persisted theme; the session arrives later via actions.
    pub async fn load(local: LocalStore) -> AppResult<Self> {
        let theme = local.get_json::<Theme>(THEME_KEY).await?.unwrap_or_default();
        Ok(Self {
            state: LiveView::new(AppState {
                session: None,
                theme,
            }),
            local,
        })
    }

    pub fn view(&self) -> LiveView<AppState> {
        self.state.clone()
    }

    pub fn theme(&self) -> Theme {
        self.state.read(|s| s.theme)
    }

    pub async fn dispatch(&self, action: Action) -> AppResult<()> {
        let theme = match &action {
            Action::SetTheme(theme) => Some(*theme),
            Action::SessionChanged(_) => None,
        };
        let changed = self.state.update_if(|state| reduce(state, action));
        if let (true, Some(theme)) = (changed, theme) {
            self.local.set_json(THEME_KEY, &theme).await?;
            tracing::debug!(component = "store", ?theme, "theme persisted");
        }
        Ok(())
    }

    /// Mirrors session-guard transitions into the store until dropped.
    pub fn follow_session(&self, session: LiveView<SessionState>) -> TaskGuard {
        let store = self.clone();
        TaskGuard::new(tokio::spawn(async move {
            let mut rx = session.watch();
            loop {
                let current = rx.borrow_and_update().session().cloned();
                if let Err(err) = store.dispatch(Action::SessionChanged(current)).await {
                    tracing::warn!(component = "store", error = %err, "session dispatch failed");
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }))
    }
}
