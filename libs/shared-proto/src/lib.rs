pub mod models;
pub mod realtime;

pub mod auth {
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct AuthUser {
        pub id: Uuid,
        #[serde(default)]
        pub email: Option<String>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Session {
        pub access_token: String,
        pub refresh_token: String,
        /// Unix seconds.
        pub expires_at: i64,
        pub user: AuthUser,
    }

    impl Session {
        pub fn user_id(&self) -> Uuid {
            self.user.id
        }

        /// Treats a token that expires within `leeway_secs` as already expired.
        pub fn is_expired(&self, now_secs: i64, leeway_secs: i64) -> bool {
            self.expires_at <= now_secs.saturating_add(leeway_secs)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "event", content = "session", rename_all = "SCREAMING_SNAKE_CASE")]
    pub enum AuthEvent {
        SignedIn(Session),
        SignedOut,
        TokenRefreshed(Session),
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct PasswordCredentials {
        pub email: String,
        pub password: String,
    }
}
