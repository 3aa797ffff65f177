use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use shared_proto::auth::{AuthEvent, AuthUser, PasswordCredentials, Session};
use tokio::sync::broadcast;

use super::{checked, json_body, AuthApi, BackendClient};
use crate::error::{AppError, AppResult};
use crate::protocol;

/// Access tokens this close to expiry are refreshed before use.
pub const EXPIRY_LEEWAY_SECS: i64 = 30;

#[derive(Debug, Deserialize)]
struct TokenGrant {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: AuthUser,
}

impl TokenGrant {
    fn into_session(self) -> Session {
        let expires_at = self
            .expires_at
            .unwrap_or_else(|| Utc::now().timestamp() + self.expires_in.unwrap_or(3600));
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        }
    }
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

impl BackendClient {
    async fn token_grant<B: Serialize + ?Sized>(
        &self,
        grant_type: &str,
        body: &B,
        context: &str,
    ) -> AppResult<Session> {
        let mut url = self.endpoint(&format!("{}/token", protocol::AUTH_PATH))?;
        url.query_pairs_mut().append_pair("grant_type", grant_type);

        let res = self
            .request_with_bearer(Method::POST, url, self.anon_key())
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::network(format!("Network error: {}", e)))?;

        let value = json_body(res, context).await.map_err(|err| {
            if grant_type == "password" && err.code == crate::error::AppErrorCode::Validation {
                AppError::auth("Invalid login credentials")
            } else {
                err
            }
        })?;
        let grant: TokenGrant = serde_json::from_value(value)?;
        Ok(grant.into_session())
    }

    async fn refresh(&self, refresh_token: &str) -> AppResult<Session> {
        let session = self
            .token_grant(
                "refresh_token",
                &RefreshRequest { refresh_token },
                "Refresh session",
            )
            .await?;
        self.store_session(Some(session.clone())).await;
        tracing::debug!(component = "auth", user_id = %session.user.id, "session refreshed");
        self.emit(AuthEvent::TokenRefreshed(session.clone()));
        Ok(session)
    }
}

#[async_trait]
impl AuthApi for BackendClient {
    async fn sign_up(&self, email: &str, password: &str) -> AppResult<Option<Session>> {
        let url = self.endpoint(&format!("{}/signup", protocol::AUTH_PATH))?;
        let res = self
            .request_with_bearer(Method::POST, url, self.anon_key())
            .json(&PasswordCredentials {
                email: email.to_string(),
                password: password.to_string(),
            })
            .send()
            .await
            .map_err(|e| AppError::network(format!("Network error: {}", e)))?;

        let value = json_body(res, "Sign up").await?;
        if value.get("access_token").is_none() {
            tracing::info!(component = "auth", "sign-up pending email confirmation");
            return Ok(None);
        }

        let session = serde_json::from_value::<TokenGrant>(value)?.into_session();
        self.store_session(Some(session.clone())).await;
        self.emit(AuthEvent::SignedIn(session.clone()));
        Ok(Some(session))
    }

    async fn sign_in(&self, email: &str, password: &str) -> AppResult<Session> {
        let session = self
            .token_grant(
                "password",
                &PasswordCredentials {
                    email: email.to_string(),
                    password: password.to_string(),
                },
                "Sign in",
            )
            .await?;
        self.store_session(Some(session.clone())).await;
        tracing::info!(component = "auth", user_id = %session.user.id, "signed in");
        self.emit(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> AppResult<()> {
        let current = self.current_session().await;
        self.store_session(None).await;

        if let Some(session) = current {
            let url = self.endpoint(&format!("{}/logout", protocol::AUTH_PATH))?;
            let result = self
                .request_with_bearer(Method::POST, url, &session.access_token)
                .send()
                .await;
            // Local sign-out stands even when the backend call fails.
            match result {
                Ok(res) => {
                    if let Err(err) = checked(res, "Sign out").await {
                        tracing::warn!(component = "auth", error = %err, "remote sign-out rejected");
                    }
                }
                Err(err) => {
                    tracing::warn!(component = "auth", error = %err, "remote sign-out failed");
                }
            }
        }

        self.emit(AuthEvent::SignedOut);
        Ok(())
    }

    async fn get_session(&self) -> AppResult<Option<Session>> {
        let Some(session) = self.current_session().await else {
            return Ok(None);
        };

        if !session.is_expired(Utc::now().timestamp(), EXPIRY_LEEWAY_SECS) {
            return Ok(Some(session));
        }

        match self.refresh(&session.refresh_token).await {
            Ok(refreshed) => Ok(Some(refreshed)),
            Err(err) if err.is_network() => Err(err),
            Err(err) => {
                tracing::warn!(component = "auth", error = %err, "refresh rejected, signing out");
                self.store_session(None).await;
                self.emit(AuthEvent::SignedOut);
                Ok(None)
            }
        }
    }

    async fn set_session(&self, access_token: &str, refresh_token: &str) -> AppResult<Session> {
        let url = self.endpoint(&format!("{}/user", protocol::AUTH_PATH))?;
        let res = self
            .request_with_bearer(Method::GET, url, access_token)
            .send()
            .await
            .map_err(|e| AppError::network(format!("Network error: {}", e)))?;

        // A still-valid access token only proves identity; the refresh grant
        // is what yields a session with a known expiry.
        if res.status().is_success() || res.status().as_u16() == 401 {
            let session = self
                .token_grant(
                    "refresh_token",
                    &RefreshRequest { refresh_token },
                    "Restore session",
                )
                .await?;
            self.store_session(Some(session.clone())).await;
            tracing::info!(component = "auth", user_id = %session.user.id, "session restored");
            self.emit(AuthEvent::SignedIn(session.clone()));
            return Ok(session);
        }

        Err(checked(res, "Restore session")
            .await
            .err()
            .unwrap_or_else(|| AppError::auth("Restore session failed")))
    }

    fn subscribe_auth(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_events.subscribe()
    }
}
