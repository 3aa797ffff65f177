pub mod auth;
pub mod friends;
pub mod messages;
pub mod notifications;
pub mod posts;
pub mod profiles;
pub mod query;
pub mod stories;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared_proto::auth::{AuthEvent, Session};
use shared_proto::models::Table;
use tokio::sync::{broadcast, RwLock};
use url::Url;

use crate::error::{AppError, AppResult};
use crate::protocol;
use query::Query;

/// Table, storage and RPC surface of the hosted backend.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn select(&self, table: &str, query: &Query) -> AppResult<Vec<Value>>;

    /// Inserts one row and returns it as stored.
    async fn insert(&self, table: &str, row: Value) -> AppResult<Value>;

    async fn update(&self, table: &str, query: &Query, patch: Value) -> AppResult<Vec<Value>>;

    async fn delete(&self, table: &str, query: &Query) -> AppResult<()>;

    async fn rpc(&self, function: &str, args: Value) -> AppResult<Value>;

    /// Uploads an object and returns its public URL.
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> AppResult<String>;
}

/// Authentication surface of the hosted backend.
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Returns `None` when the backend requires email confirmation first.
    async fn sign_up(&self, email: &str, password: &str) -> AppResult<Option<Session>>;

    async fn sign_in(&self, email: &str, password: &str) -> AppResult<Session>;

    async fn sign_out(&self) -> AppResult<()>;

    /// The live session, refreshed when its access token has expired.
    async fn get_session(&self) -> AppResult<Option<Session>>;

    /// Adopts a previously persisted token pair.
    async fn set_session(&self, access_token: &str, refresh_token: &str) -> AppResult<Session>;

    fn subscribe_auth(&self) -> broadcast::Receiver<AuthEvent>;
}

pub async fn fetch_rows<T>(backend: &dyn Backend, query: &Query) -> AppResult<Vec<T>>
where
    T: Table + DeserializeOwned,
{
    let rows = backend.select(T::NAME, query).await?;
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(AppError::from))
        .collect()
}

pub async fn insert_row<T>(backend: &dyn Backend, row: Value) -> AppResult<T>
where
    T: Table + DeserializeOwned,
{
    let stored = backend.insert(T::NAME, row).await?;
    Ok(serde_json::from_value(stored)?)
}

pub async fn update_rows<T>(backend: &dyn Backend, query: &Query, patch: Value) -> AppResult<Vec<T>>
where
    T: Table + DeserializeOwned,
{
    let rows = backend.update(T::NAME, query, patch).await?;
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(AppError::from))
        .collect()
}

/// HTTP client for the hosted backend. Holds the live auth session.
pub struct BackendClient {
    pub client: Client,
    pub base_url: Url,
    anon_key: String,
    session: Arc<RwLock<Option<Session>>>,
    auth_events: broadcast::Sender<AuthEvent>,
}

impl BackendClient {
    pub fn new(base_url: Url, anon_key: String) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::internal("Failed to create HTTP client").with_details(e.to_string()))?;

        let mut base_url = base_url;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let (auth_events, _) = broadcast::channel(16);

        Ok(Self {
            client,
            base_url,
            anon_key,
            session: Arc::new(RwLock::new(None)),
            auth_events,
        })
    }

    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }

    pub async fn current_session(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    async fn store_session(&self, session: Option<Session>) {
        let mut write_guard = self.session.write().await;
        *write_guard = session;
    }

    fn emit(&self, event: AuthEvent) {
        // No listeners is fine.
        let _ = self.auth_events.send(event);
    }

    pub fn endpoint(&self, path: &str) -> AppResult<Url> {
        Ok(self.base_url.join(path)?)
    }

    pub fn rest_url(&self, table: &str) -> AppResult<Url> {
        self.endpoint(&format!("{}/{}", protocol::REST_PATH, table))
    }

    pub fn public_object_url(&self, bucket: &str, path: &str) -> AppResult<Url> {
        self.endpoint(&format!(
            "{}/object/public/{}/{}",
            protocol::STORAGE_PATH,
            bucket,
            path
        ))
    }

    pub fn realtime_url(&self) -> AppResult<Url> {
        let mut url = self.endpoint(protocol::REALTIME_PATH)?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| AppError::validation("Backend URL cannot be used for websockets"))?;
        url.query_pairs_mut()
            .append_pair("apikey", &self.anon_key)
            .append_pair("vsn", protocol::REALTIME_VSN);
        Ok(url)
    }

    /// Bearer token for the next request: the user's access token, refreshed
    /// when expired, or the anon key when signed out.
    pub async fn bearer_token(&self) -> String {
        match self.get_session().await {
            Ok(Some(session)) => session.access_token,
            _ => self.anon_key.clone(),
        }
    }

    async fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let bearer = self.bearer_token().await;
        self.request_with_bearer(method, url, &bearer)
    }

    fn request_with_bearer(&self, method: Method, url: Url, bearer: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header(protocol::HEADER_API_KEY, &self.anon_key)
            .header(protocol::HEADER_AUTHORIZATION, format!("Bearer {}", bearer))
            .header(protocol::HEADER_CLIENT_INFO, protocol::CLIENT_INFO)
            .header(protocol::HEADER_TRACE_ID, crate::observability::trace_id())
            .header(protocol::HEADER_REQUEST_ID, crate::observability::request_id())
    }
}

async fn checked(res: Response, context: &str) -> AppResult<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let text = res.text().await.unwrap_or_default();
    tracing::warn!(
        component = "api",
        status = status.as_u16(),
        context = context,
        "backend request rejected"
    );
    Err(AppError::from_status(status.as_u16(), context, text))
}

async fn json_body(res: Response, context: &str) -> AppResult<Value> {
    let res = checked(res, context).await?;
    let text = res.text().await?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
}

fn into_rows(value: Value) -> Vec<Value> {
    match value {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

#[async_trait]
impl Backend for BackendClient {
    async fn select(&self, table: &str, query: &Query) -> AppResult<Vec<Value>> {
        let url = self.rest_url(table)?;
        let res = self
            .request(Method::GET, url)
            .await
            .query(&query.to_params())
            .send()
            .await?;
        Ok(into_rows(json_body(res, &format!("Select {}", table)).await?))
    }

    async fn insert(&self, table: &str, row: Value) -> AppResult<Value> {
        let url = self.rest_url(table)?;
        let res = self
            .request(Method::POST, url)
            .await
            .header(protocol::HEADER_PREFER, protocol::PREFER_RETURN_REPRESENTATION)
            .json(&row)
            .send()
            .await?;
        into_rows(json_body(res, &format!("Insert into {}", table)).await?)
            .into_iter()
            .next()
            .ok_or_else(|| AppError::protocol(format!("Insert into {} returned no row", table)))
    }

    async fn update(&self, table: &str, query: &Query, patch: Value) -> AppResult<Vec<Value>> {
        let url = self.rest_url(table)?;
        let res = self
            .request(Method::PATCH, url)
            .await
            .header(protocol::HEADER_PREFER, protocol::PREFER_RETURN_REPRESENTATION)
            .query(&query.to_params())
            .json(&patch)
            .send()
            .await?;
        Ok(into_rows(json_body(res, &format!("Update {}", table)).await?))
    }

    async fn delete(&self, table: &str, query: &Query) -> AppResult<()> {
        let url = self.rest_url(table)?;
        let res = self
            .request(Method::DELETE, url)
            .await
            .header(protocol::HEADER_PREFER, protocol::PREFER_RETURN_MINIMAL)
            .query(&query.to_params())
            .send()
            .await?;
        checked(res, &format!("Delete from {}", table)).await?;
        Ok(())
    }

    async fn rpc(&self, function: &str, args: Value) -> AppResult<Value> {
        let url = self.endpoint(&format!("{}/rpc/{}", protocol::REST_PATH, function))?;
        let res = self
            .request(Method::POST, url)
            .await
            .json(&args)
            .send()
            .await?;
        json_body(res, &format!("Call {}", function)).await
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> AppResult<String> {
        let url = self.endpoint(&format!("{}/object/{}/{}", protocol::STORAGE_PATH, bucket, path))?;
        let res = self
            .request(Method::POST, url)
            .await
            .header("Content-Type", content_type)
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await?;
        checked(res, &format!("Upload to {}", bucket)).await?;
        Ok(self.public_object_url(bucket, path)?.to_string())
    }
}
