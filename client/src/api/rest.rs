use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::auth::Session;
use crate::error::ApiError;
use crate::store::MemberKey;

/// Lookup endpoints the client uses to upgrade partial records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    User(String),
    Channel(String),
    Server(String),
    Member(MemberKey),
    Bot(String),
    Webhook(String),
    SyncUnreads,
}

impl Route {
    pub fn path(&self) -> String {
        match self {
            Self::User(id) => format!("/users/{id}"),
            Self::Channel(id) => format!("/channels/{id}"),
            Self::Server(id) => format!("/servers/{id}"),
            Self::Member(key) => format!("/servers/{}/members/{}", key.server, key.user),
            Self::Bot(id) => format!("/bots/{id}"),
            Self::Webhook(id) => format!("/webhooks/{id}"),
            Self::SyncUnreads => "/sync/unreads".to_string(),
        }
    }
}

/// REST collaborator. Implementors only provide `get`; the typed lookups
/// are built on it.
#[async_trait]
pub trait RestApi: Send + Sync {
    async fn get(&self, route: Route) -> Result<Value, ApiError>;

    async fn fetch_user(&self, id: &str) -> Result<Value, ApiError> {
        self.get(Route::User(id.to_string())).await
    }

    async fn fetch_channel(&self, id: &str) -> Result<Value, ApiError> {
        self.get(Route::Channel(id.to_string())).await
    }

    async fn fetch_server(&self, id: &str) -> Result<Value, ApiError> {
        self.get(Route::Server(id.to_string())).await
    }

    async fn fetch_member(&self, key: &MemberKey) -> Result<Value, ApiError> {
        self.get(Route::Member(key.clone())).await
    }

    async fn fetch_bot(&self, id: &str) -> Result<Value, ApiError> {
        self.get(Route::Bot(id.to_string())).await
    }

    async fn fetch_webhook(&self, id: &str) -> Result<Value, ApiError> {
        self.get(Route::Webhook(id.to_string())).await
    }

    /// Unread state for every channel; a non-array body counts as empty.
    async fn sync_unreads(&self) -> Result<Vec<Value>, ApiError> {
        match self.get(Route::SyncUnreads).await? {
            Value::Array(unreads) => Ok(unreads),
            _ => Ok(Vec::new()),
        }
    }
}

/// [`RestApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpApi {
    http: reqwest::Client,
    base_url: String,
    session: Session,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, session: Session) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl RestApi for HttpApi {
    async fn get(&self, route: Route) -> Result<Value, ApiError> {
        let path = route.path();
        let (header, token) = self.session.auth_header();
        debug!(%path, "GET");

        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .header(header, token)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                route: path,
                status: status.as_u16(),
            });
        }
        Ok(resp.json().await?)
    }
}
