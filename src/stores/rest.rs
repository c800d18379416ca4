//! REST row-store backend, enabled with the `store-rest` feature.
//!
//! Speaks a small JSON dialect to a row store fronted by HTTP:
//!
//! | Operation                  | Request                                        |
//! |----------------------------|------------------------------------------------|
//! | `create_session`           | `POST   sessions`                              |
//! | `get_session`              | `GET    sessions/{code}`                       |
//! | `update_session`           | `PATCH  sessions/{code}`                       |
//! | `add_player`               | `POST   players`                               |
//! | `get_player`               | `GET    players/{id}`                          |
//! | `session_players`          | `GET    sessions/{code}/players`               |
//! | `update_player`            | `PATCH  players/{id}`                          |
//! | `update_player_connection` | `PATCH  players/{id}/connection`               |
//! | `claim_video_room`         | `POST   sessions/{code}/video-room/claim`      |
//! | `complete_video_room`      | `POST   sessions/{code}/video-room/complete`   |
//! | `release_video_room`       | `POST   sessions/{code}/video-room/release`    |
//! | `record_event`             | `POST   sessions/{code}/events`                |
//!
//! Status codes carry the [`StoreError`] taxonomy: `404` is
//! [`StoreError::NotFound`] (or a foreign-key violation for `add_player`),
//! `409` is [`StoreError::DuplicateKey`] on create and a lost claim on
//! `claim_video_room`. Everything else non-2xx is
//! [`StoreError::Unavailable`]. The claim endpoint performs the
//! compare-and-set server-side, inside the row store's transaction, which
//! is what makes the guarantee hold across processes.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::model::{Player, PlayerId, Session, SessionCode};
use crate::protocol::{PlayerPatch, SessionPatch};
use crate::store::{
    NewPlayer, NewSession, SessionStore, StoreError, StoreResult, VideoRoomClaim,
};

/// Runtime configuration describing how to reach the row store.
#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    /// Base URL of the row store, e.g. `https://store.example.com/v1`.
    pub base_url: String,
    /// Bearer token sent with every request, if the store requires one.
    pub api_key: Option<String>,
}

impl RestStoreConfig {
    /// Construct a configuration from an explicit base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
        }
    }

    /// Attach a bearer token to the configuration.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Build a configuration from `THIRTY_SYNC_STORE_URL` and the optional
    /// `THIRTY_SYNC_STORE_KEY`.
    pub fn from_env() -> StoreResult<Self> {
        let base_url = std::env::var("THIRTY_SYNC_STORE_URL")
            .map_err(|_| StoreError::unavailable("THIRTY_SYNC_STORE_URL is not set"))?;

        let mut config = Self::new(base_url);
        if let Ok(api_key) = std::env::var("THIRTY_SYNC_STORE_KEY") {
            config = config.with_api_key(api_key);
        }
        Ok(config)
    }
}

/// [`SessionStore`] backed by the REST row store.
///
/// Cloning is cheap; clones share the underlying connection pool.
#[derive(Clone)]
pub struct RestStore {
    client: Client,
    base_url: Arc<str>,
    api_key: Option<Arc<str>>,
}

impl RestStore {
    /// Build the HTTP client and probe the store's health endpoint.
    pub async fn connect(config: RestStoreConfig) -> StoreResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|source| StoreError::unavailable_from("failed to build HTTP client", source))?;

        let store = Self {
            client,
            base_url: Arc::<str>::from(config.base_url.trim_end_matches('/')),
            api_key: config.api_key.map(Arc::<str>::from),
        };

        store.health_check().await?;
        Ok(store)
    }

    /// Probe the store. Useful for readiness checks after a reconnect.
    pub async fn health_check(&self) -> StoreResult<()> {
        let response = self.send(self.request(Method::GET, "health"), "health").await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error("health", response.status()))
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url, path);
        let builder = self.client.request(method, url);
        if let Some(key) = &self.api_key {
            builder.bearer_auth(key.as_ref())
        } else {
            builder
        }
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        path: &str,
    ) -> StoreResult<reqwest::Response> {
        builder.send().await.map_err(|source| {
            StoreError::unavailable_from(format!("request to {path} failed"), source)
        })
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
        path: &str,
    ) -> StoreResult<T> {
        response.json::<T>().await.map_err(|source| {
            StoreError::unavailable_from(format!("undecodable response from {path}"), source)
        })
    }
}

fn status_error(path: &str, status: StatusCode) -> StoreError {
    StoreError::unavailable(format!("{path} returned {status}"))
}

#[derive(Serialize)]
struct ConnectionBody<'a> {
    session_code: &'a SessionCode,
    connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    attrs: Option<&'a NewPlayer>,
}

#[derive(Serialize)]
struct CompleteBody<'a> {
    url: &'a str,
}

#[derive(Serialize)]
struct ReleaseBody<'a> {
    reason: &'a str,
}

#[derive(Serialize)]
struct EventBody<'a> {
    kind: &'a str,
    payload: serde_json::Value,
}

#[async_trait]
impl SessionStore for RestStore {
    async fn create_session(&self, new: NewSession) -> StoreResult<Session> {
        let response = self
            .send(self.request(Method::POST, "sessions").json(&new), "sessions")
            .await?;
        match response.status() {
            StatusCode::CONFLICT => Err(StoreError::duplicate("session", &new.code)),
            status if status.is_success() => self.decode(response, "sessions").await,
            other => Err(status_error("sessions", other)),
        }
    }

    async fn get_session(&self, code: &SessionCode) -> StoreResult<Session> {
        let path = format!("sessions/{code}");
        let response = self.send(self.request(Method::GET, &path), &path).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(StoreError::not_found("session", code)),
            status if status.is_success() => self.decode(response, &path).await,
            other => Err(status_error(&path, other)),
        }
    }

    async fn update_session(
        &self,
        code: &SessionCode,
        patch: SessionPatch,
    ) -> StoreResult<Session> {
        let path = format!("sessions/{code}");
        let response = self
            .send(self.request(Method::PATCH, &path).json(&patch), &path)
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(StoreError::not_found("session", code)),
            status if status.is_success() => self.decode(response, &path).await,
            other => Err(status_error(&path, other)),
        }
    }

    async fn add_player(&self, new: NewPlayer) -> StoreResult<Player> {
        let response = self
            .send(self.request(Method::POST, "players").json(&new), "players")
            .await?;
        match response.status() {
            // The store rejects rows whose session is missing; an existing
            // player id is replaced, never a conflict.
            StatusCode::NOT_FOUND => Err(StoreError::foreign_key(format!(
                "player {} references missing session {}",
                new.id, new.session_code
            ))),
            status if status.is_success() => self.decode(response, "players").await,
            other => Err(status_error("players", other)),
        }
    }

    async fn get_player(&self, id: &PlayerId) -> StoreResult<Player> {
        let path = format!("players/{id}");
        let response = self.send(self.request(Method::GET, &path), &path).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(StoreError::not_found("player", id)),
            status if status.is_success() => self.decode(response, &path).await,
            other => Err(status_error(&path, other)),
        }
    }

    async fn session_players(&self, code: &SessionCode) -> StoreResult<Vec<Player>> {
        let path = format!("sessions/{code}/players");
        let response = self.send(self.request(Method::GET, &path), &path).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(StoreError::not_found("session", code)),
            status if status.is_success() => self.decode(response, &path).await,
            other => Err(status_error(&path, other)),
        }
    }

    async fn update_player(&self, id: &PlayerId, patch: PlayerPatch) -> StoreResult<Player> {
        let path = format!("players/{id}");
        let response = self
            .send(self.request(Method::PATCH, &path).json(&patch), &path)
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(StoreError::not_found("player", id)),
            status if status.is_success() => self.decode(response, &path).await,
            other => Err(status_error(&path, other)),
        }
    }

    async fn update_player_connection(
        &self,
        id: &PlayerId,
        code: &SessionCode,
        connected: bool,
        attrs: Option<NewPlayer>,
    ) -> StoreResult<Player> {
        let path = format!("players/{id}/connection");
        let body = ConnectionBody {
            session_code: code,
            connected,
            attrs: attrs.as_ref(),
        };
        let response = self
            .send(self.request(Method::PATCH, &path).json(&body), &path)
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(StoreError::not_found("player", id)),
            status if status.is_success() => self.decode(response, &path).await,
            other => Err(status_error(&path, other)),
        }
    }

    async fn claim_video_room(&self, code: &SessionCode) -> StoreResult<VideoRoomClaim> {
        let path = format!("sessions/{code}/video-room/claim");
        let response = self.send(self.request(Method::POST, &path), &path).await?;
        match response.status() {
            // The service returns 409 when the compare-and-set found the
            // room already claimed or provisioned.
            StatusCode::CONFLICT => {
                debug!(session = %code, "video room claim lost");
                Ok(VideoRoomClaim::Lost)
            }
            StatusCode::NOT_FOUND => Err(StoreError::not_found("session", code)),
            status if status.is_success() => Ok(VideoRoomClaim::Won),
            other => Err(status_error(&path, other)),
        }
    }

    async fn complete_video_room(&self, code: &SessionCode, url: &str) -> StoreResult<Session> {
        let path = format!("sessions/{code}/video-room/complete");
        let response = self
            .send(
                self.request(Method::POST, &path).json(&CompleteBody { url }),
                &path,
            )
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(StoreError::not_found("session", code)),
            status if status.is_success() => self.decode(response, &path).await,
            other => Err(status_error(&path, other)),
        }
    }

    async fn release_video_room(
        &self,
        code: &SessionCode,
        reason: &str,
    ) -> StoreResult<Session> {
        let path = format!("sessions/{code}/video-room/release");
        let response = self
            .send(
                self.request(Method::POST, &path).json(&ReleaseBody { reason }),
                &path,
            )
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(StoreError::not_found("session", code)),
            status if status.is_success() => self.decode(response, &path).await,
            other => Err(status_error(&path, other)),
        }
    }

    async fn record_event(
        &self,
        code: &SessionCode,
        kind: &str,
        payload: serde_json::Value,
    ) -> StoreResult<()> {
        let path = format!("sessions/{code}/events");
        let response = self
            .send(
                self.request(Method::POST, &path)
                    .json(&EventBody { kind, payload }),
                &path,
            )
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(StoreError::not_found("session", code)),
            status if status.is_success() => Ok(()),
            other => Err(status_error(&path, other)),
        }
    }
}
