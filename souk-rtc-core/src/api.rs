//! Conversation REST API
//!
//! History and conversation bootstrap go over HTTP; only live traffic
//! rides the channel. The [`ConversationApi`] trait is the seam the
//! chat store depends on, so tests can stand in an in-memory server.

use crate::types::{ConversationId, ConversationSummary, Message, UserId};
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

/// REST API errors
#[derive(Error, Debug)]
pub enum ApiError {
    /// The request never completed
    #[error("request failed: {0}")]
    Transport(String),

    /// The server answered with a non-success status
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: StatusCode,
        /// Response body, for diagnostics
        body: String,
    },

    /// The response body did not parse
    #[error("malformed response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Authoritative store for conversations and message history
#[async_trait]
pub trait ConversationApi: Send + Sync {
    /// List the caller's conversations
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] when the request fails.
    async fn conversations(&self) -> Result<Vec<ConversationSummary>, ApiError>;

    /// Fetch one page of a conversation's history, newest first;
    /// page numbering starts at 1
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] when the request fails.
    async fn messages(
        &self,
        conversation_id: &ConversationId,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Message>, ApiError>;

    /// Create (or fetch the existing) direct conversation with a peer
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] when the request fails.
    async fn create_conversation(&self, peer: &UserId) -> Result<ConversationSummary, ApiError>;
}

/// [`ConversationApi`] over HTTP with bearer-token auth
pub struct HttpApi {
    client: reqwest::Client,
    base: Url,
    token: String,
}

impl HttpApi {
    /// Create a client for the given API base URL
    #[must_use]
    pub fn new(base: Url, token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base,
            token,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path)
            .map_err(|e| ApiError::Transport(e.to_string()))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::Status { status, body })
        }
    }
}

#[async_trait]
impl ConversationApi for HttpApi {
    async fn conversations(&self) -> Result<Vec<ConversationSummary>, ApiError> {
        let response = self
            .client
            .get(self.endpoint("conversations")?)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn messages(
        &self,
        conversation_id: &ConversationId,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Message>, ApiError> {
        let mut url = self.endpoint(&format!("conversations/{conversation_id}/messages"))?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("limit", &limit.to_string());
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn create_conversation(&self, peer: &UserId) -> Result<ConversationSummary, ApiError> {
        let response = self
            .client
            .post(self.endpoint("conversations")?)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "peerId": peer }))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }
}
