//! Client for the remote state endpoint.
//!
//! Carries no retry or backoff: callers decide whether a failure matters.

use crate::error::RemoteError;
use async_trait::async_trait;
use link_protocol::headers;
use link_protocol::{ErrorBody, StatePutBody, StateSnapshot, Stage, WriteAck};
use reqwest::header::{AUTHORIZATION, CACHE_CONTROL};
use reqwest::{Client, RequestBuilder, Response};
use std::time::Duration;
use url::Url;

const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Which write path a `PUT` takes; decides the headers sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteKind {
    /// `X-Admin-Reset: 1`, optionally `X-Client-Aborted: 1`.
    AdminReset { aborted: bool },
    /// `X-Client-Stage: <stage>` for finalize (6) and unlink (7).
    ClientStage(Stage),
    /// `X-Client-Stage: 6` with `test_message: true`.
    TestMessage,
    /// Bearer-token write, as the bot performs.
    Bot { token: String },
    /// Bearer-token write restricted to profile fields.
    ProfileOnly { token: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateWrite {
    pub kind: WriteKind,
    pub body: StatePutBody,
    /// Sent as `X-Link-Capability` when present.
    pub capability: Option<String>,
}

impl StateWrite {
    pub fn admin_reset(stage: Stage, aborted: bool) -> Self {
        Self {
            kind: WriteKind::AdminReset { aborted },
            body: StatePutBody::with_stage(stage),
            capability: None,
        }
    }

    pub fn client_stage(stage: Stage) -> Self {
        Self {
            kind: WriteKind::ClientStage(stage),
            body: StatePutBody::with_stage(stage),
            capability: None,
        }
    }

    pub fn test_message() -> Self {
        Self {
            kind: WriteKind::TestMessage,
            body: StatePutBody::test_message(),
            capability: None,
        }
    }

    pub fn bot(token: impl Into<String>, body: StatePutBody) -> Self {
        Self {
            kind: WriteKind::Bot {
                token: token.into(),
            },
            body,
            capability: None,
        }
    }

    pub fn profile_only(token: impl Into<String>, body: StatePutBody) -> Self {
        Self {
            kind: WriteKind::ProfileOnly {
                token: token.into(),
            },
            body,
            capability: None,
        }
    }

    pub fn with_capability(mut self, capability: Option<String>) -> Self {
        self.capability = capability;
        self
    }

    pub fn label(&self) -> &'static str {
        match &self.kind {
            WriteKind::AdminReset { aborted: true } => "abort",
            WriteKind::AdminReset { aborted: false } => "admin reset",
            WriteKind::ClientStage(stage) if *stage == Stage::UNLINKED => "unlink",
            WriteKind::ClientStage(_) => "finalize",
            WriteKind::TestMessage => "test message",
            WriteKind::Bot { .. } => "bot write",
            WriteKind::ProfileOnly { .. } => "profile update",
        }
    }
}

#[async_trait]
pub trait RemoteState: Send + Sync {
    /// `None` when the endpoint has no record for the session (`{}`).
    async fn get(&self, session_id: &str) -> Result<Option<StateSnapshot>, RemoteError>;

    async fn put(&self, session_id: &str, write: &StateWrite) -> Result<WriteAck, RemoteError>;
}

/// `reqwest` implementation talking to `GET`/`PUT <endpoint>?session=<id>`.
#[derive(Debug, Clone)]
pub struct HttpRemoteState {
    client: Client,
    endpoint: Url,
}

impl HttpRemoteState {
    pub fn new(endpoint: &str) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Self::with_client(client, endpoint)
    }

    pub fn with_client(client: Client, endpoint: &str) -> Result<Self, RemoteError> {
        Ok(Self {
            client,
            endpoint: Url::parse(endpoint)?,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn url_with(&self, key: &str, value: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair(key, value);
        url
    }

    /// Most recently updated session whose persistent or last actor is the
    /// given Telegram user.
    pub async fn find_by_telegram_user(
        &self,
        tg_user_id: i64,
    ) -> Result<Option<StateSnapshot>, RemoteError> {
        let url = self.url_with("tg", &tg_user_id.to_string());
        fetch_snapshot(self.client.get(url)).await
    }
}

#[async_trait]
impl RemoteState for HttpRemoteState {
    async fn get(&self, session_id: &str) -> Result<Option<StateSnapshot>, RemoteError> {
        let url = self.url_with("session", session_id);
        fetch_snapshot(self.client.get(url)).await
    }

    async fn put(&self, session_id: &str, write: &StateWrite) -> Result<WriteAck, RemoteError> {
        let url = self.url_with("session", session_id);
        let mut request = self.client.put(url).json(&write.body);

        request = match &write.kind {
            WriteKind::AdminReset { aborted } => {
                let request = request.header(headers::ADMIN_RESET, "1");
                if *aborted {
                    request.header(headers::CLIENT_ABORTED, "1")
                } else {
                    request
                }
            }
            WriteKind::ClientStage(stage) => request.header(headers::CLIENT_STAGE, stage.to_string()),
            WriteKind::TestMessage => {
                request.header(headers::CLIENT_STAGE, Stage::LINKED.to_string())
            }
            WriteKind::Bot { token } => request.header(AUTHORIZATION, format!("Bearer {token}")),
            WriteKind::ProfileOnly { token } => request
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .header(headers::PROFILE_ONLY, "1"),
        };
        if let Some(capability) = &write.capability {
            request = request.header(headers::CAPABILITY, capability);
        }

        let response = check_status(request.send().await?).await?;
        response
            .json::<WriteAck>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

async fn fetch_snapshot(request: RequestBuilder) -> Result<Option<StateSnapshot>, RemoteError> {
    let response = check_status(request.header(CACHE_CONTROL, "no-store").send().await?).await?;
    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| RemoteError::Decode(e.to_string()))?;

    match body.as_object() {
        Some(fields) if fields.is_empty() => Ok(None),
        Some(_) => serde_json::from_value(body)
            .map(Some)
            .map_err(|e| RemoteError::Decode(e.to_string())),
        None => Err(RemoteError::Decode(format!("expected an object, got {body}"))),
    }
}

async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(ErrorBody {
            error,
            detail: Some(detail),
        }) => format!("{error}: {detail}"),
        Ok(ErrorBody { error, detail: None }) => error,
        Err(_) => text,
    };
    Err(RemoteError::Status {
        status: status.as_u16(),
        message,
    })
}
