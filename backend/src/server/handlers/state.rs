use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use link_protocol::{DEFAULT_SESSION, StatePutBody, WriteAck, is_valid_session_param};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::server::{
    auth::WritePolicy,
    config::AppState,
    error::ApiError,
    services::session_state::{WriteIntent, merge},
};

#[derive(Debug, Default, Deserialize)]
pub struct StateQuery {
    pub session: Option<String>,
    /// Short alias for `session`.
    pub s: Option<String>,
    /// Telegram user id; looks up that user's latest session instead.
    pub tg: Option<String>,
}

impl StateQuery {
    /// Invalid or missing identifiers share the `default` session.
    pub fn session_id(&self) -> &str {
        [self.session.as_deref(), self.s.as_deref()]
            .into_iter()
            .flatten()
            .find(|value| !value.is_empty())
            .filter(|value| is_valid_session_param(value))
            .unwrap_or(DEFAULT_SESSION)
    }
}

pub async fn get_state(
    State(state): State<AppState>,
    Query(query): Query<StateQuery>,
) -> Result<Response, ApiError> {
    let store = state.store()?;

    let snapshot = match query.tg.as_deref() {
        Some(tg) => {
            let tg_user_id: i64 = tg
                .trim()
                .parse()
                .map_err(|_| ApiError::InvalidTelegramUser)?;
            store
                .find_by_actor(tg_user_id)
                .await
                .map_err(ApiError::Read)?
                .map(|record| record.lookup_snapshot())
        }
        None => store
            .get(query.session_id())
            .await
            .map_err(ApiError::Read)?
            .map(|record| record.snapshot()),
    };

    Ok(match snapshot {
        Some(snapshot) => Json(snapshot).into_response(),
        None => Json(json!({})).into_response(),
    })
}

pub async fn put_state(
    State(state): State<AppState>,
    Query(query): Query<StateQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WriteAck>, ApiError> {
    let store = state.store()?;
    let session_id = query.session_id();
    let body = parse_body(&body)?;

    let intent = WritePolicy::classify(&headers, &body)?;
    let now = Utc::now();
    if let Err(e) = state
        .policy
        .authorize(session_id, intent, &headers, now.timestamp())
    {
        info!(session = session_id, intent = intent.label(), "write refused");
        return Err(e);
    }

    let previous = store.get(session_id).await.map_err(ApiError::Read)?;
    let record = merge(previous, session_id, intent, &body, now);
    store.upsert(&record).await.map_err(ApiError::Write)?;
    info!(
        session = session_id,
        intent = intent.label(),
        stage = %record.stage(),
        "state written"
    );

    if intent == WriteIntent::TestMessage {
        match (&state.notifier, record.actor_chat_id()) {
            (Some(notifier), Some(chat_id)) => notifier.spawn_test_message(chat_id),
            _ => debug!(session = session_id, "test message recorded without delivery"),
        }
    }

    let capabilities = state.policy.grants(session_id, intent, now.timestamp());
    Ok(Json(WriteAck::with_capabilities(capabilities)))
}

pub async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

pub async fn not_found() -> ApiError {
    ApiError::NotFound
}

/// An empty body counts as `{}`. Anything that is not a JSON object, or an
/// object whose fields have the wrong types, is rejected.
fn parse_body(bytes: &[u8]) -> Result<StatePutBody, ApiError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(StatePutBody::default());
    }
    let value: Value = serde_json::from_slice(bytes).map_err(|_| ApiError::BadJson)?;
    if !value.is_object() {
        return Err(ApiError::BadJson);
    }
    serde_json::from_value(value).map_err(|_| ApiError::BadJson)
}

#[cfg(test)]
mod tests {
    use super::*;
    use link_protocol::Stage;

    fn query(session: Option<&str>, s: Option<&str>) -> StateQuery {
        StateQuery {
            session: session.map(str::to_string),
            s: s.map(str::to_string),
            tg: None,
        }
    }

    #[test]
    fn session_parameter_falls_back_to_default() {
        assert_eq!(query(Some("SLX9A2B3"), None).session_id(), "SLX9A2B3");
        assert_eq!(query(None, Some("abc_DEF-1")).session_id(), "abc_DEF-1");
        assert_eq!(query(Some(""), Some("ALIAS001")).session_id(), "ALIAS001");
        assert_eq!(query(Some("bad id!"), Some("ALIAS001")).session_id(), DEFAULT_SESSION);
        assert_eq!(query(Some(&"x".repeat(65)), None).session_id(), DEFAULT_SESSION);
        assert_eq!(query(None, None).session_id(), DEFAULT_SESSION);
    }

    #[test]
    fn body_parsing() {
        assert_eq!(parse_body(b"").expect("empty"), StatePutBody::default());
        assert_eq!(
            parse_body(br#"{"stage": "6"}"#).expect("numeric string"),
            StatePutBody::with_stage(Stage::LINKED)
        );
        assert!(matches!(parse_body(b"{not json"), Err(ApiError::BadJson)));
        assert!(matches!(parse_body(b"[1, 2]"), Err(ApiError::BadJson)));
        assert!(matches!(
            parse_body(br#"{"twofa_verified": "yes"}"#),
            Err(ApiError::BadJson)
        ));
    }
}
