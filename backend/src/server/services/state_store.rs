use async_trait::async_trait;
use chrono::{DateTime, Utc};
use link_protocol::{Stage, StateSnapshot};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Executor, PgPool};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

const SCHEMA: &str = include_str!("../../../migrations/0001_link_sessions.sql");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Unavailable(String),
}

/// One row per session id, as persisted by the endpoint.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SessionRecord {
    pub session_id: String,
    pub current_state: i32,
    pub twofa_verified: bool,
    pub linking_code: Option<String>,
    /// Persistent Telegram identity, set once.
    pub tg_user_id: Option<i64>,
    pub tg_chat_id: Option<i64>,
    pub last_actor_tg_id: Option<i64>,
    pub last_actor_chat_id: Option<i64>,
    pub tg_username: Option<String>,
    pub tg_display_name: Option<String>,
    pub tg_photo_url: Option<String>,
    pub send_test_at: Option<DateTime<Utc>>,
    pub reset_reason: Option<String>,
    pub last_updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(session_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            current_state: i32::from(Stage::NOT_STARTED.get()),
            twofa_verified: false,
            linking_code: None,
            tg_user_id: None,
            tg_chat_id: None,
            last_actor_tg_id: None,
            last_actor_chat_id: None,
            tg_username: None,
            tg_display_name: None,
            tg_photo_url: None,
            send_test_at: None,
            reset_reason: None,
            last_updated_at: now,
        }
    }

    pub fn stage(&self) -> Stage {
        Stage::clamped(i64::from(self.current_state))
    }

    pub fn set_stage(&mut self, stage: Stage) {
        self.current_state = i32::from(stage.get());
    }

    pub fn actor_tg_user_id(&self) -> Option<i64> {
        self.last_actor_tg_id.or(self.tg_user_id)
    }

    pub fn actor_chat_id(&self) -> Option<i64> {
        self.last_actor_chat_id.or(self.tg_chat_id)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            stage: self.stage(),
            twofa_verified: self.twofa_verified,
            linking_code: self.linking_code.clone(),
            updated_at: self.last_updated_at.timestamp(),
            actor_tg_user_id: self.actor_tg_user_id(),
            actor_chat_id: self.actor_chat_id(),
            tg_username: self.tg_username.clone(),
            tg_display_name: self.tg_display_name.clone(),
            tg_photo_url: self.tg_photo_url.clone(),
            send_test_at: self.send_test_at,
            session_id: None,
            reset_reason: self.reset_reason.clone(),
        }
    }

    /// Snapshot for lookups by Telegram user, which also name the session.
    pub fn lookup_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            session_id: Some(self.session_id.clone()),
            ..self.snapshot()
        }
    }

    fn belongs_to(&self, tg_user_id: i64) -> bool {
        self.last_actor_tg_id == Some(tg_user_id) || self.tg_user_id == Some(tg_user_id)
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    /// Most recently updated session acted on by this Telegram user.
    async fn find_by_actor(&self, tg_user_id: i64) -> Result<Option<SessionRecord>, StoreError>;

    async fn upsert(&self, record: &SessionRecord) -> Result<(), StoreError>;
}

/// Process-local store used for `local` runs and tests.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    records: Arc<RwLock<HashMap<String, SessionRecord>>>,
    offline: Arc<AtomicBool>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail, standing in for a database outage.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("state store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        self.check_online()?;
        Ok(self.records.read().await.get(session_id).cloned())
    }

    async fn find_by_actor(&self, tg_user_id: i64) -> Result<Option<SessionRecord>, StoreError> {
        self.check_online()?;
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|record| record.belongs_to(tg_user_id))
            .max_by_key(|record| record.last_updated_at)
            .cloned())
    }

    async fn upsert(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.check_online()?;
        self.records
            .write()
            .await
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }
}

pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Builds a lazily connecting pool; nothing touches the network until the
    /// first query.
    pub fn connect_lazy(options: PgConnectOptions) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy_with(options);
        Self::new(pool)
    }

    /// Creates the `link_sessions` table and its indexes if missing.
    pub async fn bootstrap(&self) -> Result<(), StoreError> {
        self.pool.execute(SCHEMA).await?;
        info!("link_sessions schema ready");
        Ok(())
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let record = sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT session_id, current_state, twofa_verified, linking_code,
                   tg_user_id, tg_chat_id, last_actor_tg_id, last_actor_chat_id,
                   tg_username, tg_display_name, tg_photo_url, send_test_at,
                   reset_reason, last_updated_at
            FROM link_sessions
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn find_by_actor(&self, tg_user_id: i64) -> Result<Option<SessionRecord>, StoreError> {
        let record = sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT session_id, current_state, twofa_verified, linking_code,
                   tg_user_id, tg_chat_id, last_actor_tg_id, last_actor_chat_id,
                   tg_username, tg_display_name, tg_photo_url, send_test_at,
                   reset_reason, last_updated_at
            FROM link_sessions
            WHERE last_actor_tg_id = $1 OR tg_user_id = $1
            ORDER BY last_updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(tg_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn upsert(&self, record: &SessionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO link_sessions (
                session_id, current_state, twofa_verified, linking_code,
                tg_user_id, tg_chat_id, last_actor_tg_id, last_actor_chat_id,
                tg_username, tg_display_name, tg_photo_url, send_test_at,
                reset_reason, last_updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (session_id) DO UPDATE SET
                current_state = EXCLUDED.current_state,
                twofa_verified = EXCLUDED.twofa_verified,
                linking_code = EXCLUDED.linking_code,
                tg_user_id = EXCLUDED.tg_user_id,
                tg_chat_id = EXCLUDED.tg_chat_id,
                last_actor_tg_id = EXCLUDED.last_actor_tg_id,
                last_actor_chat_id = EXCLUDED.last_actor_chat_id,
                tg_username = EXCLUDED.tg_username,
                tg_display_name = EXCLUDED.tg_display_name,
                tg_photo_url = EXCLUDED.tg_photo_url,
                send_test_at = EXCLUDED.send_test_at,
                reset_reason = EXCLUDED.reset_reason,
                last_updated_at = EXCLUDED.last_updated_at
            "#,
        )
        .bind(&record.session_id)
        .bind(record.current_state)
        .bind(record.twofa_verified)
        .bind(&record.linking_code)
        .bind(record.tg_user_id)
        .bind(record.tg_chat_id)
        .bind(record.last_actor_tg_id)
        .bind(record.last_actor_chat_id)
        .bind(&record.tg_username)
        .bind(&record.tg_display_name)
        .bind(&record.tg_photo_url)
        .bind(record.send_test_at)
        .bind(&record.reset_reason)
        .bind(record.last_updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
