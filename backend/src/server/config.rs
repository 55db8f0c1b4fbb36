use axum::{Router, middleware, routing::get};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::configuration::{Settings, StoreKind};
use crate::server::{
    auth::WritePolicy,
    error::ApiError,
    handlers::{
        health::health_check,
        state::{get_state, method_not_allowed, not_found, put_state},
    },
    middleware::{cors, log_request},
    services::{
        state_store::{MemoryStateStore, PgStateStore, StateStore},
        telegram::TelegramNotifier,
    },
};

#[derive(Clone)]
pub struct AppState {
    /// `None` when a store was configured but could not be set up.
    pub store: Option<Arc<dyn StateStore>>,
    pub policy: Arc<WritePolicy>,
    pub notifier: Option<Arc<TelegramNotifier>>,
}

impl AppState {
    pub fn new(store: Option<Arc<dyn StateStore>>, policy: WritePolicy) -> Self {
        Self {
            store,
            policy: Arc::new(policy),
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: TelegramNotifier) -> Self {
        self.notifier = Some(Arc::new(notifier));
        self
    }

    pub fn store(&self) -> Result<&Arc<dyn StateStore>, ApiError> {
        self.store.as_ref().ok_or(ApiError::StoreNotConfigured)
    }
}

pub async fn configure_app(settings: &Settings) -> Router {
    let store = build_store(settings).await;

    let policy = match WritePolicy::from_settings(&settings.application) {
        Ok(policy) => policy,
        Err(e) => {
            error!(error = %e, "capability secret rejected, self-service writes are header-only");
            WritePolicy::new(settings.application.write_token(), None)
        }
    };
    if !policy.enforces_capabilities() {
        warn!("no capability secret configured, self-service writes are trusted on headers alone");
    }
    if !policy.accepts_bot_writes() {
        warn!("no write token configured, bot writes will be refused");
    }

    let mut state = AppState::new(store, policy);
    if let Some(token) = settings.telegram.bot_token() {
        match TelegramNotifier::new(&settings.telegram.api_base, token) {
            Ok(notifier) => state = state.with_notifier(notifier),
            Err(e) => error!(error = %e, "telegram notifier unavailable"),
        }
    }

    app_router(state)
}

async fn build_store(settings: &Settings) -> Option<Arc<dyn StateStore>> {
    match settings.database.store {
        StoreKind::Memory => {
            info!("using in-memory state store");
            Some(Arc::new(MemoryStateStore::new()))
        }
        StoreKind::Postgres => {
            let options = match settings.database.connect_options() {
                Ok(options) => options,
                Err(e) => {
                    error!(error = %e, "invalid database settings");
                    return None;
                }
            };
            let store = PgStateStore::connect_lazy(options);
            if let Err(e) = store.bootstrap().await {
                warn!(error = %e, "could not prepare link_sessions, continuing");
            }
            info!("using postgres state store");
            Some(Arc::new(store))
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/state",
            get(get_state).put(put_state).fallback(method_not_allowed),
        )
        .route(
            "/api/state",
            get(get_state).put(put_state).fallback(method_not_allowed),
        )
        .route("/health", get(health_check))
        .fallback(not_found)
        .layer(middleware::from_fn(log_request))
        .layer(middleware::from_fn(cors))
        .with_state(state)
}
