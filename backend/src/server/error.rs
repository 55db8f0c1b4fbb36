use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use link_protocol::ErrorBody;
use thiserror::Error;
use tracing::error;

use crate::server::services::state_store::StoreError;

/// Every failure the state routes can answer with. The display text is the
/// `error` field of the JSON body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad JSON")]
    BadJson,
    #[error("Admin reset stage must be 3 or lower")]
    InvalidResetStage,
    #[error("Invalid tg parameter")]
    InvalidTelegramUser,
    #[error("Unauthorized")]
    Unauthorized(Option<String>),
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("Not found")]
    NotFound,
    #[error("State store not configured")]
    StoreNotConfigured,
    #[error("DB read error")]
    Read(#[source] StoreError),
    #[error("DB write error")]
    Write(#[source] StoreError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadJson | Self::InvalidResetStage | Self::InvalidTelegramUser => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::StoreNotConfigured | Self::Read(_) | Self::Write(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn body(&self) -> ErrorBody {
        match self {
            Self::Unauthorized(Some(detail)) => ErrorBody::with_detail(self.to_string(), detail),
            Self::Read(e) | Self::Write(e) => ErrorBody::with_detail(self.to_string(), e.to_string()),
            _ => ErrorBody::new(self.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            match &self {
                Self::Read(e) | Self::Write(e) => error!(error = %e, "{}", self),
                _ => error!("{}", self),
            }
        }
        (status, Json(self.body())).into_response()
    }
}
