//! Who may write what to `PUT /state`.
//!
//! Writes are classified in a fixed order: an admin reset, a client stage
//! change (finalize or unlink), a test message, and finally a bot write that
//! must carry the bearer token. The first three are self-service. When a
//! capability secret is configured they must also present a signed token
//! issued by an earlier write on the same session.

use axum::http::{HeaderMap, header};
use link_protocol::{
    Capabilities, CapabilityAction, CapabilitySigner, Stage, StatePutBody, headers,
};
use secrecy::{ExposeSecret, Secret};
use subtle::ConstantTimeEq;

use crate::configuration::ApplicationSettings;
use crate::server::error::ApiError;
use crate::server::services::session_state::WriteIntent;

const DEFAULT_FINALIZE_TTL_SECS: i64 = 15 * 60;
const DEFAULT_LINKED_TTL_SECS: i64 = 30 * 24 * 60 * 60;

pub struct WritePolicy {
    write_token: Option<Secret<String>>,
    signer: Option<CapabilitySigner>,
    finalize_ttl_secs: i64,
    linked_ttl_secs: i64,
}

impl WritePolicy {
    pub fn new(write_token: Option<&str>, signer: Option<CapabilitySigner>) -> Self {
        Self {
            write_token: write_token.map(|token| Secret::new(token.to_string())),
            signer,
            finalize_ttl_secs: DEFAULT_FINALIZE_TTL_SECS,
            linked_ttl_secs: DEFAULT_LINKED_TTL_SECS,
        }
    }

    pub fn with_ttls(mut self, finalize_secs: i64, linked_secs: i64) -> Self {
        self.finalize_ttl_secs = finalize_secs;
        self.linked_ttl_secs = linked_secs;
        self
    }

    pub fn from_settings(
        settings: &ApplicationSettings,
    ) -> Result<Self, link_protocol::CapabilityError> {
        let signer = settings
            .capability_secret()
            .map(CapabilitySigner::new)
            .transpose()?;
        Ok(Self::new(settings.write_token(), signer).with_ttls(
            settings.finalize_capability_ttl_secs,
            settings.linked_capability_ttl_secs,
        ))
    }

    pub fn enforces_capabilities(&self) -> bool {
        self.signer.is_some()
    }

    pub fn accepts_bot_writes(&self) -> bool {
        self.write_token.is_some()
    }

    /// Decides what the write is from its headers and body alone.
    pub fn classify(headers: &HeaderMap, body: &StatePutBody) -> Result<WriteIntent, ApiError> {
        if flag(headers, headers::ADMIN_RESET) {
            let stage = body.stage.unwrap_or_default();
            if stage > Stage::LINK_GENERATED {
                return Err(ApiError::InvalidResetStage);
            }
            return Ok(WriteIntent::AdminReset {
                stage,
                aborted: flag(headers, headers::CLIENT_ABORTED),
            });
        }

        if let Some(claimed) = client_stage(headers) {
            // A test message only stamps `send_test_at`, even when the body
            // also repeats the stage.
            if claimed == Stage::LINKED && body.test_message {
                return Ok(WriteIntent::TestMessage);
            }
            if (claimed == Stage::LINKED || claimed == Stage::UNLINKED) && body.stage == Some(claimed)
            {
                return Ok(WriteIntent::ClientStage(claimed));
            }
        }

        if flag(headers, headers::PROFILE_ONLY) {
            Ok(WriteIntent::ProfileOnly)
        } else {
            Ok(WriteIntent::Bot)
        }
    }

    /// `now` is unix seconds.
    pub fn authorize(
        &self,
        session_id: &str,
        intent: WriteIntent,
        headers: &HeaderMap,
        now: i64,
    ) -> Result<(), ApiError> {
        if intent.needs_bearer() {
            return self.check_bearer(headers);
        }
        let (Some(action), Some(signer)) = (intent.required_capability(), &self.signer) else {
            return Ok(());
        };
        let token = header_str(headers, headers::CAPABILITY)
            .ok_or_else(|| ApiError::Unauthorized(Some(format!("missing {action} capability"))))?;
        signer
            .verify(token, session_id, action, now)
            .map_err(|e| ApiError::Unauthorized(Some(e.to_string())))
    }

    /// Capabilities minted for a successful write. Empty unless a secret is
    /// configured.
    pub fn grants(&self, session_id: &str, intent: WriteIntent, now: i64) -> Capabilities {
        let mut capabilities = Capabilities::new();
        let Some(signer) = &self.signer else {
            return capabilities;
        };
        match intent {
            WriteIntent::AdminReset { stage, .. } if stage == Stage::LINK_GENERATED => {
                let expires_at = now + self.finalize_ttl_secs;
                capabilities.insert(
                    CapabilityAction::Finalize,
                    signer.issue(session_id, CapabilityAction::Finalize, expires_at),
                );
            }
            WriteIntent::ClientStage(stage) if stage == Stage::LINKED => {
                let expires_at = now + self.linked_ttl_secs;
                for action in [CapabilityAction::Unlink, CapabilityAction::TestMessage] {
                    capabilities.insert(action, signer.issue(session_id, action, expires_at));
                }
            }
            _ => {}
        }
        capabilities
    }

    fn check_bearer(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let expected = self
            .write_token
            .as_ref()
            .ok_or(ApiError::Unauthorized(None))?;
        let presented = header_str(headers, header::AUTHORIZATION.as_str())
            .and_then(bearer_token)
            .ok_or(ApiError::Unauthorized(None))?;
        if bool::from(
            presented
                .as_bytes()
                .ct_eq(expected.expose_secret().as_bytes()),
        ) {
            Ok(())
        } else {
            Err(ApiError::Unauthorized(None))
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn flag(headers: &HeaderMap, name: &str) -> bool {
    header_str(headers, name).is_some_and(headers::is_flag_set)
}

fn client_stage(headers: &HeaderMap) -> Option<Stage> {
    let value: i64 = header_str(headers, headers::CLIENT_STAGE)?.trim().parse().ok()?;
    let stage = Stage::clamped(value);
    (i64::from(stage) == value).then_some(stage)
}

fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|token| !token.is_empty())
}
