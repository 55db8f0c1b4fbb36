//! How each kind of `PUT /state` write changes a session record.

use chrono::{DateTime, Utc};
use link_protocol::{CapabilityAction, Stage, StatePutBody};

use super::state_store::SessionRecord;

pub const RESET_REASON_RESET: &str = "reset";
pub const RESET_REASON_ABORTED: &str = "aborted";

/// What a write is allowed to do, decided from its headers and body before
/// anything is read from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteIntent {
    /// Back to a stage `<= 3`, clearing verification and actor identity.
    AdminReset { stage: Stage, aborted: bool },
    /// Finalize (6) or unlink (7) by the user's own browser.
    ClientStage(Stage),
    /// Stamp `send_test_at` on a linked session.
    TestMessage,
    /// Full write by the bot, authorized with the bearer token.
    Bot,
    /// Bot write that only refreshes profile metadata.
    ProfileOnly,
}

impl WriteIntent {
    pub fn label(&self) -> &'static str {
        match self {
            Self::AdminReset { aborted: true, .. } => "abort",
            Self::AdminReset { .. } => "admin-reset",
            Self::ClientStage(stage) if *stage == Stage::LINKED => "finalize",
            Self::ClientStage(_) => "unlink",
            Self::TestMessage => "test-message",
            Self::Bot => "bot",
            Self::ProfileOnly => "profile-only",
        }
    }

    /// The capability a self-service write has to present, if any.
    pub fn required_capability(&self) -> Option<CapabilityAction> {
        match self {
            Self::ClientStage(stage) if *stage == Stage::LINKED => Some(CapabilityAction::Finalize),
            Self::ClientStage(_) => Some(CapabilityAction::Unlink),
            Self::TestMessage => Some(CapabilityAction::TestMessage),
            _ => None,
        }
    }

    pub fn needs_bearer(&self) -> bool {
        matches!(self, Self::Bot | Self::ProfileOnly)
    }
}

/// Applies one write to the previous record (or a fresh one) and stamps
/// `last_updated_at`.
pub fn merge(
    previous: Option<SessionRecord>,
    session_id: &str,
    intent: WriteIntent,
    body: &StatePutBody,
    now: DateTime<Utc>,
) -> SessionRecord {
    let mut record = previous.unwrap_or_else(|| SessionRecord::new(session_id, now));

    match intent {
        WriteIntent::AdminReset { stage, aborted } => {
            record.set_stage(stage);
            record.twofa_verified = false;
            record.linking_code = None;
            record.tg_user_id = None;
            record.tg_chat_id = None;
            record.last_actor_tg_id = None;
            record.last_actor_chat_id = None;
            record.reset_reason = Some(
                if aborted {
                    RESET_REASON_ABORTED
                } else {
                    RESET_REASON_RESET
                }
                .to_string(),
            );
        }
        WriteIntent::ClientStage(stage) => {
            record.set_stage(stage);
            if let Some(id) = body.actor_tg_user_id {
                record.last_actor_tg_id = Some(id);
            }
            if let Some(id) = body.actor_chat_id {
                record.last_actor_chat_id = Some(id);
            }
            record.reset_reason = None;
        }
        WriteIntent::TestMessage => {
            record.send_test_at = Some(now);
        }
        WriteIntent::ProfileOnly => apply_profile(&mut record, body),
        WriteIntent::Bot => {
            record.set_stage(body.stage.unwrap_or_default());
            record.twofa_verified = body.twofa_verified.unwrap_or(false);
            record.linking_code = body.linking_code.clone();
            if let Some(id) = body.actor_tg_user_id {
                record.last_actor_tg_id = Some(id);
                record.tg_user_id.get_or_insert(id);
            }
            if let Some(id) = body.actor_chat_id {
                record.last_actor_chat_id = Some(id);
                record.tg_chat_id.get_or_insert(id);
            }
            apply_profile(&mut record, body);
            if let Some(marker) = body.send_test_at {
                record.send_test_at = marker;
            }
            record.reset_reason = None;
        }
    }

    record.last_updated_at = now;
    record
}

fn apply_profile(record: &mut SessionRecord, body: &StatePutBody) {
    if let Some(username) = &body.tg_username {
        record.tg_username = Some(username.clone());
    }
    if let Some(name) = &body.tg_display_name {
        record.tg_display_name = Some(name.clone());
    }
    if let Some(url) = &body.tg_photo_url {
        record.tg_photo_url = Some(url.clone());
    }
}
