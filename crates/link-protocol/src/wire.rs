//! JSON bodies exchanged with the state endpoint.

use crate::capability::CapabilityAction;
use crate::stage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Capability tokens returned by the endpoint, keyed by the action they unlock.
pub type Capabilities = BTreeMap<CapabilityAction, String>;

/// `GET /state` response for a session that has a record.
///
/// Sessions without a record are answered with `{}`; callers model that as
/// `Option<StateSnapshot>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub stage: Stage,
    #[serde(default)]
    pub twofa_verified: bool,
    #[serde(default)]
    pub linking_code: Option<String>,
    /// Server-side `last_updated_at` in unix seconds.
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub actor_tg_user_id: Option<i64>,
    #[serde(default)]
    pub actor_chat_id: Option<i64>,
    #[serde(default)]
    pub tg_username: Option<String>,
    #[serde(default)]
    pub tg_display_name: Option<String>,
    #[serde(default)]
    pub tg_photo_url: Option<String>,
    #[serde(default)]
    pub send_test_at: Option<DateTime<Utc>>,
    /// Present only on lookups by Telegram user id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Why the session was last reset (`reset` or `aborted`), if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_reason: Option<String>,
}

/// `PUT /state` request body. Every field is optional; which ones are
/// honoured depends on the kind of write (see the endpoint's merge rules).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatePutBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twofa_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linking_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_tg_user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_chat_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tg_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tg_display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tg_photo_url: Option<String>,
    /// `Some(None)` is an explicit `null` (clear the marker); `None` means the
    /// field was absent.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub send_test_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub test_message: bool,
}

impl StatePutBody {
    pub fn with_stage(stage: Stage) -> Self {
        Self {
            stage: Some(stage),
            ..Self::default()
        }
    }

    pub fn test_message() -> Self {
        Self {
            test_message: true,
            ..Self::default()
        }
    }
}

fn deserialize_present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Successful `PUT` acknowledgement: `{"ok": true}` plus any capabilities
/// minted for the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteAck {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capabilities: Capabilities,
}

impl WriteAck {
    pub fn ok() -> Self {
        Self {
            ok: true,
            capabilities: Capabilities::new(),
        }
    }

    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            ok: true,
            capabilities,
        }
    }
}

/// Error body returned with every non-2xx status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            detail: None,
        }
    }

    pub fn with_detail(error: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            detail: Some(detail.into()),
        }
    }
}
