//! Session identifier rules.
//!
//! The client generates identifiers matching `[A-Za-z0-9_-]{8,24}`. The
//! endpoint is more lenient on the query parameter (`{1,64}`) and falls back
//! to a shared `default` session when the parameter is absent or malformed.

pub const SESSION_ID_MIN_LEN: usize = 8;
pub const SESSION_ID_MAX_LEN: usize = 24;
pub const SESSION_PARAM_MAX_LEN: usize = 64;

pub const DEFAULT_SESSION: &str = "default";

fn is_session_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '-'
}

fn matches(value: &str, min: usize, max: usize) -> bool {
    (min..=max).contains(&value.len()) && value.chars().all(is_session_char)
}

/// Validates an identifier produced or persisted by the client.
pub fn is_valid_session_id(value: &str) -> bool {
    matches(value, SESSION_ID_MIN_LEN, SESSION_ID_MAX_LEN)
}

/// Validates the `session` query parameter accepted by the endpoint.
pub fn is_valid_session_param(value: &str) -> bool {
    matches(value, 1, SESSION_PARAM_MAX_LEN)
}
