//! Custom request headers understood by the state endpoint.
//!
//! Names are lowercase so they can be used with `HeaderName::from_static`.

/// Claimed target stage for client self-service writes (`"6"` or `"7"`).
pub const CLIENT_STAGE: &str = "x-client-stage";
/// `1` marks an admin-reset write (target stage must be `<= 3`).
pub const ADMIN_RESET: &str = "x-admin-reset";
/// `1` marks an admin reset triggered by the user aborting the flow.
pub const CLIENT_ABORTED: &str = "x-client-aborted";
/// `1` marks a bearer-authorized write that only touches profile metadata.
pub const PROFILE_ONLY: &str = "x-profile-only";
/// Signed capability token for self-service writes.
pub const CAPABILITY: &str = "x-link-capability";

/// Header values that count as "set" for the boolean flags above.
pub fn is_flag_set(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True")
}
