//! Wire contract for the Telegram account-linking flow.
//!
//! Both sides of the flow depend on this crate: the browser-side client in
//! `link-client` and the state endpoint in `link-backend`. It carries the
//! stage model, the session identifier rules, the JSON bodies exchanged over
//! `GET`/`PUT /state`, the custom header names, and the signed capability
//! tokens used for self-service transitions.

pub mod capability;
pub mod headers;
pub mod session;
pub mod stage;
pub mod wire;

pub use capability::{CapabilityAction, CapabilityError, CapabilitySigner};
pub use session::{DEFAULT_SESSION, is_valid_session_id, is_valid_session_param};
pub use stage::Stage;
pub use wire::{Capabilities, ErrorBody, StatePutBody, StateSnapshot, WriteAck};
