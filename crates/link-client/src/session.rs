//! Per-profile session identifier.

use crate::clock::SharedClock;
use crate::storage::SharedStorage;
use link_protocol::{is_valid_session_id, session::SESSION_ID_MAX_LEN};
use rand::Rng;
use tracing::{debug, warn};

pub const SESSION_KEY: &str = "link.session.id.v1";

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub struct SessionIdProvider {
    storage: SharedStorage,
    clock: SharedClock,
}

impl SessionIdProvider {
    pub fn new(storage: SharedStorage, clock: SharedClock) -> Self {
        Self { storage, clock }
    }

    /// Returns the stored identifier, or generates and stores a fresh one when
    /// nothing valid is stored. If storage refuses the write the generated
    /// identifier is still returned.
    pub fn get_session_id(&self) -> String {
        match self.storage.get_item(SESSION_KEY) {
            Ok(Some(stored)) if is_valid_session_id(&stored) => return stored,
            Ok(Some(stored)) => debug!(stored = %stored, "discarding malformed session id"),
            Ok(None) => {}
            Err(err) => warn!(error = %err, "session id storage unreadable"),
        }

        let id = generate_session_id(self.clock.now_ms(), &mut rand::thread_rng());
        if let Err(err) = self.storage.set_item(SESSION_KEY, &id) {
            warn!(error = %err, "failed to persist session id");
        }
        id
    }
}

/// `S` + base36 time + base36 randomness, uppercased and capped at 24 chars.
pub fn generate_session_id(now_ms: i64, rng: &mut impl Rng) -> String {
    let mut id = String::with_capacity(SESSION_ID_MAX_LEN);
    id.push('s');
    id.push_str(&to_base36(now_ms.max(0) as u64));
    id.push_str(&to_base36(rng.r#gen::<u64>()));
    id.truncate(SESSION_ID_MAX_LEN);
    id.make_ascii_uppercase();
    while id.len() < link_protocol::session::SESSION_ID_MIN_LEN {
        id.push('0');
    }
    id
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}
