//! Signed, time-boxed capability tokens for self-service writes.
//!
//! A token grants one action on one session until an expiry instant:
//!
//! ```text
//! v1.<session>.<action>.<expires_unix>.<hex hmac-sha256>
//! ```
//!
//! The MAC covers everything before the last dot. Session identifiers never
//! contain dots, so the token splits unambiguously.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityAction {
    Finalize,
    Unlink,
    TestMessage,
}

impl CapabilityAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Finalize => "finalize",
            Self::Unlink => "unlink",
            Self::TestMessage => "test_message",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "finalize" => Some(Self::Finalize),
            "unlink" => Some(Self::Unlink),
            "test_message" => Some(Self::TestMessage),
            _ => None,
        }
    }
}

impl fmt::Display for CapabilityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("capability secret must not be empty")]
    EmptySecret,
    #[error("capability token is malformed")]
    Malformed,
    #[error("capability token was issued for another session")]
    WrongSession,
    #[error("capability token does not grant {0}")]
    WrongAction(CapabilityAction),
    #[error("capability token expired")]
    Expired,
    #[error("capability token signature mismatch")]
    BadSignature,
}

#[derive(Clone)]
pub struct CapabilitySigner {
    mac: HmacSha256,
}

impl fmt::Debug for CapabilitySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilitySigner").finish_non_exhaustive()
    }
}

impl CapabilitySigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, CapabilityError> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(CapabilityError::EmptySecret);
        }
        let mac = HmacSha256::new_from_slice(secret).map_err(|_| CapabilityError::EmptySecret)?;
        Ok(Self { mac })
    }

    pub fn issue(&self, session: &str, action: CapabilityAction, expires_at: i64) -> String {
        let payload = format!("{TOKEN_VERSION}.{session}.{action}.{expires_at}");
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        format!("{payload}.{signature}")
    }

    /// Checks shape, scope and expiry before the signature so the cheap
    /// rejections stay cheap. `now` is unix seconds.
    pub fn verify(
        &self,
        token: &str,
        session: &str,
        action: CapabilityAction,
        now: i64,
    ) -> Result<(), CapabilityError> {
        let token = token.trim();
        let (payload, signature) = token.rsplit_once('.').ok_or(CapabilityError::Malformed)?;
        let parts: Vec<&str> = payload.split('.').collect();
        let [version, token_session, token_action, expires_at] = parts.as_slice() else {
            return Err(CapabilityError::Malformed);
        };
        if *version != TOKEN_VERSION {
            return Err(CapabilityError::Malformed);
        }
        let token_action = CapabilityAction::parse(token_action).ok_or(CapabilityError::Malformed)?;
        let expires_at: i64 = expires_at.parse().map_err(|_| CapabilityError::Malformed)?;
        let signature = hex::decode(signature).map_err(|_| CapabilityError::Malformed)?;

        if *token_session != session {
            return Err(CapabilityError::WrongSession);
        }
        if token_action != action {
            return Err(CapabilityError::WrongAction(action));
        }
        if now > expires_at {
            return Err(CapabilityError::Expired);
        }

        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| CapabilityError::BadSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> CapabilitySigner {
        CapabilitySigner::new("test-capability-secret").expect("signer")
    }

    #[test]
    fn issued_token_verifies_for_its_scope() {
        let signer = signer();
        let token = signer.issue("SESSION01", CapabilityAction::Finalize, 2_000);
        assert!(token.starts_with("v1.SESSION01.finalize.2000."));
        signer
            .verify(&token, "SESSION01", CapabilityAction::Finalize, 1_999)
            .expect("valid token");
    }

    #[test]
    fn token_is_bound_to_session_action_and_time() {
        let signer = signer();
        let token = signer.issue("SESSION01", CapabilityAction::Unlink, 2_000);

        assert_eq!(
            signer.verify(&token, "SESSION02", CapabilityAction::Unlink, 1_000),
            Err(CapabilityError::WrongSession)
        );
        assert_eq!(
            signer.verify(&token, "SESSION01", CapabilityAction::Finalize, 1_000),
            Err(CapabilityError::WrongAction(CapabilityAction::Finalize))
        );
        assert_eq!(
            signer.verify(&token, "SESSION01", CapabilityAction::Unlink, 2_001),
            Err(CapabilityError::Expired)
        );
    }

    #[test]
    fn tampered_or_foreign_tokens_are_rejected() {
        let signer = signer();
        let token = signer.issue("SESSION01", CapabilityAction::Finalize, 2_000);
        let extended = token.replace(".2000.", ".9000.");
        assert_eq!(
            signer.verify(&extended, "SESSION01", CapabilityAction::Finalize, 1_000),
            Err(CapabilityError::BadSignature)
        );

        let other = CapabilitySigner::new("another-secret").expect("signer");
        let foreign = other.issue("SESSION01", CapabilityAction::Finalize, 2_000);
        assert_eq!(
            signer.verify(&foreign, "SESSION01", CapabilityAction::Finalize, 1_000),
            Err(CapabilityError::BadSignature)
        );

        assert_eq!(
            signer.verify("not-a-token", "SESSION01", CapabilityAction::Finalize, 1_000),
            Err(CapabilityError::Malformed)
        );
    }

    #[test]
    fn empty_secret_is_refused() {
        assert!(matches!(
            CapabilitySigner::new(""),
            Err(CapabilityError::EmptySecret)
        ));
    }
}
