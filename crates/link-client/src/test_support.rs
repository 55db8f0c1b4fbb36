use crate::error::RemoteError;
use crate::remote::{RemoteState, StateWrite};
use async_trait::async_trait;
use link_protocol::{Capabilities, StateSnapshot, WriteAck};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Script {
    snapshot: Option<StateSnapshot>,
    fail_gets: bool,
    fail_puts: bool,
    grant: Option<Capabilities>,
    gets: usize,
    writes: Vec<(String, StateWrite)>,
}

/// In-memory [`RemoteState`] that records writes and answers reads from a
/// scripted snapshot.
#[derive(Clone, Default)]
pub(crate) struct ScriptedRemote {
    script: Arc<Mutex<Script>>,
}

impl ScriptedRemote {
    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().expect("script lock")
    }

    pub(crate) fn set_snapshot(&self, snapshot: Option<StateSnapshot>) {
        self.script().snapshot = snapshot;
    }

    pub(crate) fn fail_gets(&self, fail: bool) {
        self.script().fail_gets = fail;
    }

    pub(crate) fn fail_puts(&self, fail: bool) {
        self.script().fail_puts = fail;
    }

    pub(crate) fn grant_on_next_put(&self, capabilities: Capabilities) {
        self.script().grant = Some(capabilities);
    }

    pub(crate) fn gets(&self) -> usize {
        self.script().gets
    }

    pub(crate) fn writes(&self) -> Vec<(String, StateWrite)> {
        self.script().writes.clone()
    }
}

fn offline() -> RemoteError {
    RemoteError::Status {
        status: 503,
        message: "offline".to_string(),
    }
}

#[async_trait]
impl RemoteState for ScriptedRemote {
    async fn get(&self, _session_id: &str) -> Result<Option<StateSnapshot>, RemoteError> {
        let mut script = self.script();
        script.gets += 1;
        if script.fail_gets {
            return Err(offline());
        }
        Ok(script.snapshot.clone())
    }

    async fn put(&self, session_id: &str, write: &StateWrite) -> Result<WriteAck, RemoteError> {
        let mut script = self.script();
        script.writes.push((session_id.to_string(), write.clone()));
        if script.fail_puts {
            return Err(offline());
        }
        Ok(match script.grant.take() {
            Some(capabilities) => WriteAck::with_capabilities(capabilities),
            None => WriteAck::ok(),
        })
    }
}
