//! User-facing linking actions.
//!
//! Every action applies its transition locally first, then performs the
//! accompanying remote write. Remote writes are best-effort: a failure is
//! logged, recorded as the last sync error and otherwise ignored, because the
//! next successful poll reconciles local and remote state.

use crate::clock::{SharedClock, duration_ms};
use crate::engine::{RemoteEffect, StageEngine, Transition};
use crate::error::{FlowError, Result};
use crate::notify::{Notice, Notifier};
use crate::progress::{LastTab, ProgressPatch, ProgressRecord, ProgressStore};
use crate::remote::{RemoteState, StateWrite};
use link_protocol::{CapabilityAction, Stage};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_FINALIZE_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_RESET_GUARD: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTimings {
    /// Delay between a verified code (stage 5) and the linked state (stage 6).
    pub finalize_delay: Duration,
    /// How long remote promotions are ignored after a reset.
    pub reset_guard: Duration,
}

impl Default for FlowTimings {
    fn default() -> Self {
        Self {
            finalize_delay: DEFAULT_FINALIZE_DELAY,
            reset_guard: DEFAULT_RESET_GUARD,
        }
    }
}

/// A best-effort write that did not go through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub action: &'static str,
    pub error: String,
    pub at_ms: i64,
}

#[derive(Default)]
struct FlowState {
    reset_guard_until_ms: i64,
    reset_generation: u64,
    finalize_sent: bool,
    finalize_timer: Option<JoinHandle<()>>,
    last_sync_error: Option<SyncFailure>,
}

pub struct LinkFlow {
    session_id: String,
    progress: ProgressStore,
    engine: StageEngine,
    remote: Arc<dyn RemoteState>,
    clock: SharedClock,
    notifier: Notifier,
    timings: FlowTimings,
    state: Mutex<FlowState>,
}

impl LinkFlow {
    pub fn new(
        session_id: String,
        progress: ProgressStore,
        engine: StageEngine,
        remote: Arc<dyn RemoteState>,
        clock: SharedClock,
        notifier: Notifier,
        timings: FlowTimings,
    ) -> Self {
        Self {
            session_id,
            progress,
            engine,
            remote,
            clock,
            notifier,
            timings,
            state: Mutex::new(FlowState::default()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn record(&self) -> ProgressRecord {
        self.progress.read()
    }

    pub fn engine(&self) -> &StageEngine {
        &self.engine
    }

    pub fn remote(&self) -> &Arc<dyn RemoteState> {
        &self.remote
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.notifier.subscribe()
    }

    /// The most recent best-effort write failure; cleared by the next
    /// successful write.
    pub fn last_sync_error(&self) -> Option<SyncFailure> {
        self.state().last_sync_error.clone()
    }

    pub fn reset_guard_active(&self) -> bool {
        self.clock.now_ms() < self.state().reset_guard_until_ms
    }

    /// Bumped every time the reset guard is armed. A remote read started
    /// under an older generation belongs to a link that no longer exists.
    pub fn reset_generation(&self) -> u64 {
        self.state().reset_generation
    }

    /// Raw local stage change with clamping. No remote write, no timers.
    pub fn set_stage(&self, requested: i64) -> ProgressRecord {
        let record = self.progress.read();
        let patch = self.engine.set_stage(&record, requested);
        self.commit(Transition {
            patch: Some(patch),
            ..Transition::default()
        })
        .unwrap_or(record)
    }

    /// Remembers which settings sub-tab was last shown.
    pub fn set_last_tab(&self, tab: LastTab) -> ProgressRecord {
        self.progress.write(ProgressPatch::default().with_last_tab(tab))
    }

    pub async fn enable_two_factor(&self, authenticator_code: &str) -> Result<ProgressRecord> {
        let transition = self
            .engine
            .enable_two_factor(&self.progress.read(), authenticator_code)?;
        Ok(self.run(transition).await)
    }

    pub async fn generate_link(&self) -> Result<ProgressRecord> {
        let transition = self
            .engine
            .generate_link(&self.progress.read(), self.clock.now_ms())?;
        Ok(self.run(transition).await)
    }

    /// Returns whether the code matched. A match moves to stage 5 and
    /// schedules the promotion to stage 6.
    pub async fn submit_code(self: &Arc<Self>, input: &str) -> Result<bool> {
        let transition = self.engine.submit_code(&self.progress.read(), input)?;
        let matched = transition.patch.is_some();
        self.run(transition).await;
        if matched {
            self.resume();
        }
        Ok(matched)
    }

    /// Stage 5 to 6. The `X-Client-Stage: 6` write is sent once per pass
    /// through the waiting stages.
    pub async fn finalize(&self) -> Result<ProgressRecord> {
        let transition = self.engine.finalize(&self.progress.read())?;
        let first = {
            let mut state = self.state();
            !std::mem::replace(&mut state.finalize_sent, true)
        };
        if first {
            return Ok(self.run(transition).await);
        }
        debug!(session = %self.session_id, "finalize already reported, skipping remote write");
        let record = self.commit(Transition {
            remote: None,
            ..transition
        });
        Ok(record.unwrap_or_else(|| self.progress.read()))
    }

    pub async fn unlink(&self) -> Result<ProgressRecord> {
        let transition = self.engine.unlink(&self.progress.read())?;
        Ok(self.run(transition).await)
    }

    pub async fn abort(&self) -> Result<ProgressRecord> {
        let transition = self.engine.abort(&self.progress.read())?;
        Ok(self.run(transition).await)
    }

    pub async fn admin_set_stage(self: &Arc<Self>, requested: i64) -> ProgressRecord {
        let transition =
            self.engine
                .admin_set_stage(&self.progress.read(), requested, self.clock.now_ms());
        let record = self.run(transition).await;
        self.resume();
        record
    }

    /// Forces the expiry transition when the waiting window has lapsed.
    pub async fn expire_if_lapsed(&self) -> Option<ProgressRecord> {
        let transition = self
            .engine
            .expire(&self.progress.read(), self.clock.now_ms())?;
        info!(session = %self.session_id, "waiting window lapsed");
        Some(self.run(transition).await)
    }

    /// Asks the endpoint to deliver a test message to the linked chat.
    pub async fn send_test_message(&self) -> Result<()> {
        let record = self.progress.read();
        if record.stage != Stage::LINKED {
            return Err(FlowError::NotAllowed {
                action: "send test message",
                stage: record.stage,
            });
        }
        let write = StateWrite::test_message()
            .with_capability(record.capabilities.get(&CapabilityAction::TestMessage).cloned());

        let outcome = match self.remote.put(&self.session_id, &write).await {
            Ok(ack) if ack.ok => Ok(()),
            Ok(_) => Err(FlowError::Rejected),
            Err(err) => Err(FlowError::from(err)),
        };
        match &outcome {
            Ok(()) => {
                self.state().last_sync_error = None;
                self.notifier.emit(Notice::TestMessageSent);
            }
            Err(err) => {
                self.record_failure(write.label(), err.to_string());
                self.notifier.emit(Notice::TestMessageFailed);
            }
        }
        outcome
    }

    /// Re-arms the stage 5 promotion timer. Call after loading a record that
    /// was left at stage 5; any earlier pending promotion is superseded.
    pub fn resume(self: &Arc<Self>) {
        if self.progress.read().stage != Stage::VERIFYING {
            return;
        }
        let flow = Arc::clone(self);
        let delay = self.timings.finalize_delay;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = flow.finalize().await {
                debug!(error = %err, "scheduled finalize skipped");
            }
        });
        if let Some(previous) = self.state().finalize_timer.replace(timer) {
            previous.abort();
        }
    }

    pub fn cancel_timers(&self) {
        if let Some(timer) = self.state().finalize_timer.take() {
            timer.abort();
        }
    }

    pub(crate) fn commit(&self, transition: Transition) -> Option<ProgressRecord> {
        let Transition {
            patch,
            notices,
            arm_reset_guard,
            ..
        } = transition;

        if arm_reset_guard {
            let until = self
                .clock
                .now_ms()
                .saturating_add(duration_ms(self.timings.reset_guard));
            let mut state = self.state();
            state.reset_guard_until_ms = until;
            state.reset_generation += 1;
        }

        let record = patch.map(|patch| {
            let before = self.progress.read().stage;
            let record = self.progress.write(patch);
            if record.stage <= Stage::CODE_ISSUED {
                self.state().finalize_sent = false;
            }
            if record.stage != before {
                info!(
                    session = %self.session_id,
                    from = %before,
                    to = %record.stage,
                    "stage changed"
                );
                self.notifier.emit(Notice::StageChanged(record.stage));
            }
            record
        });

        for notice in notices {
            self.notifier.emit(notice);
        }
        record
    }

    async fn run(&self, transition: Transition) -> ProgressRecord {
        let remote = transition.remote;
        let record = self
            .commit(transition)
            .unwrap_or_else(|| self.progress.read());
        if let Some(effect) = remote {
            self.sync(effect, &record).await;
        }
        record
    }

    async fn sync(&self, effect: RemoteEffect, record: &ProgressRecord) {
        let write = match effect {
            RemoteEffect::AdminReset { stage, aborted } => StateWrite::admin_reset(stage, aborted),
            RemoteEffect::ClientStage(stage) => {
                let action = if stage == Stage::UNLINKED {
                    CapabilityAction::Unlink
                } else {
                    CapabilityAction::Finalize
                };
                StateWrite::client_stage(stage)
                    .with_capability(record.capabilities.get(&action).cloned())
            }
        };

        match self.remote.put(&self.session_id, &write).await {
            Ok(ack) => {
                self.state().last_sync_error = None;
                self.progress.grant_capabilities(&ack.capabilities);
                debug!(session = %self.session_id, write = write.label(), "remote write accepted");
            }
            Err(err) => self.record_failure(write.label(), err.to_string()),
        }
    }

    fn record_failure(&self, action: &'static str, error: String) {
        warn!(session = %self.session_id, action, error = %error, "remote write failed");
        self.state().last_sync_error = Some(SyncFailure {
            action,
            error,
            at_ms: self.clock.now_ms(),
        });
    }

    fn state(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
