//! Stage transition rules.
//!
//! The engine is pure: given the current [`ProgressRecord`], an input and the
//! current time it returns a [`Transition`] describing the local patch, the
//! remote write to attempt and the notices to raise. Applying it (persisting,
//! calling the endpoint, scheduling timers) is the job of
//! [`LinkFlow`](crate::flow::LinkFlow).

use crate::clock::duration_ms;
use crate::error::{FlowError, Result};
use crate::notify::Notice;
use crate::progress::{ProgressPatch, ProgressRecord};
use link_protocol::{StateSnapshot, Stage};
use std::time::Duration;

pub const DEFAULT_WAITING_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Remote write that accompanies a local transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteEffect {
    /// `X-Admin-Reset` write lowering the remote record to `stage` (<= 3).
    AdminReset { stage: Stage, aborted: bool },
    /// Self-service `X-Client-Stage` write for stage 6 or 7.
    ClientStage(Stage),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    pub patch: Option<ProgressPatch>,
    pub remote: Option<RemoteEffect>,
    pub notices: Vec<Notice>,
    /// Ignore remote promotions for a short while, so a poll racing the reset
    /// write cannot resurrect the previous link.
    pub arm_reset_guard: bool,
}

impl Transition {
    fn local(patch: ProgressPatch) -> Self {
        Self {
            patch: Some(patch),
            ..Self::default()
        }
    }

    fn with_remote(mut self, effect: RemoteEffect) -> Self {
        self.remote = Some(effect);
        self
    }

    fn with_notice(mut self, notice: Notice) -> Self {
        self.notices.push(notice);
        self
    }

    fn arming_guard(mut self) -> Self {
        self.arm_reset_guard = true;
        self
    }

    pub fn target_stage(&self) -> Option<Stage> {
        self.patch.as_ref().and_then(|patch| patch.stage)
    }
}

/// Outcome of comparing a polled snapshot with local progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteDecision {
    /// Not newer than the last snapshot seen; nothing to do.
    Stale,
    /// Newer, but nothing for this browser to act on.
    Unchanged { updated_at: i64 },
    /// The bot confirmed 2FA: move to stage 4 and adopt its code.
    Advance {
        updated_at: i64,
        transition: Transition,
    },
}

#[derive(Debug, Clone)]
pub struct StageEngine {
    waiting_window: Duration,
}

impl Default for StageEngine {
    fn default() -> Self {
        Self::new(DEFAULT_WAITING_WINDOW)
    }
}

impl StageEngine {
    pub fn new(waiting_window: Duration) -> Self {
        Self { waiting_window }
    }

    pub fn waiting_window(&self) -> Duration {
        self.waiting_window
    }

    fn window_end(&self, now_ms: i64) -> i64 {
        now_ms.saturating_add(duration_ms(self.waiting_window))
    }

    /// Raw stage change. Clamps into range, clears the code at or below
    /// stage 3 and drops the window when leaving stages 3 and 4. It never
    /// opens a window itself.
    pub fn set_stage(&self, current: &ProgressRecord, requested: i64) -> ProgressPatch {
        let stage = Stage::clamped(requested);
        let mut patch = ProgressPatch::stage(stage);
        if stage <= Stage::LINK_GENERATED {
            patch = patch.with_code(None);
        }
        if !stage.is_waiting() && current.expires_at_ms.is_some() {
            patch = patch.with_window(None);
        }
        patch
    }

    pub fn enable_two_factor(
        &self,
        current: &ProgressRecord,
        authenticator_code: &str,
    ) -> Result<Transition> {
        if current.stage != Stage::NOT_STARTED {
            return Err(FlowError::NotAllowed {
                action: "enable two-factor",
                stage: current.stage,
            });
        }
        if authenticator_code.trim().is_empty() {
            return Err(FlowError::EmptyAuthenticatorCode);
        }
        let patch = self.set_stage(current, Stage::TWO_FACTOR_ENABLED.into());
        Ok(Transition::local(patch).with_notice(Notice::TwoFactorEnabled))
    }

    /// Opens a fresh waiting window at stage 3 and resets the remote record.
    pub fn generate_link(&self, current: &ProgressRecord, now_ms: i64) -> Result<Transition> {
        if current.stage < Stage::TWO_FACTOR_ENABLED {
            return Err(FlowError::NotAllowed {
                action: "generate link",
                stage: current.stage,
            });
        }
        Ok(self.open_link(now_ms))
    }

    fn open_link(&self, now_ms: i64) -> Transition {
        let patch = ProgressPatch::stage(Stage::LINK_GENERATED)
            .with_code(None)
            .with_window(Some(self.window_end(now_ms)));
        Transition::local(patch)
            .with_remote(RemoteEffect::AdminReset {
                stage: Stage::LINK_GENERATED,
                aborted: false,
            })
            .with_notice(Notice::LinkGenerated)
            .arming_guard()
    }

    /// Trimmed, case-insensitive equality. An absent stored code never
    /// matches.
    pub fn check_code(&self, input: &str, stored: Option<&str>) -> bool {
        let Some(stored) = stored else {
            return false;
        };
        let stored = stored.trim();
        !stored.is_empty() && input.trim().to_uppercase() == stored.to_uppercase()
    }

    pub fn submit_code(&self, current: &ProgressRecord, input: &str) -> Result<Transition> {
        if current.stage != Stage::CODE_ISSUED {
            return Err(FlowError::NotAllowed {
                action: "submit code",
                stage: current.stage,
            });
        }
        if !self.check_code(input, current.code.as_deref()) {
            return Ok(Transition::default().with_notice(Notice::CodeMismatch));
        }
        let patch = self.set_stage(current, Stage::VERIFYING.into());
        Ok(Transition::local(patch))
    }

    pub fn finalize(&self, current: &ProgressRecord) -> Result<Transition> {
        if current.stage != Stage::VERIFYING {
            return Err(FlowError::NotAllowed {
                action: "finalize",
                stage: current.stage,
            });
        }
        let patch = self.set_stage(current, Stage::LINKED.into()).with_window(None);
        Ok(Transition::local(patch)
            .with_remote(RemoteEffect::ClientStage(Stage::LINKED))
            .with_notice(Notice::Linked))
    }

    pub fn unlink(&self, current: &ProgressRecord) -> Result<Transition> {
        if current.stage != Stage::LINKED {
            return Err(FlowError::NotAllowed {
                action: "unlink",
                stage: current.stage,
            });
        }
        let patch = self.set_stage(current, Stage::UNLINKED.into());
        Ok(Transition::local(patch)
            .with_remote(RemoteEffect::ClientStage(Stage::UNLINKED))
            .with_notice(Notice::Unlinked))
    }

    pub fn abort(&self, current: &ProgressRecord) -> Result<Transition> {
        if !current.stage.is_waiting() {
            return Err(FlowError::NotAllowed {
                action: "abort",
                stage: current.stage,
            });
        }
        let patch = self
            .set_stage(current, Stage::TWO_FACTOR_ENABLED.into())
            .with_window(None);
        Ok(Transition::local(patch)
            .with_remote(RemoteEffect::AdminReset {
                stage: Stage::TWO_FACTOR_ENABLED,
                aborted: true,
            })
            .with_notice(Notice::Aborted))
    }

    /// Operator override. Any target is accepted after clamping.
    ///
    /// Entering stage 3 from outside the waiting stages behaves exactly like
    /// [`generate_link`](Self::generate_link); entering stage 4 that way opens
    /// a fresh window. Targets at or below 3 reset the remote record, and
    /// dropping from 3 or above to 2 or below reports the session as expired.
    pub fn admin_set_stage(
        &self,
        current: &ProgressRecord,
        requested: i64,
        now_ms: i64,
    ) -> Transition {
        let target = Stage::clamped(requested);
        let from = current.stage;

        if target == Stage::LINK_GENERATED && !from.is_waiting() {
            return self.open_link(now_ms);
        }

        let mut patch = self.set_stage(current, target.into());
        if target == Stage::CODE_ISSUED && !from.is_waiting() {
            patch = patch.with_window(Some(self.window_end(now_ms)));
        }
        let mut transition = Transition::local(patch);
        if target <= Stage::LINK_GENERATED {
            transition = transition
                .with_remote(RemoteEffect::AdminReset {
                    stage: target,
                    aborted: false,
                })
                .arming_guard();
        }
        if from >= Stage::LINK_GENERATED && target <= Stage::TWO_FACTOR_ENABLED {
            transition = transition.with_notice(Notice::SessionExpired);
        }
        transition
    }

    /// Expiry check for the waiting window; `None` while the window is open
    /// or outside stages 3 and 4.
    pub fn expire(&self, current: &ProgressRecord, now_ms: i64) -> Option<Transition> {
        if !current.window_lapsed(now_ms) {
            return None;
        }
        let patch = self
            .set_stage(current, Stage::TWO_FACTOR_ENABLED.into())
            .with_window(None);
        Some(
            Transition::local(patch)
                .with_remote(RemoteEffect::AdminReset {
                    stage: Stage::TWO_FACTOR_ENABLED,
                    aborted: false,
                })
                .with_notice(Notice::SessionExpired),
        )
    }

    /// Compares a polled snapshot with local progress. `last_seen` is the
    /// newest server `updated_at` already processed.
    pub fn apply_remote(
        &self,
        current: &ProgressRecord,
        snapshot: &StateSnapshot,
        last_seen: Option<i64>,
    ) -> RemoteDecision {
        if last_seen.is_some_and(|seen| snapshot.updated_at <= seen) {
            return RemoteDecision::Stale;
        }
        let updated_at = snapshot.updated_at;
        let confirmed = snapshot.stage >= Stage::CODE_ISSUED && snapshot.twofa_verified;
        if !confirmed || current.stage != Stage::LINK_GENERATED {
            return RemoteDecision::Unchanged { updated_at };
        }

        let code = snapshot
            .linking_code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(str::to_string);
        let patch = ProgressPatch::stage(Stage::CODE_ISSUED).with_code(code);
        RemoteDecision::Advance {
            updated_at,
            transition: Transition::local(patch).with_notice(Notice::TwoFactorConfirmed),
        }
    }
}
