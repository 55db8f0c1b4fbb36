//! Polling loop driving remote confirmation of the generated link.

use crate::election::LeaderElection;
use crate::engine::RemoteDecision;
use crate::flow::LinkFlow;
use link_protocol::Stage;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1500);

/// Whether the host surface is visible. Clones share the flag.
#[derive(Debug, Clone)]
pub struct Visibility(Arc<AtomicBool>);

impl Default for Visibility {
    fn default() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }
}

impl Visibility {
    pub fn set_visible(&self, visible: bool) {
        self.0.store(visible, Ordering::SeqCst);
    }

    pub fn is_visible(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Hidden,
    Follower,
    /// Not in a stage that needs polling (or in stage 4 with time left).
    Idle,
    Expired,
    /// Inside the reset guard; remote promotions are ignored.
    Guarded,
    Unchanged,
    Stale,
    Advanced,
    Failed,
}

pub struct PollingLoop {
    flow: Arc<LinkFlow>,
    election: Arc<LeaderElection>,
    visibility: Visibility,
    interval: Duration,
    last_seen: AtomicI64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingLoop {
    pub fn new(
        flow: Arc<LinkFlow>,
        election: Arc<LeaderElection>,
        visibility: Visibility,
        interval: Duration,
    ) -> Self {
        Self {
            flow,
            election,
            visibility,
            interval,
            last_seen: AtomicI64::new(0),
            task: Mutex::new(None),
        }
    }

    /// Newest server `updated_at` processed so far.
    pub fn last_seen(&self) -> i64 {
        self.last_seen.load(Ordering::SeqCst)
    }

    pub async fn tick(&self) -> TickOutcome {
        if !self.visibility.is_visible() {
            return TickOutcome::Hidden;
        }
        if !self.election.is_leader() {
            return TickOutcome::Follower;
        }

        let record = self.flow.record();
        if !record.stage.is_waiting() {
            return TickOutcome::Idle;
        }
        if self.flow.expire_if_lapsed().await.is_some() {
            return TickOutcome::Expired;
        }
        if record.stage != Stage::LINK_GENERATED {
            return TickOutcome::Idle;
        }
        if self.flow.reset_guard_active() {
            return TickOutcome::Guarded;
        }

        let generation = self.flow.reset_generation();
        let snapshot = match self.flow.remote().get(self.flow.session_id()).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return TickOutcome::Unchanged,
            Err(err) => {
                debug!(error = %err, "poll failed");
                return TickOutcome::Failed;
            }
        };

        // A regenerated link while the request was in flight makes this
        // snapshot belong to the previous link.
        if self.flow.reset_generation() != generation || self.flow.reset_guard_active() {
            return TickOutcome::Guarded;
        }

        // The record may have moved while the request was in flight.
        let record = self.flow.record();
        match self
            .flow
            .engine()
            .apply_remote(&record, &snapshot, Some(self.last_seen()))
        {
            RemoteDecision::Stale => TickOutcome::Stale,
            RemoteDecision::Unchanged { updated_at } => {
                self.last_seen.store(updated_at, Ordering::SeqCst);
                TickOutcome::Unchanged
            }
            RemoteDecision::Advance {
                updated_at,
                transition,
            } => {
                self.last_seen.store(updated_at, Ordering::SeqCst);
                info!(session = %self.flow.session_id(), "bot confirmed two-factor");
                self.flow.commit(transition);
                TickOutcome::Advanced
            }
        }
    }

    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        let poller = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poller.interval);
            loop {
                ticker.tick().await;
                let outcome = poller.tick().await;
                if !matches!(outcome, TickOutcome::Idle | TickOutcome::Follower | TickOutcome::Hidden) {
                    debug!(?outcome, "poll tick");
                }
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}
