//! Per-tab composition root.

use crate::clock::{SharedClock, SystemClock};
use crate::config::ClientSettings;
use crate::election::LeaderElection;
use crate::engine::StageEngine;
use crate::error::RemoteError;
use crate::flow::LinkFlow;
use crate::notify::{Notice, Notifier};
use crate::poller::{PollingLoop, Visibility};
use crate::progress::ProgressStore;
use crate::remote::{HttpRemoteState, RemoteState};
use crate::session::SessionIdProvider;
use crate::storage::SharedStorage;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// One tab's worth of linking machinery: session id, progress store, flow,
/// leader election and polling loop, all sharing one storage and endpoint.
pub struct LinkAgent {
    flow: Arc<LinkFlow>,
    election: Arc<LeaderElection>,
    poller: Arc<PollingLoop>,
    visibility: Visibility,
}

impl LinkAgent {
    pub fn new(
        storage: SharedStorage,
        remote: Arc<dyn RemoteState>,
        clock: SharedClock,
        settings: &ClientSettings,
    ) -> Self {
        let session_id =
            SessionIdProvider::new(Arc::clone(&storage), Arc::clone(&clock)).get_session_id();
        let progress = ProgressStore::with_history_limit(
            Arc::clone(&storage),
            Arc::clone(&clock),
            settings.history_limit,
        );
        let flow = Arc::new(LinkFlow::new(
            session_id,
            progress,
            StageEngine::new(settings.waiting_window()),
            remote,
            Arc::clone(&clock),
            Notifier::new(),
            settings.flow_timings(),
        ));
        let election = Arc::new(LeaderElection::new(
            storage,
            clock,
            settings.election_timings(),
        ));
        let visibility = Visibility::default();
        let poller = Arc::new(PollingLoop::new(
            Arc::clone(&flow),
            Arc::clone(&election),
            visibility.clone(),
            settings.poll_interval(),
        ));
        Self {
            flow,
            election,
            poller,
            visibility,
        }
    }

    /// Agent talking to `settings.state_url` on the system clock.
    pub fn connect(storage: SharedStorage, settings: &ClientSettings) -> Result<Self, RemoteError> {
        let remote = Arc::new(HttpRemoteState::new(&settings.state_url)?);
        Ok(Self::new(storage, remote, Arc::new(SystemClock), settings))
    }

    pub fn session_id(&self) -> &str {
        self.flow.session_id()
    }

    pub fn flow(&self) -> &Arc<LinkFlow> {
        &self.flow
    }

    pub fn election(&self) -> &Arc<LeaderElection> {
        &self.election
    }

    pub fn poller(&self) -> &Arc<PollingLoop> {
        &self.poller
    }

    pub fn visibility(&self) -> &Visibility {
        &self.visibility
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.flow.subscribe()
    }

    pub fn start(&self) {
        info!(
            session = %self.flow.session_id(),
            instance = %self.election.instance_id(),
            "starting link agent"
        );
        self.election.try_elect();
        self.election.start();
        self.poller.start();
        self.flow.resume();
    }

    pub fn stop(&self) {
        self.poller.stop();
        self.election.stop();
        self.flow.cancel_timers();
        info!(instance = %self.election.instance_id(), "link agent stopped");
    }
}
