//! Lease-based leader election over shared local storage.
//!
//! Every instance sharing a storage runs the same loop: on each check it
//! reads the master pointer and the heartbeat, claims mastership when there is
//! no master or the heartbeat is stale, then derives its own leadership from
//! whoever the pointer names. The leader refreshes the heartbeat on a shorter
//! interval. Writes to the master pointer by other instances are picked up
//! from storage events straight away.
//!
//! This is cooperative, not mutual exclusion: two instances that claim in the
//! same instant both believe they lead until the next event or check.

use crate::clock::{SharedClock, duration_ms};
use crate::storage::{SharedStorage, StorageEvent};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const MASTER_KEY: &str = "link.poll.master";
pub const HEARTBEAT_KEY: &str = "link.poll.heartbeat";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterLease {
    pub id: String,
    pub at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub t: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionTimings {
    pub check_interval: Duration,
    pub heartbeat_interval: Duration,
    /// A heartbeat older than this lets any instance take over.
    pub stale_after: Duration,
}

impl ElectionTimings {
    pub fn from_check_interval(check_interval: Duration, heartbeat_interval: Duration) -> Self {
        Self {
            check_interval,
            heartbeat_interval,
            stale_after: check_interval * 3,
        }
    }
}

impl Default for ElectionTimings {
    fn default() -> Self {
        Self::from_check_interval(Duration::from_secs(3), Duration::from_secs(1))
    }
}

pub struct LeaderElection {
    instance_id: String,
    storage: SharedStorage,
    clock: SharedClock,
    timings: ElectionTimings,
    leader: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LeaderElection {
    pub fn new(storage: SharedStorage, clock: SharedClock, timings: ElectionTimings) -> Self {
        Self::with_instance_id(uuid::Uuid::new_v4().simple().to_string(), storage, clock, timings)
    }

    pub fn with_instance_id(
        instance_id: String,
        storage: SharedStorage,
        clock: SharedClock,
        timings: ElectionTimings,
    ) -> Self {
        Self {
            instance_id,
            storage,
            clock,
            timings,
            leader: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    pub fn timings(&self) -> ElectionTimings {
        self.timings
    }

    pub fn master(&self) -> Option<MasterLease> {
        self.read_json(MASTER_KEY)
    }

    /// One election check. Claims the lease when it is free or stale, then
    /// returns whether this instance now leads.
    pub fn try_elect(&self) -> bool {
        let now = self.clock.now_ms();
        let master = self.master();
        let stale = match self.read_json::<Heartbeat>(HEARTBEAT_KEY) {
            Some(heartbeat) => now.saturating_sub(heartbeat.t) > duration_ms(self.timings.stale_after),
            None => true,
        };

        if master.is_none() || stale {
            debug!(instance = %self.instance_id, previous = ?master.map(|m| m.id), "claiming poll lease");
            self.write_json(
                MASTER_KEY,
                &MasterLease {
                    id: self.instance_id.clone(),
                    at: now,
                },
            );
        }

        let leader = self.refresh();
        if leader {
            self.renew();
        }
        leader
    }

    /// Refreshes the heartbeat if this instance still holds the lease.
    pub fn renew(&self) -> bool {
        if !self.refresh() {
            return false;
        }
        self.write_json(
            HEARTBEAT_KEY,
            &Heartbeat {
                t: self.clock.now_ms(),
            },
        );
        true
    }

    /// Reacts to a write by another instance sharing the storage.
    pub fn observe_external(&self, event: &StorageEvent) {
        if event.key == MASTER_KEY {
            self.refresh();
        }
    }

    /// Gives the lease up if this instance holds it, so another instance can
    /// take over on its next check instead of waiting for staleness.
    pub fn resign(&self) {
        if self.holds_lease() {
            info!(instance = %self.instance_id, "resigning poll lease");
            for key in [MASTER_KEY, HEARTBEAT_KEY] {
                if let Err(err) = self.storage.remove_item(key) {
                    warn!(key, error = %err, "failed to clear election key");
                }
            }
        }
        self.leader.store(false, Ordering::SeqCst);
    }

    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            return;
        }

        let election = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(election.timings.check_interval);
            loop {
                ticker.tick().await;
                election.try_elect();
            }
        }));

        let election = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(election.timings.heartbeat_interval);
            loop {
                ticker.tick().await;
                election.renew();
            }
        }));

        let election = Arc::clone(self);
        let mut events = self.storage.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => election.observe_external(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "storage events lagged, re-reading lease");
                        election.refresh();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }

    pub fn stop(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        self.resign();
    }

    fn holds_lease(&self) -> bool {
        self.master().is_some_and(|m| m.id == self.instance_id)
    }

    fn refresh(&self) -> bool {
        let leader = self.holds_lease();
        let was = self.leader.swap(leader, Ordering::SeqCst);
        if was != leader {
            info!(instance = %self.instance_id, leader, "poll leadership changed");
        }
        leader
    }

    fn read_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.storage.get_item(key) {
            Ok(raw) => raw?,
            Err(err) => {
                debug!(key, error = %err, "election key unreadable");
                return None;
            }
        };
        serde_json::from_str(&raw).ok()
    }

    fn write_json<T: Serialize>(&self, key: &str, value: &T) {
        let result = serde_json::to_string(value)
            .map_err(crate::error::StorageError::from)
            .and_then(|raw| self.storage.set_item(key, &raw));
        if let Err(err) = result {
            debug!(key, error = %err, "election key not written");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{LocalStorage, MemoryStorage};

    const NOW: i64 = 1_714_557_600_000;

    fn instance(id: &str, storage: &MemoryStorage, clock: &ManualClock) -> LeaderElection {
        LeaderElection::with_instance_id(
            id.to_string(),
            Arc::new(storage.clone()),
            Arc::new(clock.clone()),
            ElectionTimings::default(),
        )
    }

    #[test]
    fn first_claimant_wins_and_others_follow() {
        let storage = MemoryStorage::new();
        let clock = ManualClock::new(NOW);
        let a = instance("tab-a", &storage, &clock);
        let b = instance("tab-b", &storage, &clock);

        for _ in 0..2 {
            a.try_elect();
            b.try_elect();
            clock.advance(a.timings().check_interval);
        }
        assert!(a.is_leader());
        assert!(!b.is_leader());
    }

    #[test]
    fn simultaneous_claims_settle_within_a_cycle() {
        let storage = MemoryStorage::new();
        let clock = ManualClock::new(NOW);
        let a = instance("tab-a", &storage, &clock);
        let b = instance("tab-b", &storage, &clock);

        // Both saw an empty lease; b's write lands last.
        storage
            .set_item(MASTER_KEY, r#"{"id":"tab-a","at":0}"#)
            .expect("seed");
        a.refresh();
        storage
            .set_item(MASTER_KEY, r#"{"id":"tab-b","at":0}"#)
            .expect("seed");
        b.refresh();
        assert!(a.is_leader() && b.is_leader());

        a.observe_external(&StorageEvent {
            key: MASTER_KEY.to_string(),
        });
        assert!(!a.is_leader());
        assert!(b.is_leader());
    }

    #[test]
    fn stale_heartbeat_allows_takeover() {
        let storage = MemoryStorage::new();
        let clock = ManualClock::new(NOW);
        let a = instance("tab-a", &storage, &clock);
        let b = instance("tab-b", &storage, &clock);
        assert!(a.try_elect());

        clock.advance(Duration::from_secs(9));
        assert!(!b.try_elect(), "heartbeat exactly at the threshold is still fresh");

        clock.advance(Duration::from_millis(1));
        assert!(b.try_elect());
        assert!(!a.renew());
        assert!(!a.is_leader());
    }

    #[test]
    fn renewing_keeps_the_lease() {
        let storage = MemoryStorage::new();
        let clock = ManualClock::new(NOW);
        let a = instance("tab-a", &storage, &clock);
        let b = instance("tab-b", &storage, &clock);
        a.try_elect();
        for _ in 0..20 {
            clock.advance(Duration::from_secs(1));
            assert!(a.renew());
            assert!(!b.try_elect());
        }
    }

    #[test]
    fn resign_frees_the_lease() {
        let storage = MemoryStorage::new();
        let clock = ManualClock::new(NOW);
        let a = instance("tab-a", &storage, &clock);
        let b = instance("tab-b", &storage, &clock);
        a.try_elect();
        a.resign();
        assert!(!a.is_leader());
        assert!(b.try_elect());
    }

    #[test]
    fn unavailable_storage_means_no_leader() {
        let storage = MemoryStorage::new();
        let clock = ManualClock::new(NOW);
        let a = instance("tab-a", &storage, &clock);
        storage.set_failing(true);
        assert!(!a.try_elect());
    }

    #[tokio::test(start_paused = true)]
    async fn started_instances_elect_one_leader() {
        let storage = MemoryStorage::new();
        let clock = ManualClock::new(NOW);
        let a = Arc::new(LeaderElection::new(
            Arc::new(storage.clone()),
            Arc::new(clock.clone()),
            ElectionTimings::default(),
        ));
        let b = Arc::new(LeaderElection::new(
            Arc::new(storage.clone()),
            Arc::new(clock.clone()),
            ElectionTimings::default(),
        ));
        assert_ne!(a.instance_id(), b.instance_id());

        a.start();
        b.start();
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(
            [a.is_leader(), b.is_leader()].iter().filter(|l| **l).count(),
            1
        );

        let leader = if a.is_leader() { &a } else { &b };
        let follower = if a.is_leader() { &b } else { &a };
        leader.stop();
        follower.try_elect();
        assert!(follower.is_leader());
        follower.stop();
    }
}
