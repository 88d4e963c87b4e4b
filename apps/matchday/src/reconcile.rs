use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::model::{MatchInfo, MatchState, MatchStatus};

/// What `apply_state` did with a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Snapshot older than the applied tick; nothing was taken from it.
    Stale { current_tick: u64, incoming_tick: u64 },
    Unchanged,
}

#[derive(Debug, Default)]
struct Inner {
    state: MatchState,
    info: Option<MatchInfo>,
    revision: u64,
}

/// Sole owner of the canonical [`MatchState`].
///
/// Every inbound snapshot is complete, so an accepted snapshot replaces all
/// fields at once under the lock; two snapshots never interleave. Tick and
/// score never move backwards and `Finished` is final.
#[derive(Debug)]
pub struct StateReconciler {
    inner: Mutex<Inner>,
    updates: watch::Sender<MatchState>,
}

impl Default for StateReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl StateReconciler {
    pub fn new() -> Self {
        let (updates, _) = watch::channel(MatchState::default());
        Self {
            inner: Mutex::new(Inner::default()),
            updates,
        }
    }

    pub fn apply_state(&self, incoming: MatchState) -> ApplyOutcome {
        let mut inner = self.inner.lock();
        self.merge(&mut inner, incoming)
    }

    /// For payloads without a tick, such as a result-only finish push: the
    /// snapshot is taken as current rather than stale.
    pub fn apply_untimed(&self, mut incoming: MatchState) -> ApplyOutcome {
        let mut inner = self.inner.lock();
        incoming.tick = inner.state.tick;
        self.merge(&mut inner, incoming)
    }

    fn merge(&self, inner: &mut Inner, incoming: MatchState) -> ApplyOutcome {
        let current = &inner.state;

        if incoming.tick < current.tick {
            debug!(
                target = "matchday::reconcile",
                current_tick = current.tick,
                incoming_tick = incoming.tick,
                "dropping stale state snapshot"
            );
            return ApplyOutcome::Stale {
                current_tick: current.tick,
                incoming_tick: incoming.tick,
            };
        }

        let mut next = incoming;
        if next.home_score < current.home_score || next.away_score < current.away_score {
            warn!(
                target = "matchday::reconcile",
                tick = next.tick,
                current = %current.score_line(),
                incoming = %next.score_line(),
                "snapshot lowered the score; keeping the higher value"
            );
            next.home_score = next.home_score.max(current.home_score);
            next.away_score = next.away_score.max(current.away_score);
        }
        if !current.status.can_transition_to(next.status) {
            next.status = current.status;
        }

        if next == inner.state {
            return ApplyOutcome::Unchanged;
        }
        inner.state = next;
        self.publish(inner);
        ApplyOutcome::Applied
    }

    /// Session metadata is fixed by the first call; later calls return `false`.
    pub fn apply_info(&self, info: MatchInfo) -> bool {
        let mut inner = self.inner.lock();
        if inner.info.is_some() {
            return false;
        }
        inner.info = Some(info);
        inner.revision += 1;
        true
    }

    pub fn mark_paused(&self) -> bool {
        self.set_status(MatchStatus::Paused, |status| {
            matches!(status, MatchStatus::InProgress)
        })
    }

    pub fn mark_resumed(&self) -> bool {
        self.set_status(MatchStatus::InProgress, |status| {
            matches!(status, MatchStatus::Paused)
        })
    }

    pub fn mark_finished(&self) -> bool {
        self.set_status(MatchStatus::Finished, |status| !status.is_finished())
    }

    fn set_status(&self, next: MatchStatus, allowed_from: impl Fn(MatchStatus) -> bool) -> bool {
        let mut inner = self.inner.lock();
        if !allowed_from(inner.state.status) {
            return false;
        }
        inner.state.status = next;
        self.publish(&mut inner);
        true
    }

    fn publish(&self, inner: &mut Inner) {
        inner.revision += 1;
        self.updates.send_replace(inner.state.clone());
    }

    pub fn snapshot(&self) -> MatchState {
        self.inner.lock().state.clone()
    }

    pub fn info(&self) -> Option<MatchInfo> {
        self.inner.lock().info.clone()
    }

    pub fn with_info<R>(&self, f: impl FnOnce(Option<&MatchInfo>) -> R) -> R {
        f(self.inner.lock().info.as_ref())
    }

    pub fn status(&self) -> MatchStatus {
        self.inner.lock().state.status
    }

    /// Bumped on every accepted change, metadata included.
    pub fn revision(&self) -> u64 {
        self.inner.lock().revision
    }

    pub fn subscribe(&self) -> watch::Receiver<MatchState> {
        self.updates.subscribe()
    }
}
