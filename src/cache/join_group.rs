//! Per-key dial coalescing.
//!
//! The first caller for a key becomes the leader of a dial round; callers
//! arriving while the round is in flight join it and receive the same
//! outcome. Outcomes are published through a `watch` channel, which is
//! level-triggered: a waiter that subscribes after the value was sent still
//! observes it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, CacheResult, LockResultExt};

type Calls<K, V> = Arc<Mutex<HashMap<K, Call<V>>>>;

/// An in-flight dial round for one key.
struct Call<V> {
    round: u64,
    rx: watch::Receiver<Option<V>>,
}

/// Result of joining the group for a key.
pub(crate) enum Joined<K, V> {
    /// No round was in flight; the caller must drive this one to completion.
    Leader(Round<K, V>),
    /// A round is already in flight; wait on its outcome.
    Waiter(watch::Receiver<Option<V>>),
}

/// Map of key -> in-flight round.
pub(crate) struct JoinGroup<K, V> {
    calls: Calls<K, V>,
    next_round: AtomicU64,
}

impl<K, V> JoinGroup<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
            next_round: AtomicU64::new(1),
        }
    }

    /// Join the in-flight round for `key`, or start a new one.
    pub(crate) fn join(&self, key: &K) -> Joined<K, V> {
        let mut calls = self.calls.lock().recover_poison("JoinGroup::join");
        if let Some(call) = calls.get(key) {
            return Joined::Waiter(call.rx.clone());
        }

        let round = self.next_round.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        calls.insert(key.clone(), Call { round, rx });

        Joined::Leader(Round {
            key: key.clone(),
            id: round,
            tx: Some(tx),
            calls: Arc::clone(&self.calls),
        })
    }

    /// Whether a round is currently in flight for `key`.
    pub(crate) fn in_flight(&self, key: &K) -> bool {
        self.calls
            .lock()
            .recover_poison("JoinGroup::in_flight")
            .contains_key(key)
    }
}

/// Leadership of one dial round.
///
/// The round leaves the group exactly once: on [`Round::finish`], or on drop
/// if the leader never finished (waiters then observe a closed channel).
pub(crate) struct Round<K, V> {
    key: K,
    id: u64,
    tx: Option<watch::Sender<Option<V>>>,
    calls: Calls<K, V>,
}

impl<K, V> Round<K, V>
where
    K: Eq + Hash,
{
    /// A receiver for this round's outcome.
    pub(crate) fn subscribe(&self) -> Option<watch::Receiver<Option<V>>> {
        self.tx.as_ref().map(watch::Sender::subscribe)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Publish the outcome to every waiter and tear the round down.
    pub(crate) fn finish(mut self, outcome: V) {
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(outcome));
        }
        self.leave();
    }

    fn leave(&self) {
        let mut calls = self.calls.lock().recover_poison("Round::leave");
        // A newer round may already occupy the key; only remove our own.
        if calls.get(&self.key).is_some_and(|call| call.round == self.id) {
            calls.remove(&self.key);
        }
    }
}

impl<K, V> Drop for Round<K, V> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            // Leader went away without an outcome (panic or early return).
            self.calls
                .lock()
                .recover_poison("Round::drop")
                .retain(|_, call| call.round != self.id);
        }
    }
}

/// Wait for a round's outcome, or for the caller's own cancellation.
///
/// Cancellation only detaches this waiter; the round keeps running.
pub(crate) async fn wait<V: Clone>(
    mut rx: watch::Receiver<Option<V>>,
    cancel: &CancellationToken,
) -> CacheResult<V> {
    let outcome = async move {
        rx.wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|value| value.clone())
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CacheError::Canceled),
        outcome = outcome => outcome.ok_or(CacheError::DialAborted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    type Group = JoinGroup<String, Result<u32, String>>;

    fn key(name: &str) -> String {
        name.to_string()
    }

    #[test]
    fn first_caller_leads_and_others_wait() {
        let group = Group::new();

        let leader = group.join(&key("ctrl-A"));
        assert!(matches!(leader, Joined::Leader(_)));
        assert!(group.in_flight(&key("ctrl-A")));

        let waiter = group.join(&key("ctrl-A"));
        assert!(matches!(waiter, Joined::Waiter(_)));

        // Other keys are independent
        let other = group.join(&key("ctrl-B"));
        assert!(matches!(other, Joined::Leader(_)));
    }

    #[tokio::test]
    async fn finish_fans_out_outcome_and_returns_to_idle() {
        let group = Group::new();
        let Joined::Leader(round) = group.join(&key("ctrl-A")) else {
            panic!("expected leader");
        };
        let Joined::Waiter(rx1) = group.join(&key("ctrl-A")) else {
            panic!("expected waiter");
        };
        let Joined::Waiter(rx2) = group.join(&key("ctrl-A")) else {
            panic!("expected waiter");
        };

        round.finish(Ok(7));
        assert!(!group.in_flight(&key("ctrl-A")));

        let token = CancellationToken::new();
        assert_eq!(wait(rx1, &token).await.unwrap(), Ok(7));
        assert_eq!(wait(rx2, &token).await.unwrap(), Ok(7));

        // A fresh join starts a brand-new round
        assert!(matches!(group.join(&key("ctrl-A")), Joined::Leader(_)));
    }

    #[tokio::test]
    async fn failure_is_shared_verbatim() {
        let group = Group::new();
        let Joined::Leader(round) = group.join(&key("ctrl-A")) else {
            panic!("expected leader");
        };
        let leader_rx = round.subscribe().unwrap();
        let Joined::Waiter(rx) = group.join(&key("ctrl-A")) else {
            panic!("expected waiter");
        };

        round.finish(Err("refused".to_string()));

        let token = CancellationToken::new();
        assert_eq!(
            wait(leader_rx, &token).await.unwrap(),
            Err("refused".to_string())
        );
        assert_eq!(wait(rx, &token).await.unwrap(), Err("refused".to_string()));
    }

    #[tokio::test]
    async fn canceled_waiter_detaches_without_affecting_others() {
        let group = Group::new();
        let Joined::Leader(round) = group.join(&key("ctrl-A")) else {
            panic!("expected leader");
        };
        let Joined::Waiter(canceled_rx) = group.join(&key("ctrl-A")) else {
            panic!("expected waiter");
        };
        let Joined::Waiter(patient_rx) = group.join(&key("ctrl-A")) else {
            panic!("expected waiter");
        };

        let canceled = CancellationToken::new();
        canceled.cancel();
        let err = wait(canceled_rx, &canceled).await.unwrap_err();
        assert!(err.is_canceled());

        // The round is still in flight for everyone else
        assert!(group.in_flight(&key("ctrl-A")));

        let patient = CancellationToken::new();
        let waiter = tokio::spawn(async move { wait(patient_rx, &patient).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        round.finish(Ok(1));

        assert_eq!(waiter.await.unwrap().unwrap(), Ok(1));
    }

    #[tokio::test]
    async fn dropped_round_reports_aborted() {
        let group = Group::new();
        let Joined::Leader(round) = group.join(&key("ctrl-A")) else {
            panic!("expected leader");
        };
        let Joined::Waiter(rx) = group.join(&key("ctrl-A")) else {
            panic!("expected waiter");
        };

        drop(round);
        assert!(!group.in_flight(&key("ctrl-A")));

        let token = CancellationToken::new();
        assert!(matches!(
            wait(rx, &token).await,
            Err(CacheError::DialAborted)
        ));
    }

    #[test]
    fn waiter_stays_pending_until_finish() {
        let group = Group::new();
        let Joined::Leader(round) = group.join(&key("ctrl-A")) else {
            panic!("expected leader");
        };
        let Joined::Waiter(rx) = group.join(&key("ctrl-A")) else {
            panic!("expected waiter");
        };

        let token = CancellationToken::new();
        let mut waiter = task::spawn(wait(rx, &token));
        assert_pending!(waiter.poll());

        round.finish(Ok(3));
        assert!(waiter.is_woken());
        assert_eq!(assert_ready!(waiter.poll()).unwrap(), Ok(3));
    }
}
