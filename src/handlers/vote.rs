use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::error::{VoteError, VoteResult};
use crate::handlers::{PollHandle, VoteSession};
use crate::voting::projector::apply_in_place;
use crate::voting::{Delta, VoteDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteKind {
    First,
    Revote,
    /// Same option again inside the window: only the timestamp moved.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteOutcome {
    pub poll_id: String,
    pub option_id: String,
    pub kind: VoteKind,
    pub voted_at: DateTime<Utc>,
}

impl VoteSession {
    pub async fn cast_vote(&self, handle: &PollHandle, option_id: &str) -> VoteResult<VoteOutcome> {
        self.cast_vote_at(handle, option_id, Utc::now()).await
    }

    /// Vote for `option_id` as of `now`.
    ///
    /// Picks first vote, revote or reject from the voter's current vote and
    /// the revote window, projects the tally change onto the displayed poll,
    /// then asks the backend to make it durable. Any failure after projecting
    /// rolls the projection back before returning. A lost race (duplicate
    /// first vote, or a vote moved by another session) is re-evaluated once.
    pub async fn cast_vote_at(
        &self,
        handle: &PollHandle,
        option_id: &str,
        now: DateTime<Utc>,
    ) -> VoteResult<VoteOutcome> {
        {
            let view = handle.view.lock().await;
            let poll = view.poll();
            if !poll.has_option(option_id) {
                return Err(VoteError::NotFound(format!("option {} in poll {}", option_id, poll.id)));
            }
            if poll.is_closed(now) {
                return Err(VoteError::PollClosed { poll_id: poll.id.clone() });
            }
        }

        let mut retried = false;
        loop {
            let current = self.current_vote(handle.poll_id()).await;
            let decision = self.policy.decide(current.as_ref(), now);

            match self.attempt(handle, &decision, option_id, now).await {
                Ok(kind) => {
                    return Ok(VoteOutcome {
                        poll_id: handle.poll_id().to_string(),
                        option_id: option_id.to_string(),
                        kind,
                        voted_at: now,
                    });
                }
                Err(VoteError::StaleVote { .. }) if !retried => {
                    warn!("Vote on poll {} moved by another session, retrying", handle.poll_id());
                    retried = true;
                }
                Err(VoteError::DuplicateVote { .. })
                    if !retried && decision == VoteDecision::FirstVote =>
                {
                    warn!("Poll {} already has a vote from this voter, re-checking", handle.poll_id());
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(
        &self,
        handle: &PollHandle,
        decision: &VoteDecision,
        option_id: &str,
        now: DateTime<Utc>,
    ) -> VoteResult<VoteKind> {
        let poll_id = handle.poll_id();
        let (from, kind) = match decision {
            VoteDecision::FirstVote => (None, VoteKind::First),
            VoteDecision::Revote { from } if from == option_id => (Some(from.as_str()), VoteKind::Unchanged),
            VoteDecision::Revote { from } => (Some(from.as_str()), VoteKind::Revote),
            // Nothing projected yet, so nothing to undo.
            VoteDecision::Reject => {
                return Err(VoteError::DuplicateVote { poll_id: poll_id.to_string() });
            }
        };
        let delta = Delta::for_vote(from, option_id, kind == VoteKind::First);

        let previous_entry = self.state.local_entry(poll_id).await;
        let (applied, marks) = {
            let mut view = handle.view.lock().await;
            let applied = apply_in_place(view.poll_mut(), &delta);
            let marks = (mark_of(&view, &applied.from), mark_of(&view, &applied.to));
            (applied, marks)
        };

        let result = match decision {
            VoteDecision::Revote { from } => {
                self.backend
                    .submit_revote(poll_id, from, option_id, &self.identity, now)
                    .await
            }
            _ => {
                self.backend
                    .submit_first_vote(poll_id, option_id, &self.identity, now)
                    .await
            }
        };

        match result {
            Ok(()) => {
                self.state.record_local(poll_id, option_id, now).await;
                info!("Vote on poll {} committed ({:?}) for option {}", poll_id, kind, option_id);
                Ok(kind)
            }
            Err(e) => {
                {
                    let mut view = handle.view.lock().await;
                    // A side the feed has overwritten since projecting already shows the
                    // authoritative count, which never included this vote.
                    let undo = Delta {
                        from: applied.to.clone().filter(|_| mark_of(&view, &applied.to) == marks.1),
                        to: applied.from.clone().filter(|_| mark_of(&view, &applied.from) == marks.0),
                    };
                    apply_in_place(view.poll_mut(), &undo);
                }
                warn!("Vote on poll {} failed, projection rolled back: {}", poll_id, e);

                if let VoteError::Network(_) = e {
                    self.state.restore_local(poll_id, previous_entry).await;
                }
                Err(e)
            }
        }
    }
}

fn mark_of(view: &crate::feed::LiveView, option_id: &Option<String>) -> u64 {
    option_id.as_deref().map(|id| view.merge_mark(id)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::VoteStateStore;
    use crate::db::memory::MemoryStore;
    use crate::db::VoteBackend;
    use crate::feed::FeedHub;
    use crate::identity::VoterIdentity;
    use crate::models::fixtures::two_option_poll;
    use crate::models::{Poll, PollOption, VoteRecord};
    use crate::voting::RevoteWindowPolicy;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const WINDOW: Duration = Duration::from_secs(60);

    /// Passes through to a memory store, failing writes while `offline` is set
    /// and answering "no vote" to the next `blind_lookups` vote lookups.
    struct FlakyBackend {
        inner: MemoryStore,
        offline: AtomicBool,
        blind_lookups: AtomicUsize,
        // While offline, let a bystander vote for the target option before failing.
        bystander: AtomicBool,
        // Before each of the next N revotes, move the record elsewhere as another session would.
        interlopers: AtomicUsize,
    }

    impl FlakyBackend {
        fn check(&self) -> VoteResult<()> {
            if self.offline.load(Ordering::SeqCst) {
                Err(VoteError::Network("connection reset".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl VoteBackend for FlakyBackend {
        fn feed(&self) -> &FeedHub {
            self.inner.feed()
        }
        async fn create_poll(&self, poll: &Poll) -> VoteResult<()> {
            self.inner.create_poll(poll).await
        }
        async fn list_polls(&self) -> VoteResult<Vec<Poll>> {
            self.inner.list_polls().await
        }
        async fn load_poll(&self, poll_id: &str) -> VoteResult<Poll> {
            self.inner.load_poll(poll_id).await
        }
        async fn find_vote(&self, poll_id: &str, identity: &VoterIdentity) -> VoteResult<Option<VoteRecord>> {
            let blind = self
                .blind_lookups
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if blind {
                return Ok(None);
            }
            self.inner.find_vote(poll_id, identity).await
        }
        async fn submit_first_vote(
            &self,
            poll_id: &str,
            option_id: &str,
            identity: &VoterIdentity,
            at: DateTime<Utc>,
        ) -> VoteResult<()> {
            self.check()?;
            self.inner.submit_first_vote(poll_id, option_id, identity, at).await
        }
        async fn submit_revote(
            &self,
            poll_id: &str,
            from_option_id: &str,
            to_option_id: &str,
            identity: &VoterIdentity,
            at: DateTime<Utc>,
        ) -> VoteResult<()> {
            if self.offline.load(Ordering::SeqCst) && self.bystander.swap(false, Ordering::SeqCst) {
                let bystander = VoterIdentity::Authenticated("bystander".to_string());
                self.inner.submit_first_vote(poll_id, to_option_id, &bystander, at).await?;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            self.check()?;
            let interlope = self
                .interlopers
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if interlope {
                let poll = self.inner.load_poll(poll_id).await?;
                let elsewhere = poll
                    .options()
                    .iter()
                    .map(|option| option.id.clone())
                    .find(|id| id != from_option_id && id != to_option_id)
                    .unwrap_or_else(|| to_option_id.to_string());
                self.inner
                    .submit_revote(poll_id, from_option_id, &elsewhere, identity, at)
                    .await?;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            self.inner
                .submit_revote(poll_id, from_option_id, to_option_id, identity, at)
                .await
        }
        async fn delete_poll(&self, poll_id: &str, identity: &VoterIdentity) -> VoteResult<()> {
            self.inner.delete_poll(poll_id, identity).await
        }
    }

    async fn flaky_backend(now: DateTime<Utc>) -> Arc<FlakyBackend> {
        let backend = Arc::new(FlakyBackend {
            inner: MemoryStore::new(RevoteWindowPolicy::new(WINDOW), HashSet::new(), 64),
            offline: AtomicBool::new(false),
            blind_lookups: AtomicUsize::new(0),
            bystander: AtomicBool::new(false),
            interlopers: AtomicUsize::new(0),
        });
        backend.create_poll(&two_option_poll(now)).await.unwrap();
        backend
    }

    fn session(backend: Arc<dyn VoteBackend>, identity: VoterIdentity) -> VoteSession {
        VoteSession::new(
            backend,
            identity,
            Arc::new(VoteStateStore::ephemeral()),
            RevoteWindowPolicy::new(WINDOW),
            Duration::from_millis(20),
        )
    }

    fn voter(id: &str) -> VoterIdentity {
        VoterIdentity::Authenticated(id.to_string())
    }

    fn counts(poll: &Poll) -> Vec<(String, u64)> {
        assert_eq!(poll.total_votes(), poll.options().iter().map(|o| o.votes).sum::<u64>());
        poll.counts()
    }

    #[tokio::test]
    async fn vote_revote_then_locked_scenario() {
        let t0 = Utc::now();
        let backend = flaky_backend(t0).await;
        let session = session(backend.clone(), voter("v1"));
        let handle = session.open_poll("p").await.unwrap();

        let outcome = session.cast_vote_at(&handle, "a", t0).await.unwrap();
        assert_eq!(outcome.kind, VoteKind::First);
        assert_eq!(counts(&handle.snapshot().await), vec![("a".into(), 1), ("b".into(), 0)]);

        let outcome = session
            .cast_vote_at(&handle, "b", t0 + ChronoDuration::seconds(10))
            .await
            .unwrap();
        assert_eq!(outcome.kind, VoteKind::Revote);
        assert_eq!(counts(&handle.snapshot().await), vec![("a".into(), 0), ("b".into(), 1)]);

        let late = t0 + ChronoDuration::seconds(10 + 60);
        let err = session.cast_vote_at(&handle, "a", late).await.unwrap_err();
        assert!(matches!(err, VoteError::DuplicateVote { .. }));
        assert_eq!(counts(&handle.snapshot().await), vec![("a".into(), 0), ("b".into(), 1)]);
        assert_eq!(counts(&backend.load_poll("p").await.unwrap()), vec![("a".into(), 0), ("b".into(), 1)]);
    }

    #[tokio::test]
    async fn repeat_vote_in_window_only_moves_timestamp() {
        let t0 = Utc::now();
        let backend = flaky_backend(t0).await;
        let session = session(backend.clone(), voter("v1"));
        let handle = session.open_poll("p").await.unwrap();

        session.cast_vote_at(&handle, "a", t0).await.unwrap();
        let t1 = t0 + ChronoDuration::seconds(20);
        let outcome = session.cast_vote_at(&handle, "a", t1).await.unwrap();
        assert_eq!(outcome.kind, VoteKind::Unchanged);
        assert_eq!(counts(&handle.snapshot().await), vec![("a".into(), 1), ("b".into(), 0)]);
        assert_eq!(session.current_vote("p").await.unwrap().timestamp, t1);
    }

    #[tokio::test]
    async fn failed_revote_restores_counts_exactly() {
        let t0 = Utc::now();
        let backend = flaky_backend(t0).await;
        let session = session(backend.clone(), voter("v1"));
        let handle = session.open_poll("p").await.unwrap();
        session.cast_vote_at(&handle, "a", t0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let before = handle.snapshot().await;
        let cached = session.state.local_entry("p").await;
        backend.offline.store(true, Ordering::SeqCst);

        let err = session
            .cast_vote_at(&handle, "b", t0 + ChronoDuration::seconds(5))
            .await
            .unwrap_err();
        assert!(matches!(err, VoteError::Network(_)));
        assert_eq!(handle.snapshot().await, before);
        assert_eq!(session.state.local_entry("p").await, cached);
    }

    #[tokio::test]
    async fn rollback_keeps_counts_the_feed_overwrote() {
        let t0 = Utc::now();
        let backend = flaky_backend(t0).await;
        let session = session(backend.clone(), voter("v1"));
        let handle = session.open_poll("p").await.unwrap();
        session.cast_vote_at(&handle, "a", t0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        backend.offline.store(true, Ordering::SeqCst);
        backend.bystander.store(true, Ordering::SeqCst);
        let err = session
            .cast_vote_at(&handle, "b", t0 + ChronoDuration::seconds(5))
            .await
            .unwrap_err();
        assert!(matches!(err, VoteError::Network(_)));

        // "b" holds the bystander's vote as reported by the feed; "a" is restored.
        let authoritative = backend.load_poll("p").await.unwrap();
        assert_eq!(counts(&authoritative), vec![("a".into(), 1), ("b".into(), 1)]);
        assert_eq!(handle.snapshot().await, authoritative);
    }

    async fn add_three_option_poll(backend: &FlakyBackend, now: DateTime<Utc>) {
        let options = ["a", "b", "c"]
            .iter()
            .map(|id| PollOption { id: id.to_string(), text: id.to_uppercase(), votes: 0 })
            .collect();
        let poll = Poll::from_parts(
            "p3".into(),
            "Pick one".into(),
            "General".into(),
            "tester".into(),
            now,
            now + ChronoDuration::days(1),
            options,
        );
        backend.create_poll(&poll).await.unwrap();
    }

    #[tokio::test]
    async fn revote_moved_by_another_session_is_retried_once() {
        let t0 = Utc::now();
        let backend = flaky_backend(t0).await;
        add_three_option_poll(&backend, t0).await;
        let session = session(backend.clone(), voter("v1"));
        let handle = session.open_poll("p3").await.unwrap();
        session.cast_vote_at(&handle, "a", t0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The other session moves a -> b, so the first attempt from a goes stale.
        backend.interlopers.store(1, Ordering::SeqCst);
        let outcome = session
            .cast_vote_at(&handle, "c", t0 + ChronoDuration::seconds(5))
            .await
            .unwrap();
        assert_eq!(outcome.kind, VoteKind::Revote);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let authoritative = backend.load_poll("p3").await.unwrap();
        assert_eq!(counts(&authoritative), vec![("a".into(), 0), ("b".into(), 0), ("c".into(), 1)]);
        assert_eq!(handle.snapshot().await, authoritative);
        assert_eq!(session.current_vote("p3").await.unwrap().option_id, "c");
    }

    #[tokio::test]
    async fn revote_stale_twice_is_surfaced_and_rolled_back() {
        let t0 = Utc::now();
        let backend = flaky_backend(t0).await;
        add_three_option_poll(&backend, t0).await;
        let session = session(backend.clone(), voter("v1"));
        let handle = session.open_poll("p3").await.unwrap();
        session.cast_vote_at(&handle, "a", t0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // a -> b before the first attempt, then b -> a before the retry.
        backend.interlopers.store(2, Ordering::SeqCst);
        let err = session
            .cast_vote_at(&handle, "c", t0 + ChronoDuration::seconds(5))
            .await
            .unwrap_err();
        assert!(matches!(err, VoteError::StaleVote { .. }));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let authoritative = backend.load_poll("p3").await.unwrap();
        assert_eq!(counts(&authoritative), vec![("a".into(), 1), ("b".into(), 0), ("c".into(), 0)]);
        assert_eq!(handle.snapshot().await, authoritative);
        assert_eq!(backend.interlopers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_first_vote_leaves_no_trace() {
        let t0 = Utc::now();
        let backend = flaky_backend(t0).await;
        backend.offline.store(true, Ordering::SeqCst);
        let session = session(backend.clone(), VoterIdentity::Anonymous);
        let handle = session.open_poll("p").await.unwrap();
        let before = handle.snapshot().await;

        assert!(session.cast_vote_at(&handle, "a", t0).await.is_err());
        assert_eq!(handle.snapshot().await, before);
        assert_eq!(session.current_vote("p").await, None);
    }

    #[tokio::test]
    async fn vote_from_another_session_is_picked_up_as_revote() {
        let t0 = Utc::now();
        let backend = flaky_backend(t0).await;
        let phone = session(backend.clone(), voter("v1"));
        let laptop = session(backend.clone(), voter("v1"));
        let laptop_handle = laptop.open_poll("p").await.unwrap();

        let phone_handle = phone.open_poll("p").await.unwrap();
        phone.cast_vote_at(&phone_handle, "a", t0).await.unwrap();

        let outcome = laptop
            .cast_vote_at(&laptop_handle, "b", t0 + ChronoDuration::seconds(3))
            .await
            .unwrap();
        assert_eq!(outcome.kind, VoteKind::Revote);
        let poll = backend.load_poll("p").await.unwrap();
        assert_eq!(counts(&poll), vec![("a".into(), 0), ("b".into(), 1)]);
    }

    #[tokio::test]
    async fn duplicate_first_vote_race_retries_as_revote() {
        let t0 = Utc::now();
        let backend = flaky_backend(t0).await;
        let phone = session(backend.clone(), voter("v1"));
        let laptop = session(backend.clone(), voter("v1"));
        let phone_handle = phone.open_poll("p").await.unwrap();
        let laptop_handle = laptop.open_poll("p").await.unwrap();
        phone.cast_vote_at(&phone_handle, "a", t0).await.unwrap();

        // The laptop's lookup misses the phone's vote, so it tries a first vote and loses.
        backend.blind_lookups.store(1, Ordering::SeqCst);
        let outcome = laptop
            .cast_vote_at(&laptop_handle, "b", t0 + ChronoDuration::seconds(3))
            .await
            .unwrap();
        assert_eq!(outcome.kind, VoteKind::Revote);
        assert_eq!(counts(&backend.load_poll("p").await.unwrap()), vec![("a".into(), 0), ("b".into(), 1)]);
        assert_eq!(laptop.current_vote("p").await.unwrap().option_id, "b");
    }

    #[tokio::test]
    async fn duplicate_first_vote_after_window_reports_already_voted() {
        let t0 = Utc::now();
        let backend = flaky_backend(t0).await;
        let phone = session(backend.clone(), voter("v1"));
        let laptop = session(backend.clone(), voter("v1"));
        let phone_handle = phone.open_poll("p").await.unwrap();
        let laptop_handle = laptop.open_poll("p").await.unwrap();
        phone.cast_vote_at(&phone_handle, "a", t0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let before = laptop_handle.snapshot().await;

        backend.blind_lookups.store(1, Ordering::SeqCst);
        let err = laptop
            .cast_vote_at(&laptop_handle, "b", t0 + ChronoDuration::minutes(5))
            .await
            .unwrap_err();
        assert!(matches!(err, VoteError::DuplicateVote { .. }));
        assert_eq!(laptop_handle.snapshot().await.counts(), before.counts());
    }

    #[tokio::test]
    async fn anonymous_voter_is_limited_by_local_cache() {
        let t0 = Utc::now();
        let backend = flaky_backend(t0).await;
        let session = session(backend.clone(), VoterIdentity::Anonymous);
        let handle = session.open_poll("p").await.unwrap();

        session.cast_vote_at(&handle, "a", t0).await.unwrap();
        let outcome = session
            .cast_vote_at(&handle, "b", t0 + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(outcome.kind, VoteKind::Revote);
        let err = session
            .cast_vote_at(&handle, "a", t0 + ChronoDuration::seconds(120))
            .await
            .unwrap_err();
        assert!(matches!(err, VoteError::DuplicateVote { .. }));
        assert_eq!(counts(&backend.load_poll("p").await.unwrap()), vec![("a".into(), 0), ("b".into(), 1)]);
    }

    #[tokio::test]
    async fn two_voters_same_option_total_two() {
        let t0 = Utc::now();
        let backend = flaky_backend(t0).await;
        let first = session(backend.clone(), voter("v1"));
        let second = session(backend.clone(), voter("v2"));
        let h1 = first.open_poll("p").await.unwrap();
        let h2 = second.open_poll("p").await.unwrap();

        let (r1, r2) = tokio::join!(first.cast_vote_at(&h1, "a", t0), second.cast_vote_at(&h2, "a", t0));
        r1.unwrap();
        r2.unwrap();

        // Let both feeds drain; each view converges on the authoritative count.
        for handle in [&h1, &h2] {
            for _ in 0..100 {
                if handle.snapshot().await.total_votes() == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert_eq!(counts(&handle.snapshot().await), vec![("a".into(), 2), ("b".into(), 0)]);
        }
    }

    #[tokio::test]
    async fn unknown_option_and_closed_poll_are_rejected_up_front() {
        let t0 = Utc::now();
        let backend = flaky_backend(t0).await;
        let session = session(backend.clone(), voter("v1"));
        let handle = session.open_poll("p").await.unwrap();

        assert!(matches!(
            session.cast_vote_at(&handle, "zzz", t0).await,
            Err(VoteError::NotFound(_))
        ));
        assert!(matches!(
            session.cast_vote_at(&handle, "a", t0 + ChronoDuration::days(2)).await,
            Err(VoteError::PollClosed { .. })
        ));
        assert_eq!(handle.snapshot().await.total_votes(), 0);
    }
}
