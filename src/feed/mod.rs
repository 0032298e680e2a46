use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::db::VoteBackend;
use crate::models::{CountChanged, Poll};

/// Fan-out point for option count changes. Backends publish after each commit.
#[derive(Clone)]
pub struct FeedHub {
    sender: broadcast::Sender<CountChanged>,
}

impl FeedHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CountChanged> {
        self.sender.subscribe()
    }

    /// Delivery errors only mean nobody is listening.
    pub fn publish(&self, event: CountChanged) {
        let _ = self.sender.send(event);
    }
}

/// Merge one feed event into a displayed poll.
///
/// The reported count overwrites the local one, including when it is lower:
/// the feed speaks for the authoritative store. The total is recomputed from
/// the options. Returns false when the event is for another poll or an unknown option.
pub fn merge_count(view: &mut Poll, event: &CountChanged) -> bool {
    if view.id != event.poll_id {
        return false;
    }
    view.set_count(&event.option_id, event.new_count)
}

/// A displayed poll plus a per-option count of feed merges.
///
/// The merge marks let a rollback tell whether the feed has overwritten an
/// option since the optimistic delta was applied.
#[derive(Debug, Clone)]
pub struct LiveView {
    poll: Poll,
    merges: HashMap<String, u64>,
}

impl LiveView {
    pub fn new(poll: Poll) -> Self {
        Self { poll, merges: HashMap::new() }
    }

    pub fn poll(&self) -> &Poll {
        &self.poll
    }

    pub fn poll_mut(&mut self) -> &mut Poll {
        &mut self.poll
    }

    pub fn merge(&mut self, event: &CountChanged) -> bool {
        if !merge_count(&mut self.poll, event) {
            return false;
        }
        *self.merges.entry(event.option_id.clone()).or_insert(0) += 1;
        true
    }

    pub fn merge_mark(&self, option_id: &str) -> u64 {
        self.merges.get(option_id).copied().unwrap_or(0)
    }
}

/// Keeps one displayed poll in step with the change feed.
pub struct ChangeFeedSubscriber;

/// Live subscription. Dropping it or calling [`FeedSubscription::close`] ends it.
pub struct FeedSubscription {
    poll_id: String,
    task: JoinHandle<()>,
}

impl ChangeFeedSubscriber {
    /// Start merging events for `view.id` into `view`.
    ///
    /// Counts are reloaded from `backend` right after subscribing, and again
    /// whenever the receiver falls behind, so no overwritten count is missed.
    pub async fn spawn(
        view: Arc<Mutex<LiveView>>,
        backend: Arc<dyn VoteBackend>,
    ) -> FeedSubscription {
        let poll_id = view.lock().await.poll().id.clone();
        let mut receiver = backend.feed().subscribe();
        info!("Subscribed to change feed for poll {}", poll_id);
        reload_counts(&view, backend.as_ref(), &poll_id).await;

        let task_poll_id = poll_id.clone();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) if event.poll_id == task_poll_id => {
                        if !view.lock().await.merge(&event) {
                            debug!(
                                "Ignoring count change for unknown option {} in poll {}",
                                event.option_id, task_poll_id
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            "Change feed for poll {} lagged by {} events, reloading",
                            task_poll_id, skipped
                        );
                        reload_counts(&view, backend.as_ref(), &task_poll_id).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        FeedSubscription { poll_id, task }
    }
}

async fn reload_counts(view: &Mutex<LiveView>, backend: &dyn VoteBackend, poll_id: &str) {
    match backend.load_poll(poll_id).await {
        Ok(fresh) => {
            let mut guard = view.lock().await;
            for option in fresh.options() {
                guard.merge(&CountChanged {
                    poll_id: poll_id.to_string(),
                    option_id: option.id.clone(),
                    new_count: option.votes,
                });
            }
        }
        Err(e) => error!("Reload of poll {} failed: {}", poll_id, e),
    }
}

impl FeedSubscription {
    pub fn close(self) {
        // Drop does the work.
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.task.abort();
        info!("Closed change feed subscription for poll {}", self.poll_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::models::fixtures::two_option_poll;
    use crate::voting::RevoteWindowPolicy;
    use chrono::Utc;
    use std::collections::HashSet;
    use std::time::Duration;

    fn event(option: &str, count: u64) -> CountChanged {
        CountChanged { poll_id: "p".into(), option_id: option.into(), new_count: count }
    }

    #[test]
    fn merge_overwrites_and_recomputes_total() {
        let mut view = two_option_poll(Utc::now());
        view.set_count("a", 1);
        // Local optimistic +1 on "b" that the feed already accounts for.
        view.set_count("b", 1);
        assert!(merge_count(&mut view, &event("b", 1)));
        assert_eq!(view.total_votes(), 2);

        // Lower count is trusted.
        assert!(merge_count(&mut view, &event("a", 0)));
        assert_eq!(view.counts(), vec![("a".into(), 0), ("b".into(), 1)]);
        assert_eq!(view.total_votes(), 1);
    }

    #[test]
    fn merge_ignores_foreign_events() {
        let mut view = two_option_poll(Utc::now());
        assert!(!merge_count(&mut view, &event("zzz", 4)));
        let other = CountChanged { poll_id: "q".into(), option_id: "a".into(), new_count: 9 };
        assert!(!merge_count(&mut view, &other));
        assert_eq!(view.total_votes(), 0);
    }

    #[test]
    fn merge_is_idempotent() {
        let events = [event("a", 1), event("a", 2), event("b", 1)];
        let mut forward = two_option_poll(Utc::now());
        for e in &events {
            merge_count(&mut forward, e);
        }
        let mut replayed = forward.clone();
        for e in &events {
            merge_count(&mut replayed, e);
        }
        assert_eq!(forward, replayed);
        assert_eq!(forward.total_votes(), 3);
    }

    #[tokio::test]
    async fn subscription_applies_events_until_closed() {
        let store = Arc::new(MemoryStore::new(
            RevoteWindowPolicy::new(Duration::from_secs(60)),
            HashSet::new(),
            16,
        ));
        store.create_poll(&two_option_poll(Utc::now())).await.unwrap();
        let backend: Arc<dyn VoteBackend> = store.clone();

        let view = Arc::new(Mutex::new(LiveView::new(backend.load_poll("p").await.unwrap())));
        let subscription = ChangeFeedSubscriber::spawn(view.clone(), backend.clone()).await;
        assert_eq!(subscription.poll_id, "p");

        store.feed().publish(event("a", 5));
        wait_for(&view, |p| p.total_votes() == 5).await;
        assert!(view.lock().await.merge_mark("a") >= 1);

        subscription.close();
        tokio::task::yield_now().await;
        store.feed().publish(event("a", 9));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(view.lock().await.poll().option("a").unwrap().votes, 5);
    }

    #[test]
    fn live_view_marks_only_applied_merges() {
        let mut view = LiveView::new(two_option_poll(Utc::now()));
        assert!(view.merge(&event("a", 2)));
        assert!(!view.merge(&event("zzz", 2)));
        assert_eq!(view.merge_mark("a"), 1);
        assert_eq!(view.merge_mark("b"), 0);
        assert_eq!(view.poll().total_votes(), 2);
    }

    async fn wait_for(view: &Arc<Mutex<LiveView>>, done: impl Fn(&Poll) -> bool) {
        for _ in 0..100 {
            if done(view.lock().await.poll()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("view never reached expected state: {:?}", view.lock().await.poll());
    }
}
