mod vote;

pub use vote::{VoteKind, VoteOutcome};

use crate::cache::VoteStateStore;
use crate::config::VoteConfig;
use crate::db::VoteBackend;
use crate::error::VoteResult;
use crate::feed::{ChangeFeedSubscriber, FeedSubscription, LiveView};
use crate::identity::VoterIdentity;
use crate::models::{CountChanged, LocalVoteEntry, Poll};
use crate::tasks::window_ticker::spawn_window_ticker;
use crate::voting::{RevoteWindowPolicy, WindowState};
use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Everything one voter's session needs. Build one per session; nothing is global.
pub struct VoteSession {
    backend: Arc<dyn VoteBackend>,
    identity: VoterIdentity,
    state: Arc<VoteStateStore>,
    policy: RevoteWindowPolicy,
    window_tick: Duration,
}

/// An actively viewed poll: its live view, change-feed subscription and countdown.
/// Dropping the handle tears both background tasks down.
pub struct PollHandle {
    poll_id: String,
    view: Arc<Mutex<LiveView>>,
    _subscription: FeedSubscription,
    window: watch::Receiver<WindowState>,
    ticker: JoinHandle<()>,
}

impl VoteSession {
    pub fn new(
        backend: Arc<dyn VoteBackend>,
        identity: VoterIdentity,
        state: Arc<VoteStateStore>,
        policy: RevoteWindowPolicy,
        window_tick: Duration,
    ) -> Self {
        Self {
            backend,
            identity,
            state,
            policy,
            window_tick,
        }
    }

    /// Wire a session from configuration.
    pub async fn from_config(
        config: &VoteConfig,
        backend: Arc<dyn VoteBackend>,
        identity: VoterIdentity,
    ) -> Self {
        let state = Arc::new(VoteStateStore::open(config.cache_path.clone()).await);
        Self::new(
            backend,
            identity,
            state,
            RevoteWindowPolicy::new(config.revote_window),
            config.window_tick,
        )
    }

    pub fn backend(&self) -> &Arc<dyn VoteBackend> {
        &self.backend
    }

    /// Load a poll and start following it.
    pub async fn open_poll(&self, poll_id: &str) -> VoteResult<PollHandle> {
        let poll = self.backend.load_poll(poll_id).await?;
        let view = Arc::new(Mutex::new(LiveView::new(poll)));
        let subscription = ChangeFeedSubscriber::spawn(Arc::clone(&view), Arc::clone(&self.backend)).await;

        // Prime the cache so the countdown reflects votes made in other sessions.
        self.state
            .current_vote(poll_id, &self.identity, self.backend.as_ref())
            .await;
        let (window, ticker) = spawn_window_ticker(
            Arc::clone(&self.state),
            self.policy,
            poll_id.to_string(),
            self.window_tick,
        );

        info!("Opened poll {}", poll_id);
        Ok(PollHandle {
            poll_id: poll_id.to_string(),
            view,
            _subscription: subscription,
            window,
            ticker,
        })
    }

    pub async fn current_vote(&self, poll_id: &str) -> Option<LocalVoteEntry> {
        self.state
            .current_vote(poll_id, &self.identity, self.backend.as_ref())
            .await
    }

    /// Overwrite the displayed counts with the authoritative ones, as feed merges.
    pub async fn resync(&self, handle: &PollHandle) -> VoteResult<()> {
        let fresh = self.backend.load_poll(&handle.poll_id).await?;
        let mut view = handle.view.lock().await;
        for option in fresh.options() {
            view.merge(&CountChanged {
                poll_id: fresh.id.clone(),
                option_id: option.id.clone(),
                new_count: option.votes,
            });
        }
        Ok(())
    }

    pub async fn delete_poll(&self, poll_id: &str) -> VoteResult<()> {
        self.backend.delete_poll(poll_id, &self.identity).await
    }
}

impl PollHandle {
    pub fn poll_id(&self) -> &str {
        &self.poll_id
    }

    /// Copy of the poll as currently displayed.
    pub async fn snapshot(&self) -> Poll {
        self.view.lock().await.poll().clone()
    }

    pub fn window_state(&self) -> WindowState {
        *self.window.borrow()
    }

    pub fn window_updates(&self) -> watch::Receiver<WindowState> {
        self.window.clone()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}
