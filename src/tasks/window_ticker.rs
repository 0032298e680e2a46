use crate::cache::VoteStateStore;
use crate::voting::{RevoteWindowPolicy, WindowState};
use chrono::Utc;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Start the revote countdown for one poll.
///
/// Polls the wall clock every `tick` instead of sleeping until the deadline, so
/// a suspended session picks up the right state as soon as it runs again. The
/// task ends once every receiver is gone.
pub fn spawn_window_ticker(
    state: Arc<VoteStateStore>,
    policy: RevoteWindowPolicy,
    poll_id: String,
    tick: Duration,
) -> (watch::Receiver<WindowState>, JoinHandle<()>) {
    let (sender, receiver) = watch::channel(WindowState::NoVote);
    let handle = tokio::spawn(run_window_ticker(state, policy, poll_id, tick, sender));
    (receiver, handle)
}

pub async fn run_window_ticker(
    state: Arc<VoteStateStore>,
    policy: RevoteWindowPolicy,
    poll_id: String,
    tick: Duration,
    sender: watch::Sender<WindowState>,
) {
    info!("Starting revote window ticker for poll {}", poll_id);
    let mut interval = interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await; // Wait for the next interval tick
        if sender.is_closed() {
            break;
        }

        let last_vote = state.local_entry(&poll_id).await.map(|entry| entry.timestamp);
        let next = policy.state(last_vote, Utc::now());
        let changed = sender.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed && next == WindowState::Locked {
            info!("Revote window for poll {} closed", poll_id);
        }
    }

    debug!("Window ticker for poll {} stopped", poll_id);
}
