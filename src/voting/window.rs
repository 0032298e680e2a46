use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::models::LocalVoteEntry;

/// Decides whether a voter may still change an existing vote.
#[derive(Debug, Clone, Copy)]
pub struct RevoteWindowPolicy {
    window: Duration,
}

/// What a vote action should do given the voter's current vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteDecision {
    FirstVote,
    Revote { from: String },
    Reject,
}

/// Countdown state shown next to a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    NoVote,
    Open { remaining: Duration },
    Locked,
}

impl RevoteWindowPolicy {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// True when there is no prior vote, or the prior vote is younger than `window`.
    /// A timestamp in the future counts as zero elapsed time.
    pub fn can_mutate(last_vote: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
        match last_vote {
            None => true,
            Some(last) => elapsed(last, now) < window,
        }
    }

    pub fn is_open(&self, last_vote: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        Self::can_mutate(last_vote, now, self.window)
    }

    pub fn decide(&self, current: Option<&LocalVoteEntry>, now: DateTime<Utc>) -> VoteDecision {
        match current {
            None => VoteDecision::FirstVote,
            Some(entry) if self.is_open(Some(entry.timestamp), now) => VoteDecision::Revote {
                from: entry.option_id.clone(),
            },
            Some(_) => VoteDecision::Reject,
        }
    }

    pub fn state(&self, last_vote: Option<DateTime<Utc>>, now: DateTime<Utc>) -> WindowState {
        match last_vote {
            None => WindowState::NoVote,
            Some(last) => {
                let spent = elapsed(last, now);
                if spent < self.window {
                    WindowState::Open { remaining: self.window - spent }
                } else {
                    WindowState::Locked
                }
            }
        }
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}
