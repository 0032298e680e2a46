use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

use crate::db::{validate_new_poll, VoteBackend};
use crate::error::{VoteError, VoteResult};
use crate::feed::FeedHub;
use crate::identity::VoterIdentity;
use crate::models::{CountChanged, Poll, VoteRecord};
use crate::voting::RevoteWindowPolicy;

/// Local-only backend. One mutex guards all state, so every operation is atomic.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    policy: RevoteWindowPolicy,
    admin_ids: HashSet<String>,
    feed: FeedHub,
}

#[derive(Default)]
struct MemoryState {
    polls: HashMap<String, Poll>,
    order: Vec<String>,
    // (poll_id, voter_id) -> record
    records: HashMap<(String, String), VoteRecord>,
}

impl MemoryStore {
    pub fn new(policy: RevoteWindowPolicy, admin_ids: HashSet<String>, feed_capacity: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            policy,
            admin_ids,
            feed: FeedHub::new(feed_capacity),
        }
    }
}

impl MemoryState {
    fn open_poll_mut(&mut self, poll_id: &str, at: DateTime<Utc>) -> VoteResult<&mut Poll> {
        let poll = self
            .polls
            .get_mut(poll_id)
            .ok_or_else(|| VoteError::NotFound(format!("poll {}", poll_id)))?;
        if poll.is_closed(at) {
            return Err(VoteError::PollClosed { poll_id: poll_id.to_string() });
        }
        Ok(poll)
    }
}

fn require_option(poll: &Poll, option_id: &str) -> VoteResult<()> {
    if poll.has_option(option_id) {
        Ok(())
    } else {
        Err(VoteError::NotFound(format!("option {} in poll {}", option_id, poll.id)))
    }
}

fn count_of(poll: &Poll, option_id: &str) -> CountChanged {
    CountChanged {
        poll_id: poll.id.clone(),
        option_id: option_id.to_string(),
        new_count: poll.option(option_id).map(|o| o.votes).unwrap_or(0),
    }
}

#[async_trait]
impl VoteBackend for MemoryStore {
    fn feed(&self) -> &FeedHub {
        &self.feed
    }

    async fn create_poll(&self, poll: &Poll) -> VoteResult<()> {
        validate_new_poll(poll)?;
        let mut state = self.state.lock().await;
        if state.polls.contains_key(&poll.id) {
            return Err(VoteError::InvalidPoll(format!("poll {} already exists", poll.id)));
        }
        state.order.insert(0, poll.id.clone());
        state.polls.insert(poll.id.clone(), poll.clone());
        Ok(())
    }

    async fn list_polls(&self) -> VoteResult<Vec<Poll>> {
        let state = self.state.lock().await;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.polls.get(id).cloned())
            .collect())
    }

    async fn load_poll(&self, poll_id: &str) -> VoteResult<Poll> {
        let state = self.state.lock().await;
        state
            .polls
            .get(poll_id)
            .cloned()
            .ok_or_else(|| VoteError::NotFound(format!("poll {}", poll_id)))
    }

    async fn find_vote(&self, poll_id: &str, identity: &VoterIdentity) -> VoteResult<Option<VoteRecord>> {
        let Some(voter_id) = identity.voter_id() else {
            return Ok(None);
        };
        let state = self.state.lock().await;
        Ok(state
            .records
            .get(&(poll_id.to_string(), voter_id.to_string()))
            .cloned())
    }

    async fn submit_first_vote(
        &self,
        poll_id: &str,
        option_id: &str,
        identity: &VoterIdentity,
        at: DateTime<Utc>,
    ) -> VoteResult<()> {
        let mut state = self.state.lock().await;
        let poll = state.open_poll_mut(poll_id, at)?;
        require_option(poll, option_id)?;

        if let Some(voter_id) = identity.voter_id() {
            let key = (poll_id.to_string(), voter_id.to_string());
            if state.records.contains_key(&key) {
                return Err(VoteError::DuplicateVote { poll_id: poll_id.to_string() });
            }
            state.records.insert(
                key,
                VoteRecord {
                    poll_id: poll_id.to_string(),
                    voter_id: voter_id.to_string(),
                    option_id: option_id.to_string(),
                    voted_at: at,
                },
            );
        }

        let poll = state.open_poll_mut(poll_id, at)?;
        poll.increment(option_id);
        let event = count_of(poll, option_id);
        drop(state);

        info!("Recorded first vote on poll {} option {}", poll_id, option_id);
        self.feed.publish(event);
        Ok(())
    }

    async fn submit_revote(
        &self,
        poll_id: &str,
        from_option_id: &str,
        to_option_id: &str,
        identity: &VoterIdentity,
        at: DateTime<Utc>,
    ) -> VoteResult<()> {
        let mut state = self.state.lock().await;
        let poll = state.open_poll_mut(poll_id, at)?;
        require_option(poll, from_option_id)?;
        require_option(poll, to_option_id)?;

        if let Some(voter_id) = identity.voter_id() {
            let key = (poll_id.to_string(), voter_id.to_string());
            let record = state.records.get_mut(&key).ok_or_else(|| VoteError::StaleVote {
                poll_id: poll_id.to_string(),
                expected: from_option_id.to_string(),
            })?;
            if !self.policy.is_open(Some(record.voted_at), at) {
                return Err(VoteError::DuplicateVote { poll_id: poll_id.to_string() });
            }
            if record.option_id != from_option_id {
                return Err(VoteError::StaleVote {
                    poll_id: poll_id.to_string(),
                    expected: from_option_id.to_string(),
                });
            }
            record.option_id = to_option_id.to_string();
            record.voted_at = at;
        }

        if from_option_id == to_option_id {
            return Ok(());
        }

        let poll = state.open_poll_mut(poll_id, at)?;
        poll.decrement(from_option_id);
        poll.increment(to_option_id);
        let events = [count_of(poll, from_option_id), count_of(poll, to_option_id)];
        drop(state);

        info!(
            "Moved vote on poll {} from {} to {}",
            poll_id, from_option_id, to_option_id
        );
        for event in events {
            self.feed.publish(event);
        }
        Ok(())
    }

    async fn delete_poll(&self, poll_id: &str, identity: &VoterIdentity) -> VoteResult<()> {
        require_admin(&self.admin_ids, identity)?;
        let mut state = self.state.lock().await;
        if state.polls.remove(poll_id).is_none() {
            return Err(VoteError::NotFound(format!("poll {}", poll_id)));
        }
        state.order.retain(|id| id != poll_id);
        state.records.retain(|(p, _), _| p != poll_id);
        info!("Deleted poll {}", poll_id);
        Ok(())
    }
}

pub(crate) fn require_admin(admin_ids: &HashSet<String>, identity: &VoterIdentity) -> VoteResult<()> {
    match identity.voter_id() {
        Some(id) if admin_ids.contains(id) => Ok(()),
        _ => Err(VoteError::Permission("deleting polls needs an elevated identity".to_string())),
    }
}
