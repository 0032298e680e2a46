use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Displayed state of one poll: its options, their counts and the derived total.
///
/// The total is never set directly. Every count mutation goes through a method
/// that recomputes it as the sum over options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub id: String,
    pub question: String,
    pub category: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    options: Vec<PollOption>,
    total_votes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOption {
    pub id: String,
    pub text: String,
    pub votes: u64,
}

/// Input from the poll-creation flow.
#[derive(Debug, Clone)]
pub struct NewPoll {
    pub question: String,
    pub category: String,
    pub created_by: String,
    pub options: Vec<String>,
    pub duration_hours: i64,
}

/// The authoritative "voter V chose option O on poll P at time T".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub poll_id: String,
    pub voter_id: String,
    pub option_id: String,
    pub voted_at: DateTime<Utc>,
}

/// Session-owned mirror of the current vote on one poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVoteEntry {
    #[serde(rename = "optionId")]
    pub option_id: String,
    pub timestamp: DateTime<Utc>,
}

/// A change-feed event: option `option_id` of `poll_id` now has `new_count` votes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountChanged {
    pub poll_id: String,
    pub option_id: String,
    pub new_count: u64,
}

impl Poll {
    /// Assemble a poll from stored parts. The total is derived from `options`.
    pub fn from_parts(
        id: String,
        question: String,
        category: String,
        created_by: String,
        created_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        options: Vec<PollOption>,
    ) -> Self {
        let mut poll = Self {
            id,
            question,
            category,
            created_by,
            created_at,
            ends_at,
            options,
            total_votes: 0,
        };
        poll.recount();
        poll
    }

    /// Build a fresh poll with zeroed counts and generated ids.
    pub fn create(new_poll: NewPoll, now: DateTime<Utc>) -> Self {
        let options = new_poll
            .options
            .into_iter()
            .map(|text| PollOption {
                id: Uuid::new_v4().to_string(),
                text,
                votes: 0,
            })
            .collect();

        Self::from_parts(
            Uuid::new_v4().to_string(),
            new_poll.question,
            new_poll.category,
            new_poll.created_by,
            now,
            now + Duration::hours(new_poll.duration_hours),
            options,
        )
    }

    pub fn options(&self) -> &[PollOption] {
        &self.options
    }

    pub fn option(&self, option_id: &str) -> Option<&PollOption> {
        self.options.iter().find(|o| o.id == option_id)
    }

    pub fn has_option(&self, option_id: &str) -> bool {
        self.option(option_id).is_some()
    }

    pub fn total_votes(&self) -> u64 {
        self.total_votes
    }

    pub fn is_closed(&self, now: DateTime<Utc>) -> bool {
        now >= self.ends_at
    }

    /// Overwrite one option's count. Returns false if the option is unknown.
    pub fn set_count(&mut self, option_id: &str, count: u64) -> bool {
        let Some(option) = self.options.iter_mut().find(|o| o.id == option_id) else {
            return false;
        };
        option.votes = count;
        self.recount();
        true
    }

    /// Add one vote to an option. Returns false if the option is unknown.
    pub fn increment(&mut self, option_id: &str) -> bool {
        let Some(option) = self.options.iter_mut().find(|o| o.id == option_id) else {
            return false;
        };
        option.votes += 1;
        self.recount();
        true
    }

    /// Remove one vote from an option, floored at zero.
    /// Returns true only if a vote was actually removed.
    pub fn decrement(&mut self, option_id: &str) -> bool {
        let Some(option) = self.options.iter_mut().find(|o| o.id == option_id) else {
            return false;
        };
        if option.votes == 0 {
            return false;
        }
        option.votes -= 1;
        self.recount();
        true
    }

    /// Counts in display order, handy for comparing snapshots.
    pub fn counts(&self) -> Vec<(String, u64)> {
        self.options.iter().map(|o| (o.id.clone(), o.votes)).collect()
    }

    fn recount(&mut self) {
        self.total_votes = self.options.iter().map(|o| o.votes).sum();
    }
}
