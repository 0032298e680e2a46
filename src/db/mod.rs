pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::info;
use std::sync::Arc;

use crate::config::{BackendKind, VoteConfig};
use crate::error::VoteResult;
use crate::feed::FeedHub;
use crate::identity::VoterIdentity;
use crate::models::{Poll, PollOption, VoteRecord};
use crate::voting::RevoteWindowPolicy;

/// The source of truth for polls, vote counts and vote records.
///
/// Every mutation is atomic: either all of its count and record changes are
/// visible or none are. Implementations publish a [`crate::models::CountChanged`]
/// on [`VoteBackend::feed`] for each option count they change, after the change
/// is durable.
#[async_trait]
pub trait VoteBackend: Send + Sync {
    fn feed(&self) -> &FeedHub;

    /// Store a poll built by the creation flow. Needs at least two options.
    async fn create_poll(&self, poll: &Poll) -> VoteResult<()>;

    async fn list_polls(&self) -> VoteResult<Vec<Poll>>;

    async fn load_poll(&self, poll_id: &str) -> VoteResult<Poll>;

    /// The live vote record for this voter. Always `None` for anonymous voters.
    async fn find_vote(&self, poll_id: &str, identity: &VoterIdentity) -> VoteResult<Option<VoteRecord>>;

    async fn query_vote(&self, poll_id: &str, identity: &VoterIdentity) -> VoteResult<Option<String>> {
        Ok(self.find_vote(poll_id, identity).await?.map(|record| record.option_id))
    }

    /// Fails with `DuplicateVote` when the voter already has a record for the poll.
    async fn submit_first_vote(
        &self,
        poll_id: &str,
        option_id: &str,
        identity: &VoterIdentity,
        at: DateTime<Utc>,
    ) -> VoteResult<()>;

    /// Move a vote from `from_option_id` to `to_option_id` in one step.
    ///
    /// Fails with `StaleVote` when the record is not on `from_option_id`,
    /// `DuplicateVote` when the record's window has closed, and `NotFound`
    /// when the poll or either option is gone. Moving to the same option only
    /// refreshes the record's timestamp.
    async fn submit_revote(
        &self,
        poll_id: &str,
        from_option_id: &str,
        to_option_id: &str,
        identity: &VoterIdentity,
        at: DateTime<Utc>,
    ) -> VoteResult<()>;

    /// Remove a poll with its options and vote records. Needs an elevated identity.
    async fn delete_poll(&self, poll_id: &str, identity: &VoterIdentity) -> VoteResult<()>;
}

/// Open the backend selected by configuration.
pub async fn open_backend(config: &VoteConfig) -> VoteResult<Arc<dyn VoteBackend>> {
    let policy = RevoteWindowPolicy::new(config.revote_window);
    let backend: Arc<dyn VoteBackend> = match config.backend {
        BackendKind::Sqlite => Arc::new(
            sqlite::Database::connect(
                &config.database_url,
                policy,
                config.admin_ids.clone(),
                config.feed_capacity,
                config.feed_poll,
            )
            .await?,
        ),
        BackendKind::Memory => Arc::new(memory::MemoryStore::new(
            policy,
            config.admin_ids.clone(),
            config.feed_capacity,
        )),
    };

    if config.seed_demo {
        seed_demo_polls(backend.as_ref(), Utc::now()).await?;
    }
    Ok(backend)
}

/// Insert the two demo polls when the store has no polls at all.
pub async fn seed_demo_polls(backend: &dyn VoteBackend, now: DateTime<Utc>) -> VoteResult<()> {
    if !backend.list_polls().await?.is_empty() {
        return Ok(());
    }

    let option = |id: &str, text: &str, votes: u64| PollOption {
        id: id.to_string(),
        text: text.to_string(),
        votes,
    };

    let demo = [
        Poll::from_parts(
            "seed-1".to_string(),
            "Preferred Design Style?".to_string(),
            "Tech".to_string(),
            "DesignerOne".to_string(),
            now,
            now + Duration::days(2),
            vec![
                option("opt-1", "Minimalist", 65),
                option("opt-2", "Brutalist", 30),
                option("opt-3", "Skeuomorphic", 15),
                option("opt-4", "Glassmorphism", 32),
            ],
        ),
        Poll::from_parts(
            "seed-2".to_string(),
            "Coffee or Tea?".to_string(),
            "General".to_string(),
            "MorningPerson".to_string(),
            now,
            now + Duration::days(1),
            vec![
                option("opt-5", "Black Coffee", 45),
                option("opt-6", "Green Tea", 30),
                option("opt-7", "Espresso", 14),
            ],
        ),
    ];

    for poll in &demo {
        backend.create_poll(poll).await?;
    }
    info!("Seeded {} demo polls", demo.len());
    Ok(())
}

pub(crate) fn validate_new_poll(poll: &Poll) -> VoteResult<()> {
    use crate::error::VoteError;
    use std::collections::HashSet;

    if poll.options().len() < 2 {
        return Err(VoteError::InvalidPoll(format!("poll {} needs at least two options", poll.id)));
    }
    let mut seen = HashSet::new();
    if !poll.options().iter().all(|o| seen.insert(o.id.as_str())) {
        return Err(VoteError::InvalidPoll(format!("poll {} repeats an option id", poll.id)));
    }
    Ok(())
}
