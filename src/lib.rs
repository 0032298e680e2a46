//! Vote reconciliation core for a poll application.
//!
//! A [`handlers::VoteSession`] turns a vote action into a first vote or a
//! revote inside the window, shows the tally change straight away and rolls
//! it back if the backend refuses. The change feed keeps displayed counts in
//! step with other voters.

pub mod cache;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod handlers;
pub mod identity;
pub mod models;
pub mod tasks;
pub mod voting;

pub use error::{StorageError, VoteError, VoteResult};
pub use handlers::{PollHandle, VoteKind, VoteOutcome, VoteSession};
pub use identity::VoterIdentity;
