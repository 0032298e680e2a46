use std::collections::HashMap;
use std::mem::discriminant;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::commands::{Command, HELP};
use crate::error::VoteError;
use crate::handlers::{PollHandle, VoteKind, VoteSession};
use crate::models::{CountChanged, Poll};
use crate::voting::tally::calculate_results;
use crate::voting::WindowState;

/// A poll the console is following, with the task that prints its updates.
struct Watched {
    handle: Arc<PollHandle>,
    printer: JoinHandle<()>,
}

impl Drop for Watched {
    fn drop(&mut self) {
        self.printer.abort();
    }
}

/// Runs parsed commands against one voter's session.
pub struct Console {
    session: VoteSession,
    watched: HashMap<String, Watched>,
}

/// Whether the read loop should keep going.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

impl Console {
    pub fn new(session: VoteSession) -> Self {
        Self {
            session,
            watched: HashMap::new(),
        }
    }

    pub fn is_watching(&self, poll_id: &str) -> bool {
        self.watched.contains_key(poll_id)
    }

    /// Parse and run one input line, returning the text to show the user.
    pub async fn handle_line(&mut self, line: &str) -> (Flow, String) {
        if line.trim().is_empty() {
            return (Flow::Continue, String::new());
        }
        match Command::parse(line) {
            Ok(command) => self.execute(command).await,
            Err(message) => (Flow::Continue, format!("{}\nType `help` for commands.", message)),
        }
    }

    pub async fn execute(&mut self, command: Command) -> (Flow, String) {
        let output = match command {
            Command::Quit => {
                self.watched.clear();
                return (Flow::Quit, "Bye.".to_string());
            }
            Command::Help => HELP.to_string(),
            Command::List => self.list().await,
            Command::Show { poll_id } => self.show(&poll_id).await,
            Command::Vote { poll_id, option_id } => self.vote(&poll_id, &option_id).await,
            Command::Watch { poll_id } => self.watch(&poll_id).await,
            Command::Unwatch { poll_id } => match self.watched.remove(&poll_id) {
                Some(_) => format!("Stopped watching {}.", poll_id),
                None => format!("Not watching {}.", poll_id),
            },
            Command::Delete { poll_id } => match self.session.delete_poll(&poll_id).await {
                Ok(()) => {
                    self.watched.remove(&poll_id);
                    format!("Deleted poll {}.", poll_id)
                }
                Err(e) => describe_error(&e),
            },
        };
        (Flow::Continue, output)
    }

    async fn list(&self) -> String {
        let polls = match self.session.backend().list_polls().await {
            Ok(polls) => polls,
            Err(e) => return describe_error(&e),
        };
        if polls.is_empty() {
            return "No polls yet.".to_string();
        }

        let now = Utc::now();
        polls
            .iter()
            .map(|poll| {
                let status = if poll.is_closed(now) { " (closed)" } else { "" };
                format!(
                    "{}  {} [{}] - {} votes{}",
                    poll.id,
                    poll.question,
                    poll.category,
                    poll.total_votes(),
                    status
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn show(&self, poll_id: &str) -> String {
        let (poll, window) = match self.watched.get(poll_id) {
            Some(watched) => {
                if let Err(e) = self.session.resync(&watched.handle).await {
                    return describe_error(&e);
                }
                (watched.handle.snapshot().await, Some(watched.handle.window_state()))
            }
            None => match self.session.backend().load_poll(poll_id).await {
                Ok(poll) => (poll, None),
                Err(e) => return describe_error(&e),
            },
        };

        let mut output = render_poll(&poll);
        if let Some(entry) = self.session.current_vote(poll_id).await {
            output.push_str(&format!("\nYour vote: {}", entry.option_id));
        }
        if let Some(state) = window {
            output.push('\n');
            output.push_str(&describe_window(state));
        }
        output
    }

    async fn vote(&mut self, poll_id: &str, option_id: &str) -> String {
        // Reuse the watched handle so the projection lands on the displayed view.
        let handle = match self.watched.get(poll_id) {
            Some(watched) => Arc::clone(&watched.handle),
            None => match self.session.open_poll(poll_id).await {
                Ok(handle) => Arc::new(handle),
                Err(e) => return describe_error(&e),
            },
        };

        let result = self.session.cast_vote(&handle, option_id).await;
        let snapshot = handle.snapshot().await;
        match result {
            Ok(outcome) => {
                let verb = match outcome.kind {
                    VoteKind::First => "Vote recorded",
                    VoteKind::Revote => "Vote changed",
                    VoteKind::Unchanged => "Vote confirmed",
                };
                info!("{} on poll {} for option {}", verb, poll_id, option_id);
                format!("{}.\n{}", verb, render_poll(&snapshot))
            }
            Err(e) => describe_error(&e),
        }
    }

    async fn watch(&mut self, poll_id: &str) -> String {
        if self.watched.contains_key(poll_id) {
            return format!("Already watching {}.", poll_id);
        }
        let handle = match self.session.open_poll(poll_id).await {
            Ok(handle) => Arc::new(handle),
            Err(e) => return describe_error(&e),
        };
        let intro = format!(
            "{}\n{}",
            render_poll(&handle.snapshot().await),
            describe_window(handle.window_state())
        );
        let printer = spawn_printer(Arc::clone(&handle), self.session.backend().feed().subscribe());
        self.watched.insert(poll_id.to_string(), Watched { handle, printer });
        format!("Watching {}.\n{}", poll_id, intro)
    }
}

// Prints count changes and countdown transitions for one watched poll.
fn spawn_printer(
    handle: Arc<PollHandle>,
    mut events: broadcast::Receiver<CountChanged>,
) -> JoinHandle<()> {
    let mut window = handle.window_updates();
    let mut shown = discriminant(&*window.borrow());
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(change) if change.poll_id == handle.poll_id() => {
                        // Let the feed subscriber merge first.
                        tokio::task::yield_now().await;
                        let poll = handle.snapshot().await;
                        println!("[{}] {} votes in total", poll.id, poll.total_votes());
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Printer for poll {} skipped {} updates", handle.poll_id(), skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
                changed = window.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *window.borrow_and_update();
                    // The countdown itself is only shown on `show`.
                    if discriminant(&state) != shown {
                        shown = discriminant(&state);
                        println!("[{}] {}", handle.poll_id(), describe_window(state));
                    }
                }
            }
        }
    })
}

pub fn render_poll(poll: &Poll) -> String {
    let results = calculate_results(poll);
    let now = Utc::now();
    let status = if poll.is_closed(now) {
        "closed".to_string()
    } else {
        format!("ends {}", poll.ends_at.format("%Y-%m-%d %H:%M UTC"))
    };
    let ids = results
        .raw_results
        .iter()
        .map(|count| format!("{}={}", count.option_id, count.option_text))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{} ({})\nLeading: {}\n{}\nOptions: {}",
        poll.question, status, results.winner, results.summary, ids
    )
}

pub fn describe_window(state: WindowState) -> String {
    match state {
        WindowState::NoVote => "You have not voted yet.".to_string(),
        WindowState::Open { remaining } => {
            format!("You can change your vote for {}s.", remaining.as_secs())
        }
        WindowState::Locked => "Your vote is locked in.".to_string(),
    }
}

/// User-facing text for a failed command.
pub fn describe_error(err: &VoteError) -> String {
    match err {
        VoteError::DuplicateVote { .. } => {
            "You have already voted and the change window has closed.".to_string()
        }
        VoteError::StaleVote { .. } => {
            "Your vote was changed from another session. Try again.".to_string()
        }
        VoteError::NotFound(what) => format!("Not found: {}.", what),
        VoteError::Permission(_) => "Only admins can do that.".to_string(),
        VoteError::InvalidPoll(reason) => format!("Invalid poll: {}.", reason),
        VoteError::PollClosed { poll_id } => format!("Poll {} is closed.", poll_id),
        VoteError::Network(_) => {
            "Could not reach the vote store. Nothing was changed.".to_string()
        }
        VoteError::Corrupt(_) => "The vote store returned unreadable data.".to_string(),
    }
}
