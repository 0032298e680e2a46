pub mod projector;
pub mod tally;
pub mod window;

pub use projector::{apply_delta, Delta};
pub use window::{RevoteWindowPolicy, VoteDecision, WindowState};

// Rendered results for one poll
pub struct PollResults {
    pub winner: String,              // Text of the leading option, "-" before any vote
    pub summary: String,             // Detailed results as formatted text
    pub raw_results: Vec<VoteCount>, // Per-option counts in display order
}

#[derive(Debug, Clone)]
pub struct VoteCount {
    pub option_id: String,
    pub option_text: String,
    pub votes: u64,
    pub percent: u64,
}
