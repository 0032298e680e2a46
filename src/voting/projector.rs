use crate::models::Poll;

/// A predicted change to a poll's tally: one vote leaves `from`, one vote lands on `to`.
///
/// A first vote is `{ from: None, to: Some(option) }`. A revote names both sides.
/// `inverse()` swaps the sides, so a first vote's inverse removes the vote again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub from: Option<String>,
    pub to: Option<String>,
}

impl Delta {
    pub fn first_vote(to: &str) -> Self {
        Self { from: None, to: Some(to.to_string()) }
    }

    pub fn revote(from: &str, to: &str) -> Self {
        Self { from: Some(from.to_string()), to: Some(to.to_string()) }
    }

    /// Delta for a vote action: a first vote ignores `from`.
    pub fn for_vote(from: Option<&str>, to: &str, is_first_vote: bool) -> Self {
        match from {
            Some(from) if !is_first_vote => Self::revote(from, to),
            _ => Self::first_vote(to),
        }
    }

    pub fn inverse(&self) -> Self {
        Self { from: self.to.clone(), to: self.from.clone() }
    }

    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }
}

/// Apply `delta` to a copy of `view`.
///
/// Returns the new view and the delta that actually took effect: a decrement
/// floored at zero, or a side naming an option the view does not have, is
/// dropped from the effective delta. Applying `effective.inverse()` to the
/// returned view yields `view` again exactly.
pub fn apply_delta(view: &Poll, delta: &Delta) -> (Poll, Delta) {
    let mut next = view.clone();
    let effective = apply_in_place(&mut next, delta);
    (next, effective)
}

/// In-place form of [`apply_delta`], used on the shared session view.
pub fn apply_in_place(view: &mut Poll, delta: &Delta) -> Delta {
    if delta.is_noop() {
        return Delta { from: None, to: None };
    }

    let from = match &delta.from {
        Some(option_id) if view.decrement(option_id) => Some(option_id.clone()),
        _ => None,
    };
    let to = match &delta.to {
        Some(option_id) if view.increment(option_id) => Some(option_id.clone()),
        _ => None,
    };

    Delta { from, to }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::two_option_poll;
    use chrono::Utc;

    #[test]
    fn first_vote_raises_option_and_total() {
        let view = two_option_poll(Utc::now());
        let (next, effective) = apply_delta(&view, &Delta::first_vote("a"));
        assert_eq!(next.option("a").unwrap().votes, 1);
        assert_eq!(next.total_votes(), 1);
        assert_eq!(effective, Delta::first_vote("a"));
    }

    #[test]
    fn revote_moves_one_vote_and_keeps_total() {
        let mut view = two_option_poll(Utc::now());
        view.set_count("a", 3);
        let (next, _) = apply_delta(&view, &Delta::revote("a", "b"));
        assert_eq!(next.counts(), vec![("a".into(), 2), ("b".into(), 1)]);
        assert_eq!(next.total_votes(), 3);
    }

    #[test]
    fn floored_decrement_stays_reversible() {
        let view = two_option_poll(Utc::now());
        let (next, effective) = apply_delta(&view, &Delta::revote("a", "b"));
        assert_eq!(next.option("a").unwrap().votes, 0);
        assert_eq!(effective, Delta::first_vote("b"));
        assert_eq!(next.total_votes(), 1);

        let (restored, _) = apply_delta(&next, &effective.inverse());
        assert_eq!(restored, view);
    }

    #[test]
    fn inverse_restores_view_exactly() {
        let mut view = two_option_poll(Utc::now());
        view.set_count("a", 4);
        view.set_count("b", 9);
        for delta in [Delta::first_vote("b"), Delta::revote("a", "b"), Delta::revote("b", "a")] {
            let (next, effective) = apply_delta(&view, &delta);
            let (back, _) = apply_delta(&next, &effective.inverse());
            assert_eq!(back, view);
        }
    }

    #[test]
    fn same_option_is_a_noop() {
        let mut view = two_option_poll(Utc::now());
        view.set_count("a", 2);
        let (next, effective) = apply_delta(&view, &Delta::revote("a", "a"));
        assert_eq!(next, view);
        assert_eq!(effective.inverse(), Delta { from: None, to: None });
    }
}
