use crate::models::Poll;
use crate::voting::{PollResults, VoteCount};

/// Whole-number percentages per option, in display order.
///
/// Uses largest remainder rounding so that, for a non-empty poll, the values
/// sum to exactly 100. An empty poll yields all zeros.
pub fn percentages(poll: &Poll) -> Vec<(String, u64)> {
    let total = poll.total_votes();
    if total == 0 {
        return poll.options().iter().map(|o| (o.id.clone(), 0)).collect();
    }

    let mut shares: Vec<(usize, u64, u64)> = poll
        .options()
        .iter()
        .enumerate()
        .map(|(i, o)| {
            let scaled = o.votes * 100;
            (i, scaled / total, scaled % total)
        })
        .collect();

    let assigned: u64 = shares.iter().map(|(_, floor, _)| floor).sum();
    let mut leftover = 100 - assigned;

    // Hand out the remaining points to the largest remainders, earliest option first on ties.
    let mut order: Vec<usize> = (0..shares.len()).collect();
    order.sort_by(|&x, &y| shares[y].2.cmp(&shares[x].2).then(x.cmp(&y)));
    for idx in order {
        if leftover == 0 {
            break;
        }
        if shares[idx].2 > 0 {
            shares[idx].1 += 1;
            leftover -= 1;
        }
    }

    shares
        .into_iter()
        .map(|(i, pct, _)| (poll.options()[i].id.clone(), pct))
        .collect()
}

/// The option with the most votes, or `None` while nobody has voted.
/// Ties go to the option listed first.
pub fn leading_option(poll: &Poll) -> Option<&str> {
    let mut best: Option<(&str, u64)> = None;
    for option in poll.options() {
        match best {
            Some((_, votes)) if votes >= option.votes => {}
            _ => best = Some((option.id.as_str(), option.votes)),
        }
    }
    best.filter(|(_, votes)| *votes > 0).map(|(id, _)| id)
}

pub fn calculate_results(poll: &Poll) -> PollResults {
    let pcts = percentages(poll);
    let leader = leading_option(poll);

    let raw_results: Vec<VoteCount> = poll
        .options()
        .iter()
        .zip(pcts.iter())
        .map(|(option, (_, pct))| VoteCount {
            option_id: option.id.clone(),
            option_text: option.text.clone(),
            votes: option.votes,
            percent: *pct,
        })
        .collect();

    let mut summary = String::new();
    for count in &raw_results {
        let line = if Some(count.option_id.as_str()) == leader {
            format!("{}: {} votes ({}%) <- leading", count.option_text, count.votes, count.percent)
        } else {
            format!("{}: {} votes ({}%)", count.option_text, count.votes, count.percent)
        };
        summary.push_str(&line);
        summary.push('\n');
    }
    summary.push_str(&format!("\n{} votes in total.", poll.total_votes()));

    let winner = match leader.and_then(|id| poll.option(id)) {
        Some(option) => option.text.clone(),
        None => "-".to_string(),
    };

    PollResults {
        winner,
        summary,
        raw_results,
    }
}
