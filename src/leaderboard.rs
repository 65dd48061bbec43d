//! Leaderboard aggregation.

use serde::{Deserialize, Serialize};

use crate::protocol::{Participant, UserId};

/// One ranked row of the leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    /// 1-based position.
    pub rank: usize,
    pub user_id: UserId,
    pub display_name: String,
    pub score: f64,
}

/// Rank participants by score, highest first, breaking ties by `user_id`
/// ascending. Ranks are positions: tied scores still get distinct ranks.
pub fn leaderboard(participants: &[Participant]) -> Vec<LeaderboardEntry> {
    let mut ranked: Vec<&Participant> = participants.iter().collect();
    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    ranked
        .into_iter()
        .enumerate()
        .map(|(index, participant)| LeaderboardEntry {
            rank: index + 1,
            user_id: participant.user_id.clone(),
            display_name: participant.display_name.clone(),
            score: participant.score,
        })
        .collect()
}

/// 1-based rank of `user_id`, if present.
pub fn rank_of(entries: &[LeaderboardEntry], user_id: &UserId) -> Option<usize> {
    entries
        .iter()
        .find(|entry| &entry.user_id == user_id)
        .map(|entry| entry.rank)
}
