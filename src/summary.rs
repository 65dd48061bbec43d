//! End-of-session summary.
//!
//! [`build_summary`] is pure: the reconciler calls it exactly once, when the
//! session becomes finished, and publishes the result as an
//! `Arc<SessionSummary>` that never changes afterwards.

use serde::{Deserialize, Serialize};

use crate::leaderboard::{rank_of, LeaderboardEntry};
use crate::protocol::UserId;
use crate::rounds::Round;

/// Final results of a finished session for the local user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// `correct_answers / total_questions * 100`, clamped to 0–100.
    pub final_score_percent: f64,
    pub correct_answers: u32,
    pub total_questions: u32,
    pub round_history: Vec<Round>,
    pub bonus_round: Option<Round>,
    /// Side-channel score earned in the bonus-round minigame.
    pub minigame_score: Option<u32>,
    pub user_rank: Option<usize>,
    pub total_participants: usize,
    /// Some rounds were synthesized to fill gaps in the round tags.
    pub reconstructed: bool,
}

/// Everything the summary is derived from.
#[derive(Debug, Clone, Copy)]
pub struct SummaryInputs<'a> {
    pub subject: Option<&'a UserId>,
    pub round_history: &'a [Round],
    pub bonus_round: Option<&'a Round>,
    pub minigame_score: Option<u32>,
    /// Session total; `0` when unknown.
    pub total_questions: u32,
    pub leaderboard: &'a [LeaderboardEntry],
    pub reconstructed: bool,
}

pub fn build_summary(inputs: SummaryInputs<'_>) -> SessionSummary {
    let correct_answers: u32 = inputs
        .round_history
        .iter()
        .map(|round| round.correct_answers)
        .sum();

    let total_questions = if inputs.total_questions > 0 {
        inputs.total_questions
    } else {
        let attempted: usize = inputs
            .round_history
            .iter()
            .map(|round| round.questions_attempted.len())
            .sum();
        u32::try_from(attempted).unwrap_or(u32::MAX)
    };

    let final_score_percent = if total_questions == 0 {
        0.0
    } else {
        (f64::from(correct_answers) / f64::from(total_questions) * 100.0).clamp(0.0, 100.0)
    };

    SessionSummary {
        final_score_percent,
        correct_answers,
        total_questions,
        round_history: inputs.round_history.to_vec(),
        bonus_round: inputs.bonus_round.cloned(),
        minigame_score: inputs.minigame_score,
        user_rank: inputs
            .subject
            .and_then(|subject| rank_of(inputs.leaderboard, subject)),
        total_participants: inputs.leaderboard.len(),
        reconstructed: inputs.reconstructed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaderboard::leaderboard;
    use crate::protocol::Participant;

    fn round(number: u32, attempted: Vec<u64>, correct: u32) -> Round {
        let incorrect = u32::try_from(attempted.len()).unwrap_or(0) - correct;
        Round {
            round_number: number,
            is_bonus: false,
            questions_attempted: attempted,
            correct_answers: correct,
            incorrect_answers: incorrect,
            reconstructed: false,
        }
    }

    fn inputs<'a>(
        subject: Option<&'a UserId>,
        history: &'a [Round],
        board: &'a [LeaderboardEntry],
        total_questions: u32,
    ) -> SummaryInputs<'a> {
        SummaryInputs {
            subject,
            round_history: history,
            bonus_round: None,
            minigame_score: None,
            total_questions,
            leaderboard: board,
            reconstructed: false,
        }
    }

    #[test]
    fn percent_uses_session_total() {
        let me = UserId::from("me");
        let history = vec![round(1, vec![1, 2], 2), round(2, vec![3, 4], 1)];
        let board = leaderboard(&[
            Participant::new("me", "Me").with_score(3.0),
            Participant::new("you", "You").with_score(9.0),
        ]);

        let summary = build_summary(inputs(Some(&me), &history, &board, 10));
        assert_eq!(summary.correct_answers, 3);
        assert_eq!(summary.total_questions, 10);
        assert!((summary.final_score_percent - 30.0).abs() < 1e-9);
        assert_eq!(summary.user_rank, Some(2));
        assert_eq!(summary.total_participants, 2);
    }

    #[test]
    fn unknown_total_falls_back_to_attempted() {
        let history = vec![round(1, vec![1, 2, 3, 4], 3)];
        let summary = build_summary(inputs(None, &history, &[], 0));
        assert_eq!(summary.total_questions, 4);
        assert!((summary.final_score_percent - 75.0).abs() < 1e-9);
        assert_eq!(summary.user_rank, None);
    }

    #[test]
    fn nothing_attempted_scores_zero() {
        let summary = build_summary(inputs(None, &[], &[], 0));
        assert_eq!(summary.final_score_percent, 0.0);
        assert_eq!(summary.total_questions, 0);
    }

    #[test]
    fn percent_is_clamped() {
        let history = vec![round(1, vec![1, 2, 3], 3)];
        let summary = build_summary(inputs(None, &history, &[], 2));
        assert_eq!(summary.final_score_percent, 100.0);
    }

    #[test]
    fn bonus_round_does_not_count_toward_correct_answers() {
        let history = vec![round(1, vec![1], 1)];
        let mut bonus = round(2, vec![9, 10], 2);
        bonus.is_bonus = true;
        let summary = build_summary(SummaryInputs {
            bonus_round: Some(&bonus),
            minigame_score: Some(40),
            ..inputs(None, &history, &[], 1)
        });
        assert_eq!(summary.correct_answers, 1);
        assert_eq!(summary.bonus_round.as_ref().map(|r| r.round_number), Some(2));
        assert_eq!(summary.minigame_score, Some(40));
    }

    #[test]
    fn building_twice_yields_equal_summaries() {
        let me = UserId::from("me");
        let history = vec![round(1, vec![1, 2], 1)];
        let board = leaderboard(&[Participant::new("me", "Me")]);
        let first = build_summary(inputs(Some(&me), &history, &board, 5));
        let second = build_summary(inputs(Some(&me), &history, &board, 5));
        assert_eq!(first, second);
    }
}
