//! Round and score state machine.
//!
//! [`RoundTracker`] follows the question stream of one session and tallies the
//! local user's answers per round:
//!
//! ```text
//! NotStarted ──tag──▶ Round(n) ──higher tag──▶ Round(m) ──bonus flag──▶ BonusRound
//!      │                  │                                                 │
//!      └──────────────────┴───────────── finish() ──────────────────────────┴──▶ Finished
//! ```
//!
//! A tag that skips rounds synthesizes the missing ones as empty,
//! `reconstructed` records so the history stays contiguous.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::protocol::{AnswerSubmitted, QuestionId, QuestionUpdate, UserId};

/// Widest forward jump in round tags that is reconstructed. Wider jumps are
/// rejected and leave the tracker unchanged.
pub const MAX_ROUND_GAP: u32 = 64;

/// A closed (or in-progress, when read from [`RoundTracker::current_round`]) round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub round_number: u32,
    pub is_bonus: bool,
    /// Questions the local user answered, in first-answer order.
    pub questions_attempted: Vec<QuestionId>,
    pub correct_answers: u32,
    pub incorrect_answers: u32,
    /// Synthesized to fill a gap in the round tags; its tallies are unknown.
    pub reconstructed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    NotStarted,
    Round(u32),
    BonusRound,
    Finished,
}

#[derive(Debug, Clone)]
struct OpenRound {
    round_number: u32,
    is_bonus: bool,
    attempted: Vec<QuestionId>,
    outcomes: HashMap<QuestionId, bool>,
}

impl OpenRound {
    fn new(round_number: u32, is_bonus: bool) -> Self {
        Self {
            round_number,
            is_bonus,
            attempted: Vec::new(),
            outcomes: HashMap::new(),
        }
    }

    /// Returns `true` if the tally changed.
    fn record(&mut self, question_id: QuestionId, correct: bool) -> bool {
        match self.outcomes.insert(question_id, correct) {
            None => {
                self.attempted.push(question_id);
                true
            }
            Some(previous) => previous != correct,
        }
    }

    fn to_round(&self) -> Round {
        let correct = self.outcomes.values().filter(|correct| **correct).count();
        let incorrect = self.outcomes.len() - correct;
        Round {
            round_number: self.round_number,
            is_bonus: self.is_bonus,
            questions_attempted: self.attempted.clone(),
            correct_answers: u32::try_from(correct).unwrap_or(u32::MAX),
            incorrect_answers: u32::try_from(incorrect).unwrap_or(u32::MAX),
            reconstructed: false,
        }
    }
}

/// Per-session round history and bonus-round state for one subject user.
#[derive(Debug, Clone)]
pub struct RoundTracker {
    subject: Option<UserId>,
    phase: RoundPhase,
    open: Option<OpenRound>,
    history: Vec<Round>,
    bonus: Option<Round>,
    reconstructed: bool,
}

impl RoundTracker {
    /// Tracker tallying answers of `subject`. With `None`, answers are ignored
    /// until [`set_subject`](Self::set_subject) is called.
    pub fn new(subject: Option<UserId>) -> Self {
        Self {
            subject,
            phase: RoundPhase::NotStarted,
            open: None,
            history: Vec::new(),
            bonus: None,
            reconstructed: false,
        }
    }

    pub fn set_subject(&mut self, subject: UserId) {
        self.subject = Some(subject);
    }

    pub fn subject(&self) -> Option<&UserId> {
        self.subject.as_ref()
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    /// Closed ordinary rounds, in round order.
    pub fn history(&self) -> &[Round] {
        &self.history
    }

    /// The bonus round once it has been closed.
    pub fn bonus_round(&self) -> Option<&Round> {
        self.bonus.as_ref()
    }

    /// Tally of the round in progress.
    pub fn current_round(&self) -> Option<Round> {
        self.open.as_ref().map(OpenRound::to_round)
    }

    /// Whether any round had to be synthesized.
    pub fn is_reconstructed(&self) -> bool {
        self.reconstructed
    }

    /// Returns `false` when the update's round tag jumps more than
    /// [`MAX_ROUND_GAP`] rounds past the current one.
    pub fn accepts(&self, update: &QuestionUpdate) -> bool {
        if update.is_bonus_round {
            return true;
        }
        let current = match self.phase {
            RoundPhase::Round(n) => n,
            RoundPhase::NotStarted | RoundPhase::BonusRound | RoundPhase::Finished => 0,
        };
        update
            .round
            .is_none_or(|tag| tag.saturating_sub(current) <= MAX_ROUND_GAP)
    }

    /// Apply a `session_started` / `question_advanced` update.
    /// Returns `true` if the round state changed.
    pub fn on_question(&mut self, update: &QuestionUpdate) -> bool {
        if !self.accepts(update) {
            warn!(round = ?update.round, "round tag too far ahead, update rejected");
            return false;
        }
        let current = match self.phase {
            RoundPhase::Finished => {
                debug!("question update after finish ignored");
                return false;
            }
            RoundPhase::BonusRound => {
                if !update.is_bonus_round {
                    debug!(round = ?update.round, "ordinary round tag after bonus round ignored");
                }
                return false;
            }
            RoundPhase::NotStarted => 0,
            RoundPhase::Round(n) => n,
        };

        if update.is_bonus_round {
            self.open_bonus();
            return true;
        }

        let target = update.round.unwrap_or_else(|| current.max(1));
        if target == current {
            return false;
        }
        if target < current {
            debug!(current, tag = target, "stale round tag ignored");
            return false;
        }

        self.close_open();
        for missing in (current + 1)..target {
            warn!(round = missing, "round tag gap, reconstructing empty round");
            self.history.push(Round {
                round_number: missing,
                is_bonus: false,
                questions_attempted: Vec::new(),
                correct_answers: 0,
                incorrect_answers: 0,
                reconstructed: true,
            });
            self.reconstructed = true;
        }
        self.open = Some(OpenRound::new(target, false));
        self.phase = RoundPhase::Round(target);
        true
    }

    /// Tally an answer if it belongs to the subject.
    /// Returns `true` if the tally changed.
    pub fn record_answer(&mut self, answer: &AnswerSubmitted) -> bool {
        if self.subject.as_ref() != Some(&answer.user_id) {
            return false;
        }
        match self.phase {
            RoundPhase::Finished => {
                debug!(question_id = answer.question_id, "answer after finish ignored");
                return false;
            }
            // An answer implies the first round is under way.
            RoundPhase::NotStarted => {
                self.open = Some(OpenRound::new(1, false));
                self.phase = RoundPhase::Round(1);
            }
            RoundPhase::Round(_) | RoundPhase::BonusRound => {}
        }
        self.open
            .as_mut()
            .is_some_and(|open| open.record(answer.question_id, answer.correct))
    }

    /// Flush the open round and stop tracking. Idempotent; returns `true` on
    /// the first call only.
    pub fn finish(&mut self) -> bool {
        if self.phase == RoundPhase::Finished {
            return false;
        }
        self.close_open();
        self.phase = RoundPhase::Finished;
        true
    }

    fn open_bonus(&mut self) {
        self.close_open();
        let number = self
            .history
            .last()
            .map_or(1, |round| round.round_number + 1);
        debug!(round = number, "bonus round opened");
        self.open = Some(OpenRound::new(number, true));
        self.phase = RoundPhase::BonusRound;
    }

    fn close_open(&mut self) {
        if let Some(open) = self.open.take() {
            let round = open.to_round();
            if round.is_bonus {
                self.bonus = Some(round);
            } else {
                self.history.push(round);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn question(round: Option<u32>, is_bonus_round: bool) -> QuestionUpdate {
        QuestionUpdate {
            current_question: 1,
            total_questions: 10,
            round,
            is_bonus_round,
        }
    }

    fn answer(user: &str, question_id: QuestionId, correct: bool) -> AnswerSubmitted {
        AnswerSubmitted {
            user_id: UserId::from(user),
            question_id,
            correct,
        }
    }

    fn tracker() -> RoundTracker {
        RoundTracker::new(Some(UserId::from("me")))
    }

    #[test]
    fn untagged_start_opens_round_one() {
        let mut rounds = tracker();
        assert!(rounds.on_question(&question(None, false)));
        assert_eq!(rounds.phase(), RoundPhase::Round(1));
        assert!(!rounds.on_question(&question(None, false)));
    }

    #[test]
    fn next_tag_closes_round_with_tallies() {
        let mut rounds = tracker();
        rounds.on_question(&question(Some(1), false));
        rounds.record_answer(&answer("me", 1, true));
        rounds.record_answer(&answer("me", 2, false));
        rounds.record_answer(&answer("someone", 3, true));
        rounds.on_question(&question(Some(2), false));

        let closed = &rounds.history()[0];
        assert_eq!(closed.round_number, 1);
        assert_eq!(closed.questions_attempted, vec![1, 2]);
        assert_eq!(closed.correct_answers, 1);
        assert_eq!(closed.incorrect_answers, 1);
        assert_eq!(rounds.phase(), RoundPhase::Round(2));
    }

    #[test]
    fn replayed_answer_updates_outcome_without_duplicating() {
        let mut rounds = tracker();
        rounds.on_question(&question(Some(1), false));
        assert!(rounds.record_answer(&answer("me", 1, false)));
        assert!(!rounds.record_answer(&answer("me", 1, false)));
        assert!(rounds.record_answer(&answer("me", 1, true)));

        let current = rounds.current_round().unwrap();
        assert_eq!(current.questions_attempted, vec![1]);
        assert_eq!(current.correct_answers, 1);
        assert_eq!(current.incorrect_answers, 0);
    }

    #[test]
    fn implausible_round_tag_is_rejected() {
        let mut rounds = tracker();
        rounds.on_question(&question(Some(1), false));
        rounds.record_answer(&answer("me", 1, true));

        assert!(!rounds.on_question(&question(Some(u32::MAX), false)));
        assert!(!rounds.on_question(&question(Some(2 + MAX_ROUND_GAP), false)));
        assert!(rounds.history().is_empty());
        assert_eq!(rounds.phase(), RoundPhase::Round(1));
        assert_eq!(rounds.current_round().unwrap().correct_answers, 1);

        // The widest accepted jump is still reconstructed.
        assert!(rounds.on_question(&question(Some(1 + MAX_ROUND_GAP), false)));
        assert_eq!(rounds.history().len(), usize::try_from(MAX_ROUND_GAP).unwrap());
        assert!(rounds.is_reconstructed());
    }

    #[test]
    fn gap_synthesizes_reconstructed_rounds() {
        let mut rounds = tracker();
        rounds.on_question(&question(Some(1), false));
        rounds.on_question(&question(Some(4), false));

        let numbers: Vec<_> = rounds.history().iter().map(|r| r.round_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(!rounds.history()[0].reconstructed);
        assert!(rounds.history()[1].reconstructed);
        assert!(rounds.history()[2].reconstructed);
        assert!(rounds.is_reconstructed());
        assert_eq!(rounds.phase(), RoundPhase::Round(4));
    }

    #[test]
    fn stale_tag_is_ignored() {
        let mut rounds = tracker();
        rounds.on_question(&question(Some(2), false));
        assert!(!rounds.on_question(&question(Some(1), false)));
        assert_eq!(rounds.phase(), RoundPhase::Round(2));
    }

    #[test]
    fn bonus_round_is_tallied_separately() {
        let mut rounds = tracker();
        rounds.on_question(&question(Some(1), false));
        rounds.record_answer(&answer("me", 1, true));
        rounds.on_question(&question(Some(2), false));
        rounds.record_answer(&answer("me", 2, true));

        assert!(rounds.on_question(&question(None, true)));
        assert_eq!(rounds.phase(), RoundPhase::BonusRound);
        rounds.record_answer(&answer("me", 3, false));
        // Ordinary tags no longer move the machine.
        assert!(!rounds.on_question(&question(Some(5), false)));
        rounds.finish();

        assert_eq!(rounds.history().len(), 2);
        let bonus = rounds.bonus_round().unwrap();
        assert_eq!(bonus.round_number, 3);
        assert!(bonus.is_bonus);
        assert_eq!(bonus.questions_attempted, vec![3]);
        assert_eq!(bonus.incorrect_answers, 1);
    }

    #[test]
    fn answers_without_subject_are_ignored() {
        let mut rounds = RoundTracker::new(None);
        rounds.on_question(&question(Some(1), false));
        assert!(!rounds.record_answer(&answer("me", 1, true)));

        rounds.set_subject(UserId::from("me"));
        assert!(rounds.record_answer(&answer("me", 1, true)));
    }

    #[test]
    fn answer_before_start_opens_round_one() {
        let mut rounds = tracker();
        assert!(rounds.record_answer(&answer("me", 1, true)));
        assert_eq!(rounds.phase(), RoundPhase::Round(1));
    }

    #[test]
    fn finish_flushes_open_round_once() {
        let mut rounds = tracker();
        rounds.on_question(&question(Some(1), false));
        rounds.record_answer(&answer("me", 1, true));

        assert!(rounds.finish());
        assert!(!rounds.finish());
        assert_eq!(rounds.history().len(), 1);
        assert!(rounds.current_round().is_none());
        assert!(!rounds.on_question(&question(Some(2), false)));
        assert!(!rounds.record_answer(&answer("me", 2, true)));
    }

    #[test]
    fn closed_rounds_balance_their_tallies() {
        let mut rounds = tracker();
        for (round, base) in [(1, 0), (2, 10), (3, 20)] {
            rounds.on_question(&question(Some(round), false));
            for offset in 0..4 {
                rounds.record_answer(&answer("me", base + offset, offset % 2 == 0));
            }
        }
        rounds.finish();
        for round in rounds.history() {
            let total = round.correct_answers + round.incorrect_answers;
            assert_eq!(total as usize, round.questions_attempted.len());
        }
    }
}
