//! Result calculation for finished sessions.
//!
//! Answers are compared index by index with the correct letters; anything
//! unanswered counts as wrong. Mock exam slots are scored against their
//! fixed required count rather than the number of questions generated.

use log::info;

use crate::quiz::{Letter, Mode, QuizError, Session, Statistics, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuestionOutcome {
    pub given: Option<Letter>,
    /// `None` when the generator produced fewer questions than required.
    pub correct: Option<Letter>,
}

impl QuestionOutcome {
    pub fn is_correct(&self) -> bool {
        matches!((self.given, self.correct), (Some(given), Some(correct)) if given == correct)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubjectReport {
    pub subject: String,
    pub outcomes: Vec<QuestionOutcome>,
    pub correct: usize,
    pub total: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub mode: Mode,
    pub subjects: Vec<SubjectReport>,
    pub correct: usize,
    pub total: usize,
    pub percentage: f64,
}

/// `correct / total * 100`, or 0 for an empty total.
pub fn percentage(correct: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        (correct as f64 * 100.0) / total as f64
    }
}

pub fn score(session: &Session) -> Report {
    let subjects: Vec<SubjectReport> = session
        .subjects()
        .iter()
        .enumerate()
        .map(|(index, subject)| {
            let correct_letters = session
                .question_set(index)
                .map(|set| set.correct_answers())
                .unwrap_or_default();
            let answers = session.answers(index);
            let total = subject.required_count().unwrap_or(correct_letters.len());

            let outcomes: Vec<QuestionOutcome> = (0..total)
                .map(|i| QuestionOutcome {
                    given: answers.and_then(|a| a.get(&i).copied()),
                    correct: correct_letters.get(i).copied(),
                })
                .collect();
            let correct = outcomes.iter().filter(|o| o.is_correct()).count();

            SubjectReport {
                subject: subject.name().to_string(),
                outcomes,
                correct,
                total,
                percentage: percentage(correct, total),
            }
        })
        .collect();

    let correct = subjects.iter().map(|s| s.correct).sum();
    let total = subjects.iter().map(|s| s.total).sum();
    Report {
        mode: session.mode(),
        subjects,
        correct,
        total,
        percentage: percentage(correct, total),
    }
}

#[derive(Clone)]
pub struct ScoringEngine {
    statistics: Statistics,
}

impl ScoringEngine {
    pub fn new(statistics: Statistics) -> Self {
        Self { statistics }
    }

    /// Score the session and append the result to the user's statistics:
    /// one percentage per subject, one passed test per session.
    pub async fn score_and_record(&self, user: UserId, session: &Session) -> Result<Report, QuizError> {
        let report = score(session);
        let per_subject = report
            .subjects
            .iter()
            .map(|s| (s.subject.clone(), s.percentage))
            .collect();
        self.statistics.record_completed_test(user, per_subject).await?;
        info!(
            "User {} finished a {:?} session: {}/{} ({:.2}%)",
            user, report.mode, report.correct, report.total, report.percentage
        );
        Ok(report)
    }
}
