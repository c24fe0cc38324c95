pub mod catalog;
pub mod engine;
pub mod error;
pub mod generator;
pub mod limiter;
pub mod parser;
pub mod pipeline;
pub mod scoring;
pub mod session;
pub mod stats;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use catalog::SubjectCatalog;
pub use engine::{PendingGeneration, QuestionPrompt, QuizEngine, Reply, Selection};
pub use error::{GenerationCause, QuizError};
pub use generator::{BoxError, ChatGptGenerator, QuestionGenerator};
pub use limiter::{Admission, QuotaPolicy, RateLimiter};
pub use pipeline::{CommittedQuestionSet, GenerationPipeline};
pub use scoring::{QuestionOutcome, Report, ScoringEngine, SubjectReport};
pub use session::{GenerationTicket, Mode, SelectionStep, Session, Stage};
pub use stats::{Statistics, StatsSummary, UserStatistics};

/// Telegram user id, used as the key for sessions and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Answer option of a multiple-choice question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Letter {
    A,
    B,
    C,
    D,
}

impl Letter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Letter::A => "A",
            Letter::B => "B",
            Letter::C => "C",
            Letter::D => "D",
        }
    }
}

impl FromStr for Letter {
    type Err = QuizError;

    /// Accepts a single letter, case-insensitive, surrounding whitespace ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "A" => Ok(Letter::A),
            "B" => Ok(Letter::B),
            "C" => Ok(Letter::C),
            "D" => Ok(Letter::D),
            _ => Err(QuizError::InvalidAnswerInput(s.to_string())),
        }
    }
}

impl fmt::Display for Letter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed question as shown to the student. The correct letter is kept
/// apart in [`QuestionSet`] so it never travels with the prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    text: String,
}

impl Question {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Questions of one subject together with their correct letters.
///
/// Both sequences are built together, so they always have equal length.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionSet {
    questions: Vec<Question>,
    answers: Vec<Letter>,
}

impl QuestionSet {
    pub fn from_parsed(parsed: Vec<(Question, Letter)>) -> Self {
        let (questions, answers) = parsed.into_iter().unzip();
        Self { questions, answers }
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    pub fn question(&self, index: usize) -> Option<&Question> {
        self.questions.get(index)
    }

    pub fn correct_answers(&self) -> &[Letter] {
        &self.answers
    }
}

/// One of the five fixed roles in a mock exam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExamSlot {
    History,
    MathLiteracy,
    ReadingLiteracy,
    Profile1,
    Profile2,
}

impl ExamSlot {
    /// Mock exam order.
    pub const ALL: [ExamSlot; 5] = [
        ExamSlot::History,
        ExamSlot::MathLiteracy,
        ExamSlot::ReadingLiteracy,
        ExamSlot::Profile1,
        ExamSlot::Profile2,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            ExamSlot::History => "history",
            ExamSlot::MathLiteracy => "math_literacy",
            ExamSlot::ReadingLiteracy => "reading_literacy",
            ExamSlot::Profile1 => "profile1",
            ExamSlot::Profile2 => "profile2",
        }
    }

    pub fn required_count(&self) -> usize {
        match self {
            ExamSlot::History => 20,
            ExamSlot::MathLiteracy | ExamSlot::ReadingLiteracy => 10,
            ExamSlot::Profile1 | ExamSlot::Profile2 => 40,
        }
    }
}

/// A subject inside a session: either a mock exam slot (carrying the
/// display name it was generated for) or a free-standing ad-hoc subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubjectRef {
    Slot { slot: ExamSlot, name: String },
    AdHoc(String),
}

impl SubjectRef {
    pub fn name(&self) -> &str {
        match self {
            SubjectRef::Slot { name, .. } | SubjectRef::AdHoc(name) => name,
        }
    }

    /// Fixed question count for mock exam slots, `None` for ad-hoc subjects.
    pub fn required_count(&self) -> Option<usize> {
        match self {
            SubjectRef::Slot { slot, .. } => Some(slot.required_count()),
            SubjectRef::AdHoc(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letters_parse_case_insensitively() {
        assert_eq!("a".parse::<Letter>().unwrap(), Letter::A);
        assert_eq!(" D ".parse::<Letter>().unwrap(), Letter::D);
        assert!(matches!(
            "E".parse::<Letter>(),
            Err(QuizError::InvalidAnswerInput(_))
        ));
        assert!("AB".parse::<Letter>().is_err());
        assert!("".parse::<Letter>().is_err());
    }

    #[test]
    fn question_set_keeps_answers_aligned() {
        let set = QuestionSet::from_parsed(vec![
            (Question::new("Q1"), Letter::B),
            (Question::new("Q2"), Letter::C),
        ]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.correct_answers(), &[Letter::B, Letter::C]);
        assert_eq!(set.question(1).map(Question::text), Some("Q2"));
        assert!(set.question(2).is_none());
    }

    #[test]
    fn mock_exam_counts_sum_to_full_total() {
        let total: usize = ExamSlot::ALL.iter().map(ExamSlot::required_count).sum();
        assert_eq!(total, 120);
    }
}
