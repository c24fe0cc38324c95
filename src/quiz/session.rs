//! Per-user session state machine.
//!
//! ```text
//! Idle -> SubjectSelecting -> Generating -> InProgress -> Completed -> Idle
//!                                 |             |  ^
//!                    (failure) <--+             v  |  (mock exam only)
//!                                       AwaitingNextSubjectChoice
//! ```
//!
//! All transitions here are synchronous and never touch storage or the
//! generator; the engine loads a session, applies one transition and saves
//! it back. A generation is identified by a [`GenerationTicket`]; results
//! and failures carrying another ticket are refused.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::quiz::{
    CommittedQuestionSet, Letter, Question, QuestionSet, QuizError, SubjectCatalog, SubjectRef,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    AdHoc,
    FullExam,
}

/// Which pick the user is being asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionStep {
    Obligatory,
    Profile1,
    Profile2 { first: String },
    FullExamProfile1,
    FullExamProfile2 { first: String },
}

/// Identifies one generation run across session resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenerationTicket(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Stage {
    #[default]
    Idle,
    SubjectSelecting(SelectionStep),
    /// Generation is running; `resume` is where a failure sends the user back.
    Generating {
        resume: SelectionStep,
        ticket: GenerationTicket,
    },
    /// `question` is the question currently awaiting an answer.
    InProgress { subject: usize, question: usize },
    AwaitingNextSubjectChoice,
    Completed,
}

impl Stage {
    pub fn describe(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::SubjectSelecting(_) => "selecting subjects",
            Stage::Generating { .. } => "generating questions",
            Stage::InProgress { .. } => "answering questions",
            Stage::AwaitingNextSubjectChoice => "choosing the next subject",
            Stage::Completed => "showing results",
        }
    }
}

/// What a completed selection asks the generation pipeline for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationRequest {
    AdHoc(Vec<String>),
    FullExam { profile1: String, profile2: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionOutcome {
    /// Another pick is needed.
    Next(SelectionStep),
    /// Selection is complete; the session is now `Generating`.
    Generate(GenerationRequest),
}

/// Where the session stands after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Question { subject: usize, question: usize },
    ChooseNextSubject,
    Completed,
}

/// Next `(subject, question)` position at or after the given one, skipping
/// exhausted subjects. `None` once every subject is done.
pub fn next_position(lengths: &[usize], subject: usize, question: usize) -> Option<(usize, usize)> {
    let (mut subject, mut question) = (subject, question);
    while subject < lengths.len() {
        if question < lengths[subject] {
            return Some((subject, question));
        }
        subject += 1;
        question = 0;
    }
    None
}

/// `subjects`, `question_sets` and `user_answers` are index-aligned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    mode: Mode,
    stage: Stage,
    subjects: Vec<SubjectRef>,
    question_sets: Vec<QuestionSet>,
    user_answers: Vec<BTreeMap<usize, Letter>>,
}

impl Session {
    /// Fresh session waiting for the first pick of `step`.
    pub fn selecting(step: SelectionStep) -> Self {
        let mode = match step {
            SelectionStep::FullExamProfile1 | SelectionStep::FullExamProfile2 { .. } => {
                Mode::FullExam
            }
            _ => Mode::AdHoc,
        };
        Self {
            mode,
            stage: Stage::SubjectSelecting(step),
            ..Self::default()
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    pub fn subjects(&self) -> &[SubjectRef] {
        &self.subjects
    }

    pub fn question_set(&self, subject: usize) -> Option<&QuestionSet> {
        self.question_sets.get(subject)
    }

    pub fn answers(&self, subject: usize) -> Option<&BTreeMap<usize, Letter>> {
        self.user_answers.get(subject)
    }

    pub fn is_generating(&self) -> bool {
        matches!(self.stage, Stage::Generating { .. })
    }

    fn is_generating_for(&self, ticket: GenerationTicket) -> bool {
        matches!(self.stage, Stage::Generating { ticket: current, .. } if current == ticket)
    }

    fn unexpected(&self) -> QuizError {
        if self.is_generating() {
            QuizError::GenerationInProgress
        } else {
            QuizError::UnexpectedAction {
                stage: self.stage.describe(),
            }
        }
    }

    /// Apply one subject pick. Invalid picks leave the session untouched.
    /// When the pick completes the selection, the session starts
    /// generating under `ticket`.
    ///
    /// # Errors
    ///
    /// `UnknownSubjectChoice` for names outside the step's list,
    /// `DuplicateProfileSubject` when the second profile pick repeats the
    /// first, `GenerationInProgress`/`UnexpectedAction` outside selection.
    pub fn select(
        &mut self,
        catalog: &SubjectCatalog,
        name: &str,
        ticket: GenerationTicket,
    ) -> Result<SelectionOutcome, QuizError> {
        let Stage::SubjectSelecting(step) = &self.stage else {
            return Err(self.unexpected());
        };
        let known = match step {
            SelectionStep::Obligatory => catalog.is_obligatory(name),
            _ => catalog.is_profile(name),
        };
        if !known {
            return Err(QuizError::UnknownSubjectChoice(name.to_string()));
        }

        let step = step.clone();
        let outcome = match step {
            SelectionStep::Obligatory => {
                SelectionOutcome::Generate(GenerationRequest::AdHoc(vec![name.to_string()]))
            }
            SelectionStep::Profile1 => SelectionOutcome::Next(SelectionStep::Profile2 {
                first: name.to_string(),
            }),
            SelectionStep::FullExamProfile1 => {
                SelectionOutcome::Next(SelectionStep::FullExamProfile2 {
                    first: name.to_string(),
                })
            }
            SelectionStep::Profile2 { ref first } | SelectionStep::FullExamProfile2 { ref first }
                if first == name =>
            {
                return Err(QuizError::DuplicateProfileSubject(name.to_string()));
            }
            SelectionStep::Profile2 { ref first } => SelectionOutcome::Generate(
                GenerationRequest::AdHoc(vec![first.clone(), name.to_string()]),
            ),
            SelectionStep::FullExamProfile2 { ref first } => {
                SelectionOutcome::Generate(GenerationRequest::FullExam {
                    profile1: first.clone(),
                    profile2: name.to_string(),
                })
            }
        };

        self.stage = match &outcome {
            SelectionOutcome::Next(next) => Stage::SubjectSelecting(next.clone()),
            SelectionOutcome::Generate(_) => Stage::Generating {
                resume: step,
                ticket,
            },
        };
        Ok(outcome)
    }

    /// Return to the selection step that started the failed generation.
    /// Returns `false`, changing nothing, if `ticket` is not the running
    /// generation.
    pub fn generation_failed(&mut self, ticket: GenerationTicket) -> bool {
        match &self.stage {
            Stage::Generating {
                resume,
                ticket: current,
            } if *current == ticket => {
                self.stage = Stage::SubjectSelecting(resume.clone());
                true
            }
            _ => false,
        }
    }

    /// Install a freshly generated question set and move to its first
    /// question.
    ///
    /// # Errors
    ///
    /// `GenerationSuperseded` if the session is not running the generation
    /// identified by `ticket` (it was reset, possibly followed by a new
    /// selection); the set is discarded and the session left untouched.
    pub fn commit(
        &mut self,
        ticket: GenerationTicket,
        generated: CommittedQuestionSet,
    ) -> Result<Delivery, QuizError> {
        if !self.is_generating_for(ticket) {
            return Err(QuizError::GenerationSuperseded);
        }
        let (mode, subjects) = generated.into_parts();
        self.mode = mode;
        (self.subjects, self.question_sets) = subjects.into_iter().unzip();
        self.user_answers = vec![BTreeMap::new(); self.subjects.len()];
        Ok(match self.mode {
            Mode::AdHoc => self.advance_ad_hoc(0, 0),
            Mode::FullExam => self.enter_subject(0),
        })
    }

    /// Record an answer to the current question and move on.
    ///
    /// # Errors
    ///
    /// `GenerationInProgress`/`UnexpectedAction` when no question is pending.
    pub fn submit(&mut self, answer: Letter) -> Result<Delivery, QuizError> {
        let Stage::InProgress { subject, question } = self.stage else {
            return Err(self.unexpected());
        };
        self.user_answers[subject].insert(question, answer);

        Ok(match self.mode {
            Mode::AdHoc => self.advance_ad_hoc(subject, question + 1),
            Mode::FullExam => self.advance_full_exam(subject, question + 1),
        })
    }

    /// Unfinished mock exam subjects, in exam order.
    pub fn remaining_subjects(&self) -> Vec<&SubjectRef> {
        self.subjects
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.is_finished(*i))
            .map(|(_, subject)| subject)
            .collect()
    }

    /// Resume the mock exam with the unfinished subject called `name`.
    ///
    /// # Errors
    ///
    /// `UnknownSubjectChoice` for finished or unknown names,
    /// `UnexpectedAction` outside the subject choice.
    pub fn choose_next_subject(&mut self, name: &str) -> Result<Delivery, QuizError> {
        if self.stage != Stage::AwaitingNextSubjectChoice {
            return Err(self.unexpected());
        }
        let index = self
            .subjects
            .iter()
            .enumerate()
            .position(|(i, subject)| subject.name() == name && !self.is_finished(i))
            .ok_or_else(|| QuizError::UnknownSubjectChoice(name.to_string()))?;
        Ok(self.enter_subject(index))
    }

    /// End the mock exam now; unanswered questions count as wrong.
    pub fn finish_early(&mut self) -> Result<Delivery, QuizError> {
        if self.stage != Stage::AwaitingNextSubjectChoice {
            return Err(self.unexpected());
        }
        self.stage = Stage::Completed;
        Ok(Delivery::Completed)
    }

    /// Drop questions and answers once the results are out.
    pub fn close(&mut self) {
        *self = Self {
            mode: self.mode,
            stage: Stage::Completed,
            ..Self::default()
        };
    }

    /// `(subject name, question, subject total)` for a delivered position.
    pub fn prompt_at(&self, subject: usize, question: usize) -> Option<(&str, &Question, usize)> {
        let subject_ref = self.subjects.get(subject)?;
        let set = self.question_sets.get(subject)?;
        Some((subject_ref.name(), set.question(question)?, set.len()))
    }

    fn set_len(&self, subject: usize) -> usize {
        self.question_sets.get(subject).map_or(0, QuestionSet::len)
    }

    fn answered(&self, subject: usize) -> usize {
        self.user_answers.get(subject).map_or(0, BTreeMap::len)
    }

    fn is_finished(&self, subject: usize) -> bool {
        self.answered(subject) >= self.set_len(subject)
    }

    fn advance_ad_hoc(&mut self, subject: usize, question: usize) -> Delivery {
        let lengths: Vec<usize> = self.question_sets.iter().map(QuestionSet::len).collect();
        match next_position(&lengths, subject, question) {
            Some((subject, question)) => {
                self.stage = Stage::InProgress { subject, question };
                Delivery::Question { subject, question }
            }
            None => {
                self.stage = Stage::Completed;
                Delivery::Completed
            }
        }
    }

    fn enter_subject(&mut self, subject: usize) -> Delivery {
        let resume_at = self.answered(subject);
        self.advance_full_exam(subject, resume_at)
    }

    fn advance_full_exam(&mut self, subject: usize, question: usize) -> Delivery {
        if question < self.set_len(subject) {
            self.stage = Stage::InProgress { subject, question };
            return Delivery::Question { subject, question };
        }
        if self.remaining_subjects().is_empty() {
            self.stage = Stage::Completed;
            Delivery::Completed
        } else {
            self.stage = Stage::AwaitingNextSubjectChoice;
            Delivery::ChooseNextSubject
        }
    }
}
