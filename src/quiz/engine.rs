//! Entry point for transports: one method per user action.
//!
//! Each call loads the user's session, applies one transition and saves it
//! back while holding that user's lock. The lock is released for the
//! duration of the generator call; the `Generating` stage keeps other
//! actions of the same user out in the meantime, and the generation ticket
//! keeps a result from landing in any session but the one that asked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::OwnedMutexGuard;

use crate::quiz::session::{Delivery, GenerationRequest, SelectionOutcome};
use crate::quiz::{
    GenerationPipeline, GenerationTicket, Letter, QuestionGenerator, QuizError, QuotaPolicy,
    RateLimiter, Report, ScoringEngine, SelectionStep, Session, Stage, Statistics, StatsSummary,
    SubjectCatalog, UserId,
};
use crate::storage::{SessionStore, StatisticsStore};
use crate::time::Clock;

/// A question as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionPrompt {
    pub subject: String,
    /// 1-based position inside the subject.
    pub number: usize,
    pub total: usize,
    pub text: String,
}

/// What the transport should show next.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    ChooseSubject {
        step: SelectionStep,
        options: Vec<String>,
    },
    Question(QuestionPrompt),
    ChooseNextSubject {
        remaining: Vec<String>,
    },
    Finished(Report),
    Menu,
}

/// A completed selection whose questions still have to be generated; hand
/// it to [`QuizEngine::generate`].
#[derive(Debug)]
#[must_use]
pub struct PendingGeneration {
    user: UserId,
    ticket: GenerationTicket,
    request: GenerationRequest,
}

/// Result of [`QuizEngine::pick_subject`].
#[derive(Debug)]
pub enum Selection {
    /// The pick was taken; show this next.
    Continue(Reply),
    /// The pick completed the selection.
    Generate(PendingGeneration),
}

pub struct QuizEngineBuilder {
    generator: Arc<dyn QuestionGenerator>,
    sessions: Arc<dyn SessionStore>,
    statistics: Arc<dyn StatisticsStore>,
    catalog: SubjectCatalog,
    quota: QuotaPolicy,
    clock: Clock,
    timeout: Duration,
}

impl QuizEngineBuilder {
    #[must_use]
    pub fn catalog(mut self, catalog: SubjectCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    #[must_use]
    pub fn quota(mut self, quota: QuotaPolicy) -> Self {
        self.quota = quota;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> QuizEngine {
        let statistics = Statistics::new(self.statistics);
        let limiter = RateLimiter::new(statistics.clone(), self.quota).with_clock(self.clock);
        let pipeline = GenerationPipeline::new(self.generator, limiter.clone(), self.catalog.clone())
            .with_timeout(self.timeout);
        // Sessions may outlive the process; start tickets somewhere a
        // previous run is unlikely to have reached.
        let first_ticket = u64::try_from(Utc::now().timestamp_micros()).unwrap_or_default();

        QuizEngine {
            catalog: self.catalog,
            sessions: self.sessions,
            scoring: ScoringEngine::new(statistics.clone()),
            statistics,
            limiter,
            pipeline,
            next_ticket: AtomicU64::new(first_ticket),
            user_locks: Mutex::new(HashMap::new()),
        }
    }
}

type UserLocks = Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>;

pub struct QuizEngine {
    catalog: SubjectCatalog,
    sessions: Arc<dyn SessionStore>,
    statistics: Statistics,
    limiter: RateLimiter,
    pipeline: GenerationPipeline,
    scoring: ScoringEngine,
    next_ticket: AtomicU64,
    user_locks: UserLocks,
}

impl QuizEngine {
    pub fn builder(
        generator: Arc<dyn QuestionGenerator>,
        sessions: Arc<dyn SessionStore>,
        statistics: Arc<dyn StatisticsStore>,
    ) -> QuizEngineBuilder {
        QuizEngineBuilder {
            generator,
            sessions,
            statistics,
            catalog: SubjectCatalog::default(),
            quota: QuotaPolicy::default(),
            clock: Clock::default(),
            timeout: GenerationPipeline::DEFAULT_TIMEOUT,
        }
    }

    pub fn catalog(&self) -> &SubjectCatalog {
        &self.catalog
    }

    /// Start an ad-hoc quiz on one obligatory subject.
    pub async fn start_obligatory(&self, user: UserId) -> Result<Reply, QuizError> {
        self.start(user, SelectionStep::Obligatory).await
    }

    /// Start an ad-hoc quiz on two profile subjects.
    pub async fn start_profile(&self, user: UserId) -> Result<Reply, QuizError> {
        self.start(user, SelectionStep::Profile1).await
    }

    /// Start a full mock exam; the user picks the two profile subjects.
    pub async fn start_mock_exam(&self, user: UserId) -> Result<Reply, QuizError> {
        self.start(user, SelectionStep::FullExamProfile1).await
    }

    async fn start(&self, user: UserId, step: SelectionStep) -> Result<Reply, QuizError> {
        let _guard = self.lock_user(user).await;
        let session = self.load(user).await?;
        if session.is_generating() {
            return Err(QuizError::GenerationInProgress);
        }
        if !matches!(session.stage(), Stage::Idle | Stage::Completed) {
            info!("User {} abandoned a session while {}", user, session.stage().describe());
        }
        self.sessions.set(user, Session::selecting(step.clone())).await?;
        Ok(self.choose_subject(step))
    }

    /// Apply a subject pick. When the selection is complete this runs the
    /// generation and returns the first question.
    pub async fn select_subject(&self, user: UserId, name: &str) -> Result<Reply, QuizError> {
        match self.pick_subject(user, name).await? {
            Selection::Continue(reply) => Ok(reply),
            Selection::Generate(pending) => self.generate(pending).await,
        }
    }

    /// Apply a subject pick without generating anything yet.
    ///
    /// # Errors
    ///
    /// `UnknownSubjectChoice`, `DuplicateProfileSubject` and stage errors
    /// leave the session as it was.
    pub async fn pick_subject(&self, user: UserId, name: &str) -> Result<Selection, QuizError> {
        let _guard = self.lock_user(user).await;
        let mut session = self.load(user).await?;
        let ticket = GenerationTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        let outcome = session.select(&self.catalog, name, ticket)?;
        self.sessions.set(user, session).await?;
        Ok(match outcome {
            SelectionOutcome::Next(step) => Selection::Continue(self.choose_subject(step)),
            SelectionOutcome::Generate(request) => Selection::Generate(PendingGeneration {
                user,
                ticket,
                request,
            }),
        })
    }

    /// Generate the questions of a completed selection and deliver the
    /// first one.
    ///
    /// # Errors
    ///
    /// `QuotaExceeded` and `GenerationTransientFailure` send the user back
    /// to the last pick. `GenerationSuperseded` means the user reset the
    /// session meanwhile; the questions are dropped and the current
    /// session is left alone.
    pub async fn generate(&self, pending: PendingGeneration) -> Result<Reply, QuizError> {
        let PendingGeneration {
            user,
            ticket,
            request,
        } = pending;
        debug!("Generating {:?} for user {} ({:?})", request, user, ticket);
        let generated = match &request {
            GenerationRequest::AdHoc(subjects) => self.pipeline.generate_ad_hoc(user, subjects).await,
            GenerationRequest::FullExam { profile1, profile2 } => {
                self.pipeline.generate_full_exam(user, profile1, profile2).await
            }
        };

        let _guard = self.lock_user(user).await;
        let mut session = self.load(user).await?;
        match generated {
            Ok(set) => {
                let total = set.total_questions();
                let delivery = session.commit(ticket, set).map_err(|e| {
                    warn!("Discarding {} questions generated for user {}: {}", total, user, e);
                    e
                })?;
                info!("Committed {} questions for user {}", total, user);
                self.resolve(user, session, delivery).await
            }
            Err(e) => {
                if session.generation_failed(ticket) {
                    self.sessions.set(user, session).await?;
                }
                Err(e)
            }
        }
    }

    /// Answer the current question with `A`..`D` (case-insensitive).
    ///
    /// # Errors
    ///
    /// `InvalidAnswerInput` for anything else, with no state change;
    /// `UnexpectedAction`/`GenerationInProgress` when no question is pending.
    pub async fn submit_answer(&self, user: UserId, input: &str) -> Result<Reply, QuizError> {
        let answer: Letter = input.parse()?;
        let _guard = self.lock_user(user).await;
        let mut session = self.load(user).await?;
        let delivery = session.submit(answer)?;
        self.resolve(user, session, delivery).await
    }

    /// Continue the mock exam with an unfinished subject.
    pub async fn choose_next_subject(&self, user: UserId, name: &str) -> Result<Reply, QuizError> {
        let _guard = self.lock_user(user).await;
        let mut session = self.load(user).await?;
        let delivery = session.choose_next_subject(name)?;
        self.resolve(user, session, delivery).await
    }

    /// End the mock exam early and score it.
    pub async fn finish_exam(&self, user: UserId) -> Result<Reply, QuizError> {
        let _guard = self.lock_user(user).await;
        let mut session = self.load(user).await?;
        let delivery = session.finish_early()?;
        self.resolve(user, session, delivery).await
    }

    /// Drop whatever the user was doing and go back to the menu.
    pub async fn restart(&self, user: UserId) -> Result<Reply, QuizError> {
        let _guard = self.lock_user(user).await;
        self.sessions.remove(user).await?;
        Ok(Reply::Menu)
    }

    pub async fn stage(&self, user: UserId) -> Result<Stage, QuizError> {
        Ok(self.load(user).await?.stage().clone())
    }

    pub async fn stats(&self, user: UserId) -> Result<StatsSummary, QuizError> {
        Ok(self.statistics.summary(user).await?)
    }

    pub async fn set_premium(&self, user: UserId, is_premium: bool) -> Result<(), QuizError> {
        Ok(self.statistics.set_premium(user, is_premium).await?)
    }

    pub async fn reset_generation_quota(&self, user: UserId) -> Result<(), QuizError> {
        Ok(self.limiter.reset(user).await?)
    }

    pub async fn clear_statistics(&self, user: UserId) -> Result<(), QuizError> {
        Ok(self.statistics.clear(user).await?)
    }

    fn choose_subject(&self, step: SelectionStep) -> Reply {
        let options = match &step {
            SelectionStep::Obligatory => self.catalog.obligatory().to_vec(),
            SelectionStep::Profile1 | SelectionStep::FullExamProfile1 => {
                self.catalog.profile().to_vec()
            }
            SelectionStep::Profile2 { first } | SelectionStep::FullExamProfile2 { first } => {
                self.catalog.profile_except(first)
            }
        };
        Reply::ChooseSubject { step, options }
    }

    async fn resolve(
        &self,
        user: UserId,
        mut session: Session,
        delivery: Delivery,
    ) -> Result<Reply, QuizError> {
        let reply = match delivery {
            Delivery::Question { subject, question } => {
                let (name, text, total) = session.prompt_at(subject, question).ok_or(
                    QuizError::UnexpectedAction {
                        stage: session.stage().describe(),
                    },
                )?;
                Reply::Question(QuestionPrompt {
                    subject: name.to_string(),
                    number: question + 1,
                    total,
                    text: text.text().to_string(),
                })
            }
            Delivery::ChooseNextSubject => Reply::ChooseNextSubject {
                remaining: session
                    .remaining_subjects()
                    .iter()
                    .map(|subject| subject.name().to_string())
                    .collect(),
            },
            Delivery::Completed => {
                let report = self.scoring.score_and_record(user, &session).await?;
                session.close();
                Reply::Finished(report)
            }
        };
        self.sessions.set(user, session).await?;
        Ok(reply)
    }

    async fn load(&self, user: UserId) -> Result<Session, QuizError> {
        Ok(self.sessions.get(user).await?.unwrap_or_default())
    }

    async fn lock_user(&self, user: UserId) -> UserGuard<'_> {
        let lock = {
            let mut locks = self.user_locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(user).or_default().clone()
        };
        let guard = lock.clone().lock_owned().await;
        UserGuard {
            locks: &self.user_locks,
            user,
            lock,
            guard: Some(guard),
        }
    }
}

/// Holds a user's lock; the map entry goes away with the last holder.
struct UserGuard<'a> {
    locks: &'a UserLocks,
    user: UserId,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // The map and this guard; anyone else waiting holds a clone too.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.user);
        }
    }
}
