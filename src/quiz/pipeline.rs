//! Builds question sets for a session by calling the generator once per
//! subject.
//!
//! Everything is accumulated locally and handed back as one
//! [`CommittedQuestionSet`]; a failure on any subject discards the lot, so
//! the caller's session never sees a partial set.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use crate::quiz::generator::generation_prompt;
use crate::quiz::limiter::Admission;
use crate::quiz::{
    parser, ExamSlot, GenerationCause, Mode, QuestionGenerator, QuestionSet, QuizError,
    RateLimiter, SubjectCatalog, SubjectRef, UserId,
};

/// Questions for every subject of a session, ready to be committed.
#[derive(Debug, Clone)]
pub struct CommittedQuestionSet {
    mode: Mode,
    subjects: Vec<(SubjectRef, QuestionSet)>,
}

impl CommittedQuestionSet {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn subjects(&self) -> impl Iterator<Item = &SubjectRef> {
        self.subjects.iter().map(|(subject, _)| subject)
    }

    pub fn set(&self, subject: &SubjectRef) -> Option<&QuestionSet> {
        self.subjects
            .iter()
            .find(|(s, _)| s == subject)
            .map(|(_, set)| set)
    }

    pub fn total_questions(&self) -> usize {
        self.subjects.iter().map(|(_, set)| set.len()).sum()
    }

    #[cfg(test)]
    pub(crate) fn for_tests(mode: Mode, subjects: Vec<(SubjectRef, QuestionSet)>) -> Self {
        Self { mode, subjects }
    }

    pub(crate) fn into_parts(self) -> (Mode, Vec<(SubjectRef, QuestionSet)>) {
        (self.mode, self.subjects)
    }
}

#[derive(Clone)]
pub struct GenerationPipeline {
    generator: Arc<dyn QuestionGenerator>,
    limiter: RateLimiter,
    catalog: SubjectCatalog,
    timeout: Duration,
}

impl GenerationPipeline {
    pub const FREE_QUESTION_COUNT: usize = 5;
    pub const PREMIUM_QUESTION_COUNT: usize = 10;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

    pub fn new(
        generator: Arc<dyn QuestionGenerator>,
        limiter: RateLimiter,
        catalog: SubjectCatalog,
    ) -> Self {
        Self {
            generator,
            limiter,
            catalog,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Generate one or two ad-hoc subjects. Premium users skip the quota
    /// and get twice as many questions per subject.
    ///
    /// # Errors
    ///
    /// `NoSubjectSelected`, `DuplicateProfileSubject`, `QuotaExceeded`,
    /// `GenerationTransientFailure` or a storage error.
    pub async fn generate_ad_hoc(
        &self,
        user: UserId,
        subjects: &[String],
    ) -> Result<CommittedQuestionSet, QuizError> {
        if subjects.is_empty() {
            return Err(QuizError::NoSubjectSelected);
        }
        if let Some(duplicate) = first_duplicate(subjects) {
            return Err(QuizError::DuplicateProfileSubject(duplicate.to_string()));
        }

        let admission = self.admit(user).await?;
        let count = match admission {
            Admission::Unmetered => Self::PREMIUM_QUESTION_COUNT,
            _ => Self::FREE_QUESTION_COUNT,
        };
        let jobs = subjects
            .iter()
            .map(|name| (SubjectRef::AdHoc(name.clone()), count))
            .collect();
        self.run(user, admission, Mode::AdHoc, jobs).await
    }

    /// Generate the five mock exam slots with their fixed counts. The quota
    /// is charged once for the whole exam.
    ///
    /// # Errors
    ///
    /// `DuplicateProfileSubject`, `QuotaExceeded`,
    /// `GenerationTransientFailure` or a storage error.
    pub async fn generate_full_exam(
        &self,
        user: UserId,
        profile1: &str,
        profile2: &str,
    ) -> Result<CommittedQuestionSet, QuizError> {
        if profile1 == profile2 {
            return Err(QuizError::DuplicateProfileSubject(profile2.to_string()));
        }

        let admission = self.admit(user).await?;
        let jobs = ExamSlot::ALL
            .into_iter()
            .map(|slot| {
                let name = self.catalog.slot_name(slot, profile1, profile2).to_string();
                (SubjectRef::Slot { slot, name }, slot.required_count())
            })
            .collect();
        self.run(user, admission, Mode::FullExam, jobs).await
    }

    async fn admit(&self, user: UserId) -> Result<Admission, QuizError> {
        let admission = self.limiter.try_acquire(user).await?;
        if admission.is_denied() {
            warn!("User {} hit the free generation quota", user);
            return Err(QuizError::QuotaExceeded {
                limit: self.limiter.policy().limit,
            });
        }
        Ok(admission)
    }

    /// Generate every subject in order; on the first failure the slot is
    /// handed back and nothing is returned.
    async fn run(
        &self,
        user: UserId,
        admission: Admission,
        mode: Mode,
        jobs: Vec<(SubjectRef, usize)>,
    ) -> Result<CommittedQuestionSet, QuizError> {
        let mut subjects = Vec::with_capacity(jobs.len());
        for (subject, count) in jobs {
            match self.generate_subject(subject.name(), count).await {
                Ok(set) => subjects.push((subject, set)),
                Err(e) => {
                    self.limiter.release(user, admission).await?;
                    return Err(e);
                }
            }
        }
        Ok(CommittedQuestionSet { mode, subjects })
    }

    async fn generate_subject(&self, subject: &str, count: usize) -> Result<QuestionSet, QuizError> {
        let prompt = generation_prompt(subject, count);
        let text = match tokio::time::timeout(self.timeout, self.generator.generate(&prompt)).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                error!("Question generation for {} failed: {}", subject, e);
                return Err(QuizError::GenerationTransientFailure {
                    subject: subject.to_string(),
                    cause: GenerationCause::Generator(e.to_string()),
                });
            }
            Err(_) => {
                error!("Question generation for {} timed out after {:?}", subject, self.timeout);
                return Err(QuizError::GenerationTransientFailure {
                    subject: subject.to_string(),
                    cause: GenerationCause::TimedOut(self.timeout),
                });
            }
        };

        let parsed = parser::parse(&text);
        info!(
            "Generated questions for {}: {} of {} requested",
            subject,
            parsed.len(),
            count
        );
        Ok(QuestionSet::from_parsed(parsed))
    }
}

fn first_duplicate(subjects: &[String]) -> Option<&str> {
    subjects
        .iter()
        .enumerate()
        .find(|&(i, name)| subjects[..i].contains(name))
        .map(|(_, name)| name.as_str())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::quiz::generator::BoxError;
    use crate::quiz::{QuotaPolicy, Statistics};
    use crate::storage::InMemoryStatisticsStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers prompts from a script; fails for subjects listed in `fail_on`.
    #[derive(Default)]
    pub(crate) struct ScriptedGenerator {
        pub fail_on: Vec<String>,
        pub calls: Mutex<Vec<String>>,
    }

    pub(crate) fn questions_text(letters: &[&str]) -> String {
        letters
            .iter()
            .enumerate()
            .map(|(i, letter)| {
                format!("Вопрос: №{}?\nA) 1\nB) 2\nC) 3\nD) 4\nПравильный ответ: {}", i + 1, letter)
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[async_trait]
    impl QuestionGenerator for ScriptedGenerator {
        async fn generate(&self, prompt: &str) -> Result<String, BoxError> {
            self.calls.lock().unwrap().push(prompt.to_string());
            if self.fail_on.iter().any(|s| prompt.contains(&format!("'{s}'"))) {
                return Err("service unavailable".into());
            }
            Ok(questions_text(&["A", "B", "C", "D", "A"]))
        }
    }

    struct StalledGenerator;

    #[async_trait]
    impl QuestionGenerator for StalledGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String, BoxError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
    }

    fn pipeline_with(generator: Arc<dyn QuestionGenerator>) -> (GenerationPipeline, Statistics) {
        let statistics = Statistics::new(Arc::new(InMemoryStatisticsStore::new()));
        let limiter = RateLimiter::new(statistics.clone(), QuotaPolicy::default());
        let catalog = SubjectCatalog::new(["History"], ["Physics", "Chemistry"]);
        (
            GenerationPipeline::new(generator, limiter, catalog),
            statistics,
        )
    }

    #[tokio::test]
    async fn ad_hoc_generates_every_subject_in_order() {
        let generator = Arc::new(ScriptedGenerator::default());
        let (pipeline, stats) = pipeline_with(generator.clone());
        let subjects = vec!["Physics".to_string(), "Chemistry".to_string()];

        let set = pipeline.generate_ad_hoc(UserId(1), &subjects).await.unwrap();

        assert_eq!(set.mode(), Mode::AdHoc);
        assert_eq!(set.subjects().count(), 2);
        assert_eq!(set.subjects().next().map(SubjectRef::name), Some("Physics"));
        assert_eq!(set.total_questions(), 10);
        let calls = generator.calls.lock().unwrap();
        assert!(calls[0].contains("5 тестовых вопросов"));
        assert_eq!(stats.get(UserId(1)).await.unwrap().recent_generations.len(), 1);
    }

    #[tokio::test]
    async fn premium_doubles_count_and_is_not_recorded() {
        let generator = Arc::new(ScriptedGenerator::default());
        let (pipeline, stats) = pipeline_with(generator.clone());
        stats.set_premium(UserId(2), true).await.unwrap();

        pipeline
            .generate_ad_hoc(UserId(2), &["Physics".to_string()])
            .await
            .unwrap();

        assert!(generator.calls.lock().unwrap()[0].contains("10 тестовых вопросов"));
        assert!(stats.get(UserId(2)).await.unwrap().recent_generations.is_empty());
    }

    #[tokio::test]
    async fn empty_and_duplicate_selections_are_rejected() {
        let (pipeline, _) = pipeline_with(Arc::new(ScriptedGenerator::default()));
        assert!(matches!(
            pipeline.generate_ad_hoc(UserId(1), &[]).await,
            Err(QuizError::NoSubjectSelected)
        ));
        let same = vec!["Physics".to_string(), "Physics".to_string()];
        assert!(matches!(
            pipeline.generate_ad_hoc(UserId(1), &same).await,
            Err(QuizError::DuplicateProfileSubject(_))
        ));
    }

    #[tokio::test]
    async fn failure_on_second_subject_returns_nothing_and_gives_the_slot_back() {
        let generator = Arc::new(ScriptedGenerator {
            fail_on: vec!["Chemistry".into()],
            ..Default::default()
        });
        let (pipeline, stats) = pipeline_with(generator.clone());
        let subjects = vec!["Physics".to_string(), "Chemistry".to_string()];

        let result = pipeline.generate_ad_hoc(UserId(3), &subjects).await;

        assert!(matches!(
            result,
            Err(QuizError::GenerationTransientFailure { ref subject, cause: GenerationCause::Generator(_) })
                if subject == "Chemistry"
        ));
        assert_eq!(generator.calls.lock().unwrap().len(), 2);
        assert!(stats.get(UserId(3)).await.unwrap().recent_generations.is_empty());
    }

    #[tokio::test]
    async fn quota_is_enforced_for_free_users() {
        let (pipeline, _) = pipeline_with(Arc::new(ScriptedGenerator::default()));
        let subjects = vec!["Physics".to_string()];
        for _ in 0..4 {
            pipeline.generate_ad_hoc(UserId(4), &subjects).await.unwrap();
        }
        assert!(matches!(
            pipeline.generate_ad_hoc(UserId(4), &subjects).await,
            Err(QuizError::QuotaExceeded { limit: 4 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_generator_times_out_and_gives_the_slot_back() {
        let (pipeline, stats) = pipeline_with(Arc::new(StalledGenerator));
        let pipeline = pipeline.with_timeout(Duration::from_secs(5));

        let result = pipeline.generate_ad_hoc(UserId(5), &["Physics".to_string()]).await;

        assert!(matches!(
            result,
            Err(QuizError::GenerationTransientFailure { cause: GenerationCause::TimedOut(_), .. })
        ));
        assert!(stats.get(UserId(5)).await.unwrap().recent_generations.is_empty());
    }

    #[tokio::test]
    async fn full_exam_uses_fixed_slots_and_counts() {
        let generator = Arc::new(ScriptedGenerator::default());
        let (pipeline, stats) = pipeline_with(generator.clone());

        let set = pipeline
            .generate_full_exam(UserId(6), "Physics", "Chemistry")
            .await
            .unwrap();

        assert_eq!(set.mode(), Mode::FullExam);
        let names: Vec<&str> = set.subjects().map(SubjectRef::name).collect();
        assert_eq!(
            names,
            vec!["History", "Math literacy", "Reading literacy", "Physics", "Chemistry"]
        );
        let calls = generator.calls.lock().unwrap();
        assert!(calls[0].contains("20 тестовых вопросов"));
        assert!(calls[1].contains("10 тестовых вопросов"));
        assert!(calls[3].contains("40 тестовых вопросов"));
        assert_eq!(stats.get(UserId(6)).await.unwrap().recent_generations.len(), 1);
    }

    #[tokio::test]
    async fn empty_parse_still_commits_an_empty_subject() {
        struct Chatty;
        #[async_trait]
        impl QuestionGenerator for Chatty {
            async fn generate(&self, _prompt: &str) -> Result<String, BoxError> {
                Ok("Извините, не могу.".into())
            }
        }
        let (pipeline, _) = pipeline_with(Arc::new(Chatty));

        let set = pipeline
            .generate_ad_hoc(UserId(7), &["Physics".to_string()])
            .await
            .unwrap();

        let subject = set.subjects().next().unwrap();
        assert!(set.set(subject).unwrap().is_empty());
    }
}
