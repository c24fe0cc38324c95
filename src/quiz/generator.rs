use std::time::Duration;

use async_trait::async_trait;
use chatgpt::config::ChatGPTEngine;
use chatgpt::prelude::ChatGPT;
use chatgpt::types::CompletionResponse;
use log::{debug, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The text generator behind question sets: one prompt in, free text out.
#[async_trait]
pub trait QuestionGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, BoxError>;
}

/// Prompt asking for `count` ENT questions on `subject` in the format the
/// parser understands.
pub fn generation_prompt(subject: &str, count: usize) -> String {
    format!(
        "Сгенерируй {count} тестовых вопросов по предмету '{subject}' для подготовки к ЕНТ. \
         Каждый вопрос должен иметь 4 варианта ответа (A, B, C, D) и один правильный. \
         Формат:\n\nВопрос: ...\nA) ...\nB) ...\nC) ...\nD) ...\nПравильный ответ: X\n\n\
         Вопросы должны быть разного уровня сложности."
    )
}

pub struct ChatGptGenerator {
    chat_gpt: ChatGPT,
}

impl ChatGptGenerator {
    pub fn new(api_key: &str, engine: &str, timeout: Duration) -> Result<Self, BoxError> {
        let mut chat_gpt = ChatGPT::new(api_key)?;
        chat_gpt.config.engine = engine_from_name(engine);
        chat_gpt.config.temperature = 0.7;
        chat_gpt.config.timeout = timeout;
        Ok(Self { chat_gpt })
    }
}

fn engine_from_name(name: &str) -> ChatGPTEngine {
    match name {
        "gpt-4" => ChatGPTEngine::Gpt4,
        "gpt-4-32k" => ChatGPTEngine::Gpt4_32k,
        "gpt-3.5-turbo" => ChatGPTEngine::Gpt35Turbo,
        other => {
            warn!("Unknown engine {:?}, falling back to gpt-4", other);
            ChatGPTEngine::Gpt4
        }
    }
}

#[async_trait]
impl QuestionGenerator for ChatGptGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, BoxError> {
        debug!("Sending generation prompt: {:?}", prompt);
        let response: CompletionResponse = self.chat_gpt.send_message(prompt).await?;
        let content = response.message().content.trim().to_string();
        debug!("Completion: {:?}", content);
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quiz::parser;

    #[test]
    fn prompt_names_subject_count_and_answer_format() {
        let prompt = generation_prompt("Физика", 10);
        assert!(prompt.contains("10 тестовых вопросов"));
        assert!(prompt.contains("'Физика'"));
        assert!(prompt.contains("Правильный ответ: X"));
    }

    #[test]
    fn sample_in_prompt_format_parses() {
        let sample = "Вопрос: 2+2?\nA) 3\nB) 4\nC) 5\nD) 6\nПравильный ответ: B";
        assert_eq!(parser::parse(sample).len(), 1);
    }

    #[test]
    fn unknown_engine_falls_back() {
        assert!(matches!(engine_from_name("gpt-5-mega"), ChatGPTEngine::Gpt4));
        assert!(matches!(engine_from_name("gpt-3.5-turbo"), ChatGPTEngine::Gpt35Turbo));
    }
}
