//! Quiz orchestration engine for ENT practice sessions.
//!
//! The engine picks subjects, asks an external generator for question text,
//! parses it, serves questions one at a time, scores the answers and keeps
//! per-user statistics and free-tier quotas. Chat transports call into
//! [`quiz::QuizEngine`] with one semantic action per inbound event.

#![forbid(unsafe_code)]

pub mod config;
pub mod quiz;
pub mod storage;
pub mod time;

pub use config::{Config, ConfigError};
pub use quiz::{QuizEngine, QuizError, Reply, UserId};
pub use time::Clock;
