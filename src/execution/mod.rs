//! Execution data model and submission validation.

pub mod model;
pub mod validate;

pub use self::model::{
    ArtifactRefs, AttemptOutcome, AttemptRecord, Browser, BrowserOptions, Execution, ExecutionId,
    ExecutionRequest, ExecutionStatus, FailureKind, Finalization, Framework, Language,
    SealedAttempt, Viewport,
};
pub use self::validate::{validate, SubmitLimits, SubmitRequest};

use thiserror::Error;

/// Reasons a submission is rejected before anything is persisted.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("test_id must not be empty")]
    EmptyTestId,

    #[error("test source must not be empty")]
    EmptySource,

    #[error("test source is {size} bytes; the limit is {max}")]
    SourceTooLarge { size: usize, max: usize },

    #[error("unknown framework '{0}'")]
    UnknownFramework(String),

    #[error("unknown language '{0}'")]
    UnknownLanguage(String),

    #[error("unknown browser '{0}'")]
    UnknownBrowser(String),

    #[error("the configured runner cannot execute {framework} tests written in {language} on {browser}")]
    UnsupportedCombination {
        framework: Framework,
        language: Language,
        browser: Browser,
    },

    #[error("viewport {width}x{height} is outside {min}..={max} pixels per side")]
    InvalidViewport {
        width: i64,
        height: i64,
        min: u32,
        max: u32,
    },

    #[error("user_agent must be non-empty and at most {max} bytes")]
    InvalidUserAgent { max: usize },

    #[error("invalid base_url {0}")]
    InvalidBaseUrl(String),

    #[error("{field} must not be negative (got {value})")]
    NegativeOverride { field: &'static str, value: i64 },

    #[error("{field} must be greater than zero")]
    ZeroOverride { field: &'static str },

    #[error("{field} = {value} exceeds the limit of {max}")]
    OverrideTooLarge {
        field: &'static str,
        value: u64,
        max: u64,
    },
}
