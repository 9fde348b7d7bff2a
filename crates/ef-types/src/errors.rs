use thiserror::Error;

use crate::events::Stage;

/// Main error type for the Eigenflow system
#[derive(Error, Debug)]
pub enum EfError {
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Pipeline failed during {stage}: {source}")]
    Pipeline {
        stage: Stage,
        #[source]
        source: EvaluationError,
    },

    #[error("All {total} {unit} failed")]
    TotalFailure { unit: String, total: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EfError {
    /// Stage the failure should be attributed to on the event stream.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Pipeline { stage, .. } => *stage,
            Self::InvalidRequest(_) => Stage::Initialize,
            Self::Evaluation(_) => Stage::Optimize,
            _ => Stage::Finalize,
        }
    }
}

/// Request validation errors. Always raised before any stage starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error("Unknown configuration: {configuration_id}")]
    UnknownConfiguration { configuration_id: String },

    #[error("Iteration budget {budget} outside allowed range [{min}, {max}]")]
    IterationBudgetOutOfRange { budget: usize, min: usize, max: usize },

    #[error("Degenerate scan range: start {start} must be below end {end}")]
    DegenerateRange { start: f64, end: f64 },

    #[error("Scan range values must be finite, positive and at most {max} Å: start {start}, end {end}")]
    NonPhysicalRange { start: f64, end: f64, max: f64 },

    #[error("Scan spacing {resolution} Å is finer than the cache key resolution {min} Å")]
    ResolutionTooFine { resolution: f64, min: f64 },

    #[error("Sweep needs between 2 and {max} steps, got {steps}")]
    StepsOutOfRange { steps: usize, max: usize },

    #[error("At least one strategy must be requested")]
    EmptyStrategySet,

    #[error("Too many active requests (limit {limit})")]
    TooManyActiveRequests { limit: usize },

    #[error("Malformed request: {message}")]
    Malformed { message: String },
}

/// Evaluator gateway errors, local to the call that triggered them
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("Model construction failed for {configuration}: {message}")]
    BuildFailed { configuration: String, message: String },

    #[error("Objective evaluation failed: {message}")]
    EvaluateFailed { message: String },

    #[error("Evaluator call exceeded {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("Evaluator returned a non-finite value: {value}")]
    NonFinite { value: f64 },

    #[error("Invalid parameter vector: {message}")]
    InvalidParameters { message: String },
}

/// Result type alias for Eigenflow operations
pub type EfResult<T> = Result<T, EfError>;

/// Macro for creating malformed-request errors
#[macro_export]
macro_rules! invalid_request {
    ($($arg:tt)*) => {
        $crate::EfError::InvalidRequest($crate::RequestError::Malformed {
            message: format!($($arg)*),
        })
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::EfError::Config(format!($($arg)*))
    };
}
