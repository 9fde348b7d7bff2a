// Eigenflow engine
// Staged streaming pipeline with comparison and sweep orchestration

pub mod cache;
pub mod catalog;
pub mod channel;
pub mod comparison;
pub mod config;
pub mod gateway;
pub mod pipeline;
pub mod service;
pub mod sweep;

pub use cache::{CacheStats, ModelCache};
pub use catalog::ConfigurationCatalog;
pub use channel::{ChannelClosed, ProgressChannel, ProgressPublisher, RunOutcome};
pub use config::EngineConfig;
pub use gateway::{with_timeout, EvaluatorGateway, MorseProfile, SyntheticGateway};
pub use pipeline::{Pipeline, PipelineStatus, UnitError};
pub use service::{EngineContext, EngineRequest, EngineService, RunRequest};
pub use sweep::ScanRange;
