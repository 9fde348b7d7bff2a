//! Progress event wire schema.
//!
//! Every event on a progress channel serializes as
//! `{sequence, stage, status, progress, payload, strategyId?, point?, terminal}`.
//! Events tagged with a `strategyId` or `point` belong to a sub-unit of a
//! comparison or sweep; only the untagged `terminal` event ends the channel.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::model::{Configuration, ModelSummary, TrialCircuit};
use crate::optimization::{IterationRecord, StrategyKind};
use crate::reports::{ComparisonReport, PipelineReport, SweepPoint, SweepReport};

/// Unique identifier of one request's event stream.
pub type RunId = Uuid;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    Initialize,
    BuildModel,
    BuildTrialCircuit,
    Optimize,
    Finalize,
}

impl Stage {
    pub const ORDER: [Stage; 5] = [
        Stage::Initialize,
        Stage::BuildModel,
        Stage::BuildTrialCircuit,
        Stage::Optimize,
        Stage::Finalize,
    ];

    /// Progress percentage reached when the stage is done.
    pub fn exit_progress(&self) -> u8 {
        match self {
            Self::Initialize => 5,
            Self::BuildModel => 20,
            Self::BuildTrialCircuit => 30,
            Self::Optimize => 95,
            Self::Finalize => 100,
        }
    }

    /// Progress percentage at stage entry.
    pub fn entry_progress(&self) -> u8 {
        match self {
            Self::Initialize => 0,
            Self::BuildModel => Self::Initialize.exit_progress(),
            Self::BuildTrialCircuit => Self::BuildModel.exit_progress(),
            Self::Optimize => Self::BuildTrialCircuit.exit_progress(),
            Self::Finalize => Self::Optimize.exit_progress(),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initialize => "Initialize",
            Self::BuildModel => "BuildModel",
            Self::BuildTrialCircuit => "BuildTrialCircuit",
            Self::Optimize => "Optimize",
            Self::Finalize => "Finalize",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Running,
    Complete,
    Error,
}

/// Locates an event inside a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointTag {
    pub index: usize,
    pub total: usize,
    pub parameter_value: f64,
}

/// Stage-specific event body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Initialized {
        configuration: Configuration,
        geometry: String,
        iteration_budget: usize,
    },
    Model(ModelSummary),
    Circuit(TrialCircuit),
    OptimizeStarted {
        strategy_id: StrategyKind,
        parameter_count: usize,
        iteration_budget: usize,
    },
    Iteration(IterationRecord),
    SweepStarted {
        strategy_id: StrategyKind,
        grid: Vec<f64>,
        iteration_budget: usize,
    },
    /// A sweep point finished (successfully or not).
    Point(SweepPoint),
    /// One strategy or sweep point failed; the request continues.
    UnitFailed {
        message: String,
        stage: Stage,
        iterations_completed: usize,
    },
    Pipeline(Box<PipelineReport>),
    Comparison(Box<ComparisonReport>),
    Sweep(Box<SweepReport>),
    /// Terminal failure of the whole request.
    Error { message: String, stage: Stage },
}

/// One message on a progress channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub run_id: RunId,
    /// Position within the channel, starting at 0.
    pub sequence: u64,
    pub stage: Stage,
    pub status: EventStatus,
    /// Overall request progress, 0-100, non-decreasing within a channel.
    pub progress: u8,
    pub payload: EventPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_id: Option<StrategyKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point: Option<PointTag>,
    pub terminal: bool,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// `true` for error events scoped to a single strategy or sweep point.
    pub fn is_unit_failure(&self) -> bool {
        self.status == EventStatus::Error && !self.terminal
    }

    pub fn iteration(&self) -> Option<&IterationRecord> {
        match &self.payload {
            EventPayload::Iteration(record) => Some(record),
            _ => None,
        }
    }
}
