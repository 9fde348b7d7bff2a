//! Optimization run driver: one strategy, one trial circuit, one trajectory.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use tracing::{debug, info, warn};

use ef_types::{
    EvaluationError, IterationRecord, ModelArtifact, OptimizationResult, StrategyKind,
    TrialCircuit,
};

use crate::strategy::SearchStrategy;

/// The function being minimized. One call is one iteration.
#[async_trait]
pub trait Objective: Send + Sync {
    async fn evaluate(&self, circuit: &TrialCircuit, parameters: &[f64]) -> Result<f64, EvaluationError>;
}

/// Receives every iteration before the next evaluator call is issued.
#[async_trait]
pub trait IterationObserver: Send + Sync {
    /// `Break` stops the run as cancelled.
    async fn on_iteration(&mut self, record: &IterationRecord) -> ControlFlow<()>;

    /// Polled before each evaluator call.
    async fn is_cancelled(&self) -> bool {
        false
    }
}

/// Observer that ignores every iteration.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

#[async_trait]
impl IterationObserver for NoopObserver {
    async fn on_iteration(&mut self, _record: &IterationRecord) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

/// Why a run ended without a result. Both variants carry the partial trajectory.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RunError {
    #[error("{strategy} failed after {} iterations: {source}", trajectory.len())]
    Evaluation {
        strategy: StrategyKind,
        #[source]
        source: EvaluationError,
        trajectory: Vec<IterationRecord>,
    },
    #[error("{strategy} cancelled after {} iterations", trajectory.len())]
    Cancelled {
        strategy: StrategyKind,
        trajectory: Vec<IterationRecord>,
    },
    /// A run produces at most one result; it cannot be driven twice.
    #[error("{strategy} run already finished ({state:?})")]
    AlreadyFinished { strategy: StrategyKind, state: RunState },
}

impl RunError {
    pub fn trajectory(&self) -> &[IterationRecord] {
        match self {
            Self::Evaluation { trajectory, .. } | Self::Cancelled { trajectory, .. } => trajectory,
            Self::AlreadyFinished { .. } => &[],
        }
    }
}

/// Lifecycle state for an optimization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// One configured strategy against one trial circuit.
pub struct OptimizationRun<'a> {
    circuit: &'a TrialCircuit,
    artifact: &'a ModelArtifact,
    iteration_budget: usize,
    strategy: Box<dyn SearchStrategy>,
    state: RunState,
}

impl<'a> OptimizationRun<'a> {
    pub fn new(
        circuit: &'a TrialCircuit,
        artifact: &'a ModelArtifact,
        iteration_budget: usize,
        strategy: Box<dyn SearchStrategy>,
    ) -> Self {
        Self {
            circuit,
            artifact,
            iteration_budget,
            strategy,
            state: RunState::Pending,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    /// Drive the strategy until the budget is spent or it converges.
    pub async fn run(
        &mut self,
        objective: &dyn Objective,
        observer: &mut dyn IterationObserver,
    ) -> Result<OptimizationResult, RunError> {
        let strategy = self.strategy.kind();
        if self.state != RunState::Pending {
            return Err(RunError::AlreadyFinished {
                strategy,
                state: self.state,
            });
        }
        let started_at = Utc::now();
        let mut trajectory: Vec<IterationRecord> = Vec::with_capacity(self.iteration_budget);
        self.state = RunState::Running;

        info!(
            strategy = %strategy,
            parameters = self.circuit.parameter_count,
            budget = self.iteration_budget,
            "optimization run started"
        );

        while trajectory.len() < self.iteration_budget && !self.strategy.has_converged() {
            if observer.is_cancelled().await {
                return Err(self.cancel(strategy, trajectory));
            }

            let parameters = self.strategy.propose();
            let value = match objective.evaluate(self.circuit, &parameters).await {
                Ok(value) if value.is_finite() => value,
                Ok(value) => return Err(self.fail(strategy, EvaluationError::NonFinite { value }, trajectory)),
                Err(source) => return Err(self.fail(strategy, source, trajectory)),
            };
            self.strategy.observe(&parameters, value);

            let record = IterationRecord::new(trajectory.len(), value);
            debug!(strategy = %strategy, iteration = record.iteration_index, value, "iteration");
            let flow = observer.on_iteration(&record).await;
            trajectory.push(record);
            if flow.is_break() {
                return Err(self.cancel(strategy, trajectory));
            }
        }

        let converged = self.strategy.has_converged();
        let (optimal_parameters, final_value) = match self.strategy.best() {
            Some((parameters, value)) => (parameters.to_vec(), value),
            None => {
                let source = EvaluationError::EvaluateFailed {
                    message: "run finished without any evaluation".to_string(),
                };
                return Err(self.fail(strategy, source, trajectory));
            }
        };

        self.state = RunState::Completed;
        info!(
            strategy = %strategy,
            iterations = trajectory.len(),
            final_value,
            converged,
            "optimization run completed"
        );

        Ok(OptimizationResult {
            strategy_id: strategy,
            final_value,
            reference_value: self.artifact.reference_value,
            iteration_count: trajectory.len(),
            iteration_budget: self.iteration_budget,
            converged,
            optimal_parameters,
            iterations: trajectory,
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn fail(&mut self, strategy: StrategyKind, source: EvaluationError, trajectory: Vec<IterationRecord>) -> RunError {
        self.state = RunState::Failed;
        warn!(strategy = %strategy, iterations = trajectory.len(), error = %source, "optimization run failed");
        RunError::Evaluation {
            strategy,
            source,
            trajectory,
        }
    }

    fn cancel(&mut self, strategy: StrategyKind, trajectory: Vec<IterationRecord>) -> RunError {
        self.state = RunState::Cancelled;
        info!(strategy = %strategy, iterations = trajectory.len(), "optimization run cancelled");
        RunError::Cancelled {
            strategy,
            trajectory,
        }
    }
}
