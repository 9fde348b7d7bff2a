//! Stage pipeline: Initialize → BuildModel → BuildTrialCircuit → Optimize → Finalize.

use async_trait::async_trait;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use ef_optimizer::{IterationObserver, Objective, OptimizationRun, RunError};
use ef_types::{
    EfError, EvaluationError, EventPayload, EventStatus, IterationRecord, ModelArtifact,
    OptimizationResult, PipelineReport, ResolvedConfiguration, Stage, StrategyKind, TrialCircuit,
};

use crate::channel::{ChannelClosed, ProgressPublisher};
use crate::gateway::{with_timeout, EvaluatorGateway};
use crate::service::EngineContext;

/// Why a pipeline, strategy or sweep point stopped short.
#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    #[error("cancelled by subscriber")]
    Cancelled,
    #[error("{error}")]
    Failed {
        error: EfError,
        iterations_completed: usize,
    },
}

impl UnitError {
    pub fn failed(error: impl Into<EfError>) -> Self {
        Self::Failed {
            error: error.into(),
            iterations_completed: 0,
        }
    }

    pub(crate) fn from_run(stage: Stage, error: RunError) -> Self {
        match error {
            RunError::Cancelled { .. } => Self::Cancelled,
            RunError::Evaluation {
                source, trajectory, ..
            } => Self::Failed {
                error: EfError::Pipeline { stage, source },
                iterations_completed: trajectory.len(),
            },
            error @ RunError::AlreadyFinished { .. } => Self::Failed {
                error: EfError::Internal(error.to_string()),
                iterations_completed: 0,
            },
        }
    }
}

impl From<ChannelClosed> for UnitError {
    fn from(_: ChannelClosed) -> Self {
        Self::Cancelled
    }
}

/// Lifecycle of one pipeline. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineStatus {
    Pending,
    Running(Stage),
    Completed,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Evaluator calls bounded by the configured timeout.
pub(crate) struct GatewayObjective {
    gateway: Arc<dyn EvaluatorGateway>,
    timeout: Duration,
}

impl GatewayObjective {
    pub(crate) fn new(ctx: &EngineContext) -> Self {
        Self {
            gateway: ctx.gateway.clone(),
            timeout: ctx.config.evaluator_timeout,
        }
    }
}

#[async_trait]
impl Objective for GatewayObjective {
    async fn evaluate(&self, circuit: &TrialCircuit, parameters: &[f64]) -> Result<f64, EvaluationError> {
        with_timeout(self.timeout, self.gateway.evaluate(circuit, parameters)).await
    }
}

/// Maps a finished iteration to the progress value it is published with.
pub(crate) type ProgressFn = Box<dyn Fn(&IterationRecord) -> u8 + Send + Sync>;

/// Publishes one `Optimize` event per iteration and stops the run when the
/// subscriber goes away.
pub(crate) struct PublishingObserver {
    publisher: ProgressPublisher,
    progress: ProgressFn,
}

impl PublishingObserver {
    pub(crate) fn new(publisher: ProgressPublisher, progress: ProgressFn) -> Self {
        Self { publisher, progress }
    }

    /// Linear interpolation across the `Optimize` window.
    pub(crate) fn linear(budget: usize) -> ProgressFn {
        let lo = Stage::Optimize.entry_progress() as usize;
        let span = Stage::Optimize.exit_progress() as usize - lo;
        let budget = budget.max(1);
        Box::new(move |record| (lo + span * (record.iteration_index + 1).min(budget) / budget) as u8)
    }
}

#[async_trait]
impl IterationObserver for PublishingObserver {
    async fn on_iteration(&mut self, record: &IterationRecord) -> ControlFlow<()> {
        let progress = (self.progress)(record);
        let payload = EventPayload::Iteration(record.clone());
        match self
            .publisher
            .emit(Stage::Optimize, EventStatus::Running, progress, payload)
            .await
        {
            Ok(()) => ControlFlow::Continue(()),
            Err(ChannelClosed) => ControlFlow::Break(()),
        }
    }

    async fn is_cancelled(&self) -> bool {
        self.publisher.is_cancelled().await
    }
}

/// Drive one strategy against a prepared circuit.
pub(crate) async fn optimize(
    ctx: &EngineContext,
    circuit: &TrialCircuit,
    artifact: &ModelArtifact,
    strategy: StrategyKind,
    budget: usize,
    observer: &mut PublishingObserver,
) -> Result<OptimizationResult, RunError> {
    let search = ctx.strategies.create(strategy, circuit.parameter_count);
    let objective = GatewayObjective::new(ctx);
    OptimizationRun::new(circuit, artifact, budget, search)
        .run(&objective, observer)
        .await
}

/// One pass through the stages, publishing as it goes.
///
/// Emits everything up to and including the last `Optimize` iteration; the
/// caller decides what the `Finalize` event looks like.
pub struct Pipeline<'a> {
    ctx: &'a EngineContext,
    publisher: ProgressPublisher,
    status: PipelineStatus,
}

impl<'a> Pipeline<'a> {
    pub fn new(ctx: &'a EngineContext, publisher: ProgressPublisher) -> Self {
        Self {
            ctx,
            publisher,
            status: PipelineStatus::Pending,
        }
    }

    pub fn status(&self) -> PipelineStatus {
        self.status
    }

    fn enter(&mut self, stage: Stage) -> Result<(), UnitError> {
        let next = PipelineStatus::Running(stage);
        if self.status.is_terminal() || next <= self.status {
            return Err(UnitError::failed(EfError::Internal(format!(
                "illegal pipeline transition {:?} -> {:?}",
                self.status, next
            ))));
        }
        self.status = next;
        Ok(())
    }

    fn settle<T>(&mut self, result: Result<T, UnitError>) -> Result<T, UnitError> {
        match &result {
            Ok(_) => {}
            Err(UnitError::Cancelled) => self.status = PipelineStatus::Cancelled,
            Err(UnitError::Failed { .. }) => self.status = PipelineStatus::Failed,
        }
        result
    }

    pub async fn execute(
        &mut self,
        resolved: &ResolvedConfiguration,
        strategy: StrategyKind,
        budget: usize,
    ) -> Result<PipelineReport, UnitError> {
        let result = self.stages(resolved, strategy, budget).await;
        let result = self.settle(result);
        if result.is_ok() {
            self.status = PipelineStatus::Completed;
        }
        result
    }

    async fn stages(
        &mut self,
        resolved: &ResolvedConfiguration,
        strategy: StrategyKind,
        budget: usize,
    ) -> Result<PipelineReport, UnitError> {
        self.initialize(resolved, budget).await?;
        let (artifact, cached) = self.build_model(resolved).await?;
        let circuit = self.build_circuit(&artifact).await?;

        self.enter(Stage::Optimize)?;
        self.publisher
            .emit(
                Stage::Optimize,
                EventStatus::Running,
                Stage::Optimize.entry_progress(),
                EventPayload::OptimizeStarted {
                    strategy_id: strategy,
                    parameter_count: circuit.parameter_count,
                    iteration_budget: budget,
                },
            )
            .await?;
        let mut observer = PublishingObserver::new(self.publisher.clone(), PublishingObserver::linear(budget));
        let result = optimize(self.ctx, &circuit, &artifact, strategy, budget, &mut observer)
            .await
            .map_err(|e| UnitError::from_run(Stage::Optimize, e))?;

        self.enter(Stage::Finalize)?;
        Ok(PipelineReport::new(artifact.summary(cached), circuit, result))
    }

    /// Resolve static metadata. No evaluator call.
    pub(crate) async fn initialize(&mut self, resolved: &ResolvedConfiguration, budget: usize) -> Result<(), UnitError> {
        self.enter(Stage::Initialize)?;
        info!(key = %resolved.key, budget, "pipeline initialized");
        self.publisher
            .emit(
                Stage::Initialize,
                EventStatus::Complete,
                Stage::Initialize.exit_progress(),
                EventPayload::Initialized {
                    configuration: resolved.configuration.clone(),
                    geometry: resolved.geometry.clone(),
                    iteration_budget: budget,
                },
            )
            .await?;
        Ok(())
    }

    /// Fetch the model through the cache. Not retried on failure.
    pub(crate) async fn build_model(
        &mut self,
        resolved: &ResolvedConfiguration,
    ) -> Result<(Arc<ModelArtifact>, bool), UnitError> {
        self.enter(Stage::BuildModel)?;
        if self.publisher.is_cancelled().await {
            return Err(UnitError::Cancelled);
        }

        let gateway = self.ctx.gateway.clone();
        let timeout = self.ctx.config.evaluator_timeout;
        let (artifact, cached) = self
            .ctx
            .cache
            .get_or_build(&resolved.key, || async move {
                with_timeout(timeout, gateway.build_model(resolved)).await
            })
            .await
            .map_err(|source| {
                warn!(key = %resolved.key, error = %source, "model construction failed");
                UnitError::failed(EfError::Pipeline {
                    stage: Stage::BuildModel,
                    source,
                })
            })?;

        self.publisher
            .emit(
                Stage::BuildModel,
                EventStatus::Complete,
                Stage::BuildModel.exit_progress(),
                EventPayload::Model(artifact.summary(cached)),
            )
            .await?;
        Ok((artifact, cached))
    }

    /// Pure derivation from the artifact.
    pub(crate) async fn build_circuit(&mut self, artifact: &ModelArtifact) -> Result<TrialCircuit, UnitError> {
        self.enter(Stage::BuildTrialCircuit)?;
        let circuit = TrialCircuit::from_artifact(artifact);
        self.publisher
            .emit(
                Stage::BuildTrialCircuit,
                EventStatus::Complete,
                Stage::BuildTrialCircuit.exit_progress(),
                EventPayload::Circuit(circuit.clone()),
            )
            .await?;
        Ok(circuit)
    }
}
