//! Comparison session: several strategies against one shared model.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use ef_optimizer::RunError;
use ef_types::{
    Completeness, ComparisonReport, EfError, EventPayload, EventStatus, ModelArtifact,
    OptimizationResult, Ranking, RequestError, ResolvedConfiguration, Stage, StrategyFailure,
    StrategyKind, TrialCircuit,
};

use crate::channel::ProgressPublisher;
use crate::pipeline::{optimize, Pipeline, PublishingObserver, UnitError};
use crate::service::EngineContext;

/// Run every requested strategy concurrently and rank the survivors.
pub async fn execute(
    ctx: Arc<EngineContext>,
    resolved: ResolvedConfiguration,
    strategies: BTreeSet<StrategyKind>,
    budget: usize,
    publisher: ProgressPublisher,
) -> Result<ComparisonReport, UnitError> {
    if strategies.is_empty() {
        return Err(UnitError::failed(RequestError::EmptyStrategySet));
    }

    let (artifact, cached, circuit) = {
        let mut shared = Pipeline::new(&ctx, publisher.clone());
        shared.initialize(&resolved, budget).await?;
        let (artifact, cached) = shared.build_model(&resolved).await?;
        let circuit = shared.build_circuit(&artifact).await?;
        (artifact, cached, circuit)
    };

    let total = strategies.len();
    let completed = Arc::new(AtomicUsize::new(0));
    let mut tasks = JoinSet::new();
    for strategy in strategies.iter().copied() {
        tasks.spawn(run_strategy(
            ctx.clone(),
            artifact.clone(),
            circuit.clone(),
            strategy,
            budget,
            total,
            completed.clone(),
            publisher.with_strategy(strategy),
        ));
    }

    let mut results = BTreeMap::new();
    let mut failures = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(result))) => {
                results.insert(result.strategy_id, result);
            }
            Ok((strategy, Err(RunError::Evaluation { source, trajectory, .. }))) => {
                failures.push(StrategyFailure {
                    strategy_id: strategy,
                    message: source.to_string(),
                    iterations_completed: trajectory.len(),
                });
            }
            Ok((_, Err(RunError::Cancelled { .. }))) => {
                tasks.shutdown().await;
                return Err(UnitError::Cancelled);
            }
            Ok((_, Err(error @ RunError::AlreadyFinished { .. }))) => {
                tasks.shutdown().await;
                return Err(UnitError::failed(EfError::Internal(error.to_string())));
            }
            Err(e) => {
                tasks.shutdown().await;
                return Err(UnitError::failed(EfError::Internal(format!(
                    "strategy task aborted: {e}"
                ))));
            }
        }
    }

    if publisher.is_cancelled().await {
        return Err(UnitError::Cancelled);
    }
    let ranking = Ranking::from_results(results.values()).ok_or_else(|| {
        UnitError::failed(EfError::TotalFailure {
            unit: "strategies".to_string(),
            total,
        })
    })?;

    failures.sort_by_key(|f| f.strategy_id);
    info!(
        succeeded = results.len(),
        failed = failures.len(),
        best_accuracy = %ranking.best_accuracy,
        fastest = %ranking.fastest,
        "comparison finished"
    );

    Ok(ComparisonReport {
        model: artifact.summary(cached),
        reference_value: artifact.reference_value,
        completeness: Completeness::from_counts(failures.len(), total),
        results,
        failures,
        ranking,
    })
}

/// One child task. Publishes its own start, iterations and failure, tagged
/// with the strategy id, so each strategy's events stay in order.
#[allow(clippy::too_many_arguments)]
async fn run_strategy(
    ctx: Arc<EngineContext>,
    artifact: Arc<ModelArtifact>,
    circuit: TrialCircuit,
    strategy: StrategyKind,
    budget: usize,
    total: usize,
    completed: Arc<AtomicUsize>,
    publisher: ProgressPublisher,
) -> (StrategyKind, Result<OptimizationResult, RunError>) {
    let started = publisher
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
        .await;
    if started.is_err() {
        let cancelled = RunError::Cancelled {
            strategy,
            trajectory: Vec::new(),
        };
        return (strategy, Err(cancelled));
    }

    // Combined progress across all strategies of the session.
    let lo = Stage::Optimize.entry_progress() as usize;
    let span = Stage::Optimize.exit_progress() as usize - lo;
    let planned = (budget * total).max(1);
    let progress = Box::new(move |_: &ef_types::IterationRecord| {
        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
        (lo + span * done.min(planned) / planned) as u8
    });

    let mut observer = PublishingObserver::new(publisher.clone(), progress);
    let outcome = optimize(&ctx, &circuit, &artifact, strategy, budget, &mut observer).await;

    if let Err(RunError::Evaluation { source, trajectory, .. }) = &outcome {
        warn!(strategy = %strategy, error = %source, "strategy failed");
        // A closed channel surfaces on the next publish from the session.
        let _ = publisher
            .unit_failed(Stage::Optimize, source.to_string(), trajectory.len())
            .await;
    }
    (strategy, outcome)
}
