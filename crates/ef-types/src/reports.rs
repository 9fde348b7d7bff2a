//! Terminal payloads for pipelines, comparison sessions and sweeps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{ConfigurationKey, ModelSummary, TrialCircuit};
use crate::optimization::{OptimizationResult, StrategyKind, TrajectoryAnalytics};

/// Whether every sub-unit of an aggregate request succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Completeness {
    Full,
    Partial { failed: usize, total: usize },
}

impl Completeness {
    pub fn from_counts(failed: usize, total: usize) -> Self {
        if failed == 0 {
            Self::Full
        } else {
            Self::Partial { failed, total }
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Partial { .. })
    }
}

/// Result of one complete stage pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub model: ModelSummary,
    pub circuit: TrialCircuit,
    pub result: OptimizationResult,
    pub analytics: Option<TrajectoryAnalytics>,
    pub error_percentage: Option<f64>,
}

impl PipelineReport {
    pub fn new(model: ModelSummary, circuit: TrialCircuit, result: OptimizationResult) -> Self {
        Self {
            analytics: TrajectoryAnalytics::from_records(&result.iterations),
            error_percentage: result.error_percentage(),
            model,
            circuit,
            result,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyFailure {
    pub strategy_id: StrategyKind,
    pub message: String,
    pub iterations_completed: usize,
}

/// Winners of a comparison session. The two need not coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ranking {
    /// Lowest final value; ties go to fewer iterations.
    pub best_accuracy: StrategyKind,
    /// Fewest iterations; ties go to the lower final value.
    pub fastest: StrategyKind,
}

impl Ranking {
    /// Rank the successful runs. Returns `None` when there are none.
    pub fn from_results<'a, I>(results: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a OptimizationResult>,
    {
        let results: Vec<&OptimizationResult> = results.into_iter().collect();

        let best_accuracy = results.iter().min_by(|a, b| {
            a.final_value
                .total_cmp(&b.final_value)
                .then(a.iteration_count.cmp(&b.iteration_count))
        })?;
        let fastest = results.iter().min_by(|a, b| {
            a.iteration_count
                .cmp(&b.iteration_count)
                .then(a.final_value.total_cmp(&b.final_value))
        })?;

        Some(Self {
            best_accuracy: best_accuracy.strategy_id,
            fastest: fastest.strategy_id,
        })
    }
}

/// Result of a comparison session over the successful strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonReport {
    pub model: ModelSummary,
    pub reference_value: f64,
    pub results: BTreeMap<StrategyKind, OptimizationResult>,
    pub failures: Vec<StrategyFailure>,
    pub ranking: Ranking,
    pub completeness: Completeness,
}

/// One sample of the potential energy curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepPoint {
    pub index: usize,
    pub parameter_value: f64,
    /// Absent when model construction failed.
    pub reference_value: Option<f64>,
    /// Absent whenever the point failed.
    pub objective_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SweepPoint {
    pub fn succeeded(
        index: usize,
        parameter_value: f64,
        reference_value: f64,
        objective_value: f64,
        iteration_count: usize,
    ) -> Self {
        Self {
            index,
            parameter_value,
            reference_value: Some(reference_value),
            objective_value: Some(objective_value),
            iteration_count: Some(iteration_count),
            error: None,
        }
    }

    pub fn failed(
        index: usize,
        parameter_value: f64,
        reference_value: Option<f64>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            index,
            parameter_value,
            reference_value,
            objective_value: None,
            iteration_count: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.objective_value.is_some()
    }
}

/// Discrete equilibrium estimate.
///
/// This is the arg-min over sampled points, not an analytic minimum: the true
/// minimum may lie anywhere within `resolution` of `parameter_value`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquilibriumEstimate {
    pub parameter_value: f64,
    pub value: f64,
    /// Grid spacing bounding the estimate's precision.
    pub resolution: f64,
}

impl EquilibriumEstimate {
    /// Arg-min of `select` over points where it yields a finite value.
    pub fn arg_min<F>(points: &[SweepPoint], resolution: f64, select: F) -> Option<Self>
    where
        F: Fn(&SweepPoint) -> Option<f64>,
    {
        points
            .iter()
            .filter_map(|p| select(p).filter(|v| v.is_finite()).map(|v| (p.parameter_value, v)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(parameter_value, value)| Self {
                parameter_value,
                value,
                resolution,
            })
    }
}

/// Result of a sweep: the full curve plus its discrete minima.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub configuration_id: String,
    pub strategy_id: StrategyKind,
    pub points: Vec<SweepPoint>,
    /// Arg-min over successful objective values.
    pub equilibrium_estimate: EquilibriumEstimate,
    /// Arg-min over reference values, where available.
    pub reference_equilibrium: Option<EquilibriumEstimate>,
    pub completeness: Completeness,
    pub model_keys: Vec<ConfigurationKey>,
}
