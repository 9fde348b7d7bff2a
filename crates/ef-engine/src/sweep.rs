//! Sweep orchestrator: the full pipeline repeated across a bond-length grid.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use ef_optimizer::select_strategy;
use ef_types::{
    Completeness, Configuration, ConfigurationKey, EfError, EquilibriumEstimate, EventPayload,
    EventStatus, PointTag, RequestError, Stage, StrategyKind, SweepPoint, SweepReport,
};

use crate::channel::ProgressPublisher;
use crate::pipeline::{Pipeline, UnitError};
use crate::service::EngineContext;

/// Progress reached once the sweep has announced its grid.
const GRID_PROGRESS: u8 = 5;
/// Progress reached once every point has finished.
const POINTS_PROGRESS: u8 = 95;

/// Closed interval of bond lengths sampled at `steps` evenly spaced points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRange {
    pub start: f64,
    pub end: f64,
    pub steps: usize,
}

impl ScanRange {
    pub fn new(start: f64, end: f64, steps: usize) -> Self {
        Self { start, end, steps }
    }

    pub fn validate(&self, max_steps: usize) -> Result<(), RequestError> {
        let max = ConfigurationKey::MAX_BOND_LENGTH;
        let physical = |v: f64| v.is_finite() && v > 0.0 && v <= max;
        if !physical(self.start) || !physical(self.end) {
            return Err(RequestError::NonPhysicalRange {
                start: self.start,
                end: self.end,
                max,
            });
        }
        if self.start >= self.end {
            return Err(RequestError::DegenerateRange {
                start: self.start,
                end: self.end,
            });
        }
        if self.steps < 2 || self.steps > max_steps {
            return Err(RequestError::StepsOutOfRange {
                steps: self.steps,
                max: max_steps,
            });
        }
        // Neighbouring points must not collapse onto one cached model.
        if self.resolution() < ConfigurationKey::RESOLUTION {
            return Err(RequestError::ResolutionTooFine {
                resolution: self.resolution(),
                min: ConfigurationKey::RESOLUTION,
            });
        }
        Ok(())
    }

    /// Grid spacing, which bounds the equilibrium estimate's precision.
    pub fn resolution(&self) -> f64 {
        (self.end - self.start) / (self.steps - 1) as f64
    }

    /// `steps` values from `start` to `end`, both included exactly.
    pub fn grid(&self) -> Vec<f64> {
        let last = self.steps.saturating_sub(1);
        (0..self.steps)
            .map(|i| {
                if i == last {
                    self.end
                } else {
                    self.start + i as f64 * self.resolution()
                }
            })
            .collect()
    }
}

/// Sweep `configuration` over `range`. Failed points are kept with absent values.
pub async fn execute(
    ctx: Arc<EngineContext>,
    configuration: Configuration,
    range: ScanRange,
    budget: usize,
    publisher: ProgressPublisher,
) -> Result<SweepReport, UnitError> {
    range
        .validate(ctx.config.max_sweep_steps)
        .map_err(UnitError::failed)?;

    let strategy = select_strategy(&configuration);
    let grid = range.grid();
    let total = grid.len();
    info!(configuration = %configuration.id, %strategy, points = total, budget, "sweep started");

    publisher
        .emit(
            Stage::Initialize,
            EventStatus::Running,
            GRID_PROGRESS,
            EventPayload::SweepStarted {
                strategy_id: strategy,
                grid: grid.clone(),
                iteration_budget: budget,
            },
        )
        .await?;

    let window = (POINTS_PROGRESS - GRID_PROGRESS) as usize;
    let mut points = Vec::with_capacity(total);
    let mut model_keys = Vec::with_capacity(total);

    for (index, &parameter_value) in grid.iter().enumerate() {
        let tag = PointTag {
            index,
            total,
            parameter_value,
        };
        let lo = GRID_PROGRESS as usize + window * index / total;
        let hi = GRID_PROGRESS as usize + window * (index + 1) / total;
        let point_publisher = publisher.scoped(lo as u8, hi as u8).with_point(tag);

        let resolved = configuration.resolve_at(parameter_value);
        model_keys.push(resolved.key.clone());

        let mut pipeline = Pipeline::new(&ctx, point_publisher.clone());
        let point = match pipeline.execute(&resolved, strategy, budget).await {
            Ok(report) => SweepPoint::succeeded(
                index,
                parameter_value,
                report.result.reference_value,
                report.result.final_value,
                report.result.iteration_count,
            ),
            Err(UnitError::Cancelled) => return Err(UnitError::Cancelled),
            Err(UnitError::Failed {
                error,
                iterations_completed,
            }) => {
                warn!(index, parameter_value, %error, "sweep point failed");
                point_publisher
                    .unit_failed(error.stage(), error.to_string(), iterations_completed)
                    .await?;
                // The model may have been built before the optimizer failed.
                let reference = ctx.cache.get(&resolved.key).map(|a| a.reference_value);
                SweepPoint::failed(index, parameter_value, reference, error.to_string())
            }
        };

        if point.is_success() {
            point_publisher
                .emit(Stage::Finalize, EventStatus::Complete, 100, EventPayload::Point(point.clone()))
                .await?;
        }
        points.push(point);
    }

    summarize(configuration.id, strategy, range, points, model_keys)
}

fn summarize(
    configuration_id: String,
    strategy_id: StrategyKind,
    range: ScanRange,
    points: Vec<SweepPoint>,
    model_keys: Vec<ConfigurationKey>,
) -> Result<SweepReport, UnitError> {
    let total = points.len();
    let failed = points.iter().filter(|p| !p.is_success()).count();
    let resolution = range.resolution();

    let equilibrium_estimate =
        EquilibriumEstimate::arg_min(&points, resolution, |p| p.objective_value).ok_or_else(|| {
            UnitError::failed(EfError::TotalFailure {
                unit: "sweep points".to_string(),
                total,
            })
        })?;
    let reference_equilibrium = EquilibriumEstimate::arg_min(&points, resolution, |p| p.reference_value);

    info!(
        equilibrium = equilibrium_estimate.parameter_value,
        value = equilibrium_estimate.value,
        failed,
        "sweep finished"
    );

    Ok(SweepReport {
        configuration_id,
        strategy_id,
        points,
        equilibrium_estimate,
        reference_equilibrium,
        completeness: Completeness::from_counts(failed, total),
        model_keys,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{self, RunOutcome};
    use crate::gateway::{MorseProfile, SyntheticGateway};
    use crate::EngineConfig;
    use uuid::Uuid;

    async fn sweep(
        gateway: SyntheticGateway,
        range: ScanRange,
        budget: usize,
    ) -> (Result<SweepReport, UnitError>, Vec<ef_types::ProgressEvent>) {
        let ctx = Arc::new(EngineContext::new(EngineConfig::default(), Arc::new(gateway)));
        let configuration = ctx.catalog.get("H2").unwrap().clone();
        let (publisher, mut channel) = channel::channel(Uuid::new_v4(), 4096);
        channel.attach(tokio::spawn(async { RunOutcome::Completed }));
        let report = execute(ctx, configuration, range, budget, publisher).await;
        let (events, _) = channel.collect().await;
        (report, events)
    }

    #[test]
    fn grid_includes_both_endpoints() {
        let range = ScanRange::new(0.5, 2.0, 10);
        let grid = range.grid();
        assert_eq!(grid.len(), 10);
        assert_eq!(grid[0], 0.5);
        assert_eq!(grid[9], 2.0);
        assert!((grid[1] - 0.6667).abs() < 1e-4);
        for pair in grid.windows(2) {
            assert!((pair[1] - pair[0] - range.resolution()).abs() < 1e-12);
        }
    }

    #[test]
    fn range_validation() {
        assert!(ScanRange::new(0.5, 2.0, 10).validate(100).is_ok());
        assert!(matches!(
            ScanRange::new(2.0, 0.5, 10).validate(100),
            Err(RequestError::DegenerateRange { .. })
        ));
        assert!(matches!(
            ScanRange::new(1.0, 1.0, 10).validate(100),
            Err(RequestError::DegenerateRange { .. })
        ));
        assert!(matches!(
            ScanRange::new(-0.5, 2.0, 10).validate(100),
            Err(RequestError::NonPhysicalRange { .. })
        ));
        assert!(matches!(
            ScanRange::new(0.5, f64::INFINITY, 10).validate(100),
            Err(RequestError::NonPhysicalRange { .. })
        ));
        assert!(matches!(
            ScanRange::new(0.5, 2.0, 1).validate(100),
            Err(RequestError::StepsOutOfRange { steps: 1, .. })
        ));
        assert!(ScanRange::new(0.5, 2.0, 101).validate(100).is_err());
        assert!(matches!(
            ScanRange::new(0.5, 1e9, 10).validate(100),
            Err(RequestError::NonPhysicalRange { .. })
        ));
        assert!(matches!(
            ScanRange::new(1.0, 1.0 + 1e-5, 100).validate(100),
            Err(RequestError::ResolutionTooFine { .. })
        ));
        assert!(ScanRange::new(1.0, 1.0 + 1e-3, 100).validate(100).is_ok());
    }

    #[tokio::test]
    async fn full_sweep_finds_the_well() {
        let range = ScanRange::new(0.5, 2.0, 10);
        let (report, events) = sweep(SyntheticGateway::new(), range, 50).await;
        let report = report.unwrap();

        assert_eq!(report.strategy_id, StrategyKind::GradientBased);
        assert_eq!(report.points.len(), 10);
        assert_eq!(report.completeness, Completeness::Full);
        let values: Vec<f64> = report.points.iter().map(|p| p.parameter_value).collect();
        assert_eq!(values, range.grid());

        // The objective minimum is the arg-min of the sampled values.
        let argmin = report
            .points
            .iter()
            .min_by(|a, b| a.objective_value.unwrap().total_cmp(&b.objective_value.unwrap()))
            .unwrap();
        assert_eq!(report.equilibrium_estimate.parameter_value, argmin.parameter_value);
        assert_eq!(report.equilibrium_estimate.resolution, range.resolution());
        let reference = report.reference_equilibrium.unwrap();
        assert!((reference.parameter_value - MorseProfile::H2.equilibrium).abs() <= range.resolution());

        // Every per-point event is tagged and progress never goes backwards.
        for event in events.iter().skip(1) {
            assert!(event.point.is_some());
        }
        assert!(events.windows(2).all(|w| w[0].progress <= w[1].progress));
        assert!(events.iter().all(|e| !e.is_terminal()));
        let complete_points = events
            .iter()
            .filter(|e| matches!(e.payload, EventPayload::Point(_)))
            .count();
        assert_eq!(complete_points, 10);
    }

    #[tokio::test]
    async fn one_failing_point_is_isolated() {
        let range = ScanRange::new(0.5, 2.0, 10);
        let failing = ConfigurationKey::new("H2", range.grid()[3]);
        let gateway = SyntheticGateway::new().fail_build_when(move |key| *key == failing);
        let (report, events) = sweep(gateway, range, 20).await;
        let report = report.unwrap();

        let populated = report.points.iter().filter(|p| p.is_success()).count();
        assert_eq!(populated, 9);
        let failed = &report.points[3];
        assert!(failed.objective_value.is_none());
        assert!(failed.reference_value.is_none());
        assert!(failed.error.as_deref().unwrap_or_default().contains("BuildModel"));
        assert_eq!(report.completeness, Completeness::Partial { failed: 1, total: 10 });

        let unit_failures: Vec<_> = events.iter().filter(|e| e.is_unit_failure()).collect();
        assert_eq!(unit_failures.len(), 1);
        assert_eq!(unit_failures[0].point.map(|p| p.index), Some(3));
    }

    #[tokio::test]
    async fn optimizer_failure_keeps_the_cached_reference() {
        let range = ScanRange::new(0.5, 2.0, 10);
        let failing = ConfigurationKey::new("H2", range.grid()[3]);
        let gateway = SyntheticGateway::new().fail_evaluate_when(move |key| *key == failing);
        let (report, events) = sweep(gateway, range, 20).await;
        let report = report.unwrap();

        let failed = &report.points[3];
        assert!(!failed.is_success());
        assert!(failed.objective_value.is_none());
        let reference = failed.reference_value.unwrap();
        assert!((reference - MorseProfile::H2.reference(range.grid()[3])).abs() < 1e-6);
        assert_eq!(report.points.iter().filter(|p| p.is_success()).count(), 9);
        assert_eq!(report.completeness, Completeness::Partial { failed: 1, total: 10 });

        let unit_failures: Vec<_> = events.iter().filter(|e| e.is_unit_failure()).collect();
        assert_eq!(unit_failures.len(), 1);
        assert_eq!(unit_failures[0].stage, Stage::Optimize);
        assert_eq!(unit_failures[0].point.map(|p| p.index), Some(3));
    }

    #[tokio::test]
    async fn no_successful_point_is_total_failure() {
        let gateway = SyntheticGateway::new().fail_build_when(|_| true);
        let (report, _) = sweep(gateway, ScanRange::new(0.5, 2.0, 3), 5).await;
        match report.unwrap_err() {
            UnitError::Failed { error, .. } => {
                assert!(matches!(error, EfError::TotalFailure { total: 3, .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
