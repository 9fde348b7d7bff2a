use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed set of search strategies an optimization run can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Finite-difference gradient descent.
    GradientBased,
    /// Compass (coordinate pattern) search.
    DerivativeFree,
    /// Simultaneous perturbation stochastic approximation.
    StochasticPerturbation,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 3] = [
        StrategyKind::GradientBased,
        StrategyKind::DerivativeFree,
        StrategyKind::StochasticPerturbation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GradientBased => "gradient_based",
            Self::DerivativeFree => "derivative_free",
            Self::StochasticPerturbation => "stochastic_perturbation",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gradient_based" | "gradient" => Ok(Self::GradientBased),
            "derivative_free" | "compass" => Ok(Self::DerivativeFree),
            "stochastic_perturbation" | "spsa" => Ok(Self::StochasticPerturbation),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

/// One evaluator call observed by an optimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationRecord {
    pub iteration_index: usize,
    pub objective_value: f64,
    pub timestamp: DateTime<Utc>,
}

impl IterationRecord {
    pub fn new(iteration_index: usize, objective_value: f64) -> Self {
        Self {
            iteration_index,
            objective_value,
            timestamp: Utc::now(),
        }
    }
}

/// Terminal summary of one optimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationResult {
    pub strategy_id: StrategyKind,
    /// Best objective value observed over the trajectory.
    pub final_value: f64,
    pub reference_value: f64,
    /// Always equal to `iterations.len()`.
    pub iteration_count: usize,
    pub iteration_budget: usize,
    pub converged: bool,
    pub optimal_parameters: Vec<f64>,
    pub iterations: Vec<IterationRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl OptimizationResult {
    /// Relative deviation from the reference value, in percent.
    pub fn error_percentage(&self) -> Option<f64> {
        if self.reference_value == 0.0 {
            return None;
        }
        Some(((self.final_value - self.reference_value) / self.reference_value).abs() * 100.0)
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// Summary statistics over an energy trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrajectoryAnalytics {
    pub mean_value: f64,
    pub std_deviation: f64,
    pub variance: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub value_range: f64,
    /// Standard deviation of the last 10% of iterations (needs more than 10).
    pub convergence_rate: Option<f64>,
    /// Difference of the last two values (needs more than 2).
    pub final_gradient: Option<f64>,
}

impl TrajectoryAnalytics {
    pub fn from_records(records: &[IterationRecord]) -> Option<Self> {
        let values: Vec<f64> = records.iter().map(|r| r.objective_value).collect();
        Self::from_values(&values)
    }

    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let (mean, variance) = mean_and_variance(values);
        let min_value = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max_value = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let convergence_rate = (values.len() > 10).then(|| {
            let tail = &values[values.len() - values.len() / 10..];
            mean_and_variance(tail).1.sqrt()
        });
        let final_gradient =
            (values.len() > 2).then(|| values[values.len() - 1] - values[values.len() - 2]);

        Some(Self {
            mean_value: mean,
            std_deviation: variance.sqrt(),
            variance,
            min_value,
            max_value,
            value_range: max_value - min_value,
            convergence_rate,
            final_gradient,
        })
    }
}

/// Population mean and variance.
fn mean_and_variance(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(final_value: f64, reference_value: f64) -> OptimizationResult {
        let now = Utc::now();
        OptimizationResult {
            strategy_id: StrategyKind::GradientBased,
            final_value,
            reference_value,
            iteration_count: 0,
            iteration_budget: 10,
            converged: false,
            optimal_parameters: Vec::new(),
            iterations: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn strategy_kind_round_trips_names() {
        for kind in StrategyKind::ALL {
            assert_eq!(kind.as_str().parse::<StrategyKind>(), Ok(kind));
        }
        assert_eq!("spsa".parse::<StrategyKind>(), Ok(StrategyKind::StochasticPerturbation));
        assert!("slsqp".parse::<StrategyKind>().is_err());
        assert_eq!(
            serde_json::to_string(&StrategyKind::DerivativeFree).unwrap(),
            "\"derivative_free\""
        );
    }

    #[test]
    fn error_percentage_is_relative() {
        let r = result(-1.13, -1.0);
        assert!((r.error_percentage().unwrap() - 13.0).abs() < 1e-9);
        assert!(result(-1.0, 0.0).error_percentage().is_none());
    }

    #[test]
    fn analytics_small_trajectory() {
        let analytics = TrajectoryAnalytics::from_values(&[3.0, 1.0, 2.0]).unwrap();
        assert!((analytics.mean_value - 2.0).abs() < 1e-12);
        assert!((analytics.variance - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(analytics.min_value, 1.0);
        assert_eq!(analytics.max_value, 3.0);
        assert_eq!(analytics.value_range, 2.0);
        assert!(analytics.convergence_rate.is_none());
        assert_eq!(analytics.final_gradient, Some(1.0));
    }

    #[test]
    fn analytics_convergence_rate_uses_tail() {
        let mut values: Vec<f64> = (0..18).map(|i| -(i as f64)).collect();
        values.extend([-20.0, -20.0]);
        let analytics = TrajectoryAnalytics::from_values(&values).unwrap();
        // Last 10% of 20 values is the flat tail.
        assert_eq!(analytics.convergence_rate, Some(0.0));
        assert_eq!(analytics.final_gradient, Some(0.0));
        assert!(TrajectoryAnalytics::from_values(&[]).is_none());
    }
}
