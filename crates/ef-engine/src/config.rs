use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use ef_types::{config_error, EfResult, RequestError};

/// Engine limits and defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub min_iteration_budget: usize,
    pub max_iteration_budget: usize,
    /// Budget used by single pipelines and comparisons when the request has none.
    pub default_iteration_budget: usize,
    /// Per-point budget used by sweeps when the request has none.
    pub default_sweep_budget: usize,
    pub max_active_requests: usize,
    pub evaluator_timeout: Duration,
    /// Buffered events per channel before the publisher waits on the subscriber.
    pub channel_capacity: usize,
    pub max_sweep_steps: usize,
    pub default_sweep_start: f64,
    pub default_sweep_end: f64,
    pub default_sweep_steps: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_iteration_budget: 1,
            max_iteration_budget: 500,
            default_iteration_budget: 100,
            default_sweep_budget: 50,
            max_active_requests: 8,
            evaluator_timeout: Duration::from_secs(30),
            channel_capacity: 64,
            max_sweep_steps: 100,
            default_sweep_start: 0.5,
            default_sweep_end: 2.0,
            default_sweep_steps: 10,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `EIGENFLOW_*` environment variables.
    pub fn from_env() -> EfResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> EfResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "EIGENFLOW_MIN_ITERATIONS")? {
            config.min_iteration_budget = v;
        }
        if let Some(v) = parse_var(&lookup, "EIGENFLOW_MAX_ITERATIONS")? {
            config.max_iteration_budget = v;
        }
        if let Some(v) = parse_var(&lookup, "EIGENFLOW_DEFAULT_ITERATIONS")? {
            config.default_iteration_budget = v;
        }
        if let Some(v) = parse_var(&lookup, "EIGENFLOW_SWEEP_ITERATIONS")? {
            config.default_sweep_budget = v;
        }
        if let Some(v) = parse_var(&lookup, "EIGENFLOW_MAX_ACTIVE_REQUESTS")? {
            config.max_active_requests = v;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "EIGENFLOW_EVALUATOR_TIMEOUT_MS")? {
            config.evaluator_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = parse_var(&lookup, "EIGENFLOW_CHANNEL_CAPACITY")? {
            config.channel_capacity = v;
        }
        if let Some(v) = parse_var(&lookup, "EIGENFLOW_MAX_SWEEP_STEPS")? {
            config.max_sweep_steps = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_iteration_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_iteration_budget = min;
        self.max_iteration_budget = max;
        self
    }

    pub fn with_max_active_requests(mut self, limit: usize) -> Self {
        self.max_active_requests = limit;
        self
    }

    pub fn with_evaluator_timeout(mut self, timeout: Duration) -> Self {
        self.evaluator_timeout = timeout;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn validate(&self) -> EfResult<()> {
        if self.min_iteration_budget == 0 {
            return Err(config_error!("minimum iteration budget must be at least 1"));
        }
        if self.min_iteration_budget > self.max_iteration_budget {
            return Err(config_error!(
                "iteration budget bounds inverted: {} > {}",
                self.min_iteration_budget,
                self.max_iteration_budget
            ));
        }
        for (name, budget) in [
            ("default", self.default_iteration_budget),
            ("sweep", self.default_sweep_budget),
        ] {
            if !(self.min_iteration_budget..=self.max_iteration_budget).contains(&budget) {
                return Err(config_error!("{name} iteration budget {budget} outside bounds"));
            }
        }
        if self.max_active_requests == 0 {
            return Err(config_error!("max active requests must be at least 1"));
        }
        if self.evaluator_timeout.is_zero() {
            return Err(config_error!("evaluator timeout must be positive"));
        }
        if self.channel_capacity == 0 {
            return Err(config_error!("channel capacity must be at least 1"));
        }
        if self.max_sweep_steps < 2 {
            return Err(config_error!("max sweep steps must be at least 2"));
        }
        Ok(())
    }

    /// Resolve and bound-check a requested iteration budget.
    pub fn check_budget(&self, requested: Option<usize>, default: usize) -> Result<usize, RequestError> {
        let budget = requested.unwrap_or(default);
        if (self.min_iteration_budget..=self.max_iteration_budget).contains(&budget) {
            Ok(budget)
        } else {
            Err(RequestError::IterationBudgetOutOfRange {
                budget,
                min: self.min_iteration_budget,
                max: self.max_iteration_budget,
            })
        }
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> EfResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| config_error!("{name}={raw}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_iteration_budget, 100);
        assert_eq!(config.default_sweep_budget, 50);
    }

    #[test]
    fn environment_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("EIGENFLOW_MAX_ITERATIONS", "200"),
            ("EIGENFLOW_EVALUATOR_TIMEOUT_MS", "1500"),
            ("EIGENFLOW_MAX_ACTIVE_REQUESTS", " 2 "),
        ]))
        .unwrap();
        assert_eq!(config.max_iteration_budget, 200);
        assert_eq!(config.evaluator_timeout, Duration::from_millis(1500));
        assert_eq!(config.max_active_requests, 2);
    }

    #[test]
    fn invalid_environment_is_a_config_error() {
        let err = EngineConfig::from_lookup(lookup(&[("EIGENFLOW_CHANNEL_CAPACITY", "lots")])).unwrap_err();
        assert!(err.to_string().contains("EIGENFLOW_CHANNEL_CAPACITY"));

        let err = EngineConfig::from_lookup(lookup(&[("EIGENFLOW_MAX_ITERATIONS", "10")])).unwrap_err();
        assert!(err.to_string().contains("outside bounds"));
    }

    #[test]
    fn budget_bounds() {
        let config = EngineConfig::default();
        assert_eq!(config.check_budget(None, 100), Ok(100));
        assert_eq!(config.check_budget(Some(500), 100), Ok(500));
        assert!(matches!(
            config.check_budget(Some(0), 100),
            Err(RequestError::IterationBudgetOutOfRange { budget: 0, .. })
        ));
        assert!(config.check_budget(Some(501), 100).is_err());
    }
}
