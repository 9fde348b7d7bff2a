//! Ask/tell search strategies over a trial circuit's parameter space.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use ef_types::{Configuration, StrategyKind};

/// Common trait for all search strategies.
///
/// A run alternates `propose` and `observe`; every proposal costs exactly one
/// evaluator call, so strategies differ only in how they pick the next point.
pub trait SearchStrategy: Send {
    fn kind(&self) -> StrategyKind;

    /// Next parameter vector to evaluate.
    fn propose(&mut self) -> Vec<f64>;

    /// Report the objective value measured at the last proposal.
    fn observe(&mut self, parameters: &[f64], value: f64);

    /// Strategy-internal convergence criterion.
    fn has_converged(&self) -> bool {
        false
    }

    /// Best point observed so far.
    fn best(&self) -> Option<(&[f64], f64)>;
}

/// Selection policy: systems with more than two electrons have rougher
/// landscapes and use the derivative-free search.
pub fn select_strategy(configuration: &Configuration) -> StrategyKind {
    if configuration.electrons > 2 {
        StrategyKind::DerivativeFree
    } else {
        StrategyKind::GradientBased
    }
}

/// Tunables shared by the built-in strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySettings {
    /// Starting value for every parameter.
    pub initial_value: f64,
    pub tolerance: f64,
    pub learning_rate: f64,
    pub finite_difference_step: f64,
    pub initial_step: f64,
    pub spsa_a: f64,
    pub spsa_c: f64,
    pub seed: u64,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            initial_value: 0.0,
            tolerance: 1e-6,
            learning_rate: 0.4,
            finite_difference_step: 1e-4,
            initial_step: 0.5,
            spsa_a: 0.2,
            spsa_c: 0.1,
            seed: 42,
        }
    }
}

/// Builds a fresh strategy for a given dimension.
pub trait StrategyFactory: Send + Sync {
    fn create(&self, kind: StrategyKind, dimension: usize) -> Box<dyn SearchStrategy>;
}

/// Factory for the three built-in strategies.
#[derive(Debug, Clone, Default)]
pub struct DefaultStrategyFactory {
    pub settings: StrategySettings,
}

impl DefaultStrategyFactory {
    pub fn new(settings: StrategySettings) -> Self {
        Self { settings }
    }
}

impl StrategyFactory for DefaultStrategyFactory {
    fn create(&self, kind: StrategyKind, dimension: usize) -> Box<dyn SearchStrategy> {
        let start = vec![self.settings.initial_value; dimension];
        match kind {
            StrategyKind::GradientBased => Box::new(GradientDescent::new(start, &self.settings)),
            StrategyKind::DerivativeFree => Box::new(CompassSearch::new(start, &self.settings)),
            StrategyKind::StochasticPerturbation => Box::new(Spsa::new(start, &self.settings)),
        }
    }
}

/// Tracks the lowest observation.
#[derive(Debug, Clone, Default)]
struct BestPoint {
    point: Option<(Vec<f64>, f64)>,
}

impl BestPoint {
    fn offer(&mut self, parameters: &[f64], value: f64) {
        let improved = match &self.point {
            None => true,
            Some((_, best)) => value < *best,
        };
        if improved {
            self.point = Some((parameters.to_vec(), value));
        }
    }

    fn get(&self) -> Option<(&[f64], f64)> {
        self.point.as_ref().map(|(p, v)| (p.as_slice(), *v))
    }
}

// ---- Gradient descent ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GradientPhase {
    Base,
    Probe(usize),
}

/// Forward-difference gradient descent: one base evaluation plus one probe
/// per coordinate, then a step against the estimated gradient.
#[derive(Debug, Clone)]
pub struct GradientDescent {
    x: Vec<f64>,
    phase: GradientPhase,
    base_value: f64,
    gradient: Vec<f64>,
    learning_rate: f64,
    h: f64,
    tolerance: f64,
    converged: bool,
    best: BestPoint,
}

impl GradientDescent {
    pub fn new(start: Vec<f64>, settings: &StrategySettings) -> Self {
        let n = start.len();
        Self {
            x: start,
            phase: GradientPhase::Base,
            base_value: f64::NAN,
            gradient: vec![0.0; n],
            learning_rate: settings.learning_rate,
            h: settings.finite_difference_step,
            tolerance: settings.tolerance,
            converged: false,
            best: BestPoint::default(),
        }
    }
}

impl SearchStrategy for GradientDescent {
    fn kind(&self) -> StrategyKind {
        StrategyKind::GradientBased
    }

    fn propose(&mut self) -> Vec<f64> {
        let mut point = self.x.clone();
        if let GradientPhase::Probe(i) = self.phase {
            point[i] += self.h;
        }
        point
    }

    fn observe(&mut self, parameters: &[f64], value: f64) {
        self.best.offer(parameters, value);
        match self.phase {
            GradientPhase::Base => {
                self.base_value = value;
                if self.x.is_empty() {
                    self.converged = true;
                } else {
                    self.phase = GradientPhase::Probe(0);
                }
            }
            GradientPhase::Probe(i) => {
                self.gradient[i] = (value - self.base_value) / self.h;
                if i + 1 < self.x.len() {
                    self.phase = GradientPhase::Probe(i + 1);
                    return;
                }
                let norm = self.gradient.iter().map(|g| g * g).sum::<f64>().sqrt();
                if norm < self.tolerance {
                    self.converged = true;
                }
                for (xi, gi) in self.x.iter_mut().zip(&self.gradient) {
                    *xi -= self.learning_rate * gi;
                }
                self.phase = GradientPhase::Base;
            }
        }
    }

    fn has_converged(&self) -> bool {
        self.converged
    }

    fn best(&self) -> Option<(&[f64], f64)> {
        self.best.get()
    }
}

// ---- Compass search ----

/// Derivative-free coordinate pattern search. Tries `x ± step·eᵢ` for each
/// coordinate, keeps improvements, and halves the step after a sweep with
/// none.
#[derive(Debug, Clone)]
pub struct CompassSearch {
    x: Vec<f64>,
    fx: Option<f64>,
    step: f64,
    coordinate: usize,
    positive: bool,
    improved_this_sweep: bool,
    pending: Vec<f64>,
    tolerance: f64,
    best: BestPoint,
}

impl CompassSearch {
    pub fn new(start: Vec<f64>, settings: &StrategySettings) -> Self {
        Self {
            pending: start.clone(),
            x: start,
            fx: None,
            step: settings.initial_step,
            coordinate: 0,
            positive: true,
            improved_this_sweep: false,
            tolerance: settings.tolerance,
            best: BestPoint::default(),
        }
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    fn advance(&mut self) {
        self.positive = true;
        self.coordinate += 1;
        if self.coordinate >= self.x.len() {
            self.coordinate = 0;
            if !self.improved_this_sweep {
                self.step *= 0.5;
            }
            self.improved_this_sweep = false;
        }
    }
}

impl SearchStrategy for CompassSearch {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DerivativeFree
    }

    fn propose(&mut self) -> Vec<f64> {
        let mut point = self.x.clone();
        if self.fx.is_some() && !point.is_empty() {
            let delta = if self.positive { self.step } else { -self.step };
            point[self.coordinate] += delta;
        }
        self.pending = point.clone();
        point
    }

    fn observe(&mut self, parameters: &[f64], value: f64) {
        self.best.offer(parameters, value);
        let Some(fx) = self.fx else {
            self.fx = Some(value);
            return;
        };
        if value < fx {
            self.x = std::mem::take(&mut self.pending);
            self.fx = Some(value);
            self.improved_this_sweep = true;
            self.advance();
        } else if self.positive {
            self.positive = false;
        } else {
            self.advance();
        }
    }

    fn has_converged(&self) -> bool {
        (self.x.is_empty() && self.fx.is_some()) || self.step < self.tolerance
    }

    fn best(&self) -> Option<(&[f64], f64)> {
        self.best.get()
    }
}

// ---- SPSA ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpsaPhase {
    Plus,
    Minus { plus_value_bits: u64 },
}

/// Simultaneous perturbation stochastic approximation: two evaluations per
/// step along a random ±1 direction, with the standard decaying gains.
#[derive(Debug, Clone)]
pub struct Spsa {
    x: Vec<f64>,
    k: u32,
    delta: Vec<f64>,
    phase: SpsaPhase,
    a: f64,
    c: f64,
    rng: ChaCha8Rng,
    best: BestPoint,
}

impl Spsa {
    const ALPHA: f64 = 0.602;
    const GAMMA: f64 = 0.101;
    const STABILITY: f64 = 10.0;

    pub fn new(start: Vec<f64>, settings: &StrategySettings) -> Self {
        Self {
            delta: vec![0.0; start.len()],
            x: start,
            k: 0,
            phase: SpsaPhase::Plus,
            a: settings.spsa_a,
            c: settings.spsa_c,
            rng: ChaCha8Rng::seed_from_u64(settings.seed),
            best: BestPoint::default(),
        }
    }

    fn ck(&self) -> f64 {
        self.c / f64::from(self.k + 1).powf(Self::GAMMA)
    }

    fn ak(&self) -> f64 {
        self.a / (f64::from(self.k + 1) + Self::STABILITY).powf(Self::ALPHA)
    }

    fn perturbed(&self, sign: f64) -> Vec<f64> {
        let ck = self.ck();
        self.x
            .iter()
            .zip(&self.delta)
            .map(|(xi, di)| xi + sign * ck * di)
            .collect()
    }
}

impl SearchStrategy for Spsa {
    fn kind(&self) -> StrategyKind {
        StrategyKind::StochasticPerturbation
    }

    fn propose(&mut self) -> Vec<f64> {
        match self.phase {
            SpsaPhase::Plus => {
                for d in self.delta.iter_mut() {
                    *d = if self.rng.gen::<bool>() { 1.0 } else { -1.0 };
                }
                self.perturbed(1.0)
            }
            SpsaPhase::Minus { .. } => self.perturbed(-1.0),
        }
    }

    fn observe(&mut self, parameters: &[f64], value: f64) {
        self.best.offer(parameters, value);
        match self.phase {
            SpsaPhase::Plus => {
                self.phase = SpsaPhase::Minus {
                    plus_value_bits: value.to_bits(),
                };
            }
            SpsaPhase::Minus { plus_value_bits } => {
                let plus_value = f64::from_bits(plus_value_bits);
                let ck = self.ck();
                let ak = self.ak();
                for (xi, di) in self.x.iter_mut().zip(&self.delta) {
                    let g = (plus_value - value) / (2.0 * ck * di);
                    *xi -= ak * g;
                }
                self.k += 1;
                self.phase = SpsaPhase::Plus;
            }
        }
    }

    fn best(&self) -> Option<(&[f64], f64)> {
        self.best.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Convex bowl with its minimum at (1, -2).
    fn bowl(p: &[f64]) -> f64 {
        (p[0] - 1.0).powi(2) + (p[1] + 2.0).powi(2)
    }

    fn drive(strategy: &mut dyn SearchStrategy, evaluations: usize) -> f64 {
        for _ in 0..evaluations {
            if strategy.has_converged() {
                break;
            }
            let p = strategy.propose();
            let v = bowl(&p);
            strategy.observe(&p, v);
        }
        strategy.best().map(|(_, v)| v).unwrap()
    }

    #[test]
    fn factory_builds_requested_kind() {
        let factory = DefaultStrategyFactory::default();
        for kind in StrategyKind::ALL {
            let strategy = factory.create(kind, 3);
            assert_eq!(strategy.kind(), kind);
            assert!(strategy.best().is_none());
        }
    }

    #[test]
    fn gradient_descent_reduces_bowl() {
        let mut gd = GradientDescent::new(vec![0.0, 0.0], &StrategySettings::default());
        let start = bowl(&[0.0, 0.0]);
        let best = drive(&mut gd, 90);
        assert!(best < start * 0.01, "best {best}");
    }

    #[test]
    fn gradient_descent_probe_cycle() {
        let mut gd = GradientDescent::new(vec![0.0, 0.0], &StrategySettings::default());
        let base = gd.propose();
        assert_eq!(base, vec![0.0, 0.0]);
        gd.observe(&base, bowl(&base));
        let probe = gd.propose();
        assert!(probe[0] > 0.0 && probe[1] == 0.0);
    }

    #[test]
    fn compass_search_converges_on_bowl() {
        let settings = StrategySettings {
            tolerance: 1e-3,
            ..StrategySettings::default()
        };
        let mut cs = CompassSearch::new(vec![0.0, 0.0], &settings);
        let best = drive(&mut cs, 500);
        assert!(cs.has_converged());
        assert!(best < 1e-4, "best {best}");
    }

    #[test]
    fn compass_search_halves_step_without_improvement() {
        let mut cs = CompassSearch::new(vec![1.0, -2.0], &StrategySettings::default());
        let initial = cs.step();
        // Start at the optimum: base + 4 rejected probes completes one sweep.
        drive(&mut cs, 5);
        assert_eq!(cs.step(), initial * 0.5);
    }

    #[test]
    fn spsa_is_reproducible_for_a_seed() {
        let settings = StrategySettings::default();
        let mut a = Spsa::new(vec![0.0, 0.0], &settings);
        let mut b = Spsa::new(vec![0.0, 0.0], &settings);
        assert_eq!(drive(&mut a, 40), drive(&mut b, 40));
        assert!(!a.has_converged());
    }

    #[test]
    fn spsa_improves_on_start() {
        let mut spsa = Spsa::new(vec![0.0, 0.0], &StrategySettings::default());
        let best = drive(&mut spsa, 200);
        assert!(best < bowl(&[0.0, 0.0]));
    }

    #[test]
    fn selection_policy_by_electron_count() {
        let h2 = Configuration::new("H2", "Hydrogen").with_electrons(2);
        let lih = Configuration::new("LiH", "Lithium hydride").with_electrons(4);
        assert_eq!(select_strategy(&h2), StrategyKind::GradientBased);
        assert_eq!(select_strategy(&lih), StrategyKind::DerivativeFree);
    }
}
