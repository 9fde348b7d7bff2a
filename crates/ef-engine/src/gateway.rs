//! Evaluator gateway: the boundary to the numerical backend.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use ef_types::{
    Configuration, ConfigurationKey, EvaluationError, ModelArtifact, PauliTerm,
    ResolvedConfiguration, TrialCircuit,
};

/// Builds models and evaluates the objective. Calls may be slow and may fail.
#[async_trait]
pub trait EvaluatorGateway: Send + Sync {
    async fn build_model(&self, configuration: &ResolvedConfiguration) -> Result<ModelArtifact, EvaluationError>;

    async fn evaluate(&self, circuit: &TrialCircuit, parameters: &[f64]) -> Result<f64, EvaluationError>;
}

/// Bound a gateway call by `timeout`.
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, EvaluationError>
where
    F: Future<Output = Result<T, EvaluationError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(EvaluationError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Morse-shaped potential energy profile of a diatomic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MorseProfile {
    /// Equilibrium bond length (Å).
    pub equilibrium: f64,
    /// Well depth (Ha).
    pub depth: f64,
    /// Width parameter (1/Å).
    pub width: f64,
    /// Energy at dissociation (Ha).
    pub asymptote: f64,
    /// Correlation energy at equilibrium (Ha).
    pub correlation: f64,
    pub qubits: usize,
}

impl MorseProfile {
    pub const H2: Self = Self {
        equilibrium: 0.735,
        depth: 0.187,
        width: 1.9,
        asymptote: -0.930,
        correlation: 0.0205,
        qubits: 4,
    };

    pub const LIH: Self = Self {
        equilibrium: 1.596,
        depth: 0.063,
        width: 1.2,
        asymptote: -7.800,
        correlation: 0.0192,
        qubits: 12,
    };

    /// Rough profile for configurations without a tabulated one.
    pub fn estimate(configuration: &Configuration) -> Self {
        let electrons = configuration.electrons.max(1) as f64;
        Self {
            equilibrium: configuration.bond_length,
            depth: 0.1,
            width: 1.5,
            asymptote: -0.5 * electrons * electrons,
            correlation: 0.01 * electrons,
            qubits: 2 * configuration.electrons.max(2) as usize,
        }
    }

    /// Mean-field (reference) energy at bond length `r`.
    pub fn reference(&self, r: f64) -> f64 {
        let x = 1.0 - (-self.width * (r - self.equilibrium)).exp();
        self.asymptote + self.depth * (x * x - 1.0)
    }

    /// Correlation grows as the bond stretches.
    pub fn correlation(&self, r: f64) -> f64 {
        self.correlation * (1.0 + 0.5 * (r - self.equilibrium).max(0.0))
    }

    /// Lowest reachable objective value at `r`.
    pub fn exact(&self, r: f64) -> f64 {
        self.reference(r) - self.correlation(r)
    }
}

type KeyPredicate = dyn Fn(&ConfigurationKey) -> bool + Send + Sync;

/// Analytic stand-in for a quantum chemistry backend.
///
/// The objective is `exact(r) + Σ s_k (1 - cos(θ_k - φ_k))`, scaled so that the
/// all-zero parameter vector reproduces the reference energy. Every strategy
/// therefore starts at the mean-field value and can reach the exact one.
pub struct SyntheticGateway {
    profiles: RwLock<HashMap<String, MorseProfile>>,
    fail_build: Option<Arc<KeyPredicate>>,
    fail_evaluate: Option<Arc<KeyPredicate>>,
    build_latency: Duration,
    evaluate_latency: Duration,
    build_calls: AtomicUsize,
    evaluate_calls: AtomicUsize,
}

impl SyntheticGateway {
    pub fn new() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert("H2".to_string(), MorseProfile::H2);
        profiles.insert("LiH".to_string(), MorseProfile::LIH);
        Self {
            profiles: RwLock::new(profiles),
            fail_build: None,
            fail_evaluate: None,
            build_latency: Duration::ZERO,
            evaluate_latency: Duration::ZERO,
            build_calls: AtomicUsize::new(0),
            evaluate_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_profile(self, configuration_id: impl Into<String>, profile: MorseProfile) -> Self {
        self.profiles.write().insert(configuration_id.into(), profile);
        self
    }

    /// Fail model construction for every key matching `predicate`.
    pub fn fail_build_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ConfigurationKey) -> bool + Send + Sync + 'static,
    {
        self.fail_build = Some(Arc::new(predicate));
        self
    }

    /// Fail every evaluation against a model whose key matches `predicate`.
    pub fn fail_evaluate_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ConfigurationKey) -> bool + Send + Sync + 'static,
    {
        self.fail_evaluate = Some(Arc::new(predicate));
        self
    }

    pub fn with_build_latency(mut self, latency: Duration) -> Self {
        self.build_latency = latency;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.evaluate_latency = latency;
        self
    }

    pub fn build_calls(&self) -> usize {
        self.build_calls.load(Ordering::SeqCst)
    }

    pub fn evaluate_calls(&self) -> usize {
        self.evaluate_calls.load(Ordering::SeqCst)
    }

    fn profile(&self, configuration_id: &str) -> Option<MorseProfile> {
        self.profiles.read().get(configuration_id).copied()
    }
}

impl Default for SyntheticGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EvaluatorGateway for SyntheticGateway {
    async fn build_model(&self, configuration: &ResolvedConfiguration) -> Result<ModelArtifact, EvaluationError> {
        self.build_calls.fetch_add(1, Ordering::SeqCst);
        if !self.build_latency.is_zero() {
            tokio::time::sleep(self.build_latency).await;
        }

        let key = &configuration.key;
        if let Some(predicate) = &self.fail_build {
            if predicate(key) {
                return Err(EvaluationError::BuildFailed {
                    configuration: key.to_string(),
                    message: "self-consistent field did not converge".to_string(),
                });
            }
        }

        let profile = match self.profile(&key.configuration_id) {
            Some(profile) => profile,
            None => {
                let estimated = MorseProfile::estimate(&configuration.configuration);
                self.profiles
                    .write()
                    .insert(key.configuration_id.clone(), estimated);
                estimated
            }
        };

        let r = key.bond_length();
        let reference = profile.reference(r);
        let terms = pauli_terms(profile.qubits, reference, r);
        debug!(key = %key, qubits = profile.qubits, terms = terms.len(), reference, "synthetic model built");

        Ok(ModelArtifact::new(key.clone(), profile.qubits, reference, terms))
    }

    async fn evaluate(&self, circuit: &TrialCircuit, parameters: &[f64]) -> Result<f64, EvaluationError> {
        self.evaluate_calls.fetch_add(1, Ordering::SeqCst);
        if !self.evaluate_latency.is_zero() {
            tokio::time::sleep(self.evaluate_latency).await;
        }

        if parameters.len() != circuit.parameter_count {
            return Err(EvaluationError::InvalidParameters {
                message: format!(
                    "expected {} parameters, got {}",
                    circuit.parameter_count,
                    parameters.len()
                ),
            });
        }
        if let Some(i) = parameters.iter().position(|p| !p.is_finite()) {
            return Err(EvaluationError::InvalidParameters {
                message: format!("parameter {i} is not finite"),
            });
        }

        let key = &circuit.model_key;
        if let Some(predicate) = &self.fail_evaluate {
            if predicate(key) {
                return Err(EvaluationError::EvaluateFailed {
                    message: format!("backend rejected job for {key}"),
                });
            }
        }
        let profile = self
            .profile(&key.configuration_id)
            .ok_or_else(|| EvaluationError::EvaluateFailed {
                message: format!("no model built for {key}"),
            })?;

        let r = key.bond_length();
        let phases: Vec<f64> = (0..parameters.len()).map(target_phase).collect();
        let raw_start: f64 = phases.iter().map(|phi| 1.0 - phi.cos()).sum();
        // Scale so the zero vector sits exactly at the reference energy.
        let scale = if raw_start > 0.0 {
            profile.correlation(r) / raw_start
        } else {
            0.0
        };
        let excess: f64 = parameters
            .iter()
            .zip(&phases)
            .map(|(theta, phi)| 1.0 - (theta - phi).cos())
            .sum();

        Ok(profile.exact(r) + scale * excess)
    }
}

/// Optimal angle of parameter `k`.
fn target_phase(k: usize) -> f64 {
    0.6 * ((k + 1) as f64 * 0.7).sin()
}

/// Deterministic qubit Hamiltonian: identity offset, Z occupations, ZZ
/// couplings and XXYY hopping, with coefficients bent by the bond length.
fn pauli_terms(qubits: usize, reference: f64, r: f64) -> Vec<PauliTerm> {
    let label = |ops: &[(usize, char)]| -> String {
        let mut chars = vec!['I'; qubits];
        for &(q, op) in ops {
            chars[q] = op;
        }
        chars.into_iter().collect()
    };
    let decay = (-0.5 * r).exp();

    let mut terms = vec![PauliTerm::new(label(&[]), reference * 0.5)];
    for q in 0..qubits {
        let sign = if q % 2 == 0 { 1.0 } else { -1.0 };
        terms.push(PauliTerm::new(label(&[(q, 'Z')]), sign * (0.17 + 0.05 * q as f64) * decay));
    }
    for q in 0..qubits.saturating_sub(1) {
        terms.push(PauliTerm::new(label(&[(q, 'Z'), (q + 1, 'Z')]), 0.12 * decay));
    }
    for q in 0..qubits.saturating_sub(3) {
        terms.push(PauliTerm::new(
            label(&[(q, 'X'), (q + 1, 'X'), (q + 2, 'Y'), (q + 3, 'Y')]),
            0.045 * decay,
        ));
    }
    terms
}
