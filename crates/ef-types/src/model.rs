use serde::{Deserialize, Serialize};
use std::fmt;

/// Static description of a named molecular instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    pub id: String,
    pub description: String,
    /// Geometry with a `{r}` placeholder for the scanned bond length.
    pub geometry_template: String,
    pub charge: i32,
    pub spin: u32,
    pub basis: String,
    pub electrons: u32,
    pub atoms: u32,
    /// Bond length (Å) used when no scan value is supplied.
    pub bond_length: f64,
}

impl Configuration {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            geometry_template: String::new(),
            charge: 0,
            spin: 0,
            basis: "sto3g".to_string(),
            electrons: 2,
            atoms: 2,
            bond_length: 1.0,
        }
    }

    pub fn with_geometry(mut self, template: impl Into<String>, bond_length: f64) -> Self {
        self.geometry_template = template.into();
        self.bond_length = bond_length;
        self
    }

    pub fn with_electrons(mut self, electrons: u32) -> Self {
        self.electrons = electrons;
        self
    }

    pub fn with_basis(mut self, basis: impl Into<String>) -> Self {
        self.basis = basis.into();
        self
    }

    /// Resolve at the default bond length.
    pub fn resolve(&self) -> ResolvedConfiguration {
        self.resolve_at(self.bond_length)
    }

    /// Resolve at an explicit bond length.
    pub fn resolve_at(&self, bond_length: f64) -> ResolvedConfiguration {
        ResolvedConfiguration {
            key: ConfigurationKey::new(&self.id, bond_length),
            geometry: self.geometry_template.replace("{r}", &format!("{bond_length}")),
            configuration: self.clone(),
        }
    }
}

/// Cache key: configuration id plus the bond length rounded to 1e-6 Å.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationKey {
    pub configuration_id: String,
    pub bond_length_micros: i64,
}

impl ConfigurationKey {
    /// Bond lengths closer than this share a key.
    pub const RESOLUTION: f64 = 1e-6;
    /// Largest bond length accepted from a request, in Å.
    pub const MAX_BOND_LENGTH: f64 = 100.0;

    pub fn new(configuration_id: &str, bond_length: f64) -> Self {
        Self {
            configuration_id: configuration_id.to_string(),
            bond_length_micros: (bond_length * 1e6).round() as i64,
        }
    }

    pub fn bond_length(&self) -> f64 {
        self.bond_length_micros as f64 / 1e6
    }
}

impl fmt::Display for ConfigurationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:.6}", self.configuration_id, self.bond_length())
    }
}

/// A configuration bound to a concrete geometry, ready for model construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfiguration {
    pub key: ConfigurationKey,
    pub geometry: String,
    pub configuration: Configuration,
}

/// One weighted Pauli string of the qubit operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauliTerm {
    pub label: String,
    pub coefficient: f64,
}

/// Physical reading of a Pauli string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermKind {
    /// Constant energy offset.
    Identity,
    /// Electron occupation.
    Occupation,
    /// Electron hopping / excitation.
    Excitation,
    Mixed,
}

impl PauliTerm {
    pub fn new(label: impl Into<String>, coefficient: f64) -> Self {
        Self {
            label: label.into(),
            coefficient,
        }
    }

    pub fn kind(&self) -> TermKind {
        let has = |c: char| self.label.contains(c);
        if self.label.chars().all(|c| c == 'I') {
            TermKind::Identity
        } else if has('X') || has('Y') {
            TermKind::Excitation
        } else if has('Z') {
            TermKind::Occupation
        } else {
            TermKind::Mixed
        }
    }
}

/// Immutable output of model construction for one configuration key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelArtifact {
    pub key: ConfigurationKey,
    pub qubit_count: usize,
    pub term_count: usize,
    /// Classical (Hartree-Fock) energy of the same geometry.
    pub reference_value: f64,
    pub terms: Vec<PauliTerm>,
}

impl ModelArtifact {
    pub fn new(key: ConfigurationKey, qubit_count: usize, reference_value: f64, terms: Vec<PauliTerm>) -> Self {
        Self {
            key,
            qubit_count,
            term_count: terms.len(),
            reference_value,
            terms,
        }
    }

    /// Compact view for event payloads: the leading terms only.
    pub fn summary(&self, cached: bool) -> ModelSummary {
        ModelSummary {
            key: self.key.clone(),
            qubit_count: self.qubit_count,
            term_count: self.term_count,
            reference_value: self.reference_value,
            leading_terms: self
                .terms
                .iter()
                .take(ModelSummary::LEADING_TERMS)
                .map(|t| (t.clone(), t.kind()))
                .collect(),
            cached,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSummary {
    pub key: ConfigurationKey,
    pub qubit_count: usize,
    pub term_count: usize,
    pub reference_value: f64,
    pub leading_terms: Vec<(PauliTerm, TermKind)>,
    /// `true` when the artifact came from the cache and construction was skipped.
    pub cached: bool,
}

impl ModelSummary {
    pub const LEADING_TERMS: usize = 10;
}

/// Hardware-efficient ansatz layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnsatzDescriptor {
    pub rotation_blocks: Vec<String>,
    pub entanglement_block: String,
    pub entanglement: String,
    pub reps: usize,
}

impl Default for AnsatzDescriptor {
    fn default() -> Self {
        Self {
            rotation_blocks: vec!["ry".to_string(), "rz".to_string()],
            entanglement_block: "cx".to_string(),
            entanglement: "linear".to_string(),
            reps: 2,
        }
    }
}

/// Parameterized trial state derived from a [`ModelArtifact`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialCircuit {
    pub model_key: ConfigurationKey,
    pub qubit_count: usize,
    pub parameter_count: usize,
    pub descriptor: AnsatzDescriptor,
}

impl TrialCircuit {
    pub fn from_artifact(artifact: &ModelArtifact) -> Self {
        Self::with_descriptor(artifact, AnsatzDescriptor::default())
    }

    pub fn with_descriptor(artifact: &ModelArtifact, descriptor: AnsatzDescriptor) -> Self {
        // One rotation layer per repetition plus the final layer.
        let parameter_count =
            artifact.qubit_count * descriptor.rotation_blocks.len() * (descriptor.reps + 1);
        Self {
            model_key: artifact.key.clone(),
            qubit_count: artifact.qubit_count,
            parameter_count,
            descriptor,
        }
    }
}
