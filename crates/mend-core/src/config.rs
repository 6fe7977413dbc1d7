//! Configuration file loading for mend.
//!
//! Reads `.mend/mend.json` and provides typed access to all settings.
//! Falls back to defaults when the config file is missing or incomplete.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Top-level mend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MendConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub patterns: PatternConfig,
    #[serde(default)]
    pub packer: PackerConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub confidence: ConfidenceConfig,
    #[serde(default)]
    pub preflight: PreflightConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// When the vector index follows graph writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexPolicy {
    /// Every commit updates the index before it is published.
    #[default]
    Inline,
    /// The index is only brought up to date by an explicit refresh or compaction.
    Deferred,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Embedding dimension; 0 adopts the first embedding seen.
    #[serde(default)]
    pub embedding_dim: usize,
    #[serde(default)]
    pub index_policy: IndexPolicy,
    /// Tombstone share above which an inline commit compacts the index.
    #[serde(default = "default_compaction_ratio")]
    pub compaction_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
    #[serde(default = "default_per_hop_cap")]
    pub per_hop_cap: usize,
    #[serde(default = "default_k")]
    pub k: usize,
    /// Upper bound on the size of the Needed set.
    #[serde(default = "default_needed_budget")]
    pub needed_budget: usize,
    #[serde(default = "default_w_graph")]
    pub w_graph: f64,
    #[serde(default = "default_w_vector")]
    pub w_vector: f64,
    #[serde(default)]
    pub widen: WidenConfig,
}

/// One widening step: applied at most once per retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WidenConfig {
    #[serde(default = "default_widen_hops")]
    pub extra_hops: u32,
    #[serde(default = "default_widen_k_factor")]
    pub k_factor: usize,
    /// Re-run pattern matching against the widened Needed set.
    #[serde(default = "default_true")]
    pub rematch_patterns: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    /// EMA weight given to the newest outcome.
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
    /// Extra pattern definitions (JSON array file, relative to `.mend/`).
    #[serde(default)]
    pub library_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackerConfig {
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    #[serde(default = "default_reasoner_timeout_secs")]
    pub reasoner_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    #[default]
    AccuracyFirst,
    Fast,
}

/// Logistic weights `w0..w4` for the confidence formula.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceWeights {
    pub bias: f64,
    pub coverage: f64,
    pub agreement: f64,
    pub consistency: f64,
    pub static_precheck: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            bias: -4.0,
            coverage: 2.0,
            agreement: 1.0,
            consistency: 2.5,
            static_precheck: 2.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceConfig {
    #[serde(default)]
    pub mode: GateMode,
    #[serde(default = "default_accuracy_threshold")]
    pub accuracy_threshold: f64,
    #[serde(default = "default_fast_threshold")]
    pub fast_threshold: f64,
    #[serde(default)]
    pub weights: ConfidenceWeights,
    /// Calibration file overriding `weights` (relative to `.mend/`).
    #[serde(default = "default_calibration_path")]
    pub calibration_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightConfig {
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_typecheck_timeout")]
    pub typecheck_timeout_secs: u64,
    #[serde(default = "default_format_timeout")]
    pub format_timeout_secs: u64,
    #[serde(default = "default_compile_timeout")]
    pub compile_timeout_secs: u64,
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,
    #[serde(default)]
    pub lint: bool,
    #[serde(default)]
    pub public_api: bool,
    /// Reverse-traversal depth when selecting impacted tests.
    #[serde(default = "default_test_hops")]
    pub test_hops: u32,
    /// Globs excluded when copying the repository into a shadow workspace.
    #[serde(default = "default_shadow_excludes")]
    pub shadow_excludes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_true() -> bool {
    true
}
fn default_compaction_ratio() -> f64 {
    0.3
}
fn default_max_hops() -> u32 {
    2
}
fn default_per_hop_cap() -> usize {
    50
}
fn default_k() -> usize {
    20
}
fn default_needed_budget() -> usize {
    50
}
fn default_w_graph() -> f64 {
    0.6
}
fn default_w_vector() -> f64 {
    0.4
}
fn default_widen_hops() -> u32 {
    1
}
fn default_widen_k_factor() -> usize {
    2
}
fn default_ema_alpha() -> f64 {
    0.1
}
fn default_token_budget() -> usize {
    6000
}
fn default_max_candidates() -> usize {
    3
}
fn default_reasoner_timeout_secs() -> u64 {
    45
}
fn default_accuracy_threshold() -> f64 {
    0.90
}
fn default_fast_threshold() -> f64 {
    0.70
}
fn default_calibration_path() -> PathBuf {
    PathBuf::from("calibration.json")
}
fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, 8)
}
fn default_typecheck_timeout() -> u64 {
    5
}
fn default_format_timeout() -> u64 {
    30
}
fn default_compile_timeout() -> u64 {
    60
}
fn default_test_timeout() -> u64 {
    60
}
fn default_test_hops() -> u32 {
    3
}
fn default_shadow_excludes() -> Vec<String> {
    vec!["target/**".into(), ".git/**".into(), ".mend/**".into()]
}
fn default_max_attempts() -> u32 {
    2
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 0,
            index_policy: IndexPolicy::Inline,
            compaction_ratio: default_compaction_ratio(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_hops: default_max_hops(),
            per_hop_cap: default_per_hop_cap(),
            k: default_k(),
            needed_budget: default_needed_budget(),
            w_graph: default_w_graph(),
            w_vector: default_w_vector(),
            widen: WidenConfig::default(),
        }
    }
}

impl Default for WidenConfig {
    fn default() -> Self {
        Self {
            extra_hops: default_widen_hops(),
            k_factor: default_widen_k_factor(),
            rematch_patterns: true,
        }
    }
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            ema_alpha: default_ema_alpha(),
            library_path: None,
        }
    }
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            max_candidates: default_max_candidates(),
            reasoner_timeout_secs: default_reasoner_timeout_secs(),
        }
    }
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            mode: GateMode::AccuracyFirst,
            accuracy_threshold: default_accuracy_threshold(),
            fast_threshold: default_fast_threshold(),
            weights: ConfidenceWeights::default(),
            calibration_path: default_calibration_path(),
        }
    }
}

impl ConfidenceConfig {
    pub fn threshold(&self) -> f64 {
        match self.mode {
            GateMode::AccuracyFirst => self.accuracy_threshold,
            GateMode::Fast => self.fast_threshold,
        }
    }
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            typecheck_timeout_secs: default_typecheck_timeout(),
            format_timeout_secs: default_format_timeout(),
            compile_timeout_secs: default_compile_timeout(),
            test_timeout_secs: default_test_timeout(),
            lint: false,
            public_api: false,
            test_hops: default_test_hops(),
            shadow_excludes: default_shadow_excludes(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

impl MendConfig {
    /// Load configuration from `mend.json` inside the given `.mend` directory.
    /// Returns defaults if the file doesn't exist or can't be parsed.
    pub fn load(mend_dir: &Path) -> Self {
        let config_path = mend_dir.join("mend.json");
        let content = match std::fs::read_to_string(&config_path) {
            Ok(c) => c,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str(&content) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(path = %config_path.display(), error = %e, "failed to parse config, using defaults");
                Self::default()
            }
        }
    }
}
