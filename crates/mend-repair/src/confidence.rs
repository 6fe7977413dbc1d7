//! Confidence gate: a calibrated logistic score over evidence features and a
//! mode-dependent Proceed / Widen / Hold decision.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use mend_core::config::{ConfidenceConfig, ConfidenceWeights, GateMode};

use crate::types::{ConfidenceBreakdown, EvidenceFeatures, GateDecision};

/// Source of gate weights. Swappable without touching the gate.
pub trait Calibration: Send + Sync {
    fn weights(&self) -> ConfidenceWeights;
    fn name(&self) -> &str;
}

/// Weights taken from configuration.
pub struct StaticCalibration {
    weights: ConfidenceWeights,
}

impl StaticCalibration {
    pub fn new(weights: ConfidenceWeights) -> Self {
        Self { weights }
    }
}

impl Calibration for StaticCalibration {
    fn weights(&self) -> ConfidenceWeights {
        self.weights
    }

    fn name(&self) -> &str {
        "config"
    }
}

/// Weights fitted offline and stored as JSON (`.mend/calibration.json`).
pub struct FileCalibration {
    weights: ConfidenceWeights,
    source: String,
}

impl FileCalibration {
    pub fn load(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str::<ConfidenceWeights>(&content) {
            Ok(weights) => Some(Self {
                weights,
                source: path.display().to_string(),
            }),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unparsable calibration file");
                None
            }
        }
    }
}

impl Calibration for FileCalibration {
    fn weights(&self) -> ConfidenceWeights {
        self.weights
    }

    fn name(&self) -> &str {
        &self.source
    }
}

/// The calibration file under `mend_dir` if present, else config weights.
pub fn load_calibration(mend_dir: &Path, config: &ConfidenceConfig) -> Arc<dyn Calibration> {
    let path = if config.calibration_path.is_absolute() {
        config.calibration_path.clone()
    } else {
        mend_dir.join(&config.calibration_path)
    };
    match FileCalibration::load(&path) {
        Some(file) => Arc::new(file),
        None => Arc::new(StaticCalibration::new(config.weights)),
    }
}

pub struct ConfidenceGate {
    calibration: Arc<dyn Calibration>,
    mode: GateMode,
    accuracy_threshold: f64,
    fast_threshold: f64,
}

impl ConfidenceGate {
    pub fn new(config: &ConfidenceConfig, calibration: Arc<dyn Calibration>) -> Self {
        Self {
            calibration,
            mode: config.mode,
            accuracy_threshold: config.accuracy_threshold,
            fast_threshold: config.fast_threshold,
        }
    }

    pub fn from_config(config: &ConfidenceConfig) -> Self {
        Self::new(config, Arc::new(StaticCalibration::new(config.weights)))
    }

    pub fn mode(&self) -> GateMode {
        self.mode
    }

    pub fn threshold(&self) -> f64 {
        match self.mode {
            GateMode::AccuracyFirst => self.accuracy_threshold,
            GateMode::Fast => self.fast_threshold,
        }
    }

    /// Score in [0, 1].
    pub fn score(&self, features: &EvidenceFeatures) -> f64 {
        sigmoid(self.logit(features))
    }

    /// Below threshold widens once, then holds.
    pub fn decide(&self, score: f64, widened: bool) -> GateDecision {
        if score >= self.threshold() {
            GateDecision::Proceed
        } else if widened {
            GateDecision::Hold
        } else {
            GateDecision::Widen
        }
    }

    pub fn evaluate(&self, features: &EvidenceFeatures, widened: bool) -> ConfidenceBreakdown {
        let logit = self.logit(features);
        let score = sigmoid(logit);
        let decision = self.decide(score, widened);
        debug!(
            score,
            coverage = features.coverage,
            agreement = features.agreement,
            consistency = features.consistency,
            static_precheck = features.static_precheck,
            decision = decision.as_str(),
            "confidence evaluated"
        );
        ConfidenceBreakdown {
            features: *features,
            weights: self.calibration.weights(),
            calibration: self.calibration.name().to_string(),
            logit,
            score,
            threshold: self.threshold(),
            mode: self.mode,
            decision,
        }
    }

    fn logit(&self, f: &EvidenceFeatures) -> f64 {
        let w = self.calibration.weights();
        w.bias
            + w.coverage * unit(f.coverage)
            + w.agreement * unit(f.agreement)
            + w.consistency * unit(f.consistency)
            + w.static_precheck * unit(f.static_precheck)
    }
}

fn unit(x: f64) -> f64 {
    if x.is_finite() {
        x.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn sigmoid(x: f64) -> f64 {
    if x.is_nan() {
        return 0.0;
    }
    let p = if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    };
    p.clamp(0.0, 1.0)
}
