// Properties of the confidence gate and of PreFlight stage ordering.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use mend_core::config::{ConfidenceConfig, ConfidenceWeights, GateMode, PreflightConfig};
use mend_core::store::RepairLedger;
use mend_core::types::{Diagnostic, StageStatus, ValidationStage};
use mend_repair::services::{BuildContext, BuildService, StageReport, TypeCheckService};
use mend_repair::types::ServiceError;
use mend_repair::{Candidate, CandidateOrigin, ConfidenceGate, EvidenceFeatures, FileEdit, GateDecision, Preflight};

use crate::common::{create_repo, in_memory_store, seed_runtime_graph, RUNTIME, RUNTIME_PATH};

const EXTREMES: [f64; 11] = [
    f64::NEG_INFINITY,
    -1e12,
    -1.0,
    0.0,
    0.25,
    0.5,
    0.99,
    1.0,
    7.5,
    f64::INFINITY,
    f64::NAN,
];

fn features(v: [f64; 4]) -> EvidenceFeatures {
    EvidenceFeatures {
        coverage: v[0],
        agreement: v[1],
        consistency: v[2],
        static_precheck: v[3],
    }
}

#[test]
/// Whatever the inputs, the score is a probability and the decision agrees
/// with the threshold.
fn test_confidence_is_bounded_for_any_features() {
    let steep = ConfidenceConfig {
        weights: ConfidenceWeights {
            bias: -1e9,
            coverage: 1e9,
            agreement: 1e9,
            consistency: 1e9,
            static_precheck: 1e9,
        },
        ..ConfidenceConfig::default()
    };
    let gates = [
        ConfidenceGate::from_config(&ConfidenceConfig::default()),
        ConfidenceGate::from_config(&ConfidenceConfig {
            mode: GateMode::Fast,
            ..ConfidenceConfig::default()
        }),
        ConfidenceGate::from_config(&steep),
    ];

    for gate in &gates {
        for a in EXTREMES {
            for b in EXTREMES {
                for c in EXTREMES {
                    for d in EXTREMES {
                        let f = features([a, b, c, d]);
                        let score = gate.score(&f);
                        assert!((0.0..=1.0).contains(&score), "score {score} for {f:?}");
                        let breakdown = gate.evaluate(&f, false);
                        assert_eq!(breakdown.score, score);
                        assert_eq!(
                            breakdown.decision == GateDecision::Proceed,
                            score >= gate.threshold(),
                            "decision {:?} at {score}",
                            breakdown.decision
                        );
                        if breakdown.decision != GateDecision::Proceed {
                            assert_eq!(gate.evaluate(&f, true).decision, GateDecision::Hold);
                        }
                    }
                }
            }
        }
    }
}

#[test]
/// With non-negative weights, more evidence never lowers the score.
fn test_confidence_is_monotone_in_each_feature() {
    let gate = ConfidenceGate::from_config(&ConfidenceConfig::default());
    let steps = [0.0, 0.1, 0.3, 0.5, 0.7, 0.9, 1.0];
    for base in [0.0, 0.5, 1.0] {
        for feature in 0..4 {
            let mut previous = f64::NEG_INFINITY;
            for step in steps {
                let mut v = [base; 4];
                v[feature] = step;
                let score = gate.score(&features(v));
                assert!(score >= previous, "feature {feature} at {step}: {score} < {previous}");
                previous = score;
            }
        }
    }
}

/// Fails one stage, for every candidate or only the listed ones.
#[derive(Default)]
struct StageScript {
    fail_at: Option<ValidationStage>,
    /// Report a service error instead of a failing stage.
    as_error: bool,
    /// Candidates the failure applies to; empty means all of them.
    only: Vec<String>,
}

impl StageScript {
    fn outcome(&self, stage: ValidationStage, candidate_id: &str) -> Result<StageReport, ServiceError> {
        let targeted = self.only.is_empty() || self.only.iter().any(|id| id == candidate_id);
        if self.fail_at != Some(stage) || !targeted {
            return Ok(StageReport::pass());
        }
        if self.as_error {
            return Err(ServiceError::Failed(format!("{stage} crashed")));
        }
        Ok(StageReport::fail(vec![Diagnostic::error(None, &format!("{stage} failed"))]))
    }
}

fn candidate_of(ctx: &BuildContext<'_>) -> String {
    ctx.cache_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl TypeCheckService for StageScript {
    async fn check_overlay(&self, _base: &Path, _overlay: &[FileEdit]) -> Result<Vec<Diagnostic>, ServiceError> {
        self.outcome(ValidationStage::InMemoryTypeCheck, "")
            .map(|report| report.diagnostics)
    }
}

#[async_trait]
impl BuildService for StageScript {
    async fn format_check(&self, ctx: BuildContext<'_>) -> Result<StageReport, ServiceError> {
        self.outcome(ValidationStage::FormatCheck, &candidate_of(&ctx))
    }

    async fn compile(&self, ctx: BuildContext<'_>) -> Result<StageReport, ServiceError> {
        self.outcome(ValidationStage::CompileCheck, &candidate_of(&ctx))
    }

    async fn run_tests(&self, ctx: BuildContext<'_>, tests: &[String]) -> Result<StageReport, ServiceError> {
        assert_eq!(tests, ["runtime::tests::spawn_runs".to_string()]);
        self.outcome(ValidationStage::SelectiveTests, &candidate_of(&ctx))
    }

    async fn lint(&self, ctx: BuildContext<'_>) -> Result<StageReport, ServiceError> {
        self.outcome(ValidationStage::LintCheck, &candidate_of(&ctx))
    }

    async fn public_api(&self, ctx: BuildContext<'_>) -> Result<StageReport, ServiceError> {
        self.outcome(ValidationStage::PublicApiCheck, &candidate_of(&ctx))
    }
}

fn candidate(id: &str, target: &str, bound: &str) -> Candidate {
    Candidate {
        id: id.to_string(),
        target: target.to_string(),
        origin: CandidateOrigin::Reasoner {
            raw_response: String::new(),
        },
        edits: vec![FileEdit {
            path: RUNTIME_PATH.to_string(),
            original: RUNTIME.to_string(),
            updated: RUNTIME.replace("<F>", &format!("<F: {bound}>")),
        }],
        touched: vec![target.to_string()],
        predicted: Vec::new(),
        consistency: 0.5,
    }
}

fn all_stages() -> PreflightConfig {
    PreflightConfig {
        lint: true,
        public_api: true,
        ..PreflightConfig::default()
    }
}

#[tokio::test]
/// Stages run in their fixed order and nothing runs after the first failure
/// or error; the ledger holds exactly what ran.
async fn test_stages_stop_at_first_failure() {
    let (_dir, root) = create_repo(&[(RUNTIME_PATH, RUNTIME)]);
    let store = in_memory_store();
    let graph = seed_runtime_graph(&store);
    let order = [
        ValidationStage::InMemoryTypeCheck,
        ValidationStage::FormatCheck,
        ValidationStage::CompileCheck,
        ValidationStage::SelectiveTests,
        ValidationStage::LintCheck,
        ValidationStage::PublicApiCheck,
    ];

    let mut cases: Vec<(Option<ValidationStage>, bool)> = vec![(None, false)];
    for stage in order {
        cases.push((Some(stage), false));
        cases.push((Some(stage), true));
    }

    for (i, (fail_at, as_error)) in cases.into_iter().enumerate() {
        let script = Arc::new(StageScript {
            fail_at,
            as_error,
            ..StageScript::default()
        });
        let preflight = Preflight::new(script.clone(), script, store.clone(), &all_stages(), &root);
        assert_eq!(preflight.stages(), order.to_vec());

        let c = candidate(&format!("case-{i}"), &graph.spawn.uid, "Send");
        let run = preflight.run(&c, &CancellationToken::new()).await;
        let ran: Vec<ValidationStage> = run.results.iter().map(|r| r.stage).collect();
        let expected_len = fail_at.map_or(order.len(), |stage| {
            order.iter().position(|s| *s == stage).unwrap() + 1
        });
        assert_eq!(ran, order[..expected_len].to_vec(), "case {fail_at:?} error={as_error}");

        let (last, earlier) = run.results.split_last().unwrap();
        assert!(earlier.iter().all(|r| r.status == StageStatus::Pass));
        let expected_status = match (fail_at, as_error) {
            (None, _) => StageStatus::Pass,
            (Some(_), false) => StageStatus::Fail,
            (Some(_), true) => StageStatus::Error,
        };
        assert_eq!(last.status, expected_status);
        assert_eq!(run.passed(), fail_at.is_none());
        assert_eq!(run.failed_stage(), fail_at);

        let recorded: Vec<ValidationStage> = store
            .validation_results(&c.id)
            .unwrap()
            .into_iter()
            .map(|r| r.stage)
            .collect();
        assert_eq!(recorded, ran);
    }
}

#[tokio::test]
/// A run cancelled before it starts records nothing and never passes.
async fn test_cancelled_run_records_nothing() {
    let (_dir, root) = create_repo(&[(RUNTIME_PATH, RUNTIME)]);
    let store = in_memory_store();
    let graph = seed_runtime_graph(&store);
    let script = Arc::new(StageScript::default());
    let preflight = Preflight::new(script.clone(), script, store.clone(), &PreflightConfig::default(), &root);

    let token = CancellationToken::new();
    token.cancel();
    let c = candidate("cancelled", &graph.spawn.uid, "Send");
    let run = preflight.run(&c, &token).await;
    assert!(run.cancelled);
    assert!(run.results.is_empty());
    assert!(!run.passed());
    assert!(store.validation_results(&c.id).unwrap().is_empty());
}

#[tokio::test]
/// For every pattern of compile failures over four siblings, the winner is
/// the lowest passing index and only higher indices are ever cancelled.
async fn test_winner_is_lowest_passing_index() {
    let (_dir, root) = create_repo(&[(RUNTIME_PATH, RUNTIME)]);
    let store = in_memory_store();
    let graph = seed_runtime_graph(&store);
    let bounds = ["Send", "Sync", "Unpin", "Clone"];

    for mask in 0u32..16 {
        let candidates: Vec<Candidate> = bounds
            .iter()
            .enumerate()
            .map(|(i, b)| candidate(&format!("m{mask}-c{i}"), &graph.spawn.uid, b))
            .collect();
        let failing: Vec<String> = candidates
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, c)| c.id.clone())
            .collect();
        let script = Arc::new(StageScript {
            fail_at: Some(ValidationStage::CompileCheck),
            only: failing,
            ..StageScript::default()
        });
        let config = PreflightConfig {
            parallelism: 3,
            ..PreflightConfig::default()
        };
        let preflight = Preflight::new(script.clone(), script, store.clone(), &config, &root);

        let selection = preflight.run_all(&candidates, &CancellationToken::new()).await;
        let expected = (0..bounds.len()).find(|i| mask & (1 << i) == 0);
        assert_eq!(selection.winner, expected, "mask {mask:04b}");
        assert_eq!(selection.runs.len(), candidates.len());
        for (i, run) in selection.runs.iter().enumerate() {
            assert_eq!(run.candidate_id, candidates[i].id);
            if run.cancelled {
                assert!(expected.is_some_and(|w| i > w), "mask {mask:04b}: index {i} cancelled");
            }
            if expected.map_or(true, |w| i <= w) {
                assert!(!run.cancelled);
                assert_eq!(run.passed(), Some(i) == expected);
            }
        }
        if let Some(w) = expected {
            assert!(selection.winner_run().unwrap().passed());
            assert_eq!(selection.winner_run().unwrap().candidate_id, candidates[w].id);
        }
    }
}
