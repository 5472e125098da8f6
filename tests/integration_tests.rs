//! Integration tests for Windlass
//!
//! Engine scenarios drive the public scheduler with scripted collaborators;
//! CLI tests run the `windlass` binary against files in a temp directory.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

use serde_json::{Value, json};
use windlass::cascade::PhaseDef;
use windlass::context::Retention;
use windlass::echo::{ErrorKind, Role};
use windlass::provider::CompletionResponse;
use windlass::scheduler::{CascadeScheduler, RunStatus};
use windlass::soundings::{EvaluatorChoice, SoundingsSpec};
use windlass::test_support::{
    CountingValidator, FixedEvaluator, ScriptedProvider, cascade_of, test_runtime,
};
use windlass::trace::{MemoryTraceSink, TraceKind};
use windlass::validation::{ValidatorRegistry, WardDef, WardMode, WardsSpec};

/// Helper to create a windlass Command
fn windlass() -> Command {
    cargo_bin_cmd!("windlass")
}

fn sounding(name: &str, instructions: &str, factor: usize) -> PhaseDef {
    let mut phase = PhaseDef::new(name, instructions);
    phase.soundings = Some(SoundingsSpec::with_factor(factor));
    phase
}

fn post_ward(phase: &mut PhaseDef, ward: WardDef) {
    phase.wards = Some(WardsSpec {
        pre: Vec::new(),
        post: vec![ward],
    });
}

// =============================================================================
// Cascade execution
// =============================================================================

mod execution {
    use super::*;

    #[tokio::test]
    async fn test_draft_review_keeps_only_the_winner() {
        let provider = ScriptedProvider::new(|request| {
            let reply = match request.meta.phase.as_str() {
                "draft" => format!("draft from {}", request.meta.attempt),
                _ => "reviewed".to_string(),
            };
            Ok(CompletionResponse::text(reply))
        });
        let sink = Arc::new(MemoryTraceSink::new());
        let scheduler = CascadeScheduler::new(
            test_runtime(provider.clone())
                .with_evaluator(Arc::new(FixedEvaluator::winner(1)))
                .with_trace_sink(sink.clone())
                .build()
                .unwrap(),
        );
        let cascade = cascade_of(vec![
            sounding("draft", "Write about {{ input.topic }}", 3),
            PhaseDef::new("review", "Review the draft"),
        ]);

        let outcome = scheduler.run(&cascade, json!({"topic": "tides"})).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.output("draft"), Some("draft from r0.s0.c1"));
        let review = provider
            .requests()
            .into_iter()
            .find(|r| r.meta.phase == "review")
            .unwrap();
        let texts: Vec<&str> = review.messages.iter().map(|m| m.text.as_str()).collect();
        assert!(texts.contains(&"draft from r0.s0.c1"));
        assert!(!texts.iter().any(|t| t.contains("r0.s0.c0") || t.contains("r0.s0.c2")));

        assert_eq!(sink.for_phase(TraceKind::Candidate, "draft").len(), 3);
        assert_eq!(sink.for_phase(TraceKind::Evaluation, "draft").len(), 1);
    }

    #[tokio::test]
    async fn test_blocking_post_ward_aborts_cascade() {
        let provider = ScriptedProvider::replies(&["not good enough"]);
        let validators = ValidatorRegistry::new().with(
            "strict",
            "Must be perfect",
            Arc::new(CountingValidator::failing_times(u32::MAX)),
        );
        let scheduler = CascadeScheduler::new(
            test_runtime(provider.clone())
                .with_validators(validators)
                .build()
                .unwrap(),
        );
        let mut first = PhaseDef::new("first", "Do it");
        post_ward(&mut first, WardDef::new("strict", WardMode::Blocking));
        let cascade = cascade_of(vec![first, PhaseDef::new("second", "Never runs")]);

        let outcome = scheduler.run(&cascade, Value::Null).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.failed_phase.as_deref(), Some("first"));
        assert!(outcome.outputs.is_empty());
        assert!(provider.requests().iter().all(|r| r.meta.phase == "first"));
        assert!(outcome.errors().iter().any(|e| e.kind == ErrorKind::Validation && !e.recovered));
    }

    #[tokio::test]
    async fn test_retry_ward_passes_on_third_execution() {
        let provider = ScriptedProvider::replies(&["one", "two", "three"]);
        let validator = Arc::new(CountingValidator::failing_times(2));
        let validators = ValidatorRegistry::new().with("eventually", "", validator.clone());
        let scheduler = CascadeScheduler::new(
            test_runtime(provider.clone())
                .with_validators(validators)
                .build()
                .unwrap(),
        );
        let mut phase = PhaseDef::new("write", "Write");
        post_ward(
            &mut phase,
            WardDef::new("eventually", WardMode::Retry).with_max_attempts(3),
        );

        let outcome = scheduler.run(&cascade_of(vec![phase]), Value::Null).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(provider.calls(), 3);
        assert_eq!(validator.calls(), 3);
        assert_eq!(outcome.final_output(), Some("three"));
        assert!(!outcome.echo.has_errors());
        // both rejection reasons reach the third execution
        let third = &provider.requests()[2].messages[0].text;
        assert!(third.contains("rejected on call 1"));
        assert!(third.contains("rejected on call 2"));
    }

    #[tokio::test]
    async fn test_evaluator_tie_picks_lowest_index() {
        let provider = ScriptedProvider::by_attempt(|label| format!("answer {}", label));
        let scheduler = CascadeScheduler::new(
            test_runtime(provider)
                .with_evaluator(Arc::new(FixedEvaluator::new(EvaluatorChoice::Tie(vec![2, 1]))))
                .build()
                .unwrap(),
        );
        let cascade = cascade_of(vec![sounding("pick", "Answer", 3)]);

        for _ in 0..3 {
            let outcome = scheduler.run(&cascade, Value::Null).await.unwrap();
            assert_eq!(outcome.final_output(), Some("answer r0.s0.c1"));
        }
    }

    #[tokio::test]
    async fn test_single_sounding_matches_bare_phase() {
        let bare_provider = ScriptedProvider::replies(&["same answer"]);
        let bare = CascadeScheduler::new(test_runtime(bare_provider.clone()).build().unwrap())
            .run(&cascade_of(vec![PhaseDef::new("p", "Go")]), Value::Null)
            .await
            .unwrap();

        let sounded_provider = ScriptedProvider::replies(&["same answer"]);
        let sounded = CascadeScheduler::new(test_runtime(sounded_provider.clone()).build().unwrap())
            .run(&cascade_of(vec![sounding("p", "Go", 1)]), Value::Null)
            .await
            .unwrap();

        assert_eq!(bare.outputs, sounded.outputs);
        assert_eq!(bare.status, sounded.status);
        assert_eq!(bare_provider.calls(), sounded_provider.calls());
        assert_eq!(
            bare.echo.record("p").unwrap().attempt,
            sounded.echo.record("p").unwrap().attempt
        );
    }

    #[tokio::test]
    async fn test_output_only_retention_hides_upstream_turns() {
        let provider = ScriptedProvider::by_phase_turn(|phase, turn| match (phase, turn) {
            ("research", 1) => {
                r#"{"tool": "set_state", "arguments": {"key": "notes", "value": "n"}}"#.into()
            }
            ("research", _) => "research summary".into(),
            _ => "final".into(),
        });
        let scheduler = CascadeScheduler::new(test_runtime(provider.clone()).build().unwrap());
        let mut research = PhaseDef::new("research", "Research").with_tools(&["set_state"]);
        research.retention = Some(Retention::OutputOnly);
        let cascade = cascade_of(vec![research, PhaseDef::new("write", "Write")]);

        let outcome = scheduler.run(&cascade, Value::Null).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.state()["notes"], json!("n"));

        let write = provider
            .requests()
            .into_iter()
            .find(|r| r.meta.phase == "write")
            .unwrap();
        let upstream: Vec<_> = write.messages.iter().filter(|m| m.phase == "research").collect();
        assert_eq!(upstream.len(), 1);
        assert_eq!(upstream[0].role, Role::Assistant);
        assert_eq!(upstream[0].text, "research summary");
    }

    #[tokio::test]
    async fn test_failing_token_budget_fails_instead_of_truncating() {
        let long = "word ".repeat(400);
        let provider = ScriptedProvider::by_phase(move |phase| match phase {
            "gather" => long.clone(),
            _ => "unreachable".into(),
        });
        let scheduler = CascadeScheduler::new(test_runtime(provider.clone()).build().unwrap());
        let mut summarize = PhaseDef::new("summarize", "Summarize");
        summarize.token_budget = Some(windlass::context::TokenBudgetSpec::new(
            "50",
            windlass::context::BudgetStrategy::Fail,
        ));
        let cascade = cascade_of(vec![PhaseDef::new("gather", "Gather"), summarize]);

        let outcome = scheduler.run(&cascade, Value::Null).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.failed_phase.as_deref(), Some("summarize"));
        assert!(provider.requests().iter().all(|r| r.meta.phase != "summarize"));
        assert!(outcome.errors().iter().any(|e| e.kind == ErrorKind::Resource));
    }

    #[tokio::test]
    async fn test_loop_until_exhaustion_is_distinct_from_transport() {
        let provider = ScriptedProvider::replies(&["almost"]);
        let validators = ValidatorRegistry::new().with(
            "never",
            "",
            Arc::new(CountingValidator::failing_times(u32::MAX)),
        );
        let scheduler = CascadeScheduler::new(
            test_runtime(provider)
                .with_validators(validators)
                .build()
                .unwrap(),
        );
        let mut phase = PhaseDef::new("p", "Converge");
        phase.rules.loop_until = Some("never".into());
        phase.rules.max_turns = Some(2);

        let outcome = scheduler.run(&cascade_of(vec![phase]), Value::Null).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        let kinds: Vec<ErrorKind> = outcome.errors().iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&ErrorKind::Resource));
        assert!(!kinds.contains(&ErrorKind::Transport));
    }
}

// =============================================================================
// Cancellation
// =============================================================================

mod cancellation {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use windlass::errors::ProviderError;
    use windlass::provider::{CompletionRequest, ModelProvider};

    /// Aborts the execution from inside the first model call.
    struct AbortingProvider {
        abort: CancellationToken,
    }

    #[async_trait]
    impl ModelProvider for AbortingProvider {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, ProviderError> {
            self.abort.cancel();
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(CompletionResponse::text("too late"))
        }
    }

    #[tokio::test]
    async fn test_abort_during_exploration_merges_nothing() {
        let abort = CancellationToken::new();
        let provider = Arc::new(AbortingProvider {
            abort: abort.clone(),
        });
        let scheduler = CascadeScheduler::new(
            test_runtime(provider)
                .with_evaluator(Arc::new(FixedEvaluator::winner(0)))
                .build()
                .unwrap(),
        );
        let handle = scheduler.abort_handle();
        tokio::spawn(async move {
            abort.cancelled().await;
            handle.cancel();
        });

        let cascade = cascade_of(vec![sounding("explore", "Explore", 3)]);
        let outcome = scheduler.run(&cascade, Value::Null).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.echo.record("explore").is_none());
        assert!(outcome.errors().iter().any(|e| e.kind == ErrorKind::Cancelled));
    }
}

// =============================================================================
// CLI
// =============================================================================

const BLOG_YAML: &str = r#"
cascade_id: blog
description: Draft and review a post
phases:
  - name: draft
    instructions: "Write about {{ input.topic }}"
    soundings:
      factor: 3
    handoffs: [review]
  - name: review
    instructions: "Tighten it"
    handoffs: []
"#;

mod cli {
    use super::*;

    fn write_cascade(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_windlass_help() {
        windlass()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("validate"));
    }

    #[test]
    fn test_windlass_version() {
        windlass().arg("--version").assert().success();
    }

    #[test]
    fn test_validate_prints_routing() {
        let dir = TempDir::new().unwrap();
        let path = write_cascade(&dir, "blog.yaml", BLOG_YAML);

        windlass()
            .current_dir(dir.path())
            .arg("validate")
            .arg(&path)
            .assert()
            .success()
            .stdout(predicate::str::contains("Cascade 'blog' is valid"))
            .stdout(predicate::str::contains("draft (soundings x3)"))
            .stdout(predicate::str::contains("draft -> review"))
            .stdout(predicate::str::contains("review -> (end)"));
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let dir = TempDir::new().unwrap();
        let path = write_cascade(
            &dir,
            "loop.json",
            r#"{"cascade_id": "loop", "phases": [
                {"name": "a", "instructions": "x", "handoffs": ["b"]},
                {"name": "b", "instructions": "y", "handoffs": ["a"]}
            ]}"#,
        );

        windlass()
            .current_dir(dir.path())
            .arg("validate")
            .arg(&path)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Routing cycle detected"));
    }

    #[test]
    fn test_species_is_stable_per_phase() {
        let dir = TempDir::new().unwrap();
        let path = write_cascade(&dir, "blog.yaml", BLOG_YAML);

        let first = windlass()
            .current_dir(dir.path())
            .args(["species", "--phase", "draft"])
            .arg(&path)
            .output()
            .unwrap();
        let second = windlass()
            .current_dir(dir.path())
            .args(["species", "--phase", "draft"])
            .arg(&path)
            .output()
            .unwrap();
        assert!(first.status.success());
        assert_eq!(first.stdout, second.stdout);
        let line = String::from_utf8_lossy(&first.stdout);
        let hash = line.split_whitespace().next().unwrap();
        assert_eq!(hash.len(), 64);
        assert!(line.contains("draft"));
        assert!(!line.contains("review"));
    }

    #[test]
    fn test_species_unknown_phase_fails() {
        let dir = TempDir::new().unwrap();
        let path = write_cascade(&dir, "blog.yaml", BLOG_YAML);

        windlass()
            .current_dir(dir.path())
            .args(["species", "--phase", "missing"])
            .arg(&path)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Phase 'missing' not found"));
    }

    #[test]
    fn test_winners_lists_newest_first() {
        let dir = TempDir::new().unwrap();
        let winners = dir.path().join("winners");
        fs::create_dir_all(&winners).unwrap();
        fs::write(
            winners.join("abc123.jsonl"),
            concat!(
                r#"{"text": "older rewrite", "recorded_at": "2026-01-01T00:00:00Z"}"#,
                "\n",
                r#"{"text": "newer rewrite", "recorded_at": "2026-02-01T00:00:00Z"}"#,
                "\n"
            ),
        )
        .unwrap();

        let output = windlass()
            .current_dir(dir.path())
            .env("WINDLASS_DATA_DIR", dir.path())
            .args(["winners", "abc123", "-k", "1"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("newer rewrite"));
        assert!(!stdout.contains("older rewrite"));
    }

    #[test]
    fn test_trace_summary() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace.jsonl");
        let record = |kind: &str, phase: &str, tokens: u64| {
            json!({
                "id": uuid::Uuid::new_v4().to_string(),
                "parent_id": null,
                "execution_id": "exec-1",
                "kind": kind,
                "phase": phase,
                "attempt": "r0.s0.c0",
                "timestamp": "2026-03-01T12:00:00Z",
                "duration_ms": 5,
                "tokens": tokens,
                "cost_usd": 0.25,
                "detail": {}
            })
            .to_string()
        };
        let lines = [
            record("phase_started", "draft", 0),
            record("turn", "draft", 40),
            record("turn", "draft", 60),
            record("candidate", "draft", 100),
        ];
        fs::write(&path, lines.join("\n")).unwrap();

        windlass()
            .current_dir(dir.path())
            .arg("trace")
            .arg(&path)
            .assert()
            .success()
            .stdout(predicate::str::contains("4 records across 1 execution(s)"))
            .stdout(predicate::str::contains("tokens: 100"))
            .stdout(predicate::str::contains("cost:   $0.5000"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("windlass.toml"),
            "[engine]\nmax_parallel = 0\n",
        )
        .unwrap();

        windlass()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("engine.max_parallel is 0"));
    }

    #[test]
    fn test_invalid_config_file_fails() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("windlass.toml"), "[engine\n").unwrap();

        windlass()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("windlass.toml"));
    }
}
