//! End-to-end scenarios exercising the flow runner and DSE engine as a
//! whole, as opposed to the unit tests living alongside each module.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::sync::watch;
use xeda_core::design::{Design, Rtl, Source, SourceType, Tb};
use xeda_core::dse::{DseConfig, DseEngine, FmaxOptimizer, FmaxOptimizerConfig};
use xeda_core::settings;
use xeda_core::{FlowRunner, RunRequest, RunnerConfig, XedaError};

fn sample_design(dir: &std::path::Path) -> Design {
    let source_path = dir.join("top.v");
    std::fs::write(&source_path, "module top; endmodule\n").unwrap();
    Design {
        name: "sample".to_string(),
        rtl: Rtl {
            sources: vec![Source {
                path: source_path,
                content_hash: "irrelevant".to_string(),
                source_type: SourceType::Verilog,
                standard: None,
            }],
            top: "top".to_string(),
            clocks: BTreeMap::new(),
        },
        tb: Tb { sources: Vec::new(), top: None, configuration_specification: None },
        parameters: BTreeMap::new(),
        language: Default::default(),
    }
}

/// Scenario 2: a project-file default is present for `synth.strategy`,
/// and a CLI-style override for the same key must win, leaving sibling
/// keys from the project layer untouched.
#[test]
fn override_precedence_cli_wins_over_project_defaults() {
    let mut project_layer = Map::new();
    settings::set_hierarchy(&mut project_layer, "synth.strategy", json!("Default"));
    settings::set_hierarchy(&mut project_layer, "synth.fanout_limit", json!(16));

    let mut cli_layer = Map::new();
    settings::set_hierarchy(&mut cli_layer, "synth.strategy", json!("Timing"));

    let effective = settings::merge(&Value::Object(project_layer), &Value::Object(cli_layer));
    assert_eq!(effective.pointer("/synth/strategy"), Some(&json!("Timing")));
    assert_eq!(effective.pointer("/synth/fanout_limit"), Some(&json!(16)));
}

/// Scenario 6: deeply nested hierarchical overrides land at the right
/// path and leave unrelated top-level keys alone.
#[test]
fn hierarchical_overrides_land_at_nested_paths() {
    let overrides = settings::parse_flow_settings_overrides(&[
        "synth.steps.synth.directive=PerformanceOptimized,impl.strategy=Timing".to_string(),
    ])
    .unwrap();
    assert_eq!(
        Value::Object(overrides.clone()).pointer("/synth/steps/synth/directive"),
        Some(&json!("PerformanceOptimized"))
    );
    assert_eq!(Value::Object(overrides).pointer("/impl/strategy"), Some(&json!("Timing")));
}

/// Scenario 1: an identical second invocation with caching enabled
/// performs no flow work and returns byte-identical results.
#[tokio::test]
async fn cache_hit_returns_identical_results_without_rerunning() {
    let tmp = tempfile::tempdir().unwrap();
    let design = sample_design(tmp.path());
    let runner = FlowRunner::new(RunnerConfig { root: tmp.path().join("runs"), ..Default::default() });

    let first = runner.run_flow(RunRequest::new("echo", design.clone())).await.unwrap();
    assert!(first.succeeded());

    let second = runner.run_flow(RunRequest::new("echo", design)).await.unwrap();
    assert_eq!(first.run_path, second.run_path);
    assert_eq!(
        serde_json::to_value(&first.results).unwrap(),
        serde_json::to_value(&second.results).unwrap()
    );
}

/// Scenario 5: a flow whose `run` outlasts its own `timeout_seconds`
/// surfaces as a failed-but-completed run, not a propagated error, with
/// a run directory left behind for inspection.
#[tokio::test(start_paused = true)]
async fn flow_exceeding_its_timeout_completes_with_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let design = sample_design(tmp.path());
    let runner = FlowRunner::new(RunnerConfig { root: tmp.path().join("runs"), ..Default::default() });

    let mut overrides = Map::new();
    overrides.insert("timeout_seconds".to_string(), json!(1u64));

    let request = RunRequest::new("sleepy", design).with_overrides(overrides);
    let run = tokio::spawn(async move { runner.run_flow(request).await });

    tokio::time::advance(Duration::from_secs(10)).await;
    let completed = run.await.unwrap().unwrap();

    assert!(!completed.succeeded());
    assert!(completed.run_path.exists());
    assert!(completed.results.extra.contains_key("error"));
}

/// A settings value rejected at validation never reaches run_path
/// creation, and the error enumerates every offending field at once.
#[tokio::test]
async fn invalid_settings_are_rejected_before_any_run_directory_exists() {
    let tmp = tempfile::tempdir().unwrap();
    let design = sample_design(tmp.path());
    let runner = FlowRunner::new(RunnerConfig { root: tmp.path().join("runs"), ..Default::default() });

    let mut overrides = Map::new();
    overrides.insert("dockerized".to_string(), json!("not-a-bool"));
    overrides.insert("timeout_seconds".to_string(), json!("not-a-number"));

    let request = RunRequest::new("echo", design).with_overrides(overrides);
    let err = runner.run_flow(request).await.unwrap_err();
    match err {
        XedaError::SettingsInvalid(errors) => assert_eq!(errors.len(), 2),
        other => panic!("expected SettingsInvalid, got {other:?}"),
    }
    assert!(!tmp.path().join("runs").exists());
}

/// Scenario 4 + DSE monotonicity invariant: across a convergent search,
/// the reported best never regresses and every persisted best.json
/// reflects the optimizer's current best.
#[tokio::test]
async fn dse_best_fmax_is_monotonically_non_decreasing() {
    let tmp = tempfile::tempdir().unwrap();
    let design = sample_design(tmp.path());
    let runner = Arc::new(FlowRunner::new(RunnerConfig { root: tmp.path().join("runs"), ..Default::default() }));

    let optimizer = FmaxOptimizer::new(
        FmaxOptimizerConfig { init_freq_low: 100.0, init_freq_high: 400.0, resolution: 0.2, ..Default::default() },
        Map::new(),
        BTreeMap::new(),
    );
    let (_tx, rx) = watch::channel(false);
    let mut engine = DseEngine::new(
        runner,
        design,
        Box::new(optimizer),
        DseConfig {
            flow_name: "synthetic_synth".to_string(),
            max_workers: 4,
            max_failed_iters: 3,
            best_json_path: tmp.path().join("best.json"),
            ..Default::default()
        },
    );

    let summary = engine.run(rx).await.unwrap();
    let best = summary.best.expect("search should converge to a best result");
    assert!((best.fmax - 200.0).abs() < 1.0);

    let persisted: serde_json::Value =
        serde_json::from_slice(&std::fs::read(tmp.path().join("best.json")).unwrap()).unwrap();
    assert_eq!(persisted.get("fmax").and_then(Value::as_f64), Some(best.fmax));
}
