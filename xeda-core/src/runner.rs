//! Flow Runner: the central orchestration algorithm tying settings,
//! hashing, run directories, the flow registry, and process supervision
//! together into one cacheable invocation.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_recursion::async_recursion;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::design::Design;
use crate::error::{Result, XedaError};
use crate::flow::{Artifact, CompletedDependency, FlowContext, FlowResults};
use crate::hash::semantic_hash_of;
use crate::registry;
use crate::run_dir::{self, PreexistencePolicy, RunRecordHeader};
use crate::settings;
use crate::timestamp;
use crate::util::WorkingDirectoryGuard;

/// Policy knobs that apply to every invocation made through one runner,
/// independent of which flow is being launched.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub root: PathBuf,
    pub incremental: bool,
    pub incremental_fresh: bool,
    pub backups: bool,
    pub scrub_old_runs: bool,
    pub cached_dependencies: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            root: PathBuf::from("xeda_run"),
            incremental: false,
            incremental_fresh: false,
            backups: true,
            scrub_old_runs: false,
            cached_dependencies: true,
        }
    }
}

/// A single flow invocation's inputs: which flow, on which design, with
/// which settings overrides layered on top of whatever the flow's own
/// constructor defaults to.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub flow_name: String,
    pub design: Design,
    pub overrides: Map<String, Value>,
    pub parent_debug: bool,
    pub parent_verbose: u32,
    /// Already resolved to absolute paths (a depender resolves its
    /// dependency's relative resource list against its own run_path
    /// before recursing).
    pub resources_to_copy: Vec<PathBuf>,
}

impl RunRequest {
    pub fn new(flow_name: impl Into<String>, design: Design) -> Self {
        RunRequest {
            flow_name: flow_name.into(),
            design,
            overrides: Map::new(),
            parent_debug: false,
            parent_verbose: 0,
            resources_to_copy: Vec::new(),
        }
    }

    pub fn with_overrides(mut self, overrides: Map<String, Value>) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Outcome of a completed (or cache-reused) flow invocation.
#[derive(Debug, Clone)]
pub struct CompletedFlow {
    pub flow_name: String,
    pub run_path: PathBuf,
    pub design_hash: String,
    pub flow_hash: String,
    pub results: FlowResults,
    pub artifacts: BTreeMap<String, Artifact>,
    pub completed_dependencies: Vec<CompletedDependency>,
}

impl CompletedFlow {
    pub fn succeeded(&self) -> bool {
        self.results.success
    }
}

pub struct FlowRunner {
    config: RunnerConfig,
}

const ARTIFACTS_KEY: &str = "_artifacts";

impl FlowRunner {
    pub fn new(config: RunnerConfig) -> Self {
        FlowRunner { config }
    }

    /// Runs `request.flow_name` against `request.design`, recursing into
    /// any dependencies the flow's `init` declares, and returns once the
    /// flow (or a cached equivalent) has produced results.
    #[async_recursion]
    pub async fn run_flow(&self, request: RunRequest) -> Result<CompletedFlow> {
        let descriptor = registry::get_flow_class(&request.flow_name)?;

        let mut effective_settings = request.overrides.clone();
        if request.parent_debug {
            effective_settings.insert("debug".to_string(), Value::Bool(true));
        }
        let own_verbose = effective_settings.get("verbose").and_then(Value::as_u64).unwrap_or(0) as u32;
        if request.parent_verbose > 1 && request.parent_verbose > own_verbose {
            effective_settings.insert("verbose".to_string(), json!(request.parent_verbose));
        }

        let errors = settings::validate_and_normalize(&mut effective_settings);
        if !errors.is_empty() {
            return Err(XedaError::SettingsInvalid(errors));
        }

        let design_hash = semantic_hash_of(&(request.design.rtl_hash(), request.design.tb_hash()));
        let resource_identities: Vec<String> =
            request.resources_to_copy.iter().map(|p| p.to_string_lossy().to_string()).collect();
        let flowrun_hash = semantic_hash_of(&(
            &request.flow_name,
            &effective_settings,
            &resource_identities,
            env!("CARGO_PKG_VERSION"),
        ));

        let run_path = run_dir::derive_run_path(
            &self.config.root,
            &request.design.name,
            &request.flow_name,
            &design_hash,
            &flowrun_hash,
            self.config.incremental,
        );

        let header = RunRecordHeader {
            flow_name: request.flow_name.clone(),
            design_hash: design_hash.clone(),
            flowrun_hash: flowrun_hash.clone(),
        };

        if self.config.cached_dependencies && run_dir::is_cache_hit(&run_path, &header) {
            return self.load_cached(request.flow_name, run_path, design_hash, flowrun_hash);
        }

        if self.config.scrub_old_runs {
            if let Some(parent) = run_path.parent() {
                run_dir::scrub_runs(&request.flow_name, parent, &[run_path.clone()])?;
            }
        }

        let policy = if self.config.incremental {
            if self.config.incremental_fresh {
                PreexistencePolicy::IncrementalFresh
            } else {
                PreexistencePolicy::IncrementalResume
            }
        } else if self.config.backups {
            PreexistencePolicy::BackupAndReplace
        } else {
            PreexistencePolicy::Replace
        };
        run_dir::apply_preexistence_policy(&run_path, policy)?;

        let mut flow = (descriptor.constructor)(effective_settings.clone())?;
        let mut ctx = FlowContext::new(request.design.clone(), run_path.clone(), design_hash.clone(), flowrun_hash.clone());

        {
            let _cwd = WorkingDirectoryGuard::enter(&run_path)?;
            flow.init(&mut ctx).await?;
        }

        self.write_settings_json(&run_path, &header, &effective_settings, &request.design)?;
        run_dir::copy_resources(&run_path, &request.resources_to_copy)?;

        let mut completed_dependencies = Vec::new();
        for dependency in std::mem::take(&mut ctx.dependencies) {
            let dep_flow_name = dependency.flow_name.clone();
            info!(flow = %dep_flow_name, depender = %request.flow_name, "running dependency");
            let resolved_resources: Vec<PathBuf> =
                dependency.resources_to_copy.iter().map(|r| run_path.join(r)).collect();
            let dep_request = RunRequest {
                flow_name: dependency.flow_name,
                design: request.design.clone(),
                overrides: dependency.settings_overrides,
                parent_debug: effective_settings.get("debug").and_then(Value::as_bool).unwrap_or(false),
                parent_verbose: effective_settings.get("verbose").and_then(Value::as_u64).unwrap_or(0) as u32,
                resources_to_copy: resolved_resources,
            };
            match self.run_flow(dep_request).await {
                Ok(dep) if dep.succeeded() => {
                    completed_dependencies.push(CompletedDependency {
                        flow_name: dep_flow_name,
                        run_path: dep.run_path,
                        results: dep.results,
                        artifacts: dep.artifacts,
                    });
                }
                Ok(_) => {
                    warn!(flow = %dep_flow_name, "dependency completed but did not succeed");
                    return Err(XedaError::DependencyFailure { flow_name: dep_flow_name });
                }
                Err(_) => {
                    return Err(XedaError::DependencyFailure { flow_name: dep_flow_name });
                }
            }
        }
        ctx.completed_dependencies = completed_dependencies.clone();

        let timeout_seconds = effective_settings.get("timeout_seconds").and_then(Value::as_u64).unwrap_or(3600 * 2);
        let run_outcome = {
            let _cwd = WorkingDirectoryGuard::enter(&run_path)?;
            match tokio::time::timeout(std::time::Duration::from_secs(timeout_seconds), flow.run(&mut ctx)).await {
                Ok(result) => result,
                Err(_) => Err(XedaError::TimeoutExceeded {
                    command: vec![request.flow_name.clone()],
                    timeout_seconds,
                }),
            }
        };

        let mut results = match run_outcome {
            Ok(results) => results,
            Err(XedaError::ToolNonZeroExit { stderr_tail, .. }) => FlowResults {
                success: false,
                runtime: ctx.elapsed_seconds(),
                extra: {
                    let mut extra = Map::new();
                    extra.insert("error_tail".to_string(), json!(stderr_tail));
                    extra
                },
            },
            Err(XedaError::TimeoutExceeded { timeout_seconds, .. }) => FlowResults {
                success: false,
                runtime: ctx.elapsed_seconds(),
                extra: {
                    let mut extra = Map::new();
                    extra.insert("error".to_string(), json!(format!("exceeded {timeout_seconds}s timeout")));
                    extra
                },
            },
            Err(other) => return Err(other),
        };
        results.runtime = ctx.elapsed_seconds();

        let parse_ok = {
            let _cwd = WorkingDirectoryGuard::enter(&run_path)?;
            flow.parse_reports(&ctx, &mut results).await
        };
        if let Err(err) = parse_ok {
            results.success = false;
            results.extra.insert("parse_error".to_string(), json!(err.to_string()));
        }

        results.extra.insert("design".to_string(), json!(request.design.name));
        results.extra.insert("flow".to_string(), json!(request.flow_name));
        results.extra.insert("timestamp".to_string(), json!(timestamp::now_rfc3339()));

        if !ctx.artifacts.is_empty() && results.success {
            results.extra.insert(ARTIFACTS_KEY.to_string(), serde_json::to_value(&ctx.artifacts)?);
        }

        std::fs::write(run_path.join("results.json"), serde_json::to_vec_pretty(&results)?)?;

        Ok(CompletedFlow {
            flow_name: request.flow_name,
            run_path,
            design_hash,
            flow_hash: flowrun_hash,
            artifacts: ctx.artifacts,
            results,
            completed_dependencies,
        })
    }

    fn write_settings_json(
        &self,
        run_path: &std::path::Path,
        header: &RunRecordHeader,
        effective_settings: &Map<String, Value>,
        design: &Design,
    ) -> Result<()> {
        let record = json!({
            "flow_name": header.flow_name,
            "design_hash": header.design_hash,
            "flowrun_hash": header.flowrun_hash,
            "flow_settings": effective_settings,
            "design_name": design.name,
            "xeda_version": env!("CARGO_PKG_VERSION"),
        });
        std::fs::write(run_path.join("settings.json"), serde_json::to_vec_pretty(&record)?)?;
        Ok(())
    }

    fn load_cached(
        &self,
        flow_name: String,
        run_path: PathBuf,
        design_hash: String,
        flow_hash: String,
    ) -> Result<CompletedFlow> {
        let bytes = std::fs::read(run_path.join("results.json"))?;
        let results: FlowResults = serde_json::from_slice(&bytes)?;
        let artifacts: BTreeMap<String, Artifact> = results
            .extra
            .get(ARTIFACTS_KEY)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()?
            .unwrap_or_default();
        info!(%flow_name, run_path = %run_path.display(), "reusing cached results");
        Ok(CompletedFlow {
            flow_name,
            run_path,
            design_hash,
            flow_hash,
            results,
            artifacts,
            completed_dependencies: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::{Design, Rtl, Source, SourceType, Tb};
    use std::collections::BTreeMap;

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
            tb: Tb {
                sources: Vec::new(),
                top: None,
                configuration_specification: None,
            },
            parameters: BTreeMap::new(),
            language: Default::default(),
        }
    }

    #[tokio::test]
    async fn cache_reuse_skips_second_execution() {
        let tmp = tempfile::tempdir().unwrap();
        let design = sample_design(tmp.path());
        let runner = FlowRunner::new(RunnerConfig {
            root: tmp.path().join("runs"),
            ..Default::default()
        });

        let first = runner.run_flow(RunRequest::new("echo", design.clone())).await.unwrap();
        assert!(first.succeeded());

        let second = runner.run_flow(RunRequest::new("echo", design)).await.unwrap();
        assert_eq!(second.run_path, first.run_path);
        assert_eq!(second.results.runtime, first.results.runtime);
        assert_eq!(second.results.success, first.results.success);
    }

    #[tokio::test]
    async fn dependency_chain_copies_netlist_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let design = sample_design(tmp.path());
        let runner = FlowRunner::new(RunnerConfig {
            root: tmp.path().join("runs"),
            ..Default::default()
        });

        let completed = runner.run_flow(RunRequest::new("openroad", design)).await.unwrap();
        assert!(completed.succeeded());
        assert_eq!(completed.completed_dependencies.len(), 1);
        let dep = &completed.completed_dependencies[0];
        assert_eq!(dep.flow_name, "yosys_synth");
        assert!(dep.artifacts.contains_key("netlist_verilog"));

        let copied = match completed.artifacts.get("netlist_verilog") {
            Some(Artifact::One(path)) => path.clone(),
            other => panic!("expected a single copied netlist artifact, got {other:?}"),
        };
        assert!(copied.starts_with(&completed.run_path));
        assert!(copied.exists(), "netlist should have been copied into the depender's run_path");
    }

    #[tokio::test]
    async fn settings_error_surfaces_every_field() {
        let tmp = tempfile::tempdir().unwrap();
        let design = sample_design(tmp.path());
        let runner = FlowRunner::new(RunnerConfig {
            root: tmp.path().join("runs"),
            ..Default::default()
        });

        let mut request = RunRequest::new("echo", design);
        request.overrides.insert("debug".to_string(), json!("not-a-bool"));
        request.overrides.insert("dockerized".to_string(), json!("also-not-a-bool"));

        let err = runner.run_flow(request).await.unwrap_err();
        match err {
            XedaError::SettingsInvalid(errors) => assert_eq!(errors.len(), 2),
            other => panic!("expected SettingsInvalid, got {other:?}"),
        }
    }
}
