//! The `Flow` trait and the runtime types that travel alongside an
//! instance: results, artifacts, and dependency descriptors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::design::{Design, PhysicalClock};
use crate::error::Result;

/// A named output file, or a list of them, promised by a flow's contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Artifact {
    One(PathBuf),
    Many(Vec<PathBuf>),
}

/// A flow's open result map. `success` and `runtime` are always present
/// once a flow has run; everything else is flow-specific.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowResults {
    pub success: bool,
    pub runtime: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `(flow_class_or_name, settings_overrides, resources_to_copy)` — declared
/// by a flow's `init` hook, run strictly before that flow's own `run`.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub flow_name: String,
    pub settings_overrides: Map<String, Value>,
    pub resources_to_copy: Vec<PathBuf>,
}

impl Dependency {
    pub fn new(flow_name: impl Into<String>) -> Self {
        Dependency {
            flow_name: flow_name.into(),
            settings_overrides: Map::new(),
            resources_to_copy: Vec::new(),
        }
    }

    pub fn with_override(mut self, key: impl Into<String>, value: Value) -> Self {
        crate::settings::set_hierarchy(&mut self.settings_overrides, &key.into(), value);
        self
    }

    pub fn with_resource(mut self, path: impl Into<PathBuf>) -> Self {
        self.resources_to_copy.push(path.into());
        self
    }
}

/// Context handed to `Flow::init`/`run`/`parse_reports`: everything a flow
/// implementation needs besides its own settings.
pub struct FlowContext {
    pub design: Design,
    pub run_path: PathBuf,
    pub init_time: Instant,
    pub design_hash: String,
    pub flow_hash: String,
    pub dependencies: Vec<Dependency>,
    pub completed_dependencies: Vec<CompletedDependency>,
    pub artifacts: BTreeMap<String, Artifact>,
}

impl FlowContext {
    pub fn new(design: Design, run_path: PathBuf, design_hash: String, flow_hash: String) -> Self {
        FlowContext {
            design,
            run_path,
            init_time: Instant::now(),
            design_hash,
            flow_hash,
            dependencies: Vec::new(),
            completed_dependencies: Vec::new(),
            artifacts: BTreeMap::new(),
        }
    }

    /// Declares a dependency to be launched before `run`. Only meaningful
    /// when called from within `Flow::init`.
    pub fn add_dependency(&mut self, dependency: Dependency) {
        self.dependencies.push(dependency);
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.init_time.elapsed().as_secs_f64()
    }
}

/// Record of a dependency flow that ran to completion before its depender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedDependency {
    pub flow_name: String,
    pub run_path: PathBuf,
    pub results: FlowResults,
    pub artifacts: BTreeMap<String, Artifact>,
}

/// Capability exposed by synthesis-family flows: named physical clocks.
pub trait SynthCapable {
    fn clocks(&self) -> &[PhysicalClock];
}

/// The contract every registered flow implements. `init` runs once the
/// flow's working directory has been entered but before any dependency has
/// launched; `run` runs after all declared dependencies have completed.
#[async_trait]
pub trait Flow: Send {
    /// Raw, already-validated settings for this flow instance.
    fn settings(&self) -> &Map<String, Value>;

    /// Called once, may call `ctx.add_dependency(..)` any number of times.
    async fn init(&mut self, ctx: &mut FlowContext) -> Result<()>;

    /// Executes the flow's work (usually via the process supervisor). The
    /// runner wraps this call in a `timeout_seconds` deadline itself, since
    /// not every flow shells out through the process supervisor's own
    /// per-command timeout. Only `ToolNonZeroExit` and `TimeoutExceeded`
    /// are caught here by the runner and folded into `results.success =
    /// false`; every other error propagates.
    async fn run(&mut self, ctx: &mut FlowContext) -> Result<FlowResults>;

    /// Scans `ctx.run_path` reports and folds structured fields into the
    /// result map returned by `run`. Returning `Ok(())` without touching
    /// `results` is a legitimate no-op for flows with no reports.
    async fn parse_reports(&mut self, ctx: &FlowContext, results: &mut FlowResults) -> Result<()> {
        let _ = (ctx, results);
        Ok(())
    }
}

/// Matches a required regex against a report file's contents, inserting
/// every named capture group into `results.extra`. Used by
/// `Flow::parse_reports` implementations.
pub fn parse_report_regex(
    report_path: &Path,
    pattern: &regex::Regex,
    required: bool,
    results: &mut FlowResults,
) -> Result<()> {
    let contents = std::fs::read_to_string(report_path)?;
    match pattern.captures(&contents) {
        Some(caps) => {
            for name in pattern.capture_names().flatten() {
                if let Some(m) = caps.name(name) {
                    results.extra.insert(name.to_string(), Value::String(m.as_str().to_string()));
                }
            }
            Ok(())
        }
        None if required => Err(crate::error::XedaError::ReportParseFailure {
            report_path: report_path.to_path_buf(),
            pattern: pattern.as_str().to_string(),
        }),
        None => Ok(()),
    }
}
