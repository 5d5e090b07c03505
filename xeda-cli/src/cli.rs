//! Command-line surface: argument parsing and the dispatch glue that
//! turns a parsed command into `xeda_core` calls.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::{Map, Value};
use tokio::sync::watch;
use xeda_core::{
    CompletedFlow, DseConfig, DseEngine, FmaxOptimizer, FmaxOptimizerConfig, RunRequest, RunnerConfig,
};

use crate::project;

#[derive(Parser)]
#[command(name = "xeda", version, about = "Run and explore EDA flows")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a single flow to completion
    Run(RunArgs),
    /// Run a design-space exploration search over a flow
    Dse(DseArgs),
    /// List registered flows
    ListFlows,
    /// Print the effective settings schema for a flow
    ListSettings { flow_name: String },
    /// Print a shell completion script
    Completion { shell: Shell },
}

#[derive(Parser)]
pub struct CommonArgs {
    /// Root directory under which run directories are created
    #[arg(long, env = "XEDA_RUN_DIR", default_value = "xeda_run")]
    pub xeda_run_dir: PathBuf,

    /// Project file declaring one or more designs
    #[arg(long)]
    pub xedaproject: Option<PathBuf>,

    /// Standalone design file, as an alternative to --xedaproject
    #[arg(long)]
    pub design_file: Option<PathBuf>,

    /// Design to select when the project file declares more than one
    #[arg(long)]
    pub design_name: Option<String>,

    /// Repeatable KEY=VALUE[,KEY=VALUE...] flow setting overrides
    #[arg(long = "flow-settings", value_name = "KEY=VALUE[,...]")]
    pub flow_settings: Vec<String>,

    /// Reuse a previously completed dependency's run directory when its
    /// hash matches (the default)
    #[arg(long, conflicts_with = "no_cached_dependencies")]
    pub cached_dependencies: bool,
    /// Always re-run dependencies instead of reusing a matching run directory
    #[arg(long)]
    pub no_cached_dependencies: bool,

    /// Resume into an existing incremental run directory instead of
    /// replacing it
    #[arg(long)]
    pub incremental: bool,

    /// Re-print the full error chain instead of the top-level message
    #[arg(long)]
    pub debug: bool,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress informational output
    #[arg(short, long)]
    pub quiet: bool,
}

impl CommonArgs {
    fn resolve_cached_dependencies(&self) -> bool {
        !self.no_cached_dependencies
    }

    /// Loads the requested design plus the flow-settings defaults its
    /// project/design file declared, keyed by flow name.
    fn load_design(&self) -> Result<(xeda_core::design::Design, Map<String, Value>)> {
        if let Some(design_file) = &self.design_file {
            return project::load_design_file(design_file);
        }
        let project_path = self
            .xedaproject
            .clone()
            .unwrap_or_else(project::default_project_path);
        if !project_path.exists() {
            bail!(
                "no design source given: pass --design-file or --xedaproject (tried {})",
                project_path.display()
            );
        }
        let loaded = project::load_project(&project_path)?;
        let design = project::select_design(loaded.designs, self.design_name.as_deref())?;
        Ok((design, loaded.flow_defaults))
    }

    fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            root: self.xeda_run_dir.clone(),
            incremental: self.incremental,
            cached_dependencies: self.resolve_cached_dependencies(),
            ..Default::default()
        }
    }
}

#[derive(Parser)]
pub struct RunArgs {
    pub flow_name: String,
    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Parser)]
pub struct DseArgs {
    pub flow_name: String,
    #[command(flatten)]
    pub common: CommonArgs,

    /// Number of trials to run concurrently
    #[arg(long, default_value_t = 4)]
    pub max_workers: usize,

    /// Optimizer strategy; only `fmax` is implemented
    #[arg(long, default_value = "fmax")]
    pub optimizer: String,

    /// Repeatable KEY=VALUE optimizer-specific setting overrides
    #[arg(long = "optimizer-settings", value_name = "KEY=VALUE[,...]")]
    pub optimizer_settings: Vec<String>,

    #[arg(long, default_value_t = 100.0)]
    pub init_freq_low: f64,
    #[arg(long, default_value_t = 500.0)]
    pub init_freq_high: f64,

    /// Wall-clock budget for the whole search
    #[arg(long, default_value_t = 60.0)]
    pub max_runtime_minutes: f64,
}

fn init_tracing(common: &CommonArgs) {
    use tracing_subscriber::EnvFilter;
    let default_level = if common.debug {
        "debug"
    } else if common.verbose >= 2 {
        "trace"
    } else if common.verbose == 1 {
        "debug"
    } else if common.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_env("XEDA_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

/// Merges a flow's project-file defaults beneath the CLI's own
/// `--flow-settings`/`--debug`/`--quiet`/`--verbose` overrides.
fn overrides_from(common: &CommonArgs, flow_name: &str, flow_defaults: &Map<String, Value>) -> Result<Map<String, Value>> {
    let project_layer = flow_defaults.get(flow_name).cloned().unwrap_or(Value::Object(Map::new()));
    let cli_layer = xeda_core::settings::parse_flow_settings_overrides(&common.flow_settings)
        .map_err(|e| anyhow::anyhow!(e))?;
    let mut overrides = xeda_core::settings::merge(&project_layer, &Value::Object(cli_layer))
        .as_object()
        .cloned()
        .unwrap_or_default();
    if common.debug {
        overrides.insert("debug".to_string(), Value::Bool(true));
    }
    if common.quiet {
        overrides.insert("quiet".to_string(), Value::Bool(true));
    }
    if common.verbose > 0 {
        overrides.insert("verbose".to_string(), Value::from(common.verbose));
    }
    Ok(overrides)
}

async fn run_run(args: RunArgs) -> Result<CompletedFlow> {
    init_tracing(&args.common);
    let (design, flow_defaults) = args.common.load_design()?;
    let overrides = overrides_from(&args.common, &args.flow_name, &flow_defaults)?;

    let runner = xeda_core::FlowRunner::new(args.common.runner_config());
    let request = RunRequest::new(args.flow_name, design).with_overrides(overrides);
    runner.run_flow(request).await.context("flow run failed")
}

async fn run_dse(mut args: DseArgs) -> Result<xeda_core::DseSummary> {
    init_tracing(&args.common);
    // `dse`'s xeda-run-dir default differs from `run`'s; only apply it when
    // the user left --xeda-run-dir at its flag-level default.
    if args.common.xeda_run_dir == PathBuf::from("xeda_run") {
        args.common.xeda_run_dir = PathBuf::from("xeda_run_dse");
    }
    let (design, flow_defaults) = args.common.load_design()?;
    let base_overrides = overrides_from(&args.common, &args.flow_name, &flow_defaults)?;

    if args.optimizer != "fmax" {
        bail!("unknown optimizer `{}`; only `fmax` is implemented", args.optimizer);
    }
    let optimizer_overrides = xeda_core::settings::parse_flow_settings_overrides(&args.optimizer_settings)
        .map_err(|e| anyhow::anyhow!(e))?;
    let mut optimizer_config = FmaxOptimizerConfig {
        init_freq_low: args.init_freq_low,
        init_freq_high: args.init_freq_high,
        ..Default::default()
    };
    if let Some(max_variations) = optimizer_overrides.get("max_variations").and_then(Value::as_u64) {
        optimizer_config.max_variations = (max_variations as usize).max(1);
    }
    if let Some(max_luts) = optimizer_overrides.get("max_luts").and_then(Value::as_f64) {
        optimizer_config.max_luts = Some(max_luts);
    }
    let optimizer = FmaxOptimizer::new(optimizer_config, base_overrides, Default::default());

    let runner = Arc::new(xeda_core::FlowRunner::new(args.common.runner_config()));
    let best_json_path = args.common.xeda_run_dir.join("best.json");
    let dse_config = DseConfig {
        flow_name: args.flow_name,
        max_workers: args.max_workers,
        max_runtime_minutes: args.max_runtime_minutes,
        best_json_path,
        ..Default::default()
    };
    let mut engine = DseEngine::new(runner, design, Box::new(optimizer), dse_config);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    engine.run(cancel_rx).await.context("design-space exploration failed")
}

fn print_list_flows() {
    for (name, display_name, summary) in xeda_core::registry::list_flows() {
        println!("{name:<24} {display_name:<28} {summary}");
    }
}

fn print_list_settings(flow_name: &str) -> Result<()> {
    let descriptor = xeda_core::registry::get_flow_class(flow_name)?;
    let flow = (descriptor.constructor)(Map::new()).context("constructing flow with default settings")?;
    println!("settings for `{flow_name}` ({})", descriptor.display_name);
    let common = xeda_core::settings::field_descriptions();
    let common_defaults = serde_json::to_value(xeda_core::settings::CommonFlowSettings::default())
        .ok()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    for &(field, description) in common {
        let default = flow
            .settings()
            .get(field)
            .or_else(|| common_defaults.get(field))
            .cloned()
            .unwrap_or(Value::Null);
        println!("  {field:<20} {description}\n    default: {default}");
    }
    for (key, value) in flow.settings() {
        if common.iter().any(|&(f, _)| f == key.as_str()) {
            continue;
        }
        println!("  {key:<20} (flow-specific)\n    default: {value}");
    }
    Ok(())
}

fn print_completion(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
}

/// Parses argv and dispatches to the matching subcommand, returning the
/// process exit code per the documented convention: `0` on success, `1`
/// on any flow, dependency, settings, or executable-resolution failure.
pub async fn run() -> i32 {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => {
            let debug = args.common.debug;
            match run_run(args).await {
                Ok(completed) => {
                    println!("{}", serde_json::to_string_pretty(&completed.results).unwrap_or_default());
                    if completed.succeeded() { 0 } else { 1 }
                }
                Err(e) => {
                    report_error(&e, debug);
                    1
                }
            }
        }
        Commands::Dse(args) => {
            let debug = args.common.debug;
            match run_dse(args).await {
                Ok(summary) => {
                    println!("{}", serde_json::to_string_pretty(&summary).unwrap_or_default());
                    if summary.best.is_some() { 0 } else { 1 }
                }
                Err(e) => {
                    report_error(&e, debug);
                    1
                }
            }
        }
        Commands::ListFlows => {
            print_list_flows();
            0
        }
        Commands::ListSettings { flow_name } => match print_list_settings(&flow_name) {
            Ok(()) => 0,
            Err(e) => {
                report_error(&e, false);
                1
            }
        },
        Commands::Completion { shell } => {
            print_completion(shell);
            0
        }
    }
}

fn report_error(err: &anyhow::Error, debug: bool) {
    if debug {
        eprintln!("{err:#}");
    } else {
        eprintln!("error: {err}");
    }
}
