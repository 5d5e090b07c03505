//! DSE Engine: the bounded worker pool and iteration loop driving an
//! [`Optimizer`] to a best-so-far Fmax result.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value, json};
use tokio::sync::{Semaphore, watch};
use tracing::info;

use crate::design::Design;
use crate::dse::optimizer::{FlowOutcome, Optimizer};
use crate::error::{Result, XedaError};
use crate::runner::{FlowRunner, RunRequest};
use crate::timestamp;

#[derive(Debug, Clone)]
pub struct DseConfig {
    pub flow_name: String,
    pub max_workers: usize,
    pub max_runtime_minutes: f64,
    pub trial_timeout_seconds: u64,
    pub max_failed_iters: u32,
    pub max_failed_iters_with_best: u32,
    pub keep_optimal_run_dirs: bool,
    pub best_json_path: PathBuf,
}

impl Default for DseConfig {
    fn default() -> Self {
        DseConfig {
            flow_name: "synthetic_synth".to_string(),
            max_workers: 4,
            max_runtime_minutes: 60.0,
            trial_timeout_seconds: 3600,
            max_failed_iters: 10,
            max_failed_iters_with_best: 20,
            keep_optimal_run_dirs: true,
            best_json_path: PathBuf::from("xeda_run_dse/best.json"),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BestRecord {
    pub settings: Map<String, Value>,
    pub fmax: f64,
    pub run_path: PathBuf,
    pub timestamp: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DseSummary {
    pub best: Option<BestRecord>,
    pub iterations: u32,
    pub successful_trials: usize,
    pub cumulative_runtime_seconds: f64,
}

/// Orchestrates repeated [`FlowRunner::run_flow`] trials under an
/// [`Optimizer`]'s batches, bounded by a `tokio::sync::Semaphore`-gated
/// worker pool (one in-flight flow invocation per permit).
pub struct DseEngine {
    runner: Arc<FlowRunner>,
    design: Design,
    optimizer: Box<dyn Optimizer>,
    config: DseConfig,
}

impl DseEngine {
    pub fn new(runner: Arc<FlowRunner>, design: Design, optimizer: Box<dyn Optimizer>, config: DseConfig) -> Self {
        DseEngine { runner, design, optimizer, config }
    }

    /// Runs the search loop to completion, cancellation, or a configured
    /// stopping condition, writing `best.json` after every improvement.
    pub async fn run(&mut self, mut cancel: watch::Receiver<bool>) -> Result<DseSummary> {
        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut successful_trials = 0usize;
        let mut consecutive_failed_iters: u32 = 0;

        loop {
            if *cancel.borrow() {
                info!("dse cancelled before next batch");
                break;
            }
            let elapsed_minutes = started.elapsed().as_secs_f64() / 60.0;
            if elapsed_minutes > self.config.max_runtime_minutes {
                info!(elapsed_minutes, "dse exceeded configured max runtime");
                break;
            }

            let Some(batch) = self.optimizer.next_batch(self.config.max_workers) else {
                info!("optimizer declared the search complete");
                break;
            };

            info!(
                iteration = self.optimizer.iteration(),
                batch_size = batch.len(),
                "submitting dse batch"
            );

            let mut handles = Vec::with_capacity(batch.len());
            for mut trial_settings in batch {
                trial_settings.insert("timeout_seconds".to_string(), json!(self.config.trial_timeout_seconds));
                trial_settings.insert("redirect_stdout".to_string(), json!(true));

                let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closes");
                let runner = self.runner.clone();
                let design = self.design.clone();
                let flow_name = self.config.flow_name.clone();
                let trial_settings_for_outcome = trial_settings.clone();
                let mut cancel_for_task = cancel.clone();

                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    let request = RunRequest::new(flow_name, design).with_overrides(trial_settings);
                    tokio::select! {
                        biased;
                        _ = cancel_for_task.changed() => None,
                        result = runner.run_flow(request) => Some((result, trial_settings_for_outcome)),
                    }
                }));
            }

            let mut batch_had_success = false;
            for (idx, handle) in handles.into_iter().enumerate() {
                let joined = handle.await.map_err(|e| XedaError::FlowFatal(e.to_string()))?;
                let Some((result, trial_settings)) = joined else {
                    continue;
                };
                let completed = match result {
                    Ok(completed) => completed,
                    Err(_) => continue,
                };

                let outcome = FlowOutcome {
                    settings: trial_settings,
                    results: completed.results.clone(),
                    timestamp: timestamp::now_rfc3339(),
                    run_path: completed.run_path.clone(),
                };

                if completed.succeeded() {
                    batch_had_success = true;
                    successful_trials += 1;
                }

                let improved = self.optimizer.process_outcome(&outcome, idx);
                if improved {
                    self.persist_best()?;
                } else if self.config.keep_optimal_run_dirs && self.optimizer.iteration() > 1 {
                    let _ = std::fs::remove_dir_all(&completed.run_path);
                }
            }

            consecutive_failed_iters = if batch_had_success { 0 } else { consecutive_failed_iters + 1 };
            let threshold = if self.optimizer.best().is_some() {
                self.config.max_failed_iters_with_best
            } else {
                self.config.max_failed_iters
            };
            if consecutive_failed_iters > threshold {
                info!(consecutive_failed_iters, "dse stopping after too many failed iterations");
                break;
            }
        }

        self.persist_best()?;
        Ok(DseSummary {
            best: self.optimizer.best().map(to_best_record),
            iterations: self.optimizer.iteration(),
            successful_trials,
            cumulative_runtime_seconds: started.elapsed().as_secs_f64(),
        })
    }

    fn persist_best(&self) -> Result<()> {
        let Some(best) = self.optimizer.best() else {
            return Ok(());
        };
        if let Some(parent) = self.config.best_json_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let record = to_best_record(best);
        let tmp = self.config.best_json_path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&record)?)?;
        std::fs::rename(&tmp, &self.config.best_json_path)?;
        Ok(())
    }
}

fn to_best_record(best: &FlowOutcome) -> BestRecord {
    BestRecord {
        settings: best.settings.clone(),
        fmax: best.fmax().unwrap_or(0.0),
        run_path: best.run_path.clone(),
        timestamp: best.timestamp.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::{Rtl, Source, SourceType, Tb};
    use crate::dse::optimizer::{FmaxOptimizer, FmaxOptimizerConfig};
    use crate::runner::RunnerConfig;
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
            tb: Tb { sources: Vec::new(), top: None, configuration_specification: None },
            parameters: BTreeMap::new(),
            language: Default::default(),
        }
    }

    #[tokio::test]
    async fn dse_converges_and_persists_best_json() {
        let tmp = tempfile::tempdir().unwrap();
        let design = sample_design(tmp.path());
        let runner = Arc::new(FlowRunner::new(RunnerConfig {
            root: tmp.path().join("runs"),
            ..Default::default()
        }));
        let optimizer = FmaxOptimizer::new(
            FmaxOptimizerConfig {
                init_freq_low: 100.0,
                init_freq_high: 400.0,
                resolution: 0.2,
                ..Default::default()
            },
            Map::new(),
            BTreeMap::new(),
        );
        let (_cancel_tx, cancel_rx) = watch::channel(false);
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

        let summary = engine.run(cancel_rx).await.unwrap();
        let best = summary.best.expect("expected a converged best result");
        assert!((best.fmax - 200.0).abs() < 1.0);
        assert!(tmp.path().join("best.json").exists());
    }
}
