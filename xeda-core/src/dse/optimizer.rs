//! Adaptive Fmax bracket-search optimizer: the batch-generation and
//! outcome-scoring policy the DSE engine drives.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use rand::Rng;
use serde_json::{Map, Value};

use crate::flow::FlowResults;
use crate::hash::deep_hash;
use crate::settings::set_hierarchy;

/// One completed DSE trial, as handed to [`Optimizer::process_outcome`].
#[derive(Debug, Clone)]
pub struct FlowOutcome {
    pub settings: Map<String, Value>,
    pub results: FlowResults,
    pub timestamp: String,
    pub run_path: PathBuf,
}

impl FlowOutcome {
    pub fn fmax(&self) -> Option<f64> {
        self.results.extra.get("Fmax").and_then(Value::as_f64)
    }

    pub fn used_luts(&self) -> Option<f64> {
        self.results.extra.get("lut").and_then(Value::as_f64)
    }
}

/// Batch generation plus outcome scoring, as a trait so the engine isn't
/// hardwired to one search strategy even though [`FmaxOptimizer`] is the
/// only implementation shipped here.
pub trait Optimizer: Send {
    /// Up to `max_workers` candidate settings maps, or `None` once the
    /// search has converged or run out of distinct candidates.
    fn next_batch(&mut self, max_workers: usize) -> Option<Vec<Map<String, Value>>>;

    /// Scores one trial against the running best; `idx` is its position
    /// within the batch `next_batch` most recently returned. Returns
    /// whether this trial improved on the best seen so far.
    fn process_outcome(&mut self, outcome: &FlowOutcome, idx: usize) -> bool;

    fn best(&self) -> Option<&FlowOutcome>;

    fn iteration(&self) -> u32;
}

#[derive(Debug, Clone)]
pub struct FmaxOptimizerConfig {
    pub init_freq_low: f64,
    pub init_freq_high: f64,
    pub resolution: f64,
    pub delta: f64,
    pub freq_step: f64,
    pub variation_min_improv: f64,
    pub max_variations: usize,
    pub max_luts: Option<f64>,
}

impl Default for FmaxOptimizerConfig {
    fn default() -> Self {
        FmaxOptimizerConfig {
            init_freq_low: 100.0,
            init_freq_high: 500.0,
            resolution: 0.2,
            delta: 0.1,
            freq_step: 1.0,
            variation_min_improv: 0.5,
            max_variations: 8,
            max_luts: None,
        }
    }
}

/// Bracket-search Fmax optimizer. Holds the search bounds, the running
/// best, and an LRU-style ordering of each variation axis's candidate
/// values (successful choices bubble toward the front).
pub struct FmaxOptimizer {
    config: FmaxOptimizerConfig,
    base_settings: Map<String, Value>,
    variations: BTreeMap<String, Vec<Value>>,
    best: Option<FlowOutcome>,
    failed_fmax: Option<f64>,
    num_iterations: u32,
    no_improvements_this_iter: u32,
    last_improvement: f64,
    lo_freq: f64,
    hi_freq: f64,
    num_variations: usize,
    batch_hashes: HashSet<u64>,
    last_batch_choices: Vec<BTreeMap<String, usize>>,
    done: bool,
}

fn best_freq_of(outcome: &FlowOutcome) -> f64 {
    outcome.fmax().unwrap_or(0.0)
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

fn linspace(lo: f64, hi: f64, n: usize) -> Vec<f64> {
    if n <= 1 {
        return vec![(lo + hi) / 2.0];
    }
    let step = (hi - lo) / (n - 1) as f64;
    (0..n).map(|i| lo + step * i as f64).collect()
}

/// Biased pick toward index 0: squaring a uniform draw skews the
/// distribution toward the front of an already-promoted variation list.
fn biased_index(len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    let draw = rand::thread_rng().gen::<f64>();
    ((draw * draw) * len as f64) as usize
}

impl FmaxOptimizer {
    pub fn new(
        config: FmaxOptimizerConfig,
        base_settings: Map<String, Value>,
        variations: BTreeMap<String, Vec<Value>>,
    ) -> Self {
        let lo_freq = config.init_freq_low;
        let hi_freq = config.init_freq_high;
        FmaxOptimizer {
            config,
            base_settings,
            variations,
            best: None,
            failed_fmax: None,
            num_iterations: 0,
            no_improvements_this_iter: 0,
            last_improvement: f64::INFINITY,
            lo_freq,
            hi_freq,
            num_variations: 1,
            batch_hashes: HashSet::new(),
            last_batch_choices: Vec::new(),
            done: false,
        }
    }

    fn update_bounds(&mut self) {
        if self.num_iterations == 0 {
            return;
        }

        if (self.hi_freq - self.lo_freq) < self.config.resolution && self.no_improvements_this_iter >= 1 {
            self.done = true;
            return;
        }

        let had_no_improvement = self.no_improvements_this_iter > 0;
        if self.best.is_some() && (had_no_improvement || self.last_improvement < self.config.variation_min_improv) {
            self.num_variations = (self.num_variations + 1).min(self.config.max_variations);
        } else if !had_no_improvement && self.last_improvement > self.config.variation_min_improv * 4.0 {
            self.num_variations = self.num_variations.saturating_sub(1).max(1);
        }

        if let Some(best) = &self.best {
            let best_freq = best_freq_of(best);
            let max_eps = (self.config.resolution / (self.num_variations as f64 + 2.0)).max(self.config.delta);
            let eps = if max_eps > self.config.delta {
                rand::thread_rng().gen_range(self.config.delta..max_eps)
            } else {
                self.config.delta
            };
            self.lo_freq = best_freq + eps;
        }

        if had_no_improvement {
            let midpoint = self.best.as_ref().map(best_freq_of).unwrap_or(self.lo_freq);
            self.hi_freq = (self.hi_freq + midpoint) / 2.0 + self.config.delta;
            if self.best.is_none() {
                self.lo_freq = (self.lo_freq - self.config.delta).max(0.0);
            }
            if self.hi_freq < self.config.resolution {
                self.done = true;
            }
        } else if let Some(best) = &self.best {
            let best_freq = best_freq_of(best);
            let scale = self.num_variations.max(1) as f64;
            self.hi_freq = self
                .hi_freq
                .max(best_freq + self.config.resolution.max(self.config.freq_step) * scale);
        }

        if self.hi_freq <= self.lo_freq {
            self.hi_freq = self.lo_freq + self.config.resolution;
        }
    }
}

impl Optimizer for FmaxOptimizer {
    fn next_batch(&mut self, max_workers: usize) -> Option<Vec<Map<String, Value>>> {
        let max_workers = max_workers.max(1);
        self.update_bounds();
        if self.done {
            return None;
        }

        let n = ((max_workers as f64) / (self.num_variations as f64)).ceil() as usize;
        let n = n.clamp(1, max_workers);

        let mut batch = Vec::new();
        let mut choices = Vec::new();
        let mut lo = self.lo_freq;
        let mut hi = self.hi_freq;
        let mut retries = 0;
        let max_retries = self.config.max_variations * 4 + 4;

        while batch.len() < max_workers && retries < max_retries {
            let before = batch.len();
            for freq in linspace(lo, hi, n) {
                if batch.len() >= max_workers {
                    break;
                }
                if freq <= 0.0 {
                    continue;
                }
                let clock_period = round3(1000.0 / freq);
                let mut settings = self.base_settings.clone();
                settings.insert("clock_period".to_string(), Value::from(clock_period));

                let mut chosen = BTreeMap::new();
                for (keypath, values) in &self.variations {
                    if values.is_empty() {
                        continue;
                    }
                    let idx = biased_index(values.len()).min(values.len() - 1);
                    chosen.insert(keypath.clone(), idx);
                    set_hierarchy(&mut settings, keypath, values[idx].clone());
                }

                let hash = deep_hash(&settings);
                if self.batch_hashes.insert(hash) {
                    batch.push(settings);
                    choices.push(chosen);
                }
            }
            if batch.len() == before {
                let jitter = self.config.delta * (retries + 1) as f64;
                lo = (lo - jitter).max(0.0);
                hi += jitter;
            }
            retries += 1;
        }

        self.num_iterations += 1;
        self.no_improvements_this_iter = 0;
        self.last_batch_choices = choices;

        if batch.is_empty() {
            self.done = true;
            return None;
        }
        Some(batch)
    }

    fn process_outcome(&mut self, outcome: &FlowOutcome, idx: usize) -> bool {
        let Some(fmax) = outcome.fmax() else {
            return false;
        };

        if !outcome.results.success {
            if fmax > self.failed_fmax.unwrap_or(f64::MIN) {
                self.failed_fmax = Some(fmax);
            }
            self.no_improvements_this_iter += 1;
            return false;
        }

        if let (Some(max_luts), Some(used)) = (self.config.max_luts, outcome.used_luts()) {
            if used > max_luts {
                self.no_improvements_this_iter += 1;
                return false;
            }
        }

        let current_best = self.best.as_ref().map(best_freq_of).unwrap_or(f64::MIN);
        if fmax > current_best {
            self.last_improvement = fmax - current_best.max(0.0);
            self.base_settings = outcome.settings.clone();
            if let Some(chosen) = self.last_batch_choices.get(idx) {
                for (keypath, &chosen_idx) in chosen {
                    if let Some(values) = self.variations.get_mut(keypath) {
                        if chosen_idx < values.len() {
                            let promoted = values.remove(chosen_idx);
                            values.insert(0, promoted);
                        }
                    }
                }
            }
            self.best = Some(outcome.clone());
            true
        } else {
            self.no_improvements_this_iter += 1;
            false
        }
    }

    fn best(&self) -> Option<&FlowOutcome> {
        self.best.as_ref()
    }

    fn iteration(&self) -> u32 {
        self.num_iterations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowResults;
    use serde_json::json;

    fn outcome(clock_period: f64, fmax: f64, success: bool) -> FlowOutcome {
        let mut settings = Map::new();
        settings.insert("clock_period".to_string(), json!(clock_period));
        let mut extra = Map::new();
        extra.insert("Fmax".to_string(), json!(fmax));
        FlowOutcome {
            settings,
            results: FlowResults { success, runtime: 0.01, extra },
            timestamp: "t".to_string(),
            run_path: PathBuf::from("/tmp/x"),
        }
    }

    #[test]
    fn converges_toward_synthetic_peak() {
        let config = FmaxOptimizerConfig {
            init_freq_low: 100.0,
            init_freq_high: 400.0,
            resolution: 0.2,
            ..Default::default()
        };
        let mut optimizer = FmaxOptimizer::new(config, Map::new(), BTreeMap::new());

        for _ in 0..10 {
            let Some(batch) = optimizer.next_batch(4) else { break };
            for (idx, settings) in batch.iter().enumerate() {
                let period = settings.get("clock_period").and_then(Value::as_f64).unwrap();
                let fmax = 200.0 - (period - 5.0).abs() * 10.0;
                let success = fmax <= 200.0;
                optimizer.process_outcome(&outcome(period, fmax, success), idx);
            }
        }

        let best = optimizer.best().expect("expected a best result after iterating");
        assert!((best.fmax().unwrap() - 200.0).abs() < 1.0);
    }

    #[test]
    fn best_never_regresses() {
        let config = FmaxOptimizerConfig::default();
        let mut optimizer = FmaxOptimizer::new(config, Map::new(), BTreeMap::new());
        assert!(optimizer.process_outcome(&outcome(5.0, 150.0, true), 0));
        assert!(!optimizer.process_outcome(&outcome(5.0, 100.0, true), 0));
        assert_eq!(optimizer.best().unwrap().fmax(), Some(150.0));
    }

    #[test]
    fn batch_never_contains_duplicate_hashes() {
        let mut optimizer = FmaxOptimizer::new(FmaxOptimizerConfig::default(), Map::new(), BTreeMap::new());
        let batch = optimizer.next_batch(4).unwrap();
        let mut seen = HashSet::new();
        for settings in &batch {
            assert!(seen.insert(deep_hash(settings)));
        }
    }
}
