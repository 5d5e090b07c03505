//! Typed settings schema, validation, and layered merge.
//!
//! Flow settings are carried as a `serde_json::Value` map rather than one
//! concrete struct per flow class: each flow contributes its own schema on
//! top of [`CommonFlowSettings`], and the runner only ever needs to
//! validate/merge/hash the dynamic form. Concrete flow implementations are
//! expected to `serde_json::from_value` the merged map into their own
//! settings struct once the common fields have been validated.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

fn cpu_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// `(name, path)` — either side may be absent, never both.
pub type LibPath = (Option<String>, Option<PathBuf>);

/// A single clock's settings as they appear in the `clocks` map, before
/// being turned into a full [`crate::design::PhysicalClock`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClockEntry {
    pub period: Option<f64>,
    pub freq: Option<f64>,
    pub port: Option<String>,
}

/// Fields present on every flow's settings, regardless of flow kind.
/// Flow-specific fields ride along in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonFlowSettings {
    #[serde(default)]
    pub verbose: u32,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_true")]
    pub quiet: bool,
    #[serde(default)]
    pub redirect_stdout: bool,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "cpu_count")]
    pub nthreads: usize,
    #[serde(default = "cpu_count")]
    pub ncpus: usize,
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
    #[serde(default = "default_checkpoints_dir")]
    pub checkpoints_dir: PathBuf,
    #[serde(default = "default_outputs_dir")]
    pub outputs_dir: PathBuf,
    #[serde(default)]
    pub lib_paths: Vec<LibPath>,
    #[serde(default)]
    pub dockerized: bool,
    #[serde(default = "default_true")]
    pub print_commands: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_true() -> bool {
    true
}
fn default_timeout() -> u64 {
    3600 * 2
}
fn default_reports_dir() -> PathBuf {
    PathBuf::from("reports")
}
fn default_checkpoints_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}
fn default_outputs_dir() -> PathBuf {
    PathBuf::from("outputs")
}

impl Default for CommonFlowSettings {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Map::new())).expect("all fields have defaults")
    }
}

/// Per-field description, used by `list-settings` to render a schema
/// alongside its default.
pub fn field_descriptions() -> &'static [(&'static str, &'static str)] {
    &[
        ("verbose", "Verbosity level"),
        ("debug", "Enable debug mode and re-raise internal errors"),
        ("quiet", "Suppress non-essential output"),
        ("redirect_stdout", "Redirect stdout from execution of tools to files"),
        ("timeout_seconds", "Per-flow subprocess timeout in seconds"),
        ("nthreads", "Max number of threads the underlying tool may use"),
        ("ncpus", "Number of physical CPUs to use"),
        ("reports_dir", "Directory (relative to run_path) for tool reports"),
        ("checkpoints_dir", "Directory (relative to run_path) for checkpoints"),
        ("outputs_dir", "Directory (relative to run_path) for outputs"),
        ("lib_paths", "Additional libraries as (name, path) pairs"),
        ("dockerized", "Run the underlying tool inside a docker container"),
        ("print_commands", "Print the exact commands being executed"),
    ]
}

/// Normalizes a raw JSON settings map in place and returns the full list
/// of validation errors found (never stops at the first one).
pub fn validate_and_normalize(settings: &mut Map<String, Value>) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    normalize_lib_paths(settings, &mut errors);
    normalize_clocks(settings, &mut errors);
    normalize_quiet(settings);
    validate_types(settings, &mut errors);

    errors
}

fn normalize_lib_paths(settings: &mut Map<String, Value>, errors: &mut Vec<ValidationError>) {
    let Some(raw) = settings.get("lib_paths").cloned() else {
        return;
    };
    let as_pair = |v: &Value| -> Option<Value> {
        match v {
            Value::String(s) => Some(Value::Array(vec![Value::String(s.clone()), Value::Null])),
            Value::Array(pair) if pair.len() == 2 => Some(Value::Array(pair.clone())),
            _ => None,
        }
    };
    let normalized = match raw {
        Value::String(s) => vec![Value::Array(vec![Value::String(s), Value::Null])],
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in &items {
                match as_pair(item) {
                    Some(pair) => out.push(pair),
                    None => errors.push((
                        Some("lib_paths".to_string()),
                        "each entry must be a string or a (name, path) pair".to_string(),
                        None,
                        Some("type_error".to_string()),
                    )),
                }
            }
            out
        }
        _ => {
            errors.push((
                Some("lib_paths".to_string()),
                "must be a string or a list".to_string(),
                None,
                Some("type_error".to_string()),
            ));
            return;
        }
    };
    for pair in &normalized {
        if let Value::Array(p) = pair {
            if p[0].is_null() && p[1].is_null() {
                errors.push((
                    Some("lib_paths".to_string()),
                    "at least one of name or path must be set".to_string(),
                    None,
                    Some("value_error".to_string()),
                ));
            }
        }
    }
    settings.insert("lib_paths".to_string(), Value::Array(normalized));
}

fn normalize_clocks(settings: &mut Map<String, Value>, errors: &mut Vec<ValidationError>) {
    let clock_period = settings.get("clock_period").and_then(Value::as_f64);
    let clocks_empty = settings
        .get("clocks")
        .map(|v| matches!(v, Value::Object(m) if m.is_empty()) || v.is_null())
        .unwrap_or(true);

    if clocks_empty {
        if let Some(period) = clock_period {
            let mut clock = Map::new();
            clock.insert("period".to_string(), period.into());
            let mut clocks = Map::new();
            clocks.insert("main_clock".to_string(), Value::Object(clock));
            settings.insert("clocks".to_string(), Value::Object(clocks));
        }
        return;
    }

    let Some(Value::Object(clocks)) = settings.get("clocks").cloned() else {
        return;
    };

    // clock_period unset, clocks non-empty: take from main_clock, else first by insertion order.
    if clock_period.is_none() {
        let derived = clocks.get("main_clock").or_else(|| clocks.values().next()).and_then(period_or_freq);
        if let Some(period) = derived {
            settings.insert("clock_period".to_string(), period.into());
        }
    } else if let Some(period) = clock_period {
        // single-clock coherence: top-level clock_period overrides the sole/main entry.
        let target_key = if clocks.len() == 1 {
            clocks.keys().next().cloned()
        } else if clocks.contains_key("main_clock") {
            Some("main_clock".to_string())
        } else {
            None
        };
        if let Some(key) = target_key {
            let mut clocks = clocks;
            if let Some(Value::Object(entry)) = clocks.get_mut(&key) {
                entry.insert("period".to_string(), period.into());
                entry.remove("freq");
            }
            settings.insert("clocks".to_string(), Value::Object(clocks));
        }
    }

    if let Some(Value::Object(clocks)) = settings.get("clocks") {
        for (name, entry) in clocks {
            if period_of(entry).is_none() && entry.get("freq").and_then(Value::as_f64).is_none() {
                errors.push((
                    Some(format!("clocks.{name}")),
                    "exactly one of period or freq must be set".to_string(),
                    None,
                    Some("value_error".to_string()),
                ));
            }
        }
    }
}

fn period_of(entry: &Value) -> Option<f64> {
    entry.get("period").and_then(Value::as_f64)
}

/// An entry's period, or its period derived from `freq` (in MHz) when no
/// explicit period is given.
fn period_or_freq(entry: &Value) -> Option<f64> {
    period_of(entry).or_else(|| entry.get("freq").and_then(Value::as_f64).map(|freq| round3(1000.0 / freq)))
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

fn normalize_quiet(settings: &mut Map<String, Value>) {
    let verbose_truthy = settings
        .get("verbose")
        .map(|v| match v {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_i64().map(|i| i != 0).unwrap_or(false),
            _ => false,
        })
        .unwrap_or(false);
    let debug_truthy = settings.get("debug").and_then(Value::as_bool).unwrap_or(false);
    if verbose_truthy || debug_truthy {
        settings.insert("quiet".to_string(), Value::Bool(false));
    }
}

fn validate_types(settings: &Map<String, Value>, errors: &mut Vec<ValidationError>) {
    let check_bool = |key: &str, settings: &Map<String, Value>, errors: &mut Vec<ValidationError>| {
        if let Some(v) = settings.get(key) {
            if !v.is_boolean() {
                errors.push((
                    Some(key.to_string()),
                    "must be a boolean".to_string(),
                    None,
                    Some("type_error".to_string()),
                ));
            }
        }
    };
    for key in ["debug", "dockerized", "print_commands"] {
        check_bool(key, settings, errors);
    }
    if let Some(v) = settings.get("timeout_seconds") {
        if v.as_u64().is_none() {
            errors.push((
                Some("timeout_seconds".to_string()),
                "must be a non-negative integer".to_string(),
                None,
                Some("type_error".to_string()),
            ));
        }
    }
}

/// `base <- a <- b`, keys in `a`/`b` win over `base`. Recursive objects are
/// merged key-by-key; arrays and scalars in the overlay replace the base
/// wholesale (array order matters, there is no element-wise merge).
pub fn merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (k, v) in overlay_map {
                let merged_value = match merged.get(k) {
                    Some(existing) => merge(existing, v),
                    None => v.clone(),
                };
                merged.insert(k.clone(), merged_value);
            }
            Value::Object(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

/// Merges an ordered chain of layers, lowest priority first.
pub fn merge_layers(layers: &[Value]) -> Value {
    layers
        .iter()
        .fold(Value::Object(Map::new()), |acc, layer| merge(&acc, layer))
}

/// Sets `path` (dot-notation, e.g. `"synth.steps.synth.directive"`) to
/// `value` inside `map`, creating intermediate objects as needed.
pub fn set_hierarchy(map: &mut Map<String, Value>, path: &str, value: Value) {
    let mut parts = path.split('.');
    let Some(first) = parts.next() else { return };
    let rest: Vec<&str> = parts.collect();
    if rest.is_empty() {
        map.insert(first.to_string(), value);
        return;
    }
    let entry = map
        .entry(first.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    if let Value::Object(nested) = entry {
        set_hierarchy(nested, &rest.join("."), value);
    }
}

/// Coerces a CLI override's string value: strict int -> strict float ->
/// true/false/yes/no (case-insensitive) -> comma-list -> string.
pub fn coerce_value(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::from(f);
    }
    match raw.to_lowercase().as_str() {
        "true" | "yes" => return Value::Bool(true),
        "false" | "no" => return Value::Bool(false),
        _ => {}
    }
    if raw.contains(',') {
        return Value::Array(raw.split(',').map(|s| Value::String(s.trim().to_string())).collect());
    }
    Value::String(raw.to_string())
}

/// Parses `KEY=VALUE[,KEY=VALUE...]` CLI overrides into a hierarchical map.
/// Each `KEY` may use dot-notation.
///
/// Note: the top-level separator is the comma between `KEY=VALUE` pairs
/// appearing in a *single repeated flag value*, not the comma-list value
/// coercion rule (which applies to `VALUE`'s own contents once an `=` has
/// already been located).
pub fn parse_flow_settings_overrides(entries: &[String]) -> Result<Map<String, Value>, String> {
    let mut result = Map::new();
    for entry in entries {
        for kv in entry.split(',') {
            let kv = kv.trim();
            if kv.is_empty() {
                continue;
            }
            let (key, val) = kv
                .split_once('=')
                .ok_or_else(|| format!("setting override `{kv}` is not in KEY=VALUE format"))?;
            set_hierarchy(&mut result, key.trim(), coerce_value(val.trim()));
        }
    }
    Ok(result)
}

/// Converts a (possibly dotted) override map into a plain JSON map, useful
/// when an in-memory settings dict (not a CLI string) needs the same
/// dot-expansion as [`parse_flow_settings_overrides`].
pub fn expand_dict_keys(input: &BTreeMap<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (k, v) in input {
        set_hierarchy(&mut out, k, v.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_clocks_with_period_synthesizes_main_clock() {
        let mut settings = Map::new();
        settings.insert("clock_period".to_string(), json!(5.0));
        let errors = validate_and_normalize(&mut settings);
        assert!(errors.is_empty());
        assert_eq!(
            settings.get("clocks"),
            Some(&json!({"main_clock": {"period": 5.0}}))
        );
    }

    #[test]
    fn single_clock_by_freq_derives_clock_period() {
        let mut settings = Map::new();
        settings.insert("clocks".to_string(), json!({"c1": {"freq": 100.0}}));
        let errors = validate_and_normalize(&mut settings);
        assert!(errors.is_empty());
        assert_eq!(settings.get("clock_period"), Some(&json!(10.0)));
    }

    #[test]
    fn top_level_clock_period_overrides_main_clock() {
        let mut settings = Map::new();
        settings.insert(
            "clocks".to_string(),
            json!({"main_clock": {"period": 4.0}}),
        );
        settings.insert("clock_period".to_string(), json!(5.0));
        validate_and_normalize(&mut settings);
        assert_eq!(
            settings.get("clocks").unwrap().get("main_clock").unwrap().get("period"),
            Some(&json!(5.0))
        );
    }

    #[test]
    fn quiet_coerced_false_when_verbose() {
        let mut settings = Map::new();
        settings.insert("verbose".to_string(), json!(1));
        settings.insert("quiet".to_string(), json!(true));
        validate_and_normalize(&mut settings);
        assert_eq!(settings.get("quiet"), Some(&json!(false)));
    }

    #[test]
    fn settings_to_dict_hierarchy() {
        let overrides = vec!["k.a=1,k.b=2".to_string()];
        let parsed = parse_flow_settings_overrides(&overrides).unwrap();
        assert_eq!(parsed, json!({"k": {"a": 1, "b": 2}}).as_object().unwrap().clone());
    }

    #[test]
    fn hierarchical_override_preserves_siblings() {
        let overrides = vec![
            "synth.steps.synth.directive=PerformanceOptimized,impl.strategy=Timing".to_string(),
        ];
        let parsed = parse_flow_settings_overrides(&overrides).unwrap();
        assert_eq!(
            parsed,
            json!({
                "synth": {"steps": {"synth": {"directive": "PerformanceOptimized"}}},
                "impl": {"strategy": "Timing"},
            })
            .as_object()
            .unwrap()
            .clone()
        );
    }

    #[test]
    fn merge_is_associative_for_disjoint_overlays() {
        let base = json!({"a": 1});
        let a = json!({"b": 2});
        let b = json!({"c": 3});
        let left = merge(&merge(&base, &a), &b);
        let right = merge(&base, &merge(&a, &b));
        assert_eq!(left, right);
    }

    #[test]
    fn merge_precedence_is_last_wins() {
        let library_defaults = json!({"synth": {"strategy": "Default"}});
        let cli_override = json!({"synth": {"strategy": "Timing"}});
        let effective = merge(&library_defaults, &cli_override);
        assert_eq!(effective["synth"]["strategy"], json!("Timing"));
    }

    #[test]
    fn coerce_value_rules() {
        assert_eq!(coerce_value("42"), json!(42));
        assert_eq!(coerce_value("3.5"), json!(3.5));
        assert_eq!(coerce_value("yes"), json!(true));
        assert_eq!(coerce_value("No"), json!(false));
        assert_eq!(coerce_value("a,b,c"), json!(["a", "b", "c"]));
        assert_eq!(coerce_value("hello"), json!("hello"));
    }
}
