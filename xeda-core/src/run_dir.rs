//! Run directory derivation, preexistence policy, and resource copying.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::console::Console;
use crate::error::Result;

/// Sanitizes a design name for use as a path component: keeps
/// alphanumerics, `-`, and `_`; everything else becomes `_`.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// How an existing run directory should be treated before a new attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreexistencePolicy {
    /// `incremental=true, fresh=true`: delete and start clean.
    IncrementalFresh,
    /// `incremental=true, fresh=false`: keep contents, run in place.
    IncrementalResume,
    /// `incremental=false`, backups enabled: rename aside first.
    BackupAndReplace,
    /// `incremental=false`, no backups: overwrite in place.
    Replace,
}

/// `<root>/<sanitized_design_name>[_<design_hash16>]/<flow_name>[_<flowrun_hash16>]`.
/// `design_hash` is omitted when `incremental` is set, so repeated runs of
/// the same design land in the same parent directory.
pub fn derive_run_path(
    root: &Path,
    design_name: &str,
    flow_name: &str,
    design_hash: &str,
    flowrun_hash: &str,
    incremental: bool,
) -> PathBuf {
    let design_component = if incremental {
        sanitize(design_name)
    } else {
        format!("{}_{}", sanitize(design_name), &design_hash[..16.min(design_hash.len())])
    };
    let flow_component = if incremental {
        flow_name.to_string()
    } else {
        format!("{}_{}", flow_name, &flowrun_hash[..16.min(flowrun_hash.len())])
    };
    root.join(design_component).join(flow_component)
}

/// Minimal view of `settings.json`/`results.json` needed to decide a cache
/// hit, without deserializing a flow's full settings schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecordHeader {
    pub flow_name: String,
    pub design_hash: String,
    pub flowrun_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsHeader {
    pub success: bool,
}

/// `true` if `run_path` holds a complete, matching previous run: both
/// `settings.json` and `results.json` exist, `results.success == true`,
/// and the stored identity triple matches the current one.
pub fn is_cache_hit(run_path: &Path, current: &RunRecordHeader) -> bool {
    let settings_path = run_path.join("settings.json");
    let results_path = run_path.join("results.json");
    let Ok(settings_bytes) = std::fs::read(&settings_path) else {
        return false;
    };
    let Ok(results_bytes) = std::fs::read(&results_path) else {
        return false;
    };
    let Ok(stored) = serde_json::from_slice::<RunRecordHeader>(&settings_bytes) else {
        return false;
    };
    let Ok(results) = serde_json::from_slice::<ResultsHeader>(&results_bytes) else {
        return false;
    };
    results.success
        && stored.flow_name == current.flow_name
        && stored.design_hash == current.design_hash
        && stored.flowrun_hash == current.flowrun_hash
}

/// Applies the preexistence policy to `run_path`, then ensures it exists.
pub fn apply_preexistence_policy(run_path: &Path, policy: PreexistencePolicy) -> Result<()> {
    let exists = run_path.exists();
    match policy {
        PreexistencePolicy::IncrementalFresh if exists => {
            std::fs::remove_dir_all(run_path)?;
        }
        PreexistencePolicy::IncrementalResume => {}
        PreexistencePolicy::BackupAndReplace if exists => {
            let timestamp = crate::timestamp::now_compact();
            let backup = run_path.with_file_name(format!(
                "{}.backup_{timestamp}",
                run_path.file_name().and_then(|n| n.to_str()).unwrap_or("run")
            ));
            std::fs::rename(run_path, backup)?;
        }
        PreexistencePolicy::Replace if exists => {
            std::fs::remove_dir_all(run_path)?;
        }
        _ => {}
    }
    std::fs::create_dir_all(run_path)?;
    Ok(())
}

fn scrub_pattern(flow_name: &str) -> Regex {
    Regex::new(&format!("^{}_[a-z0-9]{{16}}$", regex::escape(flow_name))).unwrap()
}

/// Deletes sibling directories of `parent` whose names match
/// `^<flow_name>_[a-z0-9]{16}$` and are not in `exclude`. Prints each
/// deletion through the shared console rather than deleting silently.
pub fn scrub_runs(flow_name: &str, parent: &Path, exclude: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let pattern = scrub_pattern(flow_name);
    let mut removed = Vec::new();
    let Ok(entries) = std::fs::read_dir(parent) else {
        return Ok(removed);
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if exclude.contains(&path) {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if path.is_dir() && pattern.is_match(name) {
            Console::println(format!("scrubbing stale run directory {}", path.display()));
            std::fs::remove_dir_all(&path)?;
            removed.push(path);
        }
    }
    Ok(removed)
}

/// Copies already-resolved `sources` into `<dep_run_path>/copied_resources/`,
/// preserving basenames. Entries that don't exist or aren't regular files
/// are silently skipped. Callers resolve a dependency descriptor's
/// relative resource paths against the depender's run path before calling
/// this (mirroring how the depender's own run_path is the frame those
/// paths are relative to).
pub fn copy_resources(dep_run_path: &Path, sources: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let dest_dir = dep_run_path.join("copied_resources");
    let mut copied = Vec::new();
    for source in sources {
        if !source.is_file() {
            continue;
        }
        std::fs::create_dir_all(&dest_dir)?;
        let Some(basename) = source.file_name() else {
            continue;
        };
        let dest = dest_dir.join(basename);
        std::fs::copy(source, &dest)?;
        copied.push(dest);
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_incremental_path_includes_both_hashes() {
        let path = derive_run_path(
            Path::new("/runs"),
            "my design",
            "synth",
            "abcdef0123456789abcdef",
            "0123456789abcdeffedcba",
            false,
        );
        assert_eq!(path, PathBuf::from("/runs/my_design_abcdef0123456789/synth_0123456789abcdef"));
    }

    #[test]
    fn incremental_path_omits_design_hash() {
        let path = derive_run_path(Path::new("/runs"), "my_design", "synth", "deadbeef", "cafebabe", true);
        assert_eq!(path, PathBuf::from("/runs/my_design/synth"));
    }

    #[test]
    fn scrub_pattern_matches_16_char_hex_suffix() {
        let re = scrub_pattern("synth");
        assert!(re.is_match("synth_0123456789abcdef"));
        assert!(!re.is_match("synth_0123456789abcde"));
        assert!(!re.is_match("other_0123456789abcdef"));
    }

    #[test]
    fn resource_copy_skips_missing_and_non_file_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let parent = tmp.path().join("parent");
        let dep = tmp.path().join("dep");
        std::fs::create_dir_all(&parent).unwrap();
        std::fs::create_dir_all(&dep).unwrap();
        std::fs::write(parent.join("a.txt"), "hi").unwrap();
        std::fs::create_dir_all(parent.join("subdir")).unwrap();

        let copied = copy_resources(
            &dep,
            &[parent.join("a.txt"), parent.join("missing.txt"), parent.join("subdir")],
        )
        .unwrap();

        assert_eq!(copied, vec![dep.join("copied_resources").join("a.txt")]);
    }

    #[test]
    fn cache_hit_requires_matching_identity_and_success() {
        let tmp = tempfile::tempdir().unwrap();
        let run_path = tmp.path();
        std::fs::write(
            run_path.join("settings.json"),
            r#"{"flow_name":"synth","design_hash":"d1","flowrun_hash":"f1"}"#,
        )
        .unwrap();
        std::fs::write(run_path.join("results.json"), r#"{"success":true}"#).unwrap();

        let matching = RunRecordHeader {
            flow_name: "synth".to_string(),
            design_hash: "d1".to_string(),
            flowrun_hash: "f1".to_string(),
        };
        assert!(is_cache_hit(run_path, &matching));

        let mismatched = RunRecordHeader { flowrun_hash: "other".to_string(), ..matching };
        assert!(!is_cache_hit(run_path, &mismatched));
    }
}
