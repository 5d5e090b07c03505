//! Loading `xedaproject.{toml|json|yaml}` and standalone design files into
//! an `xeda_core::design::Design` plus a flow-settings default layer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use serde_json::{Map, Value};
use xeda_core::design::{Design, LanguageOptions, ParamValue, Rtl, Source, Tb};

/// Raw on-disk shape of a design record, before source paths are resolved
/// and hashed into [`Source`]s.
#[derive(Debug, Deserialize)]
struct RawDesign {
    name: String,
    rtl: RawRtl,
    #[serde(default)]
    tb: RawTb,
    #[serde(default)]
    parameters: BTreeMap<String, ParamValue>,
    #[serde(default)]
    language: LanguageOptions,
    #[serde(default)]
    flow: Map<String, Value>,
    #[serde(default)]
    flows: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRtl {
    sources: Vec<String>,
    top: String,
    #[serde(default)]
    clocks: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTb {
    #[serde(default)]
    sources: Vec<String>,
    #[serde(default)]
    top: Option<String>,
    #[serde(default)]
    configuration_specification: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawProject {
    design: Option<RawDesign>,
    designs: Option<Vec<RawDesign>>,
    #[serde(default)]
    flow: Map<String, Value>,
    #[serde(default)]
    flows: Map<String, Value>,
}

/// Either a multi-design project file or a single design file, loaded
/// relative to `base_dir` for source path resolution.
pub struct LoadedProject {
    pub designs: Vec<Design>,
    /// Flow name -> default settings contributed by the project/design
    /// file, merged beneath CLI overrides by the caller.
    pub flow_defaults: Map<String, Value>,
}

fn parse_value(path: &Path, contents: &str) -> Result<Value> {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "toml" => toml::from_str(contents).with_context(|| format!("parsing {} as TOML", path.display())),
        "json" => serde_json::from_str(contents).with_context(|| format!("parsing {} as JSON", path.display())),
        "yaml" | "yml" => {
            serde_yaml::from_str(contents).with_context(|| format!("parsing {} as YAML", path.display()))
        }
        other => bail!("unrecognized project file extension `{other}` for {}", path.display()),
    }
}

fn resolve_source(base_dir: &Path, raw: &str) -> Result<Source> {
    let path = base_dir.join(raw);
    Source::new(&path, None).with_context(|| format!("reading source `{}`", path.display()))
}

fn build_design(base_dir: &Path, raw: RawDesign) -> Result<(Design, Map<String, Value>)> {
    let rtl_sources = raw
        .rtl
        .sources
        .iter()
        .map(|s| resolve_source(base_dir, s))
        .collect::<Result<Vec<_>>>()?;
    let tb_sources = raw
        .tb
        .sources
        .iter()
        .map(|s| resolve_source(base_dir, s))
        .collect::<Result<Vec<_>>>()?;

    let design = Design {
        name: raw.name,
        rtl: Rtl { sources: rtl_sources, top: raw.rtl.top, clocks: raw.rtl.clocks },
        tb: Tb { sources: tb_sources, top: raw.tb.top, configuration_specification: raw.tb.configuration_specification },
        parameters: raw.parameters,
        language: raw.language,
    };

    let flow_defaults = xeda_core::settings::merge(&Value::Object(raw.flow), &Value::Object(raw.flows))
        .as_object()
        .cloned()
        .unwrap_or_default();
    Ok((design, flow_defaults))
}

/// Loads a `xedaproject.{toml|json|yaml}` file, which may declare one
/// `design` or several `designs`, plus project-wide flow defaults.
pub fn load_project(path: &Path) -> Result<LoadedProject> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let raw: RawProject = serde_yaml_or_toml_or_json(path, &contents)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut raw_designs = Vec::new();
    if let Some(d) = raw.design {
        raw_designs.push(d);
    }
    if let Some(ds) = raw.designs {
        raw_designs.extend(ds);
    }
    if raw_designs.is_empty() {
        bail!("{} declares neither `design` nor `designs`", path.display());
    }

    let project_flow_defaults = xeda_core::settings::merge(&Value::Object(raw.flow), &Value::Object(raw.flows));
    let mut designs = Vec::new();
    let mut flow_defaults = project_flow_defaults.as_object().cloned().unwrap_or_default();
    for raw_design in raw_designs {
        let (design, design_flow_defaults) = build_design(base_dir, raw_design)?;
        flow_defaults = xeda_core::settings::merge(&Value::Object(flow_defaults), &Value::Object(design_flow_defaults))
            .as_object()
            .cloned()
            .unwrap_or_default();
        designs.push(design);
    }

    Ok(LoadedProject { designs, flow_defaults })
}

/// Loads a standalone `<name>.{toml|json|yaml}` design file: a single
/// design record at the root, with an optional sibling `flow`/`flows`
/// section for design-level flow defaults.
pub fn load_design_file(path: &Path) -> Result<(Design, Map<String, Value>)> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let raw: RawDesign = serde_yaml_or_toml_or_json(path, &contents)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    build_design(base_dir, raw)
}

fn serde_yaml_or_toml_or_json<T: serde::de::DeserializeOwned>(path: &Path, contents: &str) -> Result<T> {
    let value = parse_value(path, contents)?;
    serde_json::from_value(value).map_err(|e| anyhow!("{}: {e}", path.display()))
}

/// Finds the design named `name` among `designs`, or the sole entry if
/// only one was loaded and no name was requested.
pub fn select_design(designs: Vec<Design>, name: Option<&str>) -> Result<Design> {
    match name {
        Some(name) => designs
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| anyhow!("no design named `{name}` in project file")),
        None if designs.len() == 1 => Ok(designs.into_iter().next().unwrap()),
        None => bail!(
            "project file declares {} designs; pass --design-name to pick one",
            designs.len()
        ),
    }
}

pub fn default_project_path() -> PathBuf {
    PathBuf::from("xedaproject.toml")
}
