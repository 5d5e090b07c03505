//! Design model: sources, clocks, FPGA/ASIC platform targets.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::hash::semantic_hash_of;

/// HDL/constraint dialect of a [`Source`] file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Verilog,
    SystemVerilog,
    Vhdl,
    Bluespec,
    Sdc,
    CppTestbenchHelper,
    Other(String),
}

impl SourceType {
    /// Best-effort inference from a file extension.
    pub fn from_extension(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "v" => SourceType::Verilog,
            "sv" => SourceType::SystemVerilog,
            "vhd" | "vhdl" => SourceType::Vhdl,
            "bsv" | "bs" => SourceType::Bluespec,
            "sdc" => SourceType::Sdc,
            "cpp" | "cc" | "hpp" | "h" => SourceType::CppTestbenchHelper,
            other => SourceType::Other(other.to_string()),
        }
    }
}

/// A single design source file: a resolved absolute path plus its content
/// hash, computed once at construction so later hashing never re-reads the
/// file from disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub path: PathBuf,
    pub content_hash: String,
    pub source_type: SourceType,
    pub standard: Option<String>,
}

impl Source {
    /// Resolves `path` to an absolute path and hashes its contents.
    /// Fails if the file does not exist or cannot be read — sources are
    /// validated eagerly, not lazily, so a bad design fails fast.
    pub fn new(path: impl AsRef<Path>, standard: Option<String>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let abs = fs::canonicalize(path)?;
        let bytes = fs::read(&abs)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let content_hash = hex::encode(hasher.finalize());
        let source_type = SourceType::from_extension(&abs);
        Ok(Source {
            path: abs,
            content_hash,
            source_type,
            standard,
        })
    }
}

/// A parameter/generic value: integer, bool, string, or bit-vector literal
/// (e.g. `"8'hFF"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Bool(bool),
    BitVector(String),
    Str(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VhdlOptions {
    pub standard: Option<String>,
    #[serde(default)]
    pub synopsys: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerilogOptions {
    pub standard: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LanguageOptions {
    #[serde(default)]
    pub vhdl: VhdlOptions,
    #[serde(default)]
    pub verilog: VerilogOptions,
}

/// Synthesizable sources, top module, and named clock ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rtl {
    pub sources: Vec<Source>,
    pub top: String,
    /// Clock name -> port name on `top`.
    #[serde(default)]
    pub clocks: BTreeMap<String, String>,
}

/// Testbench sources and top module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tb {
    pub sources: Vec<Source>,
    pub top: Option<String>,
    #[serde(default)]
    pub configuration_specification: Option<String>,
}

/// A named hardware design: RTL + testbench sources, parameters, and
/// language options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Design {
    pub name: String,
    pub rtl: Rtl,
    #[serde(default = "default_tb")]
    pub tb: Tb,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,
    #[serde(default)]
    pub language: LanguageOptions,
}

fn default_tb() -> Tb {
    Tb {
        sources: Vec::new(),
        top: None,
        configuration_specification: None,
    }
}

impl Design {
    /// Stable hash of the RTL source set and top module name. Changing
    /// source content, adding/removing sources, or renaming `top` all
    /// change this hash; changing only the testbench does not.
    pub fn rtl_hash(&self) -> String {
        semantic_hash_of(&(
            self.rtl
                .sources
                .iter()
                .map(|s| (s.path.to_string_lossy().to_string(), s.content_hash.clone()))
                .collect::<Vec<_>>(),
            &self.rtl.top,
        ))
    }

    /// Stable hash of the testbench source set and top module name.
    pub fn tb_hash(&self) -> String {
        semantic_hash_of(&(
            self.tb
                .sources
                .iter()
                .map(|s| (s.path.to_string_lossy().to_string(), s.content_hash.clone()))
                .collect::<Vec<_>>(),
            &self.tb.top,
        ))
    }
}

/// A clock port tolerance: `freq_mhz * period_ns == 1000` within this
/// absolute error.
pub const CLOCK_TOLERANCE: f64 = 1e-3;

/// One user-supplied side of a clock spec; the other is derived.
#[derive(Debug, Clone, Copy)]
pub enum ClockPeriodOrFreq {
    Period(f64),
    Freq(f64),
}

/// A physical clock: exactly one of period/freq is user-supplied, the
/// other is derived so that `freq_mhz * period_ns == 1000`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalClock {
    pub name: String,
    pub period_ns: f64,
    pub freq_mhz: f64,
    pub rise: f64,
    pub fall: f64,
    pub uncertainty: Option<f64>,
    pub skew: Option<f64>,
    pub port: Option<String>,
}

impl PhysicalClock {
    pub fn new(
        name: Option<String>,
        period_or_freq: ClockPeriodOrFreq,
        rise: f64,
        fall: Option<f64>,
        uncertainty: Option<f64>,
        skew: Option<f64>,
        port: Option<String>,
    ) -> Self {
        let period_ns = match period_or_freq {
            ClockPeriodOrFreq::Period(p) => p,
            ClockPeriodOrFreq::Freq(f) => round3(1000.0 / f),
        };
        let freq_mhz = 1000.0 / period_ns;
        let fall = fall.unwrap_or_else(|| round3(period_ns / 2.0));
        PhysicalClock {
            name: name.unwrap_or_else(|| "main_clock".to_string()),
            period_ns,
            freq_mhz,
            rise,
            fall,
            uncertainty,
            skew,
            port,
        }
    }

    /// `true` if `freq_mhz * period_ns == 1000` within [`CLOCK_TOLERANCE`].
    pub fn is_consistent(&self) -> bool {
        (self.freq_mhz * self.period_ns - 1000.0).abs() < CLOCK_TOLERANCE
    }

    /// If this clock has no port, look one up by name in `rtl.clocks`.
    pub fn resolve_port(&mut self, rtl: &Rtl) {
        if self.port.is_none() {
            self.port = rtl.clocks.get(&self.name).cloned();
        }
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// FPGA vendor, inferred from a part number prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vendor {
    Xilinx,
    Intel,
    Lattice,
    Unknown,
}

/// `(part, vendor, family, speed_grade, package)` describing an FPGA target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fpga {
    pub part: String,
    pub vendor: Vendor,
    pub family: String,
    pub speed_grade: Option<String>,
    pub package: Option<String>,
}

/// `(part_prefix, vendor, family)` lookup table used by [`Fpga::from_part`].
const PART_PREFIXES: &[(&str, Vendor, &str)] = &[
    ("xc7", Vendor::Xilinx, "7series"),
    ("xcku", Vendor::Xilinx, "ultrascale"),
    ("xczu", Vendor::Xilinx, "zynq-ultrascale+"),
    ("xc6", Vendor::Xilinx, "spartan6"),
    ("10m", Vendor::Intel, "max10"),
    ("5ce", Vendor::Intel, "cyclone-v"),
    ("ep4c", Vendor::Intel, "cyclone-iv"),
    ("ice40", Vendor::Lattice, "ice40"),
    ("up5k", Vendor::Lattice, "ice40-ultraplus"),
    ("lfe5", Vendor::Lattice, "ecp5"),
];

impl Fpga {
    /// Infers vendor/family from a part string prefix (case-insensitive).
    pub fn from_part(part: impl Into<String>, speed_grade: Option<String>, package: Option<String>) -> Self {
        let part = part.into();
        let lower = part.to_lowercase();
        let (vendor, family) = PART_PREFIXES
            .iter()
            .find(|(prefix, _, _)| lower.starts_with(prefix))
            .map(|(_, v, f)| (*v, f.to_string()))
            .unwrap_or((Vendor::Unknown, "unknown".to_string()));
        Fpga {
            part,
            vendor,
            family,
            speed_grade,
            package,
        }
    }
}

/// Placement parameters for an ASIC [`Platform`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacementParams {
    pub utilization: f64,
    pub padding: f64,
    pub density: f64,
}

/// A named bundle of technology-kit paths/parameters for ASIC flows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    pub name: String,
    /// PVT corner name -> liberty file path.
    pub liberty: BTreeMap<String, PathBuf>,
    pub lef_files: Vec<PathBuf>,
    pub gds_layer_map: PathBuf,
    pub klayout_tech: PathBuf,
    pub placement: PlacementParams,
    pub routing_layer_bounds: (String, String),
    #[serde(default)]
    pub dont_use_cells: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_from_period_is_consistent() {
        let c = PhysicalClock::new(None, ClockPeriodOrFreq::Period(5.0), 0.0, None, None, None, None);
        assert!(c.is_consistent());
        assert_eq!(c.name, "main_clock");
        assert!((c.freq_mhz - 200.0).abs() < 1e-6);
        assert!((c.fall - 2.5).abs() < 1e-9);
    }

    #[test]
    fn clock_from_freq_is_consistent() {
        let c = PhysicalClock::new(
            Some("c1".into()),
            ClockPeriodOrFreq::Freq(100.0),
            0.0,
            None,
            None,
            None,
            None,
        );
        assert!(c.is_consistent());
        assert!((c.period_ns - 10.0).abs() < 1e-6);
    }

    #[test]
    fn fpga_vendor_inference() {
        let f = Fpga::from_part("xc7a35tcpg236-1", None, None);
        assert_eq!(f.vendor, Vendor::Xilinx);
        assert_eq!(f.family, "7series");

        let f = Fpga::from_part("ice40up5k-sg48", None, None);
        assert_eq!(f.vendor, Vendor::Lattice);

        let f = Fpga::from_part("unknownpart123", None, None);
        assert_eq!(f.vendor, Vendor::Unknown);
    }
}
