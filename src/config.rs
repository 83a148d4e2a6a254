use crate::{PipelineError, expand_path, expand_string};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which side of the comparison a simulator configuration stands for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Hash, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigLabel {
    Baseline,
    Alternative,
}

/// LLC energy constants as simulators take them: pJ per event, mW leakage
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EnergyParams {
    pub e_read_hit_pj: f64,
    pub e_write_hit_pj: f64,
    pub e_miss_pj: f64,
    pub p_leak_mw: f64,
}

/// Energy constants in the units the calculator works in
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyModel {
    pub e_read_nj: f64,
    pub e_write_nj: f64,
    pub e_miss_nj: f64,
    pub p_leak_w: f64,
}

impl EnergyParams {
    pub const SRAM: EnergyParams = EnergyParams {
        e_read_hit_pj: 565.0,
        e_write_hit_pj: 537.0,
        e_miss_pj: 11.0,
        p_leak_mw: 3438.0,
    };

    pub const JANS: EnergyParams = EnergyParams {
        e_read_hit_pj: 188.0,
        e_write_hit_pj: 2305.0,
        e_miss_pj: 77.0,
        p_leak_mw: 48.0,
    };

    pub fn default_for(label: ConfigLabel) -> EnergyParams {
        match label {
            ConfigLabel::Baseline => EnergyParams::SRAM,
            ConfigLabel::Alternative => EnergyParams::JANS,
        }
    }

    pub fn as_model(&self) -> EnergyModel {
        EnergyModel {
            e_read_nj: self.e_read_hit_pj / 1000.0,
            e_write_nj: self.e_write_hit_pj / 1000.0,
            e_miss_nj: self.e_miss_pj / 1000.0,
            p_leak_w: self.p_leak_mw / 1000.0,
        }
    }
}

/// One memory technology under test: LLC geometry, timing and energy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    pub label: ConfigLabel,
    /// Short technology name used in directory names and CSV rows, e.g. "sram"
    pub name: String,
    pub size_bytes: u64,
    pub associativity: u32,
    pub tags_access_cycles: u32,
    pub data_access_cycles: u32,
    pub read_hit_cycles: u32,
    pub write_hit_cycles: u32,
    #[serde(default)]
    pub energy: Option<EnergyParams>,
}

impl SimConfig {
    /// Configured energy constants, or the technology default for the label
    pub fn energy_or_default(&self) -> EnergyParams {
        self.energy
            .unwrap_or_else(|| EnergyParams::default_for(self.label))
    }
}

/// An external command: program plus fixed leading arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentationConfig {
    /// Path to the instrumentation launcher, e.g. ~/dynamorio/bin64/drrun
    pub drrun: PathBuf,
    /// Capture client library, copied into each scratch dir before loading
    pub client: PathBuf,
    /// Wall-clock bound for one capture
    #[serde(default = "default_capture_timeout")]
    pub timeout_secs: u64,
    /// Write the merged trace zstd-compressed
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub keep_scratch: bool,
    #[serde(default = "std::env::temp_dir")]
    pub scratch_root: PathBuf,
}

fn default_capture_timeout() -> u64 {
    600
}

/// Granularity of the address keys used for totals and entropy
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AddressUnit {
    #[default]
    Byte,
    Line,
    Page,
}

impl AddressUnit {
    pub fn shift(&self) -> u32 {
        match self {
            AddressUnit::Byte => 0,
            AddressUnit::Line => 6,
            AddressUnit::Page => 12,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizerConfig {
    /// Window sizes M, one feature row per value
    #[serde(default = "default_window_sizes")]
    pub window_sizes: Vec<u32>,
    #[serde(default)]
    pub unit: AddressUnit,
    #[serde(default)]
    pub exclude_stack: bool,
    /// Use an external summarizer instead of the built-in one
    #[serde(default)]
    pub command: Option<ToolCommand>,
}

/// Window size M used when none is configured
pub const DEFAULT_WINDOW: u32 = 10;

fn default_window_sizes() -> Vec<u32> {
    vec![DEFAULT_WINDOW]
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        SummarizerConfig {
            window_sizes: default_window_sizes(),
            unit: AddressUnit::default(),
            exclude_stack: false,
            command: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Simulator launcher, e.g. ~/sniper/run-sniper
    pub program: PathBuf,
    #[serde(default = "default_cores")]
    pub cores: u32,
    /// Stop after this many million instructions
    pub instructions_m: u64,
    /// Warmup instructions in millions, 0 disables
    #[serde(default)]
    pub warmup_m: u64,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_cores() -> u32 {
    1
}

/// Locator override: workloads whose identifier contains `family`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverrideRule {
    pub family: String,
    /// Arguments; `{input}` is replaced with the located input file
    pub args: Vec<String>,
    /// File name suffix of an input to locate in the run dir, e.g. ".xz"
    #[serde(default)]
    pub locate_suffix: Option<String>,
}

pub fn default_overrides() -> Vec<OverrideRule> {
    vec![
        OverrideRule {
            family: "exchange2".to_string(),
            args: vec!["6".to_string()],
            locate_suffix: None,
        },
        OverrideRule {
            family: "xz".to_string(),
            args: vec!["{input}".to_string(), "160".to_string()],
            locate_suffix: Some(".xz".to_string()),
        },
    ]
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageSelection {
    #[serde(default = "default_true")]
    pub capture: bool,
    #[serde(default = "default_true")]
    pub simulate: bool,
}

impl Default for StageSelection {
    fn default() -> Self {
        StageSelection {
            capture: true,
            simulate: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub benchmarks: Vec<String>,
    /// Root of the benchmark tree, containing benchspec/CPU/<bench>/run
    pub spec_root: PathBuf,
    #[serde(default = "default_out_root")]
    pub out_root: PathBuf,
    /// Build+run bootstrap; the workload identifier is appended
    #[serde(default)]
    pub runner: Option<ToolCommand>,
    #[serde(default)]
    pub instrumentation: Option<InstrumentationConfig>,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
    pub simulator: SimulatorConfig,
    pub baseline: SimConfig,
    pub alternative: SimConfig,
    #[serde(default = "default_overrides")]
    pub overrides: Vec<OverrideRule>,
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub array_index: Option<u32>,
    #[serde(default)]
    pub stages: StageSelection,
}

fn default_out_root() -> PathBuf {
    PathBuf::from("results/{timestamp}")
}

fn default_max_jobs() -> usize {
    1
}

impl ExperimentConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<ExperimentConfig> {
        let config: ExperimentConfig = serde_json::from_slice(&std::fs::read(path)?)?;
        Ok(config)
    }

    /// Expand placeholders, environment variables and `~` in every path and
    /// free-form argument, fill scheduler-provided identities and validate.
    pub fn expand(mut self, timestamp: &str) -> crate::Result<ExperimentConfig> {
        self.spec_root = expand_path(&self.spec_root, timestamp)?;
        self.out_root = expand_path(&self.out_root, timestamp)?;
        if let Some(runner) = &mut self.runner {
            expand_tool(runner, timestamp)?;
        }
        if let Some(inst) = &mut self.instrumentation {
            inst.drrun = expand_path(&inst.drrun, timestamp)?;
            inst.client = expand_path(&inst.client, timestamp)?;
            inst.scratch_root = expand_path(&inst.scratch_root, timestamp)?;
        }
        if let Some(command) = &mut self.summarizer.command {
            expand_tool(command, timestamp)?;
        }
        self.simulator.program = expand_path(&self.simulator.program, timestamp)?;
        for arg in &mut self.simulator.extra_args {
            *arg = expand_string(arg, timestamp);
        }

        if self.job_id.is_none() {
            self.job_id = Some(
                std::env::var("SLURM_JOB_ID").unwrap_or_else(|_| std::process::id().to_string()),
            );
        }
        if self.array_index.is_none() {
            self.array_index = Some(
                std::env::var("SLURM_ARRAY_TASK_ID")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
            );
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.baseline.label != ConfigLabel::Baseline {
            return Err(PipelineError::Config(
                "baseline configuration must carry the baseline label".to_string(),
            ));
        }
        if self.alternative.label != ConfigLabel::Alternative {
            return Err(PipelineError::Config(
                "alternative configuration must carry the alternative label".to_string(),
            ));
        }
        if self.baseline.name == self.alternative.name {
            return Err(PipelineError::Config(format!(
                "baseline and alternative share the name {}",
                self.baseline.name
            )));
        }
        if self.max_jobs == 0 {
            return Err(PipelineError::Config("max_jobs must be at least 1".to_string()));
        }
        if self.simulator.instructions_m == 0 {
            return Err(PipelineError::Config(
                "simulator.instructions_m must be positive".to_string(),
            ));
        }
        if self.stages.capture && self.instrumentation.is_none() {
            return Err(PipelineError::Config(
                "capture stage enabled without an instrumentation section".to_string(),
            ));
        }
        Ok(())
    }

    pub fn job_id(&self) -> &str {
        self.job_id.as_deref().unwrap_or("0")
    }

    pub fn array_index(&self) -> u32 {
        self.array_index.unwrap_or(0)
    }

    pub fn sim_configs(&self) -> [&SimConfig; 2] {
        [&self.baseline, &self.alternative]
    }
}

fn expand_tool(tool: &mut ToolCommand, timestamp: &str) -> std::io::Result<()> {
    tool.program = expand_path(&tool.program, timestamp)?;
    for arg in &mut tool.args {
        *arg = expand_string(arg, timestamp);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_config_json() -> &'static str {
        r#"{
            "benchmarks": ["505.mcf_r", "541.leela_r"],
            "spec_root": "/opt/cpu2017",
            "out_root": "/tmp/results/{timestamp}",
            "instrumentation": {
                "drrun": "/opt/dynamorio/bin64/drrun",
                "client": "/opt/dynamorio/samples/bin64/libmemtrace_x86_text.so"
            },
            "simulator": { "program": "/opt/sniper/run-sniper", "instructions_m": 100 },
            "baseline": {
                "label": "baseline", "name": "sram", "size_bytes": 33554432,
                "associativity": 16, "tags_access_cycles": 10, "data_access_cycles": 30,
                "read_hit_cycles": 6, "write_hit_cycles": 6
            },
            "alternative": {
                "label": "alternative", "name": "jans", "size_bytes": 33554432,
                "associativity": 16, "tags_access_cycles": 10, "data_access_cycles": 30,
                "read_hit_cycles": 6, "write_hit_cycles": 17,
                "energy": { "e_read_hit_pj": 397, "e_write_hit_pj": 2305, "e_miss_pj": 77, "p_leak_mw": 48 }
            }
        }"#
    }

    #[test]
    fn test_parse_and_defaults() {
        let config: ExperimentConfig = serde_json::from_str(sample_config_json()).unwrap();
        let config = config.expand("20250101T000000Z").unwrap();
        assert_eq!(config.out_root, PathBuf::from("/tmp/results/20250101T000000Z"));
        assert_eq!(config.max_jobs, 1);
        assert_eq!(config.summarizer.window_sizes, vec![10]);
        assert_eq!(config.instrumentation.as_ref().unwrap().timeout_secs, 600);
        assert_eq!(config.overrides, default_overrides());
        assert!(config.stages.capture && config.stages.simulate);
        assert!(config.job_id.is_some());
    }

    #[test]
    fn test_energy_defaults_per_label() {
        let config: ExperimentConfig = serde_json::from_str(sample_config_json()).unwrap();
        assert_eq!(config.baseline.energy_or_default(), EnergyParams::SRAM);
        assert_eq!(config.alternative.energy_or_default().e_read_hit_pj, 397.0);

        let model = EnergyParams::SRAM.as_model();
        assert!((model.e_read_nj - 0.565).abs() < 1e-12);
        assert!((model.p_leak_w - 3.438).abs() < 1e-12);
    }

    #[test]
    fn test_validate_rejects_swapped_labels() {
        let mut config: ExperimentConfig = serde_json::from_str(sample_config_json()).unwrap();
        config.baseline.label = ConfigLabel::Alternative;
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }
}
