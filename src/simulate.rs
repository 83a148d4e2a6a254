use crate::{
    CommandSpec, ExecutionOutcome, ExecutionRecord, ExperimentConfig, PipelineError, SimConfig,
    Stage, WorkloadJob, get_sim_dir, run_bounded,
};
use log::{info, warn};
use std::path::{Path, PathBuf};

/// File name of the simulator's report inside a run directory
pub const REPORT_FILE: &str = "sim.out";

const LLC_PREFIX: &str = "perf_model/l3_cache";

#[derive(Debug, Clone)]
pub struct SimulatorSettings {
    pub program: PathBuf,
    pub cores: u32,
    pub instructions_m: u64,
    pub warmup_m: u64,
    pub extra_args: Vec<String>,
    pub out_root: PathBuf,
}

impl SimulatorSettings {
    pub fn from_config(config: &ExperimentConfig) -> SimulatorSettings {
        SimulatorSettings {
            program: config.simulator.program.clone(),
            cores: config.simulator.cores,
            instructions_m: config.simulator.instructions_m,
            warmup_m: config.simulator.warmup_m,
            extra_args: config.simulator.extra_args.clone(),
            out_root: config.out_root.clone(),
        }
    }

    pub fn outdir(&self, bench: &str, config: &SimConfig) -> PathBuf {
        get_sim_dir(&self.out_root, bench, &config.name, self.instructions_m)
    }
}

/// `key=value` parameter overrides describing one LLC configuration
pub fn config_overrides(config: &SimConfig) -> Vec<String> {
    let mut overrides = vec![
        format!("{}/cache_size={}", LLC_PREFIX, config.size_bytes / 1024),
        format!("{}/associativity={}", LLC_PREFIX, config.associativity),
        format!("{}/tags_access_time={}", LLC_PREFIX, config.tags_access_cycles),
        format!("{}/data_access_time={}", LLC_PREFIX, config.data_access_cycles),
        format!(
            "{}/llc/read_hit_latency_cycles={}",
            LLC_PREFIX, config.read_hit_cycles
        ),
        format!(
            "{}/llc/write_hit_latency_cycles={}",
            LLC_PREFIX, config.write_hit_cycles
        ),
    ];
    if let Some(energy) = &config.energy {
        overrides.extend([
            format!("{}/llc/e_read_hit_pJ={}", LLC_PREFIX, energy.e_read_hit_pj),
            format!("{}/llc/e_write_hit_pJ={}", LLC_PREFIX, energy.e_write_hit_pj),
            format!("{}/llc/e_miss_pJ={}", LLC_PREFIX, energy.e_miss_pj),
            format!("{}/llc/p_leak_mW={}", LLC_PREFIX, energy.p_leak_mw),
        ]);
    }
    overrides
}

/// Instruction-count stop condition, counts given in instructions
pub fn stop_spec(instructions: u64, warmup: u64) -> String {
    if warmup > 0 {
        format!("stop-by-icount:{}:{}", instructions, warmup)
    } else {
        format!("stop-by-icount:{}", instructions)
    }
}

pub fn build_command(
    settings: &SimulatorSettings,
    job: &WorkloadJob,
    config: &SimConfig,
    outdir: &Path,
) -> CommandSpec {
    let mut spec = CommandSpec::new(&settings.program)
        .arg("-n")
        .arg(settings.cores.to_string())
        .arg("-d")
        .arg(outdir.to_string_lossy());
    for item in config_overrides(config) {
        spec = spec.arg("-g").arg(item);
    }
    spec.arg("-s")
        .arg(stop_spec(job.instructions, job.warmup_instructions))
        .args(settings.extra_args.iter().cloned())
        .arg("--")
        .arg(job.executable.to_string_lossy())
        .args(job.args.iter().cloned())
        .current_dir(&job.working_dir)
        .stdin_file(job.stdin.clone())
        .stdout_file(outdir.join("sim.stdout"))
        .stderr_file(outdir.join("sim.stderr"))
}

/// One simulation of one configuration
#[derive(Debug)]
pub struct SimRun {
    pub config: SimConfig,
    pub outdir: PathBuf,
    pub record: Option<ExecutionRecord>,
    /// path of the report on success
    pub result: crate::Result<PathBuf>,
}

fn run_simulation(
    job: &WorkloadJob,
    config: &SimConfig,
    settings: &SimulatorSettings,
    outdir: &Path,
) -> crate::Result<(ExecutionRecord, crate::Result<PathBuf>)> {
    std::fs::create_dir_all(outdir)?;
    let spec = build_command(settings, job, config, outdir);
    info!(
        "Simulating {} with {} ({} LLC, {}-way)",
        job.id,
        config.name,
        size::Size::from_bytes(config.size_bytes),
        config.associativity
    );
    // no bound, the simulator is left to finish
    let record = run_bounded(&spec, None)?;
    let result = match record.outcome {
        ExecutionOutcome::Failed(code) => Err(PipelineError::Failed {
            stage: Stage::Simulate,
            code,
        }),
        _ => {
            let report = outdir.join(REPORT_FILE);
            if report.is_file() {
                Ok(report)
            } else {
                Err(PipelineError::not_found(
                    &job.id,
                    format!("no {} in {}", REPORT_FILE, outdir.display()),
                ))
            }
        }
    };
    Ok((record, result))
}

pub fn simulate(job: &WorkloadJob, config: &SimConfig, settings: &SimulatorSettings) -> SimRun {
    let outdir = settings.outdir(&job.id, config);
    let (record, result) = match run_simulation(job, config, settings, &outdir) {
        Ok((record, result)) => (Some(record), result),
        Err(err) => (None, Err(err)),
    };
    if let Err(err) = &result {
        warn!("Simulation of {} with {} failed: {}", job.id, config.name, err);
    }
    SimRun {
        config: config.clone(),
        outdir,
        record,
        result,
    }
}

/// Simulate every configuration in turn; a failing one does not stop the rest
pub fn simulate_all(
    job: &WorkloadJob,
    configs: &[&SimConfig],
    settings: &SimulatorSettings,
) -> Vec<SimRun> {
    configs
        .iter()
        .map(|config| simulate(job, config, settings))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConfigLabel, EnergyParams};

    fn sim_config(label: ConfigLabel, name: &str) -> SimConfig {
        SimConfig {
            label,
            name: name.to_string(),
            size_bytes: 32 * 1024 * 1024,
            associativity: 16,
            tags_access_cycles: 10,
            data_access_cycles: 30,
            read_hit_cycles: 6,
            write_hit_cycles: 17,
            energy: None,
        }
    }

    fn job(dir: &Path) -> WorkloadJob {
        WorkloadJob {
            id: "541.leela_r".to_string(),
            executable: dir.join("leela_r_base.x"),
            working_dir: dir.to_path_buf(),
            args: vec!["ref.sgf".to_string()],
            stdin: None,
            instructions: 100_000_000,
            warmup_instructions: 0,
            resolved_by: "recorded-invocation",
        }
    }

    fn settings(dir: &Path, script: &str) -> SimulatorSettings {
        let program = dir.join("run-sim.sh");
        std::fs::write(&program, format!("#!/bin/sh\n{}\n", script)).unwrap();
        let mut perms = std::fs::metadata(&program).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&program, perms).unwrap();
        SimulatorSettings {
            program,
            cores: 1,
            instructions_m: 100,
            warmup_m: 0,
            extra_args: vec![],
            out_root: dir.join("results"),
        }
    }

    #[test]
    fn test_overrides() {
        let mut config = sim_config(ConfigLabel::Alternative, "jans");
        let overrides = config_overrides(&config);
        assert_eq!(overrides[0], "perf_model/l3_cache/cache_size=32768");
        assert_eq!(overrides.len(), 6);

        config.energy = Some(EnergyParams::JANS);
        let overrides = config_overrides(&config);
        assert_eq!(overrides.len(), 10);
        assert!(overrides.contains(&"perf_model/l3_cache/llc/e_write_hit_pJ=2305".to_string()));
        assert_eq!(stop_spec(100_000_000, 0), "stop-by-icount:100000000");
        assert_eq!(stop_spec(100, 10), "stop-by-icount:100:10");
    }

    #[test]
    fn test_command_line() {
        let dir = tempfile::tempdir().unwrap();
        // $4 is the output directory
        let settings = settings(dir.path(), "echo \"$@\" > \"$4/sim.out\"");
        let run = simulate(
            &job(dir.path()),
            &sim_config(ConfigLabel::Baseline, "sram"),
            &settings,
        );
        let report = run.result.unwrap();
        assert_eq!(run.outdir, dir.path().join("results/541.leela_r_sram_100M"));
        let argv = std::fs::read_to_string(report).unwrap();
        assert!(argv.starts_with("-n 1 -d "));
        assert!(argv.contains("-g perf_model/l3_cache/llc/write_hit_latency_cycles=17"));
        assert!(argv.contains("-s stop-by-icount:100000000 -- "));
        assert!(argv.trim_end().ends_with("leela_r_base.x ref.sgf"));
    }

    #[test]
    fn test_one_failure_does_not_skip_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(
            dir.path(),
            "case \"$4\" in *sram*) exit 3;; esac\necho 'Instructions | 1' > \"$4/sim.out\"",
        );
        let baseline = sim_config(ConfigLabel::Baseline, "sram");
        let alternative = sim_config(ConfigLabel::Alternative, "jans");
        let runs = simulate_all(&job(dir.path()), &[&baseline, &alternative], &settings);
        assert_eq!(runs.len(), 2);
        assert!(matches!(
            runs[0].result,
            Err(PipelineError::Failed {
                stage: Stage::Simulate,
                code: 3
            })
        ));
        assert!(runs[1].result.is_ok());
    }

    #[test]
    fn test_missing_report() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), "exit 0");
        let run = simulate(
            &job(dir.path()),
            &sim_config(ConfigLabel::Baseline, "sram"),
            &settings,
        );
        assert_eq!(
            run.record.map(|r| r.outcome),
            Some(ExecutionOutcome::Completed)
        );
        assert!(matches!(run.result, Err(PipelineError::NotFound { .. })));
    }
}
