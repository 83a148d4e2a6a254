// experiment folder structure:
// experiments/
// \- {config-name}/
//    \- config.json
//
// results folder structure (out_root, one per run):
// {out_root}/
// |- config_used_{timestamp}.json
// |- features.csv
// |- summary.csv
// |- timing.csv
// |- logs/
//    \- {timestamp}_{benchmark-name}_drrun.{out,err}
// |- traces/
//    \- {timestamp}_{benchmark-name}_memtrace.log[.zst]
// |- {benchmark-name}_{config-name}_{N}M/
//    |- sim.out
//    \- sim.{stdout,stderr}
// \- output_{benchmark-name}/
//    |- energy_bounds.csv
//    \- summary.csv

use anyhow::{anyhow, bail};
use skim::{
    Skim,
    prelude::{SkimItemReader, SkimOptionsBuilder},
};
use std::{
    io::Cursor,
    path::{Path, PathBuf},
};

pub fn get_config_path<P: AsRef<Path>>(config_name: P) -> PathBuf {
    PathBuf::from("experiments")
        .join(config_name)
        .join("config.json")
}

pub fn get_config_stamp_path<P: AsRef<Path>>(out_root: P, timestamp: &str) -> PathBuf {
    out_root
        .as_ref()
        .join(format!("config_used_{}.json", timestamp))
}

pub fn get_features_path<P: AsRef<Path>>(out_root: P) -> PathBuf {
    out_root.as_ref().join("features.csv")
}

pub fn get_summary_path<P: AsRef<Path>>(out_root: P) -> PathBuf {
    out_root.as_ref().join("summary.csv")
}

pub fn get_timing_path<P: AsRef<Path>>(out_root: P) -> PathBuf {
    out_root.as_ref().join("timing.csv")
}

pub fn get_log_dir<P: AsRef<Path>>(out_root: P) -> PathBuf {
    out_root.as_ref().join("logs")
}

pub fn get_trace_dir<P: AsRef<Path>>(out_root: P) -> PathBuf {
    out_root.as_ref().join("traces")
}

pub fn get_sim_dir<P: AsRef<Path>>(
    out_root: P,
    bench: &str,
    config_name: &str,
    instructions_m: u64,
) -> PathBuf {
    out_root
        .as_ref()
        .join(format!("{}_{}_{}M", bench, config_name, instructions_m))
}

pub fn get_bench_output_dir<P: AsRef<Path>>(out_root: P, bench: &str) -> PathBuf {
    out_root.as_ref().join(format!("output_{}", bench))
}

/// Directory holding the timestamped run directories of one workload
pub fn get_workload_run_root<P: AsRef<Path>>(spec_root: P, bench: &str) -> PathBuf {
    spec_root
        .as_ref()
        .join("benchspec")
        .join("CPU")
        .join(bench)
        .join("run")
}

fn get_selection(selections: Vec<String>, prompt: &str) -> anyhow::Result<String> {
    if selections.is_empty() {
        bail!("Nothing to choose from for '{}'", prompt.trim())
    }

    let options = SkimOptionsBuilder::default()
        .height(String::from("50%"))
        .prompt(prompt.to_string())
        .build()?;

    let input = selections.join("\n");

    let item_reader = SkimItemReader::default();
    let items = item_reader.of_bufread(Cursor::new(input));

    let output =
        Skim::run_with(&options, Some(items)).ok_or_else(|| anyhow!("Selection failed"))?;
    if output.is_abort {
        bail!("User cancelled the selection")
    }

    output
        .selected_items
        .first()
        .map(|item| item.output().to_string())
        .ok_or_else(|| anyhow!("Nothing selected"))
}

pub fn ask_for_config_name() -> anyhow::Result<String> {
    let mut paths = vec![];
    for path in std::fs::read_dir(PathBuf::from("experiments"))? {
        let path = path?;
        if path.file_type()?.is_dir() && path.path().join("config.json").exists() {
            paths.push(path.file_name().to_string_lossy().into_owned());
        }
    }
    paths.sort();

    get_selection(paths, "Choose experiment config: ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(
            get_config_path("llc32mb"),
            PathBuf::from("experiments/llc32mb/config.json")
        );
        assert_eq!(
            get_sim_dir("/r", "541.leela_r", "sram", 100),
            PathBuf::from("/r/541.leela_r_sram_100M")
        );
        assert_eq!(
            get_bench_output_dir("/r", "541.leela_r"),
            PathBuf::from("/r/output_541.leela_r")
        );
        assert_eq!(
            get_workload_run_root("/spec", "505.mcf_r"),
            PathBuf::from("/spec/benchspec/CPU/505.mcf_r/run")
        );
    }
}
