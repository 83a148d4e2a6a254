//! Compare energy bounds of multiple benchmarks
use clap::Parser;
use cli_table::{Cell, Table, print_stdout};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Paths to energy_bounds.csv files, or results roots to scan for them
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct BoundRow {
    benchmark: String,
    config: String,
    label: String,
    method: String,
    time_s: f64,
    #[serde(rename = "energy_J")]
    energy_j: f64,
    #[serde(rename = "ed2p_J_s2")]
    ed2p_j_s2: f64,
    energy_ratio: Option<f64>,
    ed2p_ratio: Option<f64>,
}

fn collect_files(path: &Path, files: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    if path.is_file() {
        files.push(path.to_path_buf());
        return Ok(());
    }
    let mut found = vec![];
    for entry in std::fs::read_dir(path)? {
        let candidate = entry?.path().join("energy_bounds.csv");
        if candidate.is_file() {
            found.push(candidate);
        }
    }
    found.sort();
    files.extend(found);
    Ok(())
}

fn geomean(values: &[f64]) -> Option<f64> {
    if values.is_empty() || values.iter().any(|v| *v <= 0.0) {
        return None;
    }
    Some((values.iter().map(|v| v.ln()).sum::<f64>() / values.len() as f64).exp())
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

fn fmt(value: Option<f64>, precision: usize) -> String {
    value
        .map(|v| format!("{:.*}", precision, v))
        .unwrap_or_else(|| "n/a".to_string())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Cli::parse();

    let mut files = vec![];
    for path in &args.paths {
        collect_files(path, &mut files)?;
    }

    let cwd = std::env::current_dir()?;
    let mut table = vec![];
    // (time ratio, energy ratio, ed2p ratio) per benchmark
    let mut columns: Vec<(f64, f64, f64)> = vec![];
    for file in &files {
        let shown = pathdiff::diff_paths(file, &cwd).unwrap_or_else(|| file.clone());
        println!("Loading energy bounds from {}", shown.display());

        let mut reader = csv::Reader::from_path(file)?;
        let rows: Vec<BoundRow> = reader.deserialize().collect::<Result<_, _>>()?;
        let baseline = rows.iter().find(|row| row.label == "baseline");
        let alternative = rows.iter().find(|row| row.label == "alternative");
        let (Some(baseline), Some(alternative)) = (baseline, alternative) else {
            println!("Skipping {}: need one baseline and one alternative row", shown.display());
            continue;
        };

        let time_ratio = alternative.time_s / baseline.time_s;
        if let (Some(energy_ratio), Some(ed2p_ratio)) =
            (alternative.energy_ratio, alternative.ed2p_ratio)
        {
            columns.push((time_ratio, energy_ratio, ed2p_ratio));
        }

        table.push(vec![
            baseline.benchmark.clone().cell(),
            format!("{} / {}", baseline.config, alternative.config).cell(),
            format!("{} / {}", baseline.method, alternative.method).cell(),
            format!("{:.4}", time_ratio).cell(),
            format!("{:.6} / {:.6}", baseline.energy_j, alternative.energy_j).cell(),
            format!("{:.3e} / {:.3e}", baseline.ed2p_j_s2, alternative.ed2p_j_s2).cell(),
            fmt(alternative.energy_ratio, 4).cell(),
            fmt(alternative.ed2p_ratio, 4).cell(),
        ]);
    }

    println!("Summary:");

    let time: Vec<f64> = columns.iter().map(|col| col.0).collect();
    let energy: Vec<f64> = columns.iter().map(|col| col.1).collect();
    let ed2p: Vec<f64> = columns.iter().map(|col| col.2).collect();
    for (name, reduce) in [
        ("Average", mean as fn(&[f64]) -> Option<f64>),
        ("Geomean", geomean),
    ] {
        table.push(vec![
            name.cell(),
            "".cell(),
            "".cell(),
            fmt(reduce(&time), 4).cell(),
            "".cell(),
            "".cell(),
            fmt(reduce(&energy), 4).cell(),
            fmt(reduce(&ed2p), 4).cell(),
        ]);
    }

    let table = table.table().title(vec![
        "Benchmark".cell(),
        "Configs".cell(),
        "Methods".cell(),
        "Time ratio".cell(),
        "Energy (J)".cell(),
        "ED²P (J·s²)".cell(),
        "Energy ratio".cell(),
        "ED²P ratio".cell(),
    ]);
    print_stdout(table)?;

    Ok(())
}
