//! Energy and ED²P bounds from two finished simulations
use anyhow::anyhow;
use clap::Parser;
use cli_table::{Cell, Table, print_stdout};
use memtech_experiments::{
    ConfigLabel, RunInput, calculate, infer_bench_and_nm, now_utc_tag, write_bench_summary,
    write_energy_bounds,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Baseline sim.out or its run directory
    #[arg(short, long)]
    baseline: PathBuf,

    /// Alternative sim.out or its run directory
    #[arg(short, long)]
    alternative: PathBuf,

    /// Baseline configuration name, as it appears in run directory names
    #[arg(long, default_value = "sram")]
    baseline_name: String,

    /// Alternative configuration name
    #[arg(long, default_value = "jans")]
    alternative_name: String,

    /// Results root, default to the parent of the baseline run directory
    #[arg(short, long)]
    results: Option<PathBuf>,
}

fn run_dir(path: &Path) -> PathBuf {
    if path.is_file() {
        path.parent().map(Path::to_path_buf).unwrap_or_default()
    } else {
        path.to_path_buf()
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Cli::parse();

    let baseline_dir = run_dir(&args.baseline);
    let alternative_dir = run_dir(&args.alternative);
    let names = [args.baseline_name.as_str(), args.alternative_name.as_str()];
    let (bench, n_m) = infer_bench_and_nm(&baseline_dir, &names);
    let results = match &args.results {
        Some(results) => results.clone(),
        None => baseline_dir
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("{} has no parent directory", baseline_dir.display()))?,
    };
    println!(
        "Bench {} ({}M instructions), results under {}",
        bench,
        n_m.map(|n| n.to_string()).unwrap_or_else(|| "?".to_string()),
        results.display()
    );

    let baseline = RunInput::load(
        &args.baseline_name,
        ConfigLabel::Baseline,
        None,
        &baseline_dir,
    )?;
    let alternative = RunInput::load(
        &args.alternative_name,
        ConfigLabel::Alternative,
        None,
        &alternative_dir,
    )?;

    let summary = write_bench_summary(
        &results,
        &bench,
        n_m,
        &now_utc_tag(),
        &[&baseline, &alternative],
    )?;
    println!("Wrote {}", summary.display());

    let bound = calculate(&bench, n_m, &baseline, &alternative)?;
    let path = write_energy_bounds(&results, &bound, &baseline, &alternative)?;
    println!("Wrote {}", path.display());

    let mut table = vec![];
    for (config, input) in [
        (&bound.baseline, &baseline),
        (&bound.alternative, &alternative),
    ] {
        table.push(vec![
            config.name.clone().cell(),
            config.method.name().cell(),
            input.params_source.clone().cell(),
            format!("{:.6}", config.time_s).cell(),
            format!("{:.6e}", config.energy_j).cell(),
            format!("{:.6e}", config.ed2p).cell(),
            format!("[{:.6e}, {:.6e}]", config.ed2p_lower, config.ed2p_upper).cell(),
        ]);
    }
    let table = table.table().title(vec![
        "Config".cell(),
        "Method".cell(),
        "Energy params".cell(),
        "Time (s)".cell(),
        "Energy (J)".cell(),
        "ED²P (J·s²)".cell(),
        "ED²P bounds".cell(),
    ]);
    print_stdout(table)?;

    if let Some(ratio) = bound.ed2p_ratio {
        println!(
            "ED²P ratio {}/{}: {:.4}",
            args.alternative_name, args.baseline_name, ratio
        );
    }
    Ok(())
}
