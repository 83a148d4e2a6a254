//! Drive the LLC comparison pipeline over the configured benchmarks
use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use cli_table::{Cell, Table, print_stdout};
use log::info;
use memtech_experiments::{
    Dataset, ExperimentConfig, LockPolicy, Pipeline, PipelineReport, RowSet, RunInput, calculate,
    ask_for_config_name, get_config_path, now_utc_tag, write_bench_summary, write_energy_bounds,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Locate, capture and simulate every configured benchmark
    Run {
        /// Experiment config name, asked interactively when omitted
        #[arg(short, long)]
        config_name: Option<PathBuf>,
    },
    /// Resolve executable and arguments of benchmarks without running them
    Locate {
        #[arg(short, long)]
        config_name: Option<PathBuf>,

        /// Benchmarks to resolve, default to all configured ones
        #[arg(short, long)]
        bench: Vec<String>,
    },
    /// Capture traces and extract features only
    Capture {
        #[arg(short, long)]
        config_name: Option<PathBuf>,

        #[arg(short, long)]
        bench: Vec<String>,
    },
    /// Simulate both configurations and compute ED²P bounds only
    Simulate {
        #[arg(short, long)]
        config_name: Option<PathBuf>,

        #[arg(short, long)]
        bench: Vec<String>,
    },
    /// Append a row-set file to a shared dataset under its lock
    Aggregate {
        /// Dataset csv to append to
        #[arg(short, long)]
        dataset: PathBuf,

        /// Row-set csv with the same header
        #[arg(short, long)]
        rowset: PathBuf,

        /// Remove the row-set file once appended
        #[arg(long)]
        remove: bool,
    },
    /// Recompute ED²P bounds from existing simulation outputs
    Ed2p {
        #[arg(short, long)]
        config_name: Option<PathBuf>,

        #[arg(short, long)]
        bench: Vec<String>,
    },
}

fn load_config(config_name: &Option<PathBuf>, timestamp: &str) -> anyhow::Result<ExperimentConfig> {
    let config_name = match config_name {
        Some(name) => name.clone(),
        None => PathBuf::from(ask_for_config_name()?),
    };
    let path = get_config_path(&config_name);
    info!("Loading experiment config from {}", path.display());
    let config = ExperimentConfig::load(&path)
        .with_context(|| format!("reading {}", path.display()))?
        .expand(timestamp)?;
    Ok(config)
}

fn select_benchmarks(config: &mut ExperimentConfig, bench: &[String]) -> anyhow::Result<()> {
    if bench.is_empty() {
        return Ok(());
    }
    for name in bench {
        if !config.benchmarks.contains(name) {
            bail!("Benchmark {} is not part of this experiment", name);
        }
    }
    config.benchmarks = bench.to_vec();
    Ok(())
}

fn print_report(report: &PipelineReport) -> anyhow::Result<()> {
    let mut table = vec![];
    for job in &report.jobs {
        for stage in &job.stages {
            table.push(vec![
                job.bench.clone().cell(),
                stage.stage.cell(),
                stage.config.clone().unwrap_or_default().cell(),
                stage.status.name().cell(),
                stage.status.detail().cell(),
            ]);
        }
    }
    let table = table.table().title(vec![
        "Benchmark".cell(),
        "Stage".cell(),
        "Config".cell(),
        "Status".cell(),
        "Detail".cell(),
    ]);
    print_stdout(table)?;
    Ok(())
}

fn run_pipeline(config: ExperimentConfig, timestamp: &str) -> anyhow::Result<()> {
    let pipeline = Pipeline::new(config, timestamp);
    let report = pipeline.run()?;
    print_report(&report)?;
    println!("Results in {}", pipeline.config().out_root.display());
    if !report.success() {
        bail!("At least one benchmark failed")
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Cli::parse();
    let timestamp = now_utc_tag();

    match &args.command {
        Commands::Run { config_name } => {
            let config = load_config(config_name, &timestamp)?;
            run_pipeline(config, &timestamp)?;
        }
        Commands::Locate { config_name, bench } => {
            let mut config = load_config(config_name, &timestamp)?;
            select_benchmarks(&mut config, bench)?;
            let pipeline = Pipeline::new(config, &timestamp);

            let mut table = vec![];
            let mut missing = 0;
            for bench in &pipeline.config().benchmarks {
                match pipeline.locate(bench) {
                    Ok(job) => table.push(vec![
                        job.id.clone().cell(),
                        job.executable.display().cell(),
                        job.args.join(" ").cell(),
                        job.stdin
                            .as_ref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_default()
                            .cell(),
                        job.resolved_by.cell(),
                    ]),
                    Err(err) => {
                        missing += 1;
                        table.push(vec![
                            bench.clone().cell(),
                            err.to_string().cell(),
                            "".cell(),
                            "".cell(),
                            "".cell(),
                        ]);
                    }
                }
            }
            let table = table.table().title(vec![
                "Benchmark".cell(),
                "Executable".cell(),
                "Arguments".cell(),
                "Stdin".cell(),
                "Resolved by".cell(),
            ]);
            print_stdout(table)?;
            if missing > 0 {
                bail!("{} benchmark(s) could not be located", missing);
            }
        }
        Commands::Capture { config_name, bench } => {
            let mut config = load_config(config_name, &timestamp)?;
            select_benchmarks(&mut config, bench)?;
            config.stages.capture = true;
            config.stages.simulate = false;
            config.validate()?;
            run_pipeline(config, &timestamp)?;
        }
        Commands::Simulate { config_name, bench } => {
            let mut config = load_config(config_name, &timestamp)?;
            select_benchmarks(&mut config, bench)?;
            config.stages.capture = false;
            config.stages.simulate = true;
            run_pipeline(config, &timestamp)?;
        }
        Commands::Aggregate {
            dataset,
            rowset,
            remove,
        } => {
            let rows = Dataset::new(dataset)
                .append_locked(&RowSet::File(rowset.clone()), &LockPolicy::default())?;
            println!("Appended {} row(s) to {}", rows, dataset.display());
            if *remove {
                std::fs::remove_file(rowset)?;
            }
        }
        Commands::Ed2p { config_name, bench } => {
            let mut config = load_config(config_name, &timestamp)?;
            select_benchmarks(&mut config, bench)?;
            let pipeline = Pipeline::new(config, &timestamp);
            let config = pipeline.config();
            let n_m = Some(config.simulator.instructions_m);

            let mut table = vec![];
            for bench in &config.benchmarks {
                let [baseline, alternative] = config.sim_configs().map(|sim| {
                    RunInput::from_config(sim, &pipeline.simulator().outdir(bench, sim))
                });
                let (baseline, alternative) = match (baseline, alternative) {
                    (Ok(baseline), Ok(alternative)) => (baseline, alternative),
                    (Err(err), _) | (_, Err(err)) => {
                        println!("Skipping {}: {}", bench, err);
                        continue;
                    }
                };
                write_bench_summary(
                    &config.out_root,
                    bench,
                    n_m,
                    &timestamp,
                    &[&baseline, &alternative],
                )?;
                match calculate(bench, n_m, &baseline, &alternative) {
                    Ok(bound) => {
                        let path =
                            write_energy_bounds(&config.out_root, &bound, &baseline, &alternative)?;
                        table.push(vec![
                            bench.clone().cell(),
                            bound.baseline.method.name().cell(),
                            bound.alternative.method.name().cell(),
                            format_ratio(bound.energy_ratio).cell(),
                            format_ratio(bound.ed2p_ratio).cell(),
                            path.display().cell(),
                        ]);
                    }
                    Err(err) => println!("Skipping {}: {}", bench, err),
                }
            }
            let table = table.table().title(vec![
                "Benchmark".cell(),
                "Baseline method".cell(),
                "Alternative method".cell(),
                "Energy ratio".cell(),
                "ED²P ratio".cell(),
                "Output".cell(),
            ]);
            print_stdout(table)?;
        }
    }

    Ok(())
}

fn format_ratio(ratio: Option<f64>) -> String {
    ratio
        .map(|r| format!("{:.4}", r))
        .unwrap_or_else(|| "n/a".to_string())
}
