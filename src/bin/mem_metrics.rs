//! Summarize memory traces into one feature row
use clap::{Parser, ValueEnum};
use memtech_experiments::{
    AddressUnit, DEFAULT_WINDOW, Dataset, LockPolicy, Summarizer, write_rowset,
};
use std::path::{Path, PathBuf};

#[derive(Copy, Clone, ValueEnum)]
enum Unit {
    Byte,
    Line,
    Page,
}

impl From<Unit> for AddressUnit {
    fn from(unit: Unit) -> AddressUnit {
        match unit {
            Unit::Byte => AddressUnit::Byte,
            Unit::Line => AddressUnit::Line,
            Unit::Page => AddressUnit::Page,
        }
    }
}

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Workload name written to the row
    #[arg(long)]
    name: String,

    /// Dataset csv, the header is written once
    #[arg(long)]
    csv: PathBuf,

    /// Local entropy window, as an address shift
    #[arg(long = "M", default_value_t = DEFAULT_WINDOW)]
    window: u32,

    /// Granularity of unique addresses
    #[arg(long, default_value = "byte")]
    unit: Unit,

    /// Drop accesses to the user stack region
    #[arg(long)]
    exclude_stack: bool,

    /// Trace logs, plain or zstd compressed
    #[arg(required = true)]
    traces: Vec<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Cli::parse();

    let summarizer = Summarizer {
        window: args.window,
        unit: args.unit.into(),
        exclude_stack: args.exclude_stack,
    };
    let row = summarizer.summarize(&args.name, &args.traces)?;

    let dir = args
        .csv
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let rowset = write_rowset(&[row], dir)?;
    Dataset::new(&args.csv).append_locked(&rowset, &LockPolicy::default())?;
    println!("Appended features of {} to {}", args.name, args.csv.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use memtech_experiments::SummarizerConfig;

    #[test]
    fn test_default_window_matches_pipeline() {
        let args = Cli::try_parse_from(["mem_metrics", "--name", "x", "--csv", "f.csv", "t.log"])
            .unwrap();
        assert_eq!(vec![args.window], SummarizerConfig::default().window_sizes);
    }
}
