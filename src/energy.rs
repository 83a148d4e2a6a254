//! LLC energy and ED²P estimates for a baseline/alternative pair
use crate::{
    ConfigLabel, EnergyModel, EnergyParams, LlcRunSettings, PipelineError, REPORT_FILE, SimConfig,
    SimSummary, file_name_string, get_bench_output_dir,
};
use log::{info, warn};
use regex::Regex;
use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

/// How the dynamic energy of a configuration was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnergyMethod {
    /// read hits, write hits and misses all reported
    Exact,
    /// only accesses and misses; hits priced at the mean of read and write
    Blended,
    /// no LLC counters, leakage only
    LeakageOnly,
}

impl EnergyMethod {
    pub fn name(&self) -> &'static str {
        match self {
            EnergyMethod::Exact => "exact",
            EnergyMethod::Blended => "blended",
            EnergyMethod::LeakageOnly => "leakage_only",
        }
    }
}

/// One simulated configuration, as the calculator sees it
#[derive(Debug, Clone)]
pub struct RunInput {
    pub name: String,
    pub label: ConfigLabel,
    pub params: EnergyParams,
    /// where the energy constants came from
    pub params_source: String,
    pub summary: SimSummary,
    pub run_settings: LlcRunSettings,
    pub outdir: PathBuf,
}

impl RunInput {
    /// Read the report in `outdir`; energy constants come from the
    /// configuration, then from the run dir, then from the label default
    pub fn load(
        name: &str,
        label: ConfigLabel,
        energy: Option<EnergyParams>,
        outdir: &Path,
    ) -> std::io::Result<RunInput> {
        let summary = SimSummary::from_file(outdir.join(REPORT_FILE))?;
        let run_settings = LlcRunSettings::scan(outdir);
        let (params, params_source) = match (energy, run_settings.energy) {
            (Some(params), _) => (params, "config".to_string()),
            (None, Some(params)) => (
                params,
                run_settings
                    .energy_source
                    .clone()
                    .unwrap_or_else(|| "run_dir".to_string()),
            ),
            (None, None) => (EnergyParams::default_for(label), "default".to_string()),
        };
        Ok(RunInput {
            name: name.to_string(),
            label,
            params,
            params_source,
            summary,
            run_settings,
            outdir: outdir.to_path_buf(),
        })
    }

    pub fn from_config(config: &SimConfig, outdir: &Path) -> std::io::Result<RunInput> {
        RunInput::load(&config.name, config.label, config.energy, outdir)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigEnergy {
    pub name: String,
    pub label: ConfigLabel,
    pub method: EnergyMethod,
    pub time_s: f64,
    pub model: EnergyModel,
    pub accesses: Option<u64>,
    pub misses: Option<u64>,
    pub read_hits: Option<u64>,
    pub write_hits: Option<u64>,
    pub leakage_j: f64,
    pub dynamic_nj: f64,
    pub dynamic_lower_nj: f64,
    pub dynamic_upper_nj: f64,
    pub energy_j: f64,
    pub energy_lower_j: f64,
    pub energy_upper_j: f64,
    pub ed2p: f64,
    pub ed2p_lower: f64,
    pub ed2p_upper: f64,
    /// relative ED²P change when 1% of accesses turn from hits into misses
    pub miss_rate_sensitivity: Option<f64>,
    /// relative ED²P change for 1% more elapsed time
    pub latency_sensitivity: Option<f64>,
    /// `ok`, or a warning when the counters disagree
    pub notes: String,
}

pub fn ed2p(energy_j: f64, time_s: f64) -> f64 {
    energy_j * time_s * time_s
}

/// Cross-check of accesses minus misses against the reported hits
pub fn consistency_note(accesses: u64, misses: u64, read_hits: u64, write_hits: u64) -> String {
    let diff = (accesses as i128 - misses as i128) - (read_hits as i128 + write_hits as i128);
    if diff == 0 {
        "ok".to_string()
    } else {
        format!("warn_A-M!=RH+WH(diff={})", diff)
    }
}

fn require<T>(value: Option<T>, input: &RunInput, field: &'static str) -> crate::Result<T> {
    value.ok_or_else(|| PipelineError::IncompleteSummary {
        config: input.name.clone(),
        field,
    })
}

/// Energy of one configuration. Instructions, cycles and elapsed time must
/// all be present.
pub fn config_energy(input: &RunInput) -> crate::Result<ConfigEnergy> {
    let summary = &input.summary;
    require(summary.instructions, input, "instructions")?;
    require(summary.cycles, input, "cycles")?;
    let time_s = require(summary.time_s(), input, "time_ns")?;
    let model = input.params.as_model();
    let leakage_j = model.p_leak_w * time_s;

    let exact = match (summary.l3_read_hits, summary.l3_write_hits, summary.l3_misses) {
        (Some(rh), Some(wh), Some(m)) => Some((rh, wh, m)),
        _ => None,
    };
    let mut notes = "breakdown_missing".to_string();
    let (method, accesses, dynamic, lower, upper, hit_cost) = if let Some((rh, wh, m)) = exact {
        let dynamic = model.e_read_nj * rh as f64
            + model.e_write_nj * wh as f64
            + model.e_miss_nj * m as f64;
        let hits = rh + wh;
        let hit_cost = if hits > 0 {
            (model.e_read_nj * rh as f64 + model.e_write_nj * wh as f64) / hits as f64
        } else {
            (model.e_read_nj + model.e_write_nj) / 2.0
        };
        let accesses = summary.l3_accesses.unwrap_or(hits + m);
        notes = consistency_note(accesses, m, rh, wh);
        if notes != "ok" {
            warn!("{}: {}", input.name, notes);
        }
        (EnergyMethod::Exact, Some(accesses), dynamic, dynamic, dynamic, Some(hit_cost))
    } else if let (Some(acc), Some(m)) = (summary.l3_accesses, summary.l3_misses) {
        let hits = acc.saturating_sub(m) as f64;
        let miss = model.e_miss_nj * m as f64;
        let as_reads = model.e_read_nj * hits + miss;
        let as_writes = model.e_write_nj * hits + miss;
        let blended = (model.e_read_nj + model.e_write_nj) / 2.0;
        (
            EnergyMethod::Blended,
            Some(acc),
            blended * hits + miss,
            as_reads.min(as_writes),
            as_reads.max(as_writes),
            Some(blended),
        )
    } else {
        (EnergyMethod::LeakageOnly, None, 0.0, 0.0, 0.0, None)
    };
    if method != EnergyMethod::Exact {
        warn!(
            "{}: no read/write hit breakdown, using {} energy",
            input.name,
            method.name()
        );
    }

    let energy_j = dynamic * 1e-9 + leakage_j;
    let energy_lower_j = lower * 1e-9 + leakage_j;
    let energy_upper_j = upper * 1e-9 + leakage_j;
    let ed2p_value = ed2p(energy_j, time_s);

    // time is held fixed, so ED²P moves with energy
    let miss_rate_sensitivity = match (accesses, hit_cost) {
        (Some(acc), Some(hit_cost)) if energy_j > 0.0 => {
            let shifted = 0.01 * acc as f64;
            Some(shifted * (model.e_miss_nj - hit_cost) * 1e-9 / energy_j)
        }
        _ => None,
    };
    let latency_sensitivity = (ed2p_value > 0.0).then(|| {
        let t = time_s * 1.01;
        ed2p(dynamic * 1e-9 + model.p_leak_w * t, t) / ed2p_value - 1.0
    });

    Ok(ConfigEnergy {
        name: input.name.clone(),
        label: input.label,
        method,
        time_s,
        model,
        accesses,
        misses: summary.l3_misses,
        read_hits: summary.l3_read_hits,
        write_hits: summary.l3_write_hits,
        leakage_j,
        dynamic_nj: dynamic,
        dynamic_lower_nj: lower,
        dynamic_upper_nj: upper,
        energy_j,
        energy_lower_j,
        energy_upper_j,
        ed2p: ed2p_value,
        ed2p_lower: ed2p(energy_lower_j, time_s),
        ed2p_upper: ed2p(energy_upper_j, time_s),
        miss_rate_sensitivity,
        latency_sensitivity,
        notes,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnergyBound {
    pub bench: String,
    pub n_m: Option<u64>,
    pub baseline: ConfigEnergy,
    pub alternative: ConfigEnergy,
    /// alternative / baseline
    pub energy_ratio: Option<f64>,
    pub ed2p_ratio: Option<f64>,
}

fn ratio(a: f64, b: f64) -> Option<f64> {
    (b > 0.0).then(|| a / b)
}

pub fn calculate(
    bench: &str,
    n_m: Option<u64>,
    baseline: &RunInput,
    alternative: &RunInput,
) -> crate::Result<EnergyBound> {
    let baseline = config_energy(baseline)?;
    let alternative = config_energy(alternative)?;
    Ok(EnergyBound {
        bench: bench.to_string(),
        n_m,
        energy_ratio: ratio(alternative.energy_j, baseline.energy_j),
        ed2p_ratio: ratio(alternative.ed2p, baseline.ed2p),
        baseline,
        alternative,
    })
}

static N_MILLIONS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_(\d+)M$").expect("valid pattern"));

/// Bench name and instruction count in millions from a run dir leaf such as
/// `541_leela_r_sram_100M`, given the configuration names in use
pub fn infer_bench_and_nm<P: AsRef<Path>>(
    run_dir: P,
    config_names: &[&str],
) -> (String, Option<u64>) {
    let leaf = file_name_string(run_dir);
    let n_m = N_MILLIONS
        .captures(&leaf)
        .and_then(|caps| caps[1].parse().ok());
    let lower = leaf.to_ascii_lowercase();
    let cut = config_names
        .iter()
        .filter_map(|name| lower.find(&format!("_{}", name.to_ascii_lowercase())))
        .min();
    let bench = match cut {
        Some(cut) => leaf[..cut].to_string(),
        None => N_MILLIONS.replace(&leaf, "").into_owned(),
    };
    (bench, n_m)
}

pub const ENERGY_HEADER: [&str; 28] = [
    "benchmark",
    "n_m",
    "config",
    "label",
    "method",
    "time_s",
    "l3_accesses",
    "l3_misses",
    "l3_read_hits",
    "l3_write_hits",
    "leak_W",
    "leak_J",
    "dyn_nJ",
    "energy_J",
    "ed2p_J_s2",
    "dyn_lower_nJ",
    "dyn_upper_nJ",
    "energy_lower_J",
    "energy_upper_J",
    "ed2p_lower_J_s2",
    "ed2p_upper_J_s2",
    "energy_ratio",
    "ed2p_ratio",
    "miss_rate_sensitivity",
    "latency_sensitivity",
    "energy_scope",
    "energy_source",
    "notes",
];

pub const SUMMARY_HEADER: [&str; 20] = [
    "timestamp",
    "bench",
    "n_m",
    "config",
    "instructions",
    "cycles",
    "ipc",
    "time_ns",
    "l3_acc",
    "l3_miss",
    "l3_miss_rate_pct",
    "dram_acc",
    "dram_lat_ns",
    "outdir",
    "l3_read_hits",
    "l3_write_hits",
    "rd_hit_cycles",
    "wr_hit_cycles",
    "core_period_ns",
    "avg_l3_hit_ns",
];

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn opt_f(value: Option<f64>, precision: usize) -> String {
    value
        .map(|v| format!("{:.*}", precision, v))
        .unwrap_or_default()
}

fn label_name(label: ConfigLabel) -> &'static str {
    match label {
        ConfigLabel::Baseline => "baseline",
        ConfigLabel::Alternative => "alternative",
    }
}

pub fn energy_record(
    bound: &EnergyBound,
    config: &ConfigEnergy,
    energy_source: &str,
) -> Vec<String> {
    let (energy_ratio, ed2p_ratio) = match config.label {
        ConfigLabel::Baseline => (Some(1.0), Some(1.0)),
        ConfigLabel::Alternative => (bound.energy_ratio, bound.ed2p_ratio),
    };
    vec![
        bound.bench.clone(),
        opt(bound.n_m),
        config.name.clone(),
        label_name(config.label).to_string(),
        config.method.name().to_string(),
        format!("{:.6}", config.time_s),
        opt(config.accesses),
        opt(config.misses),
        opt(config.read_hits),
        opt(config.write_hits),
        format!("{:.3}", config.model.p_leak_w),
        format!("{:.6}", config.leakage_j),
        format!("{:.0}", config.dynamic_nj),
        format!("{:.6}", config.energy_j),
        format!("{:.9e}", config.ed2p),
        format!("{:.0}", config.dynamic_lower_nj),
        format!("{:.0}", config.dynamic_upper_nj),
        format!("{:.6}", config.energy_lower_j),
        format!("{:.6}", config.energy_upper_j),
        format!("{:.9e}", config.ed2p_lower),
        format!("{:.9e}", config.ed2p_upper),
        opt_f(energy_ratio, 6),
        opt_f(ed2p_ratio, 6),
        opt_f(config.miss_rate_sensitivity, 6),
        opt_f(config.latency_sensitivity, 6),
        "llc_only".to_string(),
        energy_source.to_string(),
        config.notes.clone(),
    ]
}

pub fn summary_record(
    timestamp: &str,
    bench: &str,
    n_m: Option<u64>,
    input: &RunInput,
) -> Vec<String> {
    let s = &input.summary;
    let settings = &input.run_settings;
    vec![
        timestamp.to_string(),
        bench.to_string(),
        opt(n_m),
        input.name.clone(),
        opt(s.instructions),
        opt(s.cycles),
        opt(s.ipc),
        opt(s.time_ns),
        opt(s.l3_accesses),
        opt(s.l3_misses),
        opt_f(s.l3_miss_rate_pct, 2),
        opt(s.dram_accesses),
        opt_f(s.dram_latency_ns, 2),
        input.outdir.display().to_string(),
        opt(s.l3_read_hits),
        opt(s.l3_write_hits),
        opt(settings.read_hit_cycles),
        opt(settings.write_hit_cycles),
        opt_f(s.core_period_ns(), 9),
        opt_f(settings.avg_l3_hit_ns(s), 6),
    ]
}

fn write_overwrite<I, R>(path: &Path, header: &[&str], records: I) -> crate::Result<()>
where
    I: IntoIterator<Item = R>,
    R: IntoIterator,
    R::Item: AsRef<[u8]>,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(header)?;
    for record in records {
        writer.write_record(record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Per-bench summary rows; written even when no bound could be computed
pub fn write_bench_summary(
    results_root: &Path,
    bench: &str,
    n_m: Option<u64>,
    timestamp: &str,
    inputs: &[&RunInput],
) -> crate::Result<PathBuf> {
    let path = get_bench_output_dir(results_root, bench).join("summary.csv");
    write_overwrite(
        &path,
        &SUMMARY_HEADER,
        inputs
            .iter()
            .map(|input| summary_record(timestamp, bench, n_m, input)),
    )?;
    info!("Wrote {}", path.display());
    Ok(path)
}

/// `output_<bench>/energy_bounds.csv`, one row per configuration
pub fn write_energy_bounds(
    results_root: &Path,
    bound: &EnergyBound,
    baseline: &RunInput,
    alternative: &RunInput,
) -> crate::Result<PathBuf> {
    let path = get_bench_output_dir(results_root, &bound.bench).join("energy_bounds.csv");
    write_overwrite(
        &path,
        &ENERGY_HEADER,
        [
            energy_record(bound, &bound.baseline, &baseline.params_source),
            energy_record(bound, &bound.alternative, &alternative.params_source),
        ],
    )?;
    info!("Wrote {}", path.display());
    Ok(path)
}
