//! Structured metrics from the simulator's text report
use crate::EnergyParams;
use regex::Regex;
use std::{path::Path, sync::LazyLock};

static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)\s*([A-Za-z]*)$").expect("valid pattern")
});
static UNIT_HINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\(([A-Za-z]+)\)\s*$").expect("valid pattern"));

/// A numeric cell with the unit word that followed it, if any
#[derive(Debug, Clone, PartialEq)]
pub struct Quantity {
    pub value: f64,
    pub unit: Option<String>,
}

impl Quantity {
    /// Value in nanoseconds; unitless values are taken as ns
    pub fn as_ns(&self) -> f64 {
        match self.unit.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("ps") => self.value / 1e3,
            Some("us") => self.value * 1e3,
            Some("ms") => self.value * 1e6,
            Some("s") => self.value * 1e9,
            _ => self.value,
        }
    }
}

/// Parse `1,234`, `45.9%` or `80.1 ns`; separators and percent signs are
/// dropped, a trailing unit word is kept
pub fn parse_number(cell: &str) -> Option<Quantity> {
    let cleaned: String = cell
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '_' | '%'))
        .collect();
    let caps = NUMBER.captures(cleaned.trim())?;
    let value: f64 = caps[1].parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    let unit = caps.get(2).map(|m| m.as_str()).filter(|u| !u.is_empty());
    Some(Quantity {
        value,
        unit: unit.map(str::to_string),
    })
}

#[derive(Debug)]
struct ReportLine {
    section: Option<usize>,
    label: String,
    unit_hint: Option<String>,
    cells: Vec<String>,
}

impl ReportLine {
    fn quantities(&self) -> impl Iterator<Item = Quantity> + '_ {
        self.cells.iter().filter_map(|cell| {
            parse_number(cell).map(|mut q| {
                if q.unit.is_none() {
                    q.unit = self.unit_hint.clone();
                }
                q
            })
        })
    }
}

/// Line/section view of a report
#[derive(Debug, Default)]
pub struct Report {
    sections: Vec<String>,
    lines: Vec<ReportLine>,
}

fn normalize_label(label: &str) -> (String, Option<String>) {
    let (label, hint) = match UNIT_HINT.captures(label) {
        Some(caps) => (
            &label[..caps.get(0).map_or(label.len(), |m| m.start())],
            Some(caps[1].to_string()),
        ),
        None => (label, None),
    };
    let label = label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase();
    (label, hint)
}

impl Report {
    pub fn parse(text: &str) -> Report {
        let mut report = Report::default();
        let mut section = None;
        for raw in text.lines() {
            let mut parts = raw.split('|');
            let Some(head) = parts.next() else {
                continue;
            };
            let cells: Vec<String> = parts.map(|c| c.trim().to_string()).collect();
            let (label, unit_hint) = normalize_label(head);
            if label.is_empty() {
                continue;
            }
            let indented = head.starts_with(char::is_whitespace);
            let numeric = cells.iter().any(|c| parse_number(c).is_some());
            if !indented && !numeric {
                report.sections.push(label);
                section = Some(report.sections.len() - 1);
                continue;
            }
            report.lines.push(ReportLine {
                section,
                label,
                unit_hint,
                cells,
            });
        }
        report
    }

    fn in_section<'a>(&'a self, names: &'a [&'a str]) -> impl Iterator<Item = &'a ReportLine> + 'a {
        self.lines.iter().filter(move |line| {
            line.section
                .is_some_and(|i| names.iter().any(|name| self.sections[i] == *name))
        })
    }
}

fn label_matches(labels: &[&str], line: &ReportLine) -> bool {
    labels.iter().any(|label| line.label == *label)
}

/// One way to find a metric in a report
#[derive(Debug, Clone, Copy)]
pub enum MetricSource {
    /// first line anywhere whose label matches, first numeric cell
    Line(&'static [&'static str]),
    /// first matching line inside a section
    SectionLine {
        section: &'static [&'static str],
        labels: &'static [&'static str],
    },
    /// every numeric cell of every matching line inside a section, summed
    SectionSum {
        section: &'static [&'static str],
        labels: &'static [&'static str],
    },
}

impl MetricSource {
    pub fn extract(&self, report: &Report) -> Option<Quantity> {
        match self {
            MetricSource::Line(labels) => report
                .lines
                .iter()
                .filter(|line| label_matches(labels, line))
                .find_map(|line| line.quantities().next()),
            MetricSource::SectionLine { section, labels } => report
                .in_section(section)
                .filter(|line| label_matches(labels, line))
                .find_map(|line| line.quantities().next()),
            MetricSource::SectionSum { section, labels } => {
                let mut total: Option<Quantity> = None;
                for q in report
                    .in_section(section)
                    .filter(|line| label_matches(labels, line))
                    .flat_map(|line| line.quantities())
                {
                    total = Some(match total {
                        Some(mut sum) => {
                            sum.value += q.value;
                            sum
                        }
                        None => q,
                    });
                }
                total
            }
        }
    }
}

/// First source in the chain that yields a value
pub fn first_available(sources: &[MetricSource], report: &Report) -> Option<Quantity> {
    sources.iter().find_map(|source| source.extract(report))
}

const LLC_SECTION: &[&str] = &["cache l3", "cache llc"];
const DRAM_SECTION: &[&str] = &["dram summary"];

const INSTRUCTIONS: &[MetricSource] = &[MetricSource::Line(&["instructions"])];
const CYCLES: &[MetricSource] = &[MetricSource::Line(&["cycles"])];
const IPC: &[MetricSource] = &[MetricSource::Line(&["ipc"])];
const TIME: &[MetricSource] = &[MetricSource::Line(&["time", "elapsed time"])];
const L3_ACCESSES: &[MetricSource] = &[MetricSource::SectionSum {
    section: LLC_SECTION,
    labels: &["num cache accesses", "num cache access"],
}];
const L3_MISSES: &[MetricSource] = &[MetricSource::SectionSum {
    section: LLC_SECTION,
    labels: &["num cache misses", "num cache miss"],
}];
const L3_MISS_RATE: &[MetricSource] = &[MetricSource::SectionLine {
    section: LLC_SECTION,
    labels: &["miss rate"],
}];
const L3_READ_HITS: &[MetricSource] = &[
    MetricSource::SectionSum {
        section: LLC_SECTION,
        labels: &["num read hits", "read hits"],
    },
    MetricSource::Line(&["l3_read_hits"]),
];
const L3_WRITE_HITS: &[MetricSource] = &[
    MetricSource::SectionSum {
        section: LLC_SECTION,
        labels: &["num write hits", "write hits"],
    },
    MetricSource::Line(&["l3_write_hits"]),
];
const DRAM_ACCESSES: &[MetricSource] = &[
    MetricSource::SectionSum {
        section: DRAM_SECTION,
        labels: &["num dram accesses", "num dram requests"],
    },
    MetricSource::Line(&["num dram accesses", "num dram requests"]),
];
const DRAM_LATENCY: &[MetricSource] = &[
    MetricSource::SectionLine {
        section: DRAM_SECTION,
        labels: &["average dram access latency"],
    },
    MetricSource::Line(&["average dram access latency"]),
];

fn count(q: Quantity) -> Option<u64> {
    (q.value >= 0.0).then(|| q.value.round() as u64)
}

/// Metrics of one simulation; `None` means the report did not carry it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimSummary {
    pub instructions: Option<u64>,
    pub cycles: Option<u64>,
    pub ipc: Option<f64>,
    pub time_ns: Option<f64>,
    pub l3_accesses: Option<u64>,
    pub l3_misses: Option<u64>,
    pub l3_miss_rate_pct: Option<f64>,
    pub l3_read_hits: Option<u64>,
    pub l3_write_hits: Option<u64>,
    pub dram_accesses: Option<u64>,
    pub dram_latency_ns: Option<f64>,
}

impl SimSummary {
    pub fn parse(text: &str) -> SimSummary {
        let report = Report::parse(text);
        let get = |sources: &[MetricSource]| first_available(sources, &report);

        let l3_accesses = get(L3_ACCESSES).and_then(count);
        let l3_misses = get(L3_MISSES).and_then(count);
        let l3_miss_rate_pct = match l3_accesses {
            Some(0) => None,
            _ => get(L3_MISS_RATE).map(|q| q.value).or_else(|| {
                let (acc, miss) = (l3_accesses?, l3_misses?);
                Some(100.0 * miss as f64 / acc as f64)
            }),
        };

        SimSummary {
            instructions: get(INSTRUCTIONS).and_then(count),
            cycles: get(CYCLES).and_then(count),
            ipc: get(IPC).map(|q| q.value),
            time_ns: get(TIME).map(|q| q.as_ns()),
            l3_accesses,
            l3_misses,
            l3_miss_rate_pct,
            l3_read_hits: get(L3_READ_HITS).and_then(count),
            l3_write_hits: get(L3_WRITE_HITS).and_then(count),
            dram_accesses: get(DRAM_ACCESSES).and_then(count),
            dram_latency_ns: get(DRAM_LATENCY).map(|q| q.as_ns()),
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> std::io::Result<SimSummary> {
        let bytes = std::fs::read(path)?;
        Ok(SimSummary::parse(&String::from_utf8_lossy(&bytes)))
    }

    pub fn time_s(&self) -> Option<f64> {
        self.time_ns.map(|ns| ns / 1e9)
    }

    pub fn l3_hits(&self) -> Option<u64> {
        Some(self.l3_accesses?.saturating_sub(self.l3_misses?))
    }

    pub fn core_period_ns(&self) -> Option<f64> {
        let cycles = self.cycles.filter(|&c| c > 0)?;
        Some(self.time_ns? / cycles as f64)
    }
}

/// LLC settings recovered from the files a simulator leaves in its run dir
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlcRunSettings {
    pub read_hit_cycles: Option<u32>,
    pub write_hit_cycles: Option<u32>,
    pub energy: Option<EnergyParams>,
    /// file the energy constants came from
    pub energy_source: Option<String>,
}

const RUN_SETTINGS_FILES: [&str; 3] = ["sim.cfg", "sim.info", "sim.inf"];

fn setting_regex(key: &str) -> Regex {
    Regex::new(&format!(
        r"(?m)(?:^|\s|-)(?:perf_model/l3_cache/llc/)?{}\s*=\s*([0-9]+(?:\.[0-9]*)?)",
        regex::escape(key)
    ))
    .expect("valid pattern")
}

fn find_setting(text: &str, key: &str) -> Option<f64> {
    setting_regex(key)
        .captures(text)
        .and_then(|caps| caps[1].parse().ok())
}

fn scan_energy(text: &str) -> Option<EnergyParams> {
    Some(EnergyParams {
        e_read_hit_pj: find_setting(text, "e_read_hit_pJ")?,
        e_write_hit_pj: find_setting(text, "e_write_hit_pJ")?,
        e_miss_pj: find_setting(text, "e_miss_pJ")?,
        p_leak_mw: find_setting(text, "p_leak_mW")?,
    })
}

impl LlcRunSettings {
    pub fn scan<P: AsRef<Path>>(run_dir: P) -> LlcRunSettings {
        let mut settings = LlcRunSettings::default();
        for name in RUN_SETTINGS_FILES {
            let Ok(bytes) = std::fs::read(run_dir.as_ref().join(name)) else {
                continue;
            };
            let text = String::from_utf8_lossy(&bytes);
            if settings.read_hit_cycles.is_none() {
                settings.read_hit_cycles =
                    find_setting(&text, "read_hit_latency_cycles").map(|v| v as u32);
            }
            if settings.write_hit_cycles.is_none() {
                settings.write_hit_cycles =
                    find_setting(&text, "write_hit_latency_cycles").map(|v| v as u32);
            }
            if settings.energy.is_none()
                && let Some(energy) = scan_energy(&text)
            {
                settings.energy = Some(energy);
                settings.energy_source = Some(name.to_string());
            }
        }
        settings
    }

    /// Average LLC hit latency weighted by the read/write hit mix
    pub fn avg_l3_hit_ns(&self, summary: &SimSummary) -> Option<f64> {
        let (rd, wr) = (self.read_hit_cycles? as f64, self.write_hit_cycles? as f64);
        let (rh, wh) = (summary.l3_read_hits? as f64, summary.l3_write_hits? as f64);
        let period = summary.core_period_ns().filter(|&p| p > 0.0)?;
        let hits = rh + wh;
        if hits <= 0.0 || rd <= 0.0 || wr <= 0.0 {
            return None;
        }
        Some((rh * rd + wh * wr) * period / hits)
    }
}
