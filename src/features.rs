//! Reduce merged memory traces to one feature row per window size
use crate::{
    AddressUnit, CommandSpec, ExecutionOutcome, PipelineError, RowSet, Stage, SummarizerConfig,
    ToolCommand, TraceArtifact, run_bounded,
};
use log::{debug, info};
use regex::Regex;
use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::LazyLock,
};

/// Column set of every feature row, in order
pub const FEATURE_HEADER: [&str; 12] = [
    "name",
    "M",
    "read_total",
    "read_unique",
    "read_entropy",
    "read_local_entropy",
    "read_footprint90",
    "write_total",
    "write_unique",
    "write_entropy",
    "write_local_entropy",
    "write_footprint90",
];

const STACK_RANGE: std::ops::Range<u64> = 0x0000_7fff_0000_0000..0x0000_8000_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

impl AccessKind {
    fn from_word(word: &str) -> Option<AccessKind> {
        match word.to_ascii_lowercase().as_str() {
            "r" | "read" | "load" | "ld" | "mem-read" => Some(AccessKind::Read),
            "w" | "write" | "store" | "st" | "mem-write" => Some(AccessKind::Write),
            _ => None,
        }
    }

    /// Kind column of the csv format, which also takes any r*/w* word
    fn from_csv_field(word: &str) -> Option<AccessKind> {
        AccessKind::from_word(word).or_else(|| {
            let word = word.to_ascii_lowercase();
            if word.starts_with('r') {
                Some(AccessKind::Read)
            } else if word.starts_with('w') {
                Some(AccessKind::Write)
            } else {
                None
            }
        })
    }
}

/// Result of trying one line format
#[derive(Debug, PartialEq, Eq)]
enum LineMatch {
    NoMatch,
    /// recognized, but not a read or a write
    Ignored,
    Access(AccessKind, u64),
}

static COLON_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(0x[0-9a-fA-F]+)\s*:\s*(\d+)\s*,\s*([A-Za-z-]+)").expect("valid pattern")
});
static VIEW_COMMA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r".*?,\s*([RrWw])\s*,\s*(\d+)\s*,\s*(0x[0-9a-fA-F]+)").expect("valid pattern")
});
static VIEW_SPACE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\d+\s+\d+:\s+\d+\s+(read|write)\s+(\d+)\s+byte\(s\)\s+@\s+(0x[0-9a-fA-F]+)")
        .expect("valid pattern")
});

fn parse_hex(s: &str) -> Option<u64> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(digits, 16).ok()
}

/// Trace line layouts, tried in order
#[derive(Debug, Clone, Copy)]
enum LineFormat {
    /// `0xADDR: SIZE, KIND`
    Colon,
    /// `pc,r|w,size,addr`
    Csv,
    /// drcachesim view, comma separated
    ViewComma,
    /// drcachesim view, `... read 8 byte(s) @ 0xADDR`
    ViewSpace,
}

const LINE_FORMATS: [LineFormat; 4] = [
    LineFormat::Colon,
    LineFormat::Csv,
    LineFormat::ViewComma,
    LineFormat::ViewSpace,
];

impl LineFormat {
    fn parse(&self, line: &str) -> LineMatch {
        match self {
            LineFormat::Colon => {
                let Some(caps) = COLON_LINE.captures(line) else {
                    return LineMatch::NoMatch;
                };
                match (AccessKind::from_word(&caps[3]), parse_hex(&caps[1])) {
                    (Some(kind), Some(addr)) => LineMatch::Access(kind, addr),
                    _ => LineMatch::Ignored,
                }
            }
            LineFormat::Csv => {
                let parts: Vec<&str> = line.split(',').map(str::trim).collect();
                if parts.len() < 4 {
                    return LineMatch::NoMatch;
                }
                match (AccessKind::from_csv_field(parts[1]), parse_hex(parts[3])) {
                    (Some(kind), Some(addr)) => LineMatch::Access(kind, addr),
                    _ => LineMatch::NoMatch,
                }
            }
            LineFormat::ViewComma => {
                let Some(caps) = VIEW_COMMA.captures(line) else {
                    return LineMatch::NoMatch;
                };
                match (AccessKind::from_word(&caps[1]), parse_hex(&caps[3])) {
                    (Some(kind), Some(addr)) => LineMatch::Access(kind, addr),
                    _ => LineMatch::NoMatch,
                }
            }
            LineFormat::ViewSpace => {
                let Some(caps) = VIEW_SPACE.captures(line) else {
                    return LineMatch::NoMatch;
                };
                match (AccessKind::from_word(&caps[1]), parse_hex(&caps[3])) {
                    (Some(kind), Some(addr)) => LineMatch::Access(kind, addr),
                    _ => LineMatch::NoMatch,
                }
            }
        }
    }
}

/// Kind and address of the access on `line`, if any format recognizes it
pub fn parse_access(line: &str) -> Option<(AccessKind, u64)> {
    for format in LINE_FORMATS {
        match format.parse(line) {
            LineMatch::NoMatch => continue,
            LineMatch::Ignored => return None,
            LineMatch::Access(kind, addr) => return Some((kind, addr)),
        }
    }
    None
}

fn entropy(counts: &BTreeMap<u64, u64>) -> f64 {
    let total: u64 = counts.values().sum();
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    counts
        .values()
        .map(|&c| {
            let p = c as f64 / total;
            p * (total / c as f64).log2()
        })
        .sum()
}

/// Fewest keys that together cover at least 90% of the accesses
fn footprint90(counts: &BTreeMap<u64, u64>) -> u64 {
    let total: u64 = counts.values().sum();
    if total == 0 {
        return 0;
    }
    let mut sorted: Vec<u64> = counts.values().copied().collect();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    let need = 0.9 * total as f64;
    let mut covered = 0;
    let mut keys = 0;
    for count in sorted {
        covered += count;
        keys += 1;
        if covered as f64 >= need {
            break;
        }
    }
    keys
}

#[derive(Debug, Default)]
struct AccessCounts {
    keys: BTreeMap<u64, u64>,
    local: BTreeMap<u64, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KindFeatures {
    pub total: u64,
    pub unique: u64,
    pub entropy: f64,
    pub local_entropy: f64,
    pub footprint90: u64,
}

impl AccessCounts {
    fn features(&self) -> KindFeatures {
        KindFeatures {
            total: self.keys.values().sum(),
            unique: self.keys.len() as u64,
            entropy: entropy(&self.keys),
            local_entropy: entropy(&self.local),
            footprint90: footprint90(&self.keys),
        }
    }
}

/// Summary of one workload's trace at one window size
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub name: String,
    pub window: u32,
    pub read: KindFeatures,
    pub write: KindFeatures,
}

impl FeatureRow {
    pub fn record(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.window.to_string(),
            self.read.total.to_string(),
            self.read.unique.to_string(),
            format!("{:.6}", self.read.entropy),
            format!("{:.6}", self.read.local_entropy),
            self.read.footprint90.to_string(),
            self.write.total.to_string(),
            self.write.unique.to_string(),
            format!("{:.6}", self.write.entropy),
            format!("{:.6}", self.write.local_entropy),
            self.write.footprint90.to_string(),
        ]
    }
}

/// Open a trace, decompressing `.zst` files. A missing or empty plain file
/// falls back to its `.zst` sibling.
pub fn open_trace(path: &Path) -> std::io::Result<Box<dyn BufRead>> {
    let is_zst = path.extension().is_some_and(|ext| ext == "zst");
    if is_zst {
        let decoder = zstd::Decoder::new(File::open(path)?)?;
        return Ok(Box::new(BufReader::new(decoder)));
    }
    let plain_usable = std::fs::metadata(path).is_ok_and(|meta| meta.len() > 0);
    let mut compressed = path.as_os_str().to_owned();
    compressed.push(".zst");
    let compressed = PathBuf::from(compressed);
    if !plain_usable && compressed.exists() {
        let decoder = zstd::Decoder::new(File::open(&compressed)?)?;
        return Ok(Box::new(BufReader::new(decoder)));
    }
    Ok(Box::new(BufReader::new(File::open(path)?)))
}

/// Built-in summarizer
#[derive(Debug, Clone, Copy)]
pub struct Summarizer {
    pub window: u32,
    pub unit: AddressUnit,
    pub exclude_stack: bool,
}

impl Summarizer {
    pub fn summarize<P: AsRef<Path>>(
        &self,
        name: &str,
        traces: &[P],
    ) -> std::io::Result<FeatureRow> {
        let mut reads = AccessCounts::default();
        let mut writes = AccessCounts::default();
        let shift = self.unit.shift();
        // addresses are 64-bit, larger windows put everything in one bucket
        let window = self.window.min(63);

        let mut buf = vec![];
        for trace in traces {
            let mut reader = open_trace(trace.as_ref())?;
            loop {
                buf.clear();
                if reader.read_until(b'\n', &mut buf)? == 0 {
                    break;
                }
                let line = String::from_utf8_lossy(&buf);
                if line.trim().is_empty() || line.starts_with("Format:") {
                    continue;
                }
                let Some((kind, addr)) = parse_access(&line) else {
                    continue;
                };
                if self.exclude_stack && STACK_RANGE.contains(&addr) {
                    continue;
                }
                let counts = match kind {
                    AccessKind::Read => &mut reads,
                    AccessKind::Write => &mut writes,
                };
                *counts.keys.entry(addr >> shift).or_default() += 1;
                *counts.local.entry(addr >> window).or_default() += 1;
            }
        }

        Ok(FeatureRow {
            name: name.to_string(),
            window: self.window,
            read: reads.features(),
            write: writes.features(),
        })
    }
}

/// Write rows to a private temporary file, fully flushed before it is
/// handed over
pub fn write_rowset(rows: &[FeatureRow], dir: &Path) -> crate::Result<RowSet> {
    std::fs::create_dir_all(dir)?;
    let tmp = tempfile::Builder::new()
        .prefix("features_")
        .suffix(".csv")
        .tempfile_in(dir)?;
    let mut writer = csv::Writer::from_writer(tmp);
    writer.write_record(FEATURE_HEADER)?;
    for row in rows {
        writer.write_record(row.record())?;
    }
    writer.flush()?;
    let mut tmp = writer
        .into_inner()
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    Ok(RowSet::Temp(tmp.into_temp_path()))
}

/// Owns the temporary files between a trace and the dataset
pub struct FeatureExtractor {
    unit: AddressUnit,
    exclude_stack: bool,
    command: Option<ToolCommand>,
    tmp_dir: PathBuf,
}

impl FeatureExtractor {
    pub fn new<P: AsRef<Path>>(config: &SummarizerConfig, tmp_dir: P) -> FeatureExtractor {
        FeatureExtractor {
            unit: config.unit,
            exclude_stack: config.exclude_stack,
            command: config.command.clone(),
            tmp_dir: tmp_dir.as_ref().to_path_buf(),
        }
    }

    /// One feature row for `artifact` at window size `window`
    pub fn extract(&self, artifact: &TraceArtifact, window: u32) -> crate::Result<RowSet> {
        match &self.command {
            Some(command) => self.extract_external(command, artifact, window),
            None => {
                let summarizer = Summarizer {
                    window,
                    unit: self.unit,
                    exclude_stack: self.exclude_stack,
                };
                let row = summarizer.summarize(&artifact.workload, &[&artifact.merged])?;
                debug!(
                    "{} M={}: {} reads, {} writes",
                    row.name, window, row.read.total, row.write.total
                );
                write_rowset(&[row], &self.tmp_dir)
            }
        }
    }

    fn extract_external(
        &self,
        command: &ToolCommand,
        artifact: &TraceArtifact,
        window: u32,
    ) -> crate::Result<RowSet> {
        // the tool appends, and only writes a header into a file that does
        // not exist yet
        std::fs::create_dir_all(&self.tmp_dir)?;
        let staging = tempfile::Builder::new()
            .prefix("features_")
            .tempdir_in(&self.tmp_dir)?;
        let csv_path = staging.path().join("rows.csv");
        let spec = CommandSpec::new(&command.program)
            .args(command.args.iter().cloned())
            .args(["--name".to_string(), artifact.workload.clone()])
            .args(["--csv".to_string(), csv_path.to_string_lossy().into_owned()])
            .args(["--M".to_string(), window.to_string()])
            .arg(artifact.merged.to_string_lossy());
        info!("Summarizing {} with {}", artifact.workload, spec.display());
        let record = run_bounded(&spec, None)?;
        if let ExecutionOutcome::Failed(code) = record.outcome {
            return Err(PipelineError::Failed {
                stage: Stage::Extract,
                code,
            });
        }
        if !csv_path.exists() {
            return Err(PipelineError::not_found(
                &artifact.workload,
                format!("{} wrote no rows", command.program.display()),
            ));
        }

        let mut tmp = tempfile::Builder::new()
            .prefix("features_")
            .suffix(".csv")
            .tempfile_in(&self.tmp_dir)?;
        std::io::copy(&mut File::open(&csv_path)?, &mut tmp)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        Ok(RowSet::Temp(tmp.into_temp_path()))
    }
}
