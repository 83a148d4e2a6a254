//! Per-job orchestration and admission of concurrent jobs
use crate::{
    Aggregator, AggregatorHandle, CaptureSettings, Dataset, ExecutionOutcome, ExecutionRecord,
    ExperimentConfig, FeatureExtractor, LockPolicy, Locator, PipelineError, RowSet, RunInput,
    SUMMARY_HEADER, SimulatorSettings, Stage, WorkloadJob, calculate, capture,
    get_config_stamp_path, get_features_path, get_summary_path, get_timing_path, get_tqdm_style,
    simulate_all, summary_record, write_bench_summary, write_energy_bounds,
};
use log::{error, info, warn};
use std::{
    path::PathBuf,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

pub const TIMING_HEADER: [&str; 7] = [
    "timestamp",
    "bench",
    "stage",
    "config",
    "outcome",
    "exit_code",
    "seconds",
];

const ADMISSION_POLL: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub enum StageStatus {
    Ok(String),
    /// usable but not complete, e.g. a truncated capture
    Degraded(String),
    Error(PipelineError),
}

impl StageStatus {
    pub fn name(&self) -> &'static str {
        match self {
            StageStatus::Ok(_) => "ok",
            StageStatus::Degraded(_) => "degraded",
            StageStatus::Error(_) => "error",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            StageStatus::Ok(detail) | StageStatus::Degraded(detail) => detail.clone(),
            StageStatus::Error(err) => err.to_string(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            StageStatus::Error(err) => err.is_fatal(),
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct StageReport {
    pub stage: Stage,
    pub config: Option<String>,
    pub status: StageStatus,
}

#[derive(Debug)]
pub struct JobReport {
    pub bench: String,
    pub stages: Vec<StageReport>,
}

impl JobReport {
    fn new(bench: &str) -> JobReport {
        JobReport {
            bench: bench.to_string(),
            stages: vec![],
        }
    }

    fn push(&mut self, stage: Stage, config: Option<&str>, status: StageStatus) {
        if status.is_fatal() {
            error!("{} {}: {}", self.bench, stage, status.detail());
        } else if !matches!(status, StageStatus::Ok(_)) {
            warn!("{} {}: {}", self.bench, stage, status.detail());
        }
        self.stages.push(StageReport {
            stage,
            config: config.map(str::to_string),
            status,
        });
    }

    pub fn has_fatal(&self) -> bool {
        self.stages.iter().any(|stage| stage.status.is_fatal())
    }
}

#[derive(Debug, Default)]
pub struct PipelineReport {
    pub jobs: Vec<JobReport>,
}

impl PipelineReport {
    /// False when any job hit a fatal error; degraded results do not count
    pub fn success(&self) -> bool {
        !self.jobs.iter().any(JobReport::has_fatal)
    }
}

/// Shared datasets of one run, each owned by its own writer
pub struct Sinks {
    pub features: AggregatorHandle,
    pub summary: AggregatorHandle,
    pub timing: AggregatorHandle,
}

impl Sinks {
    pub fn spawn(config: &ExperimentConfig, policy: LockPolicy) -> crate::Result<Sinks> {
        Ok(Sinks {
            features: Aggregator::spawn(Dataset::new(get_features_path(&config.out_root)), policy)?,
            summary: Aggregator::spawn(Dataset::new(get_summary_path(&config.out_root)), policy)?,
            timing: Aggregator::spawn(Dataset::new(get_timing_path(&config.out_root)), policy)?,
        })
    }

    pub fn finish(self) {
        self.features.finish();
        self.summary.finish();
        self.timing.finish();
    }
}

fn timing_rowset(
    bench: &str,
    stage: Stage,
    config: &str,
    record: &ExecutionRecord,
) -> crate::Result<RowSet> {
    RowSet::from_records(
        &TIMING_HEADER,
        [[
            record.started_at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            bench.to_string(),
            stage.name().to_string(),
            config.to_string(),
            record.outcome.name().to_string(),
            record
                .outcome
                .exit_code()
                .map(|c| c.to_string())
                .unwrap_or_default(),
            format!("{:.3}", record.duration.as_secs_f64()),
        ]],
    )
}

pub struct Pipeline {
    config: ExperimentConfig,
    timestamp: String,
    locator: Locator,
    capture: Option<CaptureSettings>,
    extractor: FeatureExtractor,
    simulator: SimulatorSettings,
    lock_policy: LockPolicy,
}

impl Pipeline {
    /// `config` must already be expanded
    pub fn new(config: ExperimentConfig, timestamp: &str) -> Pipeline {
        let tmp_dir = config
            .instrumentation
            .as_ref()
            .map(|inst| inst.scratch_root.clone())
            .unwrap_or_else(std::env::temp_dir);
        Pipeline {
            locator: Locator::from_config(&config),
            capture: CaptureSettings::from_config(&config),
            extractor: FeatureExtractor::new(&config.summarizer, tmp_dir),
            simulator: SimulatorSettings::from_config(&config),
            lock_policy: LockPolicy::default(),
            timestamp: timestamp.to_string(),
            config,
        }
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn capture_settings(&self) -> Option<&CaptureSettings> {
        self.capture.as_ref()
    }

    pub fn simulator(&self) -> &SimulatorSettings {
        &self.simulator
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    pub fn lock_policy(&self) -> LockPolicy {
        self.lock_policy
    }

    /// Write the expanded configuration next to the results
    pub fn stamp_config(&self) -> crate::Result<PathBuf> {
        std::fs::create_dir_all(&self.config.out_root)?;
        let path = get_config_stamp_path(&self.config.out_root, &self.timestamp);
        std::fs::write(&path, serde_json::to_string_pretty(&self.config)?)?;
        Ok(path)
    }

    pub fn locate(&self, bench: &str) -> crate::Result<WorkloadJob> {
        self.locator.locate(
            bench,
            self.config.simulator.instructions_m * 1_000_000,
            self.config.simulator.warmup_m * 1_000_000,
        )
    }

    fn capture_stage(
        &self,
        job: &WorkloadJob,
        settings: &CaptureSettings,
        sinks: &Sinks,
        report: &mut JobReport,
    ) -> bool {
        let run = match capture(job, settings) {
            Ok(run) => run,
            Err(err) => {
                report.push(Stage::Capture, None, StageStatus::Error(err));
                return false;
            }
        };
        if let Err(err) = timing_rowset(&job.id, Stage::Capture, "", &run.record)
            .and_then(|rows| sinks.timing.submit(rows))
        {
            report.push(Stage::Aggregate, Some("timing"), StageStatus::Error(err));
        }

        let artifact = match run.result {
            Ok(artifact) => artifact,
            Err(err) => {
                report.push(Stage::Capture, None, StageStatus::Error(err));
                return false;
            }
        };
        let detail = format!("{} thread logs", artifact.per_thread.len());
        let status = match run.record.outcome {
            ExecutionOutcome::TimedOut => StageStatus::Degraded(format!("timed out, {}", detail)),
            _ => StageStatus::Ok(detail),
        };
        report.push(Stage::Capture, None, status);

        for &window in &self.config.summarizer.window_sizes {
            let rows = match self.extractor.extract(&artifact, window) {
                Ok(rows) => rows,
                Err(err) => {
                    report.push(Stage::Extract, None, StageStatus::Error(err));
                    return false;
                }
            };
            match sinks.features.submit(rows) {
                Ok(n) => report.push(
                    Stage::Extract,
                    None,
                    StageStatus::Ok(format!("M={}, {} row", window, n)),
                ),
                Err(err) => {
                    report.push(Stage::Aggregate, Some("features"), StageStatus::Error(err));
                    return false;
                }
            }
        }
        true
    }

    fn simulate_stage(&self, job: &WorkloadJob, sinks: &Sinks, report: &mut JobReport) {
        let configs = self.config.sim_configs();
        let runs = simulate_all(job, &configs, &self.simulator);

        let mut inputs = vec![];
        for run in runs {
            let name = run.config.name.as_str();
            if let Some(record) = &run.record
                && let Err(err) = timing_rowset(&job.id, Stage::Simulate, name, record)
                    .and_then(|rows| sinks.timing.submit(rows))
            {
                report.push(Stage::Aggregate, Some("timing"), StageStatus::Error(err));
            }
            match run.result {
                Ok(path) => {
                    report.push(
                        Stage::Simulate,
                        Some(name),
                        StageStatus::Ok(path.display().to_string()),
                    );
                    match RunInput::from_config(&run.config, &run.outdir) {
                        Ok(input) => inputs.push(input),
                        Err(err) => {
                            report.push(Stage::Parse, Some(name), StageStatus::Error(err.into()))
                        }
                    }
                }
                Err(err) => report.push(Stage::Simulate, Some(name), StageStatus::Error(err)),
            }
        }
        if inputs.is_empty() {
            return;
        }

        let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let n_m = Some(self.config.simulator.instructions_m);
        let rows = RowSet::from_records(
            &SUMMARY_HEADER,
            inputs
                .iter()
                .map(|input| summary_record(&timestamp, &job.id, n_m, input)),
        )
        .and_then(|rows| sinks.summary.submit(rows));
        if let Err(err) = rows {
            report.push(Stage::Aggregate, Some("summary"), StageStatus::Error(err));
        }
        let refs: Vec<&RunInput> = inputs.iter().collect();
        if let Err(err) =
            write_bench_summary(&self.config.out_root, &job.id, n_m, &timestamp, &refs)
        {
            report.push(Stage::Bound, None, StageStatus::Error(err));
        }

        let [Some(baseline), Some(alternative)] = [
            inputs.iter().find(|i| i.label == self.config.baseline.label),
            inputs.iter().find(|i| i.label == self.config.alternative.label),
        ] else {
            report.push(
                Stage::Bound,
                None,
                StageStatus::Degraded("only one configuration simulated".to_string()),
            );
            return;
        };
        match calculate(&job.id, n_m, baseline, alternative).and_then(|bound| {
            write_energy_bounds(&self.config.out_root, &bound, baseline, alternative)?;
            Ok(bound)
        }) {
            Ok(bound) => report.push(
                Stage::Bound,
                None,
                StageStatus::Ok(format!(
                    "ED²P ratio {}",
                    bound
                        .ed2p_ratio
                        .map(|r| format!("{:.4}", r))
                        .unwrap_or_else(|| "n/a".to_string())
                )),
            ),
            Err(err @ PipelineError::IncompleteSummary { .. }) => {
                report.push(Stage::Bound, None, StageStatus::Degraded(err.to_string()))
            }
            Err(err) => report.push(Stage::Bound, None, StageStatus::Error(err)),
        }
    }

    /// Locate, capture and simulate one workload. Failures end the job, never
    /// the run.
    pub fn run_job(&self, bench: &str, sinks: &Sinks) -> JobReport {
        let mut report = JobReport::new(bench);
        let job = match self.locate(bench) {
            Ok(job) => job,
            Err(err) => {
                report.push(Stage::Locate, None, StageStatus::Error(err));
                return report;
            }
        };
        report.push(
            Stage::Locate,
            None,
            StageStatus::Ok(format!("{} via {}", job.app_name(), job.resolved_by)),
        );

        if self.config.stages.capture
            && let Some(settings) = &self.capture
            && !self.capture_stage(&job, settings, sinks, &mut report)
        {
            return report;
        }
        if self.config.stages.simulate {
            self.simulate_stage(&job, sinks, &mut report);
        }
        report
    }

    /// Run every configured benchmark, at most `max_jobs` at a time
    pub fn run(&self) -> crate::Result<PipelineReport> {
        let stamp = self.stamp_config()?;
        info!("Configuration stamped at {}", stamp.display());
        let sinks = Sinks::spawn(&self.config, self.lock_policy)?;

        let benchmarks = &self.config.benchmarks;
        let pb = indicatif::ProgressBar::new(benchmarks.len() as u64);
        pb.set_style(get_tqdm_style());
        let in_flight = AtomicUsize::new(0);
        let finished = Mutex::new(vec![]);

        std::thread::scope(|s| {
            let mut pending = benchmarks.iter().enumerate();
            let mut next = pending.next();
            while let Some((index, bench)) = next {
                if in_flight.load(Ordering::SeqCst) >= self.config.max_jobs {
                    std::thread::sleep(ADMISSION_POLL);
                    continue;
                }
                in_flight.fetch_add(1, Ordering::SeqCst);
                pb.set_message(bench.clone());
                let (sinks, in_flight, finished, pb) = (&sinks, &in_flight, &finished, &pb);
                s.spawn(move || {
                    let report = self.run_job(bench, sinks);
                    push_finished(finished, (index, report));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    pb.inc(1);
                });
                next = pending.next();
            }
        });
        pb.finish();
        sinks.finish();

        let mut jobs = finished.into_inner().unwrap_or_else(PoisonError::into_inner);
        jobs.sort_by_key(|(index, _)| *index);
        Ok(PipelineReport {
            jobs: jobs.into_iter().map(|(_, report)| report).collect(),
        })
    }
}

// the list stays usable after a job panicked while holding it
fn push_finished<T>(finished: &Mutex<Vec<T>>, item: T) {
    finished
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(item);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{capture::tests::fake_drrun, config::tests::sample_config_json};
    use std::{fs, path::Path};

    fn executable(path: &Path, body: &str) {
        fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = fs::metadata(path).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        fs::set_permissions(path, perms).unwrap();
    }

    #[test]
    fn test_push_finished_after_poison() {
        let finished = Mutex::new(vec![1]);
        let _ = std::thread::scope(|s| {
            s.spawn(|| {
                let _guard = finished.lock().unwrap();
                panic!("job panicked while holding the list");
            })
            .join()
        });
        assert!(finished.is_poisoned());
        push_finished(&finished, 2);
        assert_eq!(
            finished.into_inner().unwrap_or_else(PoisonError::into_inner),
            vec![1, 2]
        );
    }

    /// A benchmark tree with one run dir, a fake tracer and a fake simulator
    /// whose report depends on the configuration it is given
    fn setup(root: &Path, benches: &[&str]) -> ExperimentConfig {
        for bench in benches {
            let run = root
                .join("spec/benchspec/CPU")
                .join(bench)
                .join("run/run_base_refrate_x.0000");
            fs::create_dir_all(&run).unwrap();
            fs::write(run.join("app_base.x"), "").unwrap();
            fs::write(
                run.join("speccmds.cmd"),
                "-o out ../run_base/app_base.x in.txt > out.txt\n",
            )
            .unwrap();
        }
        let drrun = fake_drrun(
            root,
            "echo '0x10: 8, r' > \"$clientdir/memtrace.app_base.x.1.1.log\"\nexit 124",
        );
        executable(
            &root.join("sim.sh"),
            "case \"$4\" in\n\
             *sram*) t=45000000; c=120000000;;\n\
             *) t=56000000; c=150000000;;\n\
             esac\n\
             printf 'Instructions | 100000000\\nCycles | %s\\nTime (ns) | %s\\nCache L3 |\\n  num cache accesses | 2000\\n  num cache misses | 500\\n' $c $t > \"$4/sim.out\"",
        );
        fs::write(root.join("client.so"), "").unwrap();

        let mut config: ExperimentConfig = serde_json::from_str(sample_config_json()).unwrap();
        config.benchmarks = benches.iter().map(|b| b.to_string()).collect();
        config.spec_root = root.join("spec");
        config.out_root = root.join("results");
        let inst = config.instrumentation.as_mut().unwrap();
        inst.drrun = drrun;
        inst.client = root.join("client.so");
        inst.scratch_root = root.join("scratch");
        config.simulator.program = root.join("sim.sh");
        config.simulator.instructions_m = 100;
        config.alternative.energy = None;
        config.max_jobs = 2;
        config.job_id = Some("7".to_string());
        config.array_index = Some(0);
        config
    }

    #[test]
    fn test_full_run() {
        let root = tempfile::tempdir().unwrap();
        let config = setup(root.path(), &["505.mcf_r", "541.leela_r", "557.xz_r"]);
        let pipeline = Pipeline::new(config, "20250101T000000Z");
        let report = pipeline.run().unwrap();
        assert!(report.success());
        assert_eq!(report.jobs.len(), 3);
        assert_eq!(report.jobs[1].bench, "541.leela_r");

        let capture = report.jobs[0]
            .stages
            .iter()
            .find(|s| s.stage == Stage::Capture)
            .unwrap();
        assert!(matches!(capture.status, StageStatus::Degraded(_)));
        let bound = report.jobs[0]
            .stages
            .iter()
            .find(|s| s.stage == Stage::Bound)
            .unwrap();
        assert!(matches!(bound.status, StageStatus::Ok(_)));

        let out = root.path().join("results");
        let features = fs::read_to_string(out.join("features.csv")).unwrap();
        assert_eq!(features.lines().count(), 4);
        let summary = fs::read_to_string(out.join("summary.csv")).unwrap();
        assert_eq!(summary.lines().count(), 7);
        let timing = fs::read_to_string(out.join("timing.csv")).unwrap();
        assert_eq!(timing.lines().count(), 10);
        assert!(out.join("output_505.mcf_r/energy_bounds.csv").is_file());
        assert!(out.join("config_used_20250101T000000Z.json").is_file());
    }

    #[test]
    fn test_missing_workload_fails_only_its_job() {
        let root = tempfile::tempdir().unwrap();
        let mut config = setup(root.path(), &["505.mcf_r"]);
        config.benchmarks.push("999.nothing_r".to_string());
        config.stages.capture = false;
        let pipeline = Pipeline::new(config, "t");
        let report = pipeline.run().unwrap();
        assert!(!report.success());
        assert!(!report.jobs[0].has_fatal());
        assert!(matches!(
            report.jobs[1].stages[0].status,
            StageStatus::Error(PipelineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_incomplete_summary_is_degraded() {
        let root = tempfile::tempdir().unwrap();
        let mut config = setup(root.path(), &["505.mcf_r"]);
        config.stages.capture = false;
        executable(
            &root.path().join("sim.sh"),
            "echo 'Instructions | 100' > \"$4/sim.out\"",
        );
        let report = Pipeline::new(config, "t").run().unwrap();
        assert!(report.success());
        let bound = report.jobs[0]
            .stages
            .iter()
            .find(|s| s.stage == Stage::Bound)
            .unwrap();
        assert!(matches!(bound.status, StageStatus::Degraded(_)));
    }
}
