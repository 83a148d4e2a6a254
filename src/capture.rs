//! Memory-trace capture of one workload under the instrumentation tool
use crate::{
    CommandSpec, ExecutionOutcome, ExecutionRecord, ExperimentConfig, PipelineError, Stage,
    WorkloadJob, file_name_string, get_log_dir, get_trace_dir, run_bounded,
};
use chrono::{DateTime, Utc};
use log::{info, warn};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use tempfile::TempDir;

/// Where and how captures run
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub drrun: PathBuf,
    pub client: PathBuf,
    pub timeout: Duration,
    pub compress: bool,
    pub keep_scratch: bool,
    pub scratch_root: PathBuf,
    pub job_id: String,
    pub array_index: u32,
    pub trace_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl CaptureSettings {
    pub fn from_config(config: &ExperimentConfig) -> Option<CaptureSettings> {
        let inst = config.instrumentation.as_ref()?;
        Some(CaptureSettings {
            drrun: inst.drrun.clone(),
            client: inst.client.clone(),
            timeout: Duration::from_secs(inst.timeout_secs),
            compress: inst.compress,
            keep_scratch: inst.keep_scratch,
            scratch_root: inst.scratch_root.clone(),
            job_id: config.job_id().to_string(),
            array_index: config.array_index(),
            trace_dir: get_trace_dir(&config.out_root),
            log_dir: get_log_dir(&config.out_root),
        })
    }
}

/// Merged trace of one capture attempt
#[derive(Debug, Clone)]
pub struct TraceArtifact {
    pub workload: String,
    /// per-thread logs as they were found in the scratch dir, in merge order
    pub per_thread: Vec<PathBuf>,
    pub merged: PathBuf,
    pub captured_at: DateTime<Utc>,
}

/// A capture attempt: the execution record is kept even when the capture fails
#[derive(Debug)]
pub struct CaptureRun {
    pub record: ExecutionRecord,
    pub result: crate::Result<TraceArtifact>,
}

/// Private scratch dir for one (job, array index, workload) capture. The
/// directory is removed when the handle is dropped.
pub fn create_scratch_dir(
    settings: &CaptureSettings,
    workload: &str,
) -> std::io::Result<TempDir> {
    std::fs::create_dir_all(&settings.scratch_root)?;
    tempfile::Builder::new()
        .prefix(&format!(
            "{}_{}_{}_",
            settings.job_id, settings.array_index, workload
        ))
        .tempdir_in(&settings.scratch_root)
}

fn modified(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Per-thread logs of `app` in `dir`, newest first. Falls back to every log
/// in the directory when none carries the app name.
pub fn harvest_logs(dir: &Path, app: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut logs = vec![];
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() && entry.file_name().to_string_lossy().ends_with(".log") {
            logs.push(entry.path());
        }
    }

    let matched: Vec<PathBuf> = logs
        .iter()
        .filter(|path| {
            let name = file_name_string(path);
            name.starts_with("memtrace.") && name.contains(app)
        })
        .cloned()
        .collect();
    let mut harvested = if matched.is_empty() {
        if !logs.is_empty() {
            warn!(
                "No memtrace log named after {} in {}, taking all {} logs",
                app,
                dir.display(),
                logs.len()
            );
        }
        logs
    } else {
        matched
    };
    harvested.sort_by(|a, b| modified(b).cmp(&modified(a)).then_with(|| a.cmp(b)));
    Ok(harvested)
}

/// Concatenate `logs` into `dest`, zstd-compressed when asked
pub fn merge_logs(logs: &[PathBuf], dest: &Path, compress: bool) -> std::io::Result<u64> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(dest)?;
    let mut written = 0;
    if compress {
        let mut encoder = zstd::Encoder::new(file, 3)?;
        for log in logs {
            written += std::io::copy(&mut BufReader::new(File::open(log)?), &mut encoder)?;
        }
        encoder.finish()?.sync_all()?;
    } else {
        let mut writer = BufWriter::new(file);
        for log in logs {
            written += std::io::copy(&mut BufReader::new(File::open(log)?), &mut writer)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    Ok(written)
}

/// Run the instrumentation tool against `job` and harvest its logs.
/// A failed execution short-circuits before harvesting.
pub fn capture(job: &WorkloadJob, settings: &CaptureSettings) -> crate::Result<CaptureRun> {
    let scratch = create_scratch_dir(settings, &job.id)?;
    let client = scratch.path().join(file_name_string(&settings.client));
    std::fs::copy(&settings.client, &client)?;

    let tag = crate::now_utc_tag();
    let spec = CommandSpec::new(&settings.drrun)
        .arg("-c")
        .arg(client.to_string_lossy())
        .arg("--")
        .arg(job.executable.to_string_lossy())
        .args(job.args.iter().cloned())
        .current_dir(&job.working_dir)
        .stdin_file(job.stdin.clone())
        .stdout_file(settings.log_dir.join(format!("{}_{}_drrun.out", tag, job.id)))
        .stderr_file(settings.log_dir.join(format!("{}_{}_drrun.err", tag, job.id)));

    info!(
        "Capturing {} (bound {:?}) in {}",
        job.id,
        settings.timeout,
        scratch.path().display()
    );
    let record = run_bounded(&spec, Some(settings.timeout))?;
    info!(
        "Capture of {} {} after {:.1}s",
        job.id,
        record.outcome,
        record.duration.as_secs_f64()
    );

    let result = match record.outcome {
        ExecutionOutcome::Failed(code) => Err(PipelineError::Failed {
            stage: Stage::Capture,
            code,
        }),
        ExecutionOutcome::Completed | ExecutionOutcome::TimedOut => {
            harvest(job, settings, scratch.path(), &tag)
        }
    };

    if settings.keep_scratch {
        let kept = scratch.keep();
        info!("Keeping scratch dir {}", kept.display());
    }
    Ok(CaptureRun { record, result })
}

fn harvest(
    job: &WorkloadJob,
    settings: &CaptureSettings,
    scratch: &Path,
    tag: &str,
) -> crate::Result<TraceArtifact> {
    let logs = harvest_logs(scratch, &job.app_name())?;
    if logs.is_empty() {
        return Err(PipelineError::NoTraceProduced {
            workload: job.id.clone(),
            scratch: scratch.to_path_buf(),
        });
    }

    let mut merged = settings
        .trace_dir
        .join(format!("{}_{}_memtrace.log", tag, job.id));
    if settings.compress {
        merged.set_extension("log.zst");
    }
    let bytes = merge_logs(&logs, &merged, settings.compress)?;
    info!(
        "Merged {} logs ({} bytes) into {}",
        logs.len(),
        bytes,
        merged.display()
    );

    Ok(TraceArtifact {
        workload: job.id.clone(),
        per_thread: logs,
        merged,
        captured_at: Utc::now(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;

    pub(crate) fn settings(root: &Path, drrun: PathBuf, timeout: Duration) -> CaptureSettings {
        let client = root.join("libmemtrace_x86_text.so");
        fs::write(&client, b"client").unwrap();
        CaptureSettings {
            drrun,
            client,
            timeout,
            compress: false,
            keep_scratch: false,
            scratch_root: root.join("scratch"),
            job_id: "42".to_string(),
            array_index: 3,
            trace_dir: root.join("traces"),
            log_dir: root.join("logs"),
        }
    }

    /// A fake drrun: writes logs next to the client library it was given
    /// (`$2`), then exits with `code`.
    pub(crate) fn fake_drrun(root: &Path, body: &str) -> PathBuf {
        let path = root.join("drrun.sh");
        fs::write(&path, format!("#!/bin/sh\nclientdir=$(dirname \"$2\")\n{}\n", body)).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    pub(crate) fn job(root: &Path) -> WorkloadJob {
        WorkloadJob {
            id: "505.mcf_r".to_string(),
            executable: root.join("mcf_r_base.x"),
            working_dir: root.to_path_buf(),
            args: vec!["inp.in".to_string()],
            stdin: None,
            instructions: 1_000_000,
            warmup_instructions: 0,
            resolved_by: "recorded-invocation",
        }
    }

    #[test]
    fn test_scratch_dirs_are_private() {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path(), PathBuf::from("true"), Duration::from_secs(1));
        let a = create_scratch_dir(&settings, "505.mcf_r").unwrap();
        let b = create_scratch_dir(&settings, "505.mcf_r").unwrap();
        assert_ne!(a.path(), b.path());
        assert!(file_name_string(a.path()).starts_with("42_3_505.mcf_r_"));
        let path = a.path().to_path_buf();
        drop(a);
        assert!(!path.exists());
    }

    #[test]
    fn test_harvest_by_name_and_fallback() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("memtrace.mcf_r_base.x.1.1.log"), "a\n").unwrap();
        fs::write(dir.path().join("other.log"), "b\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "c\n").unwrap();
        let logs = harvest_logs(dir.path(), "mcf_r_base.x").unwrap();
        assert_eq!(logs, vec![dir.path().join("memtrace.mcf_r_base.x.1.1.log")]);

        let logs = harvest_logs(dir.path(), "leela_r_base.x").unwrap();
        assert_eq!(logs.len(), 2);
    }

    #[test]
    fn test_merge_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.log");
        let b = dir.path().join("b.log");
        fs::write(&a, "0x10: 8, r\n").unwrap();
        fs::write(&b, "0x20: 8, w\n").unwrap();
        let dest = dir.path().join("out").join("merged.log.zst");
        merge_logs(&[a, b], &dest, true).unwrap();
        let decoded = zstd::decode_all(File::open(&dest).unwrap()).unwrap();
        assert_eq!(decoded, b"0x10: 8, r\n0x20: 8, w\n");
    }

    #[test]
    fn test_timed_out_capture_with_logs_is_usable() {
        let root = tempfile::tempdir().unwrap();
        let drrun = fake_drrun(
            root.path(),
            "echo '0x10: 8, r' > \"$clientdir/memtrace.mcf_r_base.x.100.100.log\"\n\
             echo '0x18: 8, w' > \"$clientdir/memtrace.mcf_r_base.x.100.101.log\"\nexit 124",
        );
        let settings = settings(root.path(), drrun, Duration::from_secs(10));
        let run = capture(&job(root.path()), &settings).unwrap();
        assert_eq!(run.record.outcome, ExecutionOutcome::TimedOut);
        let artifact = run.result.unwrap();
        assert_eq!(artifact.per_thread.len(), 2);
        let merged = fs::read_to_string(&artifact.merged).unwrap();
        assert_eq!(merged.lines().count(), 2);
        // scratch is gone once the capture returns
        assert_eq!(fs::read_dir(&settings.scratch_root).unwrap().count(), 0);
    }

    #[test]
    fn test_failed_capture_short_circuits() {
        let root = tempfile::tempdir().unwrap();
        let drrun = fake_drrun(
            root.path(),
            "echo x > \"$clientdir/memtrace.mcf_r_base.x.1.1.log\"\nexit 127",
        );
        let settings = settings(root.path(), drrun, Duration::from_secs(10));
        let run = capture(&job(root.path()), &settings).unwrap();
        assert_eq!(run.record.outcome, ExecutionOutcome::Failed(127));
        assert!(matches!(
            run.result,
            Err(PipelineError::Failed {
                stage: Stage::Capture,
                code: 127
            })
        ));
        // nothing was merged
        assert!(!settings.trace_dir.exists());
    }

    #[test]
    fn test_no_trace_produced() {
        let root = tempfile::tempdir().unwrap();
        let drrun = fake_drrun(root.path(), "exit 0");
        let settings = settings(root.path(), drrun, Duration::from_secs(10));
        let run = capture(&job(root.path()), &settings).unwrap();
        assert_eq!(run.record.outcome, ExecutionOutcome::Completed);
        assert!(matches!(
            run.result,
            Err(PipelineError::NoTraceProduced { .. })
        ));
    }
}
