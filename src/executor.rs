//! Run external tools under an optional wall-clock bound
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::{
    fs::{File, OpenOptions},
    os::unix::process::{CommandExt, ExitStatusExt},
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    time::{Duration, Instant},
};

/// exit code of coreutils timeout(1) when the bound fired
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// shell convention for "command not found"
pub const NOT_FOUND_EXIT_CODE: i32 = 127;
/// shell convention for "found but not executable"
pub const NOT_EXECUTABLE_EXIT_CODE: i32 = 126;

const SIGALRM: i32 = 14;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// ran to completion with exit code 0
    Completed,
    /// truncated by the wall-clock bound, output is valid partial data
    TimedOut,
    /// crashed, not found or exited non-zero
    Failed(i32),
}

impl ExecutionOutcome {
    /// Completed and TimedOut runs both produce data downstream stages use
    pub fn is_usable(&self) -> bool {
        !matches!(self, ExecutionOutcome::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExecutionOutcome::Completed => "completed",
            ExecutionOutcome::TimedOut => "timed_out",
            ExecutionOutcome::Failed(_) => "failed",
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecutionOutcome::Completed => Some(0),
            ExecutionOutcome::TimedOut => Some(TIMEOUT_EXIT_CODE),
            ExecutionOutcome::Failed(code) => Some(*code),
        }
    }

    /// Classify a raw exit code or terminating signal
    pub fn classify(code: Option<i32>, signal: Option<i32>) -> ExecutionOutcome {
        match (code, signal) {
            (Some(0), _) => ExecutionOutcome::Completed,
            (Some(TIMEOUT_EXIT_CODE), _) => ExecutionOutcome::TimedOut,
            (Some(code), _) => ExecutionOutcome::Failed(code),
            (None, Some(SIGALRM)) => ExecutionOutcome::TimedOut,
            (None, Some(signal)) => ExecutionOutcome::Failed(128 + signal),
            (None, None) => ExecutionOutcome::Failed(-1),
        }
    }

    fn from_status(status: ExitStatus) -> ExecutionOutcome {
        ExecutionOutcome::classify(status.code(), status.signal())
    }
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionOutcome::Failed(code) => write!(f, "failed({})", code),
            outcome => f.write_str(outcome.name()),
        }
    }
}

/// Outcome of one run together with its wall-clock duration
#[derive(Debug, Clone, Copy)]
pub struct ExecutionRecord {
    pub outcome: ExecutionOutcome,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
}

/// Description of a command to run; redirections append to files
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new<P: AsRef<Path>>(program: P) -> CommandSpec {
        CommandSpec {
            program: program.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> CommandSpec {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> CommandSpec {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> CommandSpec {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin_file(mut self, path: Option<PathBuf>) -> CommandSpec {
        self.stdin = path;
        self
    }

    pub fn stdout_file<P: AsRef<Path>>(mut self, path: P) -> CommandSpec {
        self.stdout = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn stderr_file<P: AsRef<Path>>(mut self, path: P) -> CommandSpec {
        self.stderr = Some(path.as_ref().to_path_buf());
        self
    }

    /// Shell-like rendering for logs
    pub fn display(&self) -> String {
        let mut s = self.program.display().to_string();
        for arg in &self.args {
            s.push(' ');
            s.push_str(arg);
        }
        s
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// SIGKILL every process in the group led by `pgid`.
fn kill_process_group(pgid: u32) {
    let ret = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
    if ret != 0 {
        warn!(
            "Failed to kill process group {}: {}",
            pgid,
            std::io::Error::last_os_error()
        );
    }
}

/// Run `spec`, killing it once `bound` elapses. Every call yields a record
/// with a measured duration; only failing to set up redirections is an error.
pub fn run_bounded(
    spec: &CommandSpec,
    bound: Option<Duration>,
) -> std::io::Result<ExecutionRecord> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    cmd.stdin(match &spec.stdin {
        Some(path) => Stdio::from(File::open(path)?),
        None => Stdio::null(),
    });
    if let Some(path) = &spec.stdout {
        cmd.stdout(Stdio::from(open_append(path)?));
    }
    if let Some(path) = &spec.stderr {
        cmd.stderr(Stdio::from(open_append(path)?));
    }
    // own process group, so a timeout takes down the whole tool tree
    cmd.process_group(0);

    debug!("Running {}", spec.display());
    let started_at = Utc::now();
    let start = Instant::now();

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!("Failed to spawn {}: {}", spec.program.display(), err);
            let code = match err.kind() {
                std::io::ErrorKind::PermissionDenied => NOT_EXECUTABLE_EXIT_CODE,
                _ => NOT_FOUND_EXIT_CODE,
            };
            return Ok(ExecutionRecord {
                outcome: ExecutionOutcome::Failed(code),
                duration: start.elapsed(),
                started_at,
            });
        }
    };

    let outcome = match bound {
        None => ExecutionOutcome::from_status(child.wait()?),
        Some(bound) => {
            let deadline = start + bound;
            loop {
                if let Some(status) = child.try_wait()? {
                    break ExecutionOutcome::from_status(status);
                }
                if Instant::now() >= deadline {
                    debug!(
                        "Bound of {:?} reached, killing process group {}",
                        bound,
                        child.id()
                    );
                    kill_process_group(child.id());
                    if let Err(err) = child.kill() {
                        debug!("Killing {} directly: {}", child.id(), err);
                    }
                    child.wait()?;
                    break ExecutionOutcome::TimedOut;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    };

    Ok(ExecutionRecord {
        outcome,
        duration: start.elapsed(),
        started_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn test_classify() {
        assert_eq!(ExecutionOutcome::classify(Some(0), None), ExecutionOutcome::Completed);
        assert_eq!(ExecutionOutcome::classify(Some(124), None), ExecutionOutcome::TimedOut);
        assert_eq!(ExecutionOutcome::classify(None, Some(14)), ExecutionOutcome::TimedOut);
        assert_eq!(
            ExecutionOutcome::classify(Some(127), None),
            ExecutionOutcome::Failed(127)
        );
        assert_eq!(
            ExecutionOutcome::classify(None, Some(11)),
            ExecutionOutcome::Failed(139)
        );
    }

    #[test]
    fn test_completed() {
        let record = run_bounded(&sh("exit 0"), Some(Duration::from_secs(10))).unwrap();
        assert_eq!(record.outcome, ExecutionOutcome::Completed);
        assert!(record.duration < Duration::from_secs(10));
    }

    #[test]
    fn test_exit_124_is_timed_out() {
        let record = run_bounded(&sh("exit 124"), None).unwrap();
        assert_eq!(record.outcome, ExecutionOutcome::TimedOut);
        assert!(record.outcome.is_usable());
    }

    #[test]
    fn test_bound_kills_long_run() {
        let record = run_bounded(&sh("sleep 30"), Some(Duration::from_millis(200))).unwrap();
        assert_eq!(record.outcome, ExecutionOutcome::TimedOut);
        assert!(record.duration >= Duration::from_millis(200));
        assert!(record.duration < Duration::from_secs(30));
    }

    #[test]
    fn test_bound_kills_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let spec = CommandSpec::new("/bin/sh")
            .arg("-c")
            .arg("/bin/sleep 30 & echo $! > pid; wait")
            .current_dir(dir.path())
            .env("PATH", "/nonexistent");
        let record = run_bounded(&spec, Some(Duration::from_millis(300))).unwrap();
        assert_eq!(record.outcome, ExecutionOutcome::TimedOut);

        let pid: libc::pid_t = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        // a killed orphan may linger as a zombie until init reaps it
        let running = |pid: libc::pid_t| {
            (unsafe { libc::kill(pid, 0) }) == 0
                && std::fs::read_to_string(format!("/proc/{}/stat", pid))
                    .map(|stat| !stat.contains(") Z "))
                    .unwrap_or(true)
        };
        let mut alive = true;
        for _ in 0..50 {
            alive = running(pid);
            if !alive {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!alive, "sleep {} survived the timeout", pid);
    }

    #[test]
    fn test_failed_exit_code() {
        let record = run_bounded(&sh("exit 3"), Some(Duration::from_secs(10))).unwrap();
        assert_eq!(record.outcome, ExecutionOutcome::Failed(3));
        assert!(!record.outcome.is_usable());
    }

    #[test]
    fn test_missing_binary() {
        let spec = CommandSpec::new("/nonexistent/definitely/not/here");
        let record = run_bounded(&spec, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(record.outcome, ExecutionOutcome::Failed(NOT_FOUND_EXIT_CODE));
    }

    #[test]
    fn test_redirections_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("logs").join("out.txt");
        let spec = sh("pwd; echo err >&2")
            .current_dir(dir.path())
            .stdout_file(&out)
            .stderr_file(dir.path().join("err.txt"));
        let record = run_bounded(&spec, None).unwrap();
        assert_eq!(record.outcome, ExecutionOutcome::Completed);
        let pwd = std::fs::read_to_string(&out).unwrap();
        assert_eq!(
            std::path::Path::new(pwd.trim()).canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("err.txt")).unwrap(),
            "err\n"
        );
    }
}
