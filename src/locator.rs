//! Resolve a workload identifier to an executable, working dir and argv
use crate::{
    CommandSpec, ExecutionOutcome, ExperimentConfig, OverrideRule, PipelineError, Stage,
    ToolCommand, file_name_string, get_workload_run_root, run_bounded,
};
use log::{debug, info, warn};
use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

/// Name of the recorded-invocation file written by the benchmark runner
pub const RECORDED_INVOCATION_FILE: &str = "speccmds.cmd";

/// Input files probed when no invocation was recorded
pub const CONVENTIONAL_INPUTS: &[&str] = &["inp.in", "input.txt", "ref.in", "train.in", "test.in"];

/// A workload resolved for one pipeline invocation, immutable once built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadJob {
    pub id: String,
    pub executable: PathBuf,
    pub working_dir: PathBuf,
    pub args: Vec<String>,
    pub stdin: Option<PathBuf>,
    /// stop after this many instructions
    pub instructions: u64,
    pub warmup_instructions: u64,
    /// which resolver produced the arguments
    pub resolved_by: &'static str,
}

impl WorkloadJob {
    /// File name of the executable, used to match trace logs
    pub fn app_name(&self) -> String {
        file_name_string(&self.executable)
    }

    /// The workload as a plain command, without any instrumentation
    pub fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.executable)
            .args(self.args.iter().cloned())
            .current_dir(&self.working_dir)
            .stdin_file(self.stdin.clone())
    }
}

/// A run directory produced by the benchmark runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDir {
    pub path: PathBuf,
    pub executable: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedArgs {
    pub args: Vec<String>,
    pub stdin: Option<PathBuf>,
}

/// One strategy for recovering a workload's arguments
pub trait ArgResolver: Send + Sync {
    fn name(&self) -> &'static str;
    fn resolve(&self, workload: &str, run: &RunDir) -> Option<ResolvedArgs>;
}

/// Argument tail after the executable token in the runner's recorded command
pub struct RecordedInvocation;

impl ArgResolver for RecordedInvocation {
    fn name(&self) -> &'static str {
        "recorded-invocation"
    }

    fn resolve(&self, _workload: &str, run: &RunDir) -> Option<ResolvedArgs> {
        let content = std::fs::read_to_string(run.path.join(RECORDED_INVOCATION_FILE)).ok()?;
        parse_recorded_invocation(&content, &file_name_string(&run.executable), &run.path)
    }
}

const OUTPUT_REDIRECTIONS: &[&str] = &[">", ">>", "1>", "1>>", "2>", "2>>", "&>", "&>>"];

/// Find the line that invokes `exe_name` and return what follows it, minus
/// output redirections. `< file`, or a `-i file` runner flag ahead of the
/// executable, becomes the job's stdin.
pub fn parse_recorded_invocation(
    content: &str,
    exe_name: &str,
    run_dir: &Path,
) -> Option<ResolvedArgs> {
    for line in content.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(pos) = tokens
            .iter()
            .position(|token| file_name_string(token) == exe_name)
        else {
            continue;
        };

        let mut resolved = ResolvedArgs::default();
        let mut head = tokens[..pos].iter();
        while let Some(token) = head.next() {
            if *token == "-i" {
                resolved.stdin = head.next().map(|file| run_dir.join(file));
            }
        }
        let mut tail = tokens[pos + 1..].iter();
        while let Some(token) = tail.next() {
            if OUTPUT_REDIRECTIONS.contains(token) {
                // drop the redirection target as well
                tail.next();
            } else if OUTPUT_REDIRECTIONS
                .iter()
                .any(|redir| token.starts_with(redir))
            {
                // attached target, e.g. 2>>err.log
            } else if *token == "<" {
                resolved.stdin = tail.next().map(|file| run_dir.join(file));
            } else if let Some(file) = token.strip_prefix('<') {
                resolved.stdin = Some(run_dir.join(file));
            } else {
                resolved.args.push(token.to_string());
            }
        }
        return Some(resolved);
    }
    None
}

/// First conventional input file present in the run dir
pub struct ConventionalInputs;

impl ArgResolver for ConventionalInputs {
    fn name(&self) -> &'static str {
        "conventional-inputs"
    }

    fn resolve(&self, _workload: &str, run: &RunDir) -> Option<ResolvedArgs> {
        CONVENTIONAL_INPUTS
            .iter()
            .find(|name| run.path.join(name).is_file())
            .map(|name| ResolvedArgs {
                args: vec![name.to_string()],
                stdin: None,
            })
    }
}

/// Benchmark-family specific arguments
pub struct OverrideTable {
    pub rules: Vec<OverrideRule>,
}

impl ArgResolver for OverrideTable {
    fn name(&self) -> &'static str {
        "override-table"
    }

    fn resolve(&self, workload: &str, run: &RunDir) -> Option<ResolvedArgs> {
        for rule in self.rules.iter().filter(|rule| workload.contains(&rule.family)) {
            let input = match &rule.locate_suffix {
                Some(suffix) => match find_file(&run.path, |name| name.ends_with(suffix.as_str())) {
                    Some(path) => Some(file_name_string(path)),
                    None => {
                        debug!(
                            "Override for {} needs a *{} input in {}, none found",
                            rule.family,
                            suffix,
                            run.path.display()
                        );
                        continue;
                    }
                },
                None => None,
            };
            let args = rule
                .args
                .iter()
                .map(|arg| match &input {
                    Some(input) => arg.replace("{input}", input),
                    None => arg.clone(),
                })
                .collect();
            return Some(ResolvedArgs { args, stdin: None });
        }
        None
    }
}

// first regular file (by name) in `dir` whose name satisfies `pred`
fn find_file<F: Fn(&str) -> bool>(dir: &Path, pred: F) -> Option<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        .map(|entry| entry.path())
        .filter(|path| pred(&file_name_string(path)))
        .collect();
    files.sort();
    files.into_iter().next()
}

fn modified(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

pub struct Locator {
    spec_root: PathBuf,
    resolvers: Vec<Box<dyn ArgResolver>>,
    runner: Option<ToolCommand>,
}

impl Locator {
    pub fn new<P: AsRef<Path>>(
        spec_root: P,
        overrides: Vec<OverrideRule>,
        runner: Option<ToolCommand>,
    ) -> Locator {
        Locator {
            spec_root: spec_root.as_ref().to_path_buf(),
            resolvers: vec![
                Box::new(RecordedInvocation),
                Box::new(ConventionalInputs),
                Box::new(OverrideTable { rules: overrides }),
            ],
            runner,
        }
    }

    pub fn from_config(config: &ExperimentConfig) -> Locator {
        Locator::new(
            &config.spec_root,
            config.overrides.clone(),
            config.runner.clone(),
        )
    }

    /// Newest run directory of `workload` that holds a built executable
    pub fn find_run_dir(&self, workload: &str) -> Option<RunDir> {
        let run_root = get_workload_run_root(&self.spec_root, workload);
        let mut dirs: Vec<PathBuf> = std::fs::read_dir(&run_root)
            .ok()?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("run_base"))
            .map(|entry| entry.path())
            .collect();
        // newest first, name as tie-break
        dirs.sort_by(|a, b| modified(b).cmp(&modified(a)).then_with(|| b.cmp(a)));

        dirs.into_iter().find_map(|path| {
            find_file(&path, |name| name.contains("_base.")).map(|executable| RunDir {
                path,
                executable,
            })
        })
    }

    /// Try every resolver in order, first answer wins
    pub fn resolve_args(
        &self,
        workload: &str,
        run: &RunDir,
    ) -> Option<(ResolvedArgs, &'static str)> {
        self.resolvers.iter().find_map(|resolver| {
            resolver
                .resolve(workload, run)
                .map(|args| (args, resolver.name()))
        })
    }

    fn bootstrap(&self, workload: &str) -> crate::Result<()> {
        let Some(runner) = &self.runner else {
            return Ok(());
        };
        let spec = CommandSpec::new(&runner.program)
            .args(runner.args.iter().cloned())
            .arg(workload);
        info!("Bootstrapping {}: {}", workload, spec.display());
        let record = run_bounded(&spec, None)?;
        match record.outcome {
            ExecutionOutcome::Failed(code) => Err(PipelineError::Failed {
                stage: Stage::Bootstrap,
                code,
            }),
            _ => Ok(()),
        }
    }

    pub fn locate(
        &self,
        workload: &str,
        instructions: u64,
        warmup_instructions: u64,
    ) -> crate::Result<WorkloadJob> {
        let run = match self.find_run_dir(workload) {
            Some(run) => run,
            None if self.runner.is_some() => {
                warn!("No run directory for {}, running the benchmark runner", workload);
                self.bootstrap(workload)?;
                self.find_run_dir(workload).ok_or_else(|| {
                    PipelineError::not_found(workload, "no run directory after bootstrap")
                })?
            }
            None => {
                return Err(PipelineError::not_found(
                    workload,
                    format!(
                        "no run directory under {}",
                        get_workload_run_root(&self.spec_root, workload).display()
                    ),
                ));
            }
        };

        let (resolved, resolved_by) = self.resolve_args(workload, &run).ok_or_else(|| {
            PipelineError::not_found(
                workload,
                format!("cannot recover arguments in {}", run.path.display()),
            )
        })?;
        info!(
            "Resolved {} via {}: {} {}",
            workload,
            resolved_by,
            run.executable.display(),
            resolved.args.join(" ")
        );

        Ok(WorkloadJob {
            id: workload.to_string(),
            executable: run.executable,
            working_dir: run.path,
            args: resolved.args,
            stdin: resolved.stdin,
            instructions,
            warmup_instructions,
            resolved_by,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::default_overrides;
    use std::fs;

    fn make_run_dir(spec_root: &Path, bench: &str, exe: &str) -> PathBuf {
        let dir = get_workload_run_root(spec_root, bench).join("run_base_refrate_mytest-m64.0000");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(exe), b"#!/bin/sh\n").unwrap();
        dir
    }

    #[test]
    fn test_parse_recorded_invocation() {
        let content = "-C /spec/run\n\
            -o inp.out -e inp.err ../run_base_refrate_mytest-m64.0000/mcf_r_base.mytest-m64 inp.in > inp.out 2>> inp.err\n";
        let resolved =
            parse_recorded_invocation(content, "mcf_r_base.mytest-m64", Path::new("/run")).unwrap();
        assert_eq!(resolved.args, vec!["inp.in"]);
        assert_eq!(resolved.stdin, None);
    }

    #[test]
    fn test_parse_recorded_invocation_stdin() {
        let content = "../run/leela_r_base.x -g 2>>err.log < ref.sgf";
        let resolved =
            parse_recorded_invocation(content, "leela_r_base.x", Path::new("/run")).unwrap();
        assert_eq!(resolved.args, vec!["-g"]);
        assert_eq!(resolved.stdin, Some(PathBuf::from("/run/ref.sgf")));
    }

    #[test]
    fn test_parse_recorded_invocation_runner_stdin() {
        let content = "-i bwaves_1.in -o bwaves_1.out -e bwaves_1.err \
            ../run_base_refrate_mytest-m64.0000/bwaves_r_base.mytest-m64 bwaves_1\n";
        let resolved =
            parse_recorded_invocation(content, "bwaves_r_base.mytest-m64", Path::new("/run"))
                .unwrap();
        assert_eq!(resolved.args, vec!["bwaves_1"]);
        assert_eq!(resolved.stdin, Some(PathBuf::from("/run/bwaves_1.in")));
    }

    #[test]
    fn test_locate_recorded() {
        let spec = tempfile::tempdir().unwrap();
        let dir = make_run_dir(spec.path(), "505.mcf_r", "mcf_r_base.mytest-m64");
        fs::write(
            dir.join(RECORDED_INVOCATION_FILE),
            "../run_base_refrate_mytest-m64.0000/mcf_r_base.mytest-m64 inp.in > inp.out\n",
        )
        .unwrap();

        let locator = Locator::new(spec.path(), default_overrides(), None);
        let job = locator.locate("505.mcf_r", 100_000_000, 0).unwrap();
        assert_eq!(job.args, vec!["inp.in"]);
        assert_eq!(job.working_dir, dir);
        assert_eq!(job.app_name(), "mcf_r_base.mytest-m64");
        assert_eq!(job.resolved_by, "recorded-invocation");
    }

    #[test]
    fn test_locate_conventional_input() {
        let spec = tempfile::tempdir().unwrap();
        let dir = make_run_dir(spec.path(), "999.toy_r", "toy_r_base.x");
        fs::write(dir.join("ref.in"), b"").unwrap();

        let locator = Locator::new(spec.path(), default_overrides(), None);
        let job = locator.locate("999.toy_r", 1, 0).unwrap();
        assert_eq!(job.args, vec!["ref.in"]);
        assert_eq!(job.resolved_by, "conventional-inputs");
    }

    #[test]
    fn test_locate_overrides() {
        let spec = tempfile::tempdir().unwrap();
        make_run_dir(spec.path(), "548.exchange2_r", "exchange2_r_base.x");
        let dir = make_run_dir(spec.path(), "557.xz_r", "xz_r_base.x");
        fs::write(dir.join("cld.tar.xz"), b"").unwrap();

        let locator = Locator::new(spec.path(), default_overrides(), None);
        let job = locator.locate("548.exchange2_r", 1, 0).unwrap();
        assert_eq!(job.args, vec!["6"]);
        let job = locator.locate("557.xz_r", 1, 0).unwrap();
        assert_eq!(job.args, vec!["cld.tar.xz", "160"]);
        assert_eq!(job.resolved_by, "override-table");
    }

    #[test]
    fn test_locate_not_found() {
        let spec = tempfile::tempdir().unwrap();
        let locator = Locator::new(spec.path(), default_overrides(), None);
        assert!(matches!(
            locator.locate("500.perlbench_r", 1, 0),
            Err(PipelineError::NotFound { .. })
        ));

        // run dir present but nothing to recover arguments from
        make_run_dir(spec.path(), "500.perlbench_r", "perlbench_r_base.x");
        assert!(matches!(
            locator.locate("500.perlbench_r", 1, 0),
            Err(PipelineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_bootstrap_then_retry() {
        let spec = tempfile::tempdir().unwrap();
        let run_dir = get_workload_run_root(spec.path(), "999.toy_r")
            .join("run_base_refrate_mytest-m64.0000");
        // the "runner" builds the run dir the first time it is called
        let script = format!(
            "mkdir -p {dir} && touch {dir}/toy_r_base.x {dir}/inp.in",
            dir = run_dir.display()
        );
        let runner = ToolCommand {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script, "runner".to_string()],
        };

        let locator = Locator::new(spec.path(), default_overrides(), Some(runner));
        let job = locator.locate("999.toy_r", 1, 0).unwrap();
        assert_eq!(job.args, vec!["inp.in"]);
    }

    #[test]
    fn test_bootstrap_failure() {
        let spec = tempfile::tempdir().unwrap();
        let runner = ToolCommand {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), "exit 2".to_string(), "runner".to_string()],
        };
        let locator = Locator::new(spec.path(), default_overrides(), Some(runner));
        assert!(matches!(
            locator.locate("999.toy_r", 1, 0),
            Err(PipelineError::Failed {
                stage: Stage::Bootstrap,
                code: 2
            })
        ));
    }
}
