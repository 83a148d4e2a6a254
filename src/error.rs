use std::path::PathBuf;

/// Stage of a job, used to attribute failures and timing rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Locate,
    Bootstrap,
    Capture,
    Extract,
    Aggregate,
    Simulate,
    Parse,
    Bound,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Locate => "locate",
            Stage::Bootstrap => "bootstrap",
            Stage::Capture => "capture",
            Stage::Extract => "extract",
            Stage::Aggregate => "aggregate",
            Stage::Simulate => "simulate",
            Stage::Parse => "parse",
            Stage::Bound => "bound",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// workload or one of its artifacts cannot be resolved
    #[error("Not found: {workload}: {reason}")]
    NotFound { workload: String, reason: String },

    /// external tool exited with a non-zero, non-timeout code
    #[error("{stage} failed with exit code {code}")]
    Failed { stage: Stage, code: i32 },

    /// capture ran to completion (or timeout) but left no logs behind
    #[error("No trace produced for {workload} in {}", scratch.display())]
    NoTraceProduced { workload: String, scratch: PathBuf },

    /// a metric the bound depends on is missing from a report
    #[error("Incomplete summary for {config}: {field} unavailable")]
    IncompleteSummary { config: String, field: &'static str },

    #[error("Could not lock {} after {attempts} attempts", dataset.display())]
    AggregationConflict { dataset: PathBuf, attempts: u32 },

    #[error("Schema mismatch in {}: {reason}", dataset.display())]
    SchemaMismatch { dataset: PathBuf, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Whether this error makes the whole pipeline exit unsuccessfully.
    /// Incomplete summaries are recorded as degraded results instead.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipelineError::IncompleteSummary { .. })
    }

    pub fn not_found(workload: &str, reason: impl Into<String>) -> Self {
        PipelineError::NotFound {
            workload: workload.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_failed() {
        let err = PipelineError::Failed {
            stage: Stage::Capture,
            code: 127,
        };
        assert_eq!(err.to_string(), "capture failed with exit code 127");
    }

    #[test]
    fn incomplete_summary_is_degraded() {
        let err = PipelineError::IncompleteSummary {
            config: "JanS".to_string(),
            field: "time_ns",
        };
        assert!(!err.is_fatal());
        assert!(
            PipelineError::NoTraceProduced {
                workload: "505.mcf_r".to_string(),
                scratch: PathBuf::from("/tmp/x"),
            }
            .is_fatal()
        );
    }
}
