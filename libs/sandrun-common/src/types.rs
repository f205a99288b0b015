use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;

/// Key of a persisted build, assigned by the store at creation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildKey(String);

impl BuildKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of a persisted log record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogKey(String);

impl LogKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStatus {
    Started,
    Done,
    Failed,
}

impl BuildStatus {
    /// Terminal status for a finished run. Only a failed user process maps to `Failed`.
    pub fn from_outcome(outcome: &ExitOutcome) -> Self {
        if outcome.is_success() {
            BuildStatus::Done
        } else {
            BuildStatus::Failed
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStatus::Started => write!(f, "started"),
            BuildStatus::Done => write!(f, "done"),
            BuildStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Metadata of one run invocation
///
/// `status` is `Started` exactly while `end_time` is unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub challenge: String,
    pub user: String,
    pub commit: String,
    pub status: BuildStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl BuildRecord {
    pub fn started(challenge: &str, user: &str, commit: &str) -> Self {
        Self {
            challenge: challenge.to_string(),
            user: user.to_string(),
            commit: commit.to_string(),
            status: BuildStatus::Started,
            start_time: Utc::now(),
            end_time: None,
        }
    }

    /// Move the record to its terminal status.
    ///
    /// The end time is clamped so it never precedes the start time, even if
    /// the wall clock stepped backwards during the run.
    pub fn finish(&mut self, outcome: &ExitOutcome, now: DateTime<Utc>) {
        self.end_time = Some(now.max(self.start_time));
        self.status = BuildStatus::from_outcome(outcome);
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Transcripts and resource usage of one completed run. Written once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub build: BuildKey,
    pub in_log: String,
    pub out_log: String,
    pub extra_log: String,
    pub prepare_log: String,
    pub sys_usage: ResourceUsage,
}

/// Seconds/microseconds pair as emitted in `stats.log`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Timeval {
    pub sec: i64,
    pub usec: i64,
}

impl Timeval {
    pub fn as_duration(&self) -> Duration {
        let micros = self.sec.saturating_mul(1_000_000).saturating_add(self.usec);
        Duration::from_micros(micros.max(0) as u64)
    }
}

/// OS resource usage of the sandboxed process (rusage layout)
///
/// Field names match the JSON written by the sandbox image. Missing
/// counters deserialize as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ResourceUsage {
    pub utime: Timeval,
    pub stime: Timeval,
    pub maxrss: i64,
    pub ixrss: i64,
    pub idrss: i64,
    pub isrss: i64,
    pub minflt: i64,
    pub majflt: i64,
    pub nswap: i64,
    pub inblock: i64,
    pub oublock: i64,
    pub msgsnd: i64,
    pub msgrcv: i64,
    pub nsignals: i64,
    pub nvcsw: i64,
    pub nivcsw: i64,
}

impl ResourceUsage {
    /// User plus system CPU time
    pub fn cpu_time(&self) -> Duration {
        self.utime.as_duration() + self.stime.as_duration()
    }

    pub fn is_zero(&self) -> bool {
        *self == ResourceUsage::default()
    }
}

/// How the authoritative sandbox process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitOutcome {
    Success,
    Failure { code: Option<i32>, reason: String },
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            ExitOutcome::Success
        } else {
            ExitOutcome::Failure {
                code: status.code(),
                reason: status.to_string(),
            }
        }
    }

    pub fn timed_out(after: Duration) -> Self {
        ExitOutcome::Failure {
            code: None,
            reason: format!("timed out after {}ms", after.as_millis()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitOutcome::Success)
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Success => write!(f, "success"),
            ExitOutcome::Failure { reason, .. } => write!(f, "failure ({})", reason),
        }
    }
}

/// The four transcripts a run can produce; unused ones stay empty
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunTranscripts {
    pub in_log: Vec<u8>,
    pub out_log: Vec<u8>,
    pub extra_log: Vec<u8>,
    pub prepare_log: Vec<u8>,
}

impl RunTranscripts {
    pub fn into_log_record(self, build: BuildKey, sys_usage: ResourceUsage) -> LogRecord {
        LogRecord {
            build,
            in_log: String::from_utf8_lossy(&self.in_log).into_owned(),
            out_log: String::from_utf8_lossy(&self.out_log).into_owned(),
            extra_log: String::from_utf8_lossy(&self.extra_log).into_owned(),
            prepare_log: String::from_utf8_lossy(&self.prepare_log).into_owned(),
            sys_usage,
        }
    }
}
