use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{HiveError, Result};
use crate::model::job::JobInfo;
use crate::model::task::{Task, TaskId};

/// Workunit identity: `(task, rank)`, rendered as
/// `<jobId>_<taskName>_<rank>`. Rank 0 is the single workunit of an
/// unpartitioned task; partitioned tasks use ranks 1..N.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkunitId {
    pub task: TaskId,
    pub rank: u32,
}

impl WorkunitId {
    pub fn new(task: TaskId, rank: u32) -> Self {
        Self { task, rank }
    }

    pub fn job_id(&self) -> &str {
        &self.task.job_id
    }

    pub fn task_key(&self) -> String {
        self.task.key()
    }
}

impl fmt::Display for WorkunitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.task, self.rank)
    }
}

impl FromStr for WorkunitId {
    type Err = HiveError;

    fn from_str(s: &str) -> Result<Self> {
        let (task_part, rank_part) = s
            .rsplit_once('_')
            .ok_or_else(|| HiveError::Validation(format!("malformed workunit id: {s}")))?;
        let rank: u32 = rank_part
            .parse()
            .map_err(|_| HiveError::Validation(format!("malformed workunit id: {s}")))?;
        let task: TaskId = task_part.parse()?;
        Ok(Self { task, rank })
    }
}

impl Serialize for WorkunitId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for WorkunitId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkState {
    Queued,
    CheckedOut,
    Suspend,
    Done,
    Failed,
}

impl fmt::Display for WorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkState::Queued => "queued",
            WorkState::CheckedOut => "checked-out",
            WorkState::Suspend => "suspend",
            WorkState::Done => "done",
            WorkState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Command a worker runs for a workunit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }
}

/// Executable atom handed to a worker, derived from a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workunit {
    pub id: WorkunitId,
    pub state: WorkState,
    pub cmd: Command,
    /// Submission metadata copied from the owning job; `client_groups`
    /// carries the task-level override when one is set.
    pub info: JobInfo,
    pub total_work: u32,
    /// Predicted input slice size in bytes, for checkout size filtering.
    #[serde(default)]
    pub size: i64,
    /// Client currently holding the checkout, empty when waiting.
    #[serde(default)]
    pub client: String,
    #[serde(default)]
    pub checkout_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failures: u32,
}

impl Workunit {
    /// Materialize the workunit of `task` at `rank`, snapshotting the
    /// job's info block (with the task's clientgroup override applied).
    pub fn from_task(task: &Task, rank: u32, job_info: &JobInfo) -> Self {
        let mut info = job_info.clone();
        if !task.client_groups.is_empty() {
            info.client_groups = task.client_groups.clone();
        }
        Self {
            id: WorkunitId::new(task.id.clone(), rank),
            state: WorkState::Queued,
            cmd: task.cmd.clone(),
            info,
            total_work: task.total_work,
            size: task.work_size(),
            client: String::new(),
            checkout_time: None,
            failures: 0,
        }
    }
}
