use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{HiveError, Result};
use crate::model::job::JobInfo;
use crate::model::workunit::Command;

/// Sentinel node id meaning "not yet resolved".
pub const UNRESOLVED_NODE: &str = "-";

/// Task identity: `(jobId, parentName, taskName)`, rendered as
/// `<jobId>_<taskName>` for top-level tasks and
/// `<jobId>_<parentName>_<taskName>` inside a sub-workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub job_id: String,
    pub parent: String,
    pub name: String,
}

impl TaskId {
    pub fn new(job_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            parent: String::new(),
            name: name.into(),
        }
    }

    pub fn with_parent(
        job_id: impl Into<String>,
        parent: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            parent: parent.into(),
            name: name.into(),
        }
    }

    /// String key used throughout the scheduler maps and the store.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.parent.is_empty() {
            write!(f, "{}_{}", self.job_id, self.name)
        } else {
            write!(f, "{}_{}_{}", self.job_id, self.parent, self.name)
        }
    }
}

impl FromStr for TaskId {
    type Err = HiveError;

    fn from_str(s: &str) -> Result<Self> {
        let (job_id, rest) = s
            .split_once('_')
            .ok_or_else(|| HiveError::Validation(format!("malformed task id: {s}")))?;
        if job_id.is_empty() || rest.is_empty() {
            return Err(HiveError::Validation(format!("malformed task id: {s}")));
        }
        match rest.split_once('_') {
            Some((parent, name)) => Ok(TaskId::with_parent(job_id, parent, name)),
            None => Ok(TaskId::new(job_id, rest)),
        }
    }
}

impl Serialize for TaskId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Init,
    Pending,
    Ready,
    Queued,
    InProgress,
    Suspend,
    Completed,
    FailedPermanent,
    #[serde(rename = "user_skipped")]
    UserSkipped,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::FailedPermanent)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Init => "init",
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Queued => "queued",
            TaskState::InProgress => "in-progress",
            TaskState::Suspend => "suspend",
            TaskState::Completed => "completed",
            TaskState::FailedPermanent => "failed-permanent",
            TaskState::UserSkipped => "user_skipped",
            TaskState::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// File-level input or output of a task, referencing a blob-store node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoFile {
    pub file_name: String,
    #[serde(default)]
    pub host: String,
    /// Blob-store node id; `-` until resolved.
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub size: i64,
    /// Name of the predecessor task producing this file, if any.
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub data_token: String,
    /// Delete the node when the owning job is deleted.
    #[serde(default)]
    pub delete: bool,
    /// Output node is updated in place; reset must not delete it.
    #[serde(default)]
    pub update: bool,
    /// Blob-store index required on this node, empty for none.
    #[serde(default)]
    pub index: String,
}

impl IoFile {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            host: String::new(),
            node: UNRESOLVED_NODE.to_string(),
            size: 0,
            origin: String::new(),
            data_token: String::new(),
            delete: false,
            update: false,
            index: String::new(),
        }
    }

    pub fn resolved(&self) -> bool {
        !self.node.is_empty() && self.node != UNRESOLVED_NODE
    }

    pub fn clear_node(&mut self) {
        self.node = UNRESOLVED_NODE.to_string();
        self.size = 0;
    }
}

/// Partitioning of a multi-workunit task over a blob-store index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartInfo {
    /// Input file the partition index is built on.
    pub input: String,
    pub index: String,
    #[serde(default)]
    pub total_index: u64,
    #[serde(default)]
    pub max_part_size_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub state: TaskState,
    #[serde(default)]
    pub cmd: Command,
    #[serde(default)]
    pub inputs: Vec<IoFile>,
    #[serde(default)]
    pub outputs: Vec<IoFile>,
    #[serde(default)]
    pub predata: Vec<IoFile>,
    /// Keys of tasks that must complete first; union of explicit
    /// dependencies and input origins, normalized by
    /// [`Task::collect_dependencies`].
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub total_work: u32,
    pub remain_work: u32,
    #[serde(default)]
    pub max_work_size: u64,
    #[serde(default)]
    pub partition: Option<PartInfo>,
    /// Comma-separated clientgroup filter overriding the job's.
    #[serde(default)]
    pub client_groups: String,
    #[serde(default)]
    pub entrypoint: bool,
    #[serde(default)]
    pub children: Vec<TaskId>,
    #[serde(default)]
    pub reset_task: bool,
    #[serde(default)]
    pub compute_time: u64,
    pub created_date: DateTime<Utc>,
    #[serde(default)]
    pub started_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_date: Option<DateTime<Utc>>,
    /// Consecutive ready-poll failures; not persisted.
    #[serde(skip)]
    pub enqueue_failures: u32,
}

impl Task {
    pub fn new(id: TaskId) -> Self {
        Self {
            id,
            state: TaskState::Init,
            cmd: Command::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            predata: Vec::new(),
            depends_on: Vec::new(),
            total_work: 1,
            remain_work: 1,
            max_work_size: 0,
            partition: None,
            client_groups: String::new(),
            entrypoint: false,
            children: Vec::new(),
            reset_task: false,
            compute_time: 0,
            created_date: Utc::now(),
            started_date: None,
            completed_date: None,
            enqueue_failures: 0,
        }
    }

    pub fn key(&self) -> String {
        self.id.key()
    }

    /// Normalize a submitted or reloaded task against its job: attach the
    /// job id, default the work counters, stamp IO sentinels and data
    /// tokens, and collect dependencies.
    pub fn init(&mut self, job_id: &str, info: &JobInfo) -> Result<()> {
        if self.id.name.is_empty() {
            return Err(HiveError::Validation("task name is empty".to_string()));
        }
        if self.id.job_id.is_empty() {
            self.id.job_id = job_id.to_string();
        }

        if self.total_work == 0 {
            self.total_work = 1;
        }
        if self.state != TaskState::Completed && self.remain_work != self.total_work {
            self.remain_work = self.total_work;
        }

        let mut seen = HashSet::new();
        for io in &self.inputs {
            if !seen.insert(io.file_name.clone()) {
                return Err(HiveError::Validation(format!(
                    "task {} declares input {} more than once",
                    self.id, io.file_name
                )));
            }
        }

        for io in self
            .inputs
            .iter_mut()
            .chain(self.outputs.iter_mut())
            .chain(self.predata.iter_mut())
        {
            if io.node.is_empty() {
                io.node = UNRESOLVED_NODE.to_string();
            }
            if info.auth && !info.data_token.is_empty() {
                io.data_token = info.data_token.clone();
            }
        }

        self.collect_dependencies();
        Ok(())
    }

    /// Merge explicit `depends_on` entries with input-origin dependencies,
    /// normalizing everything to full task keys. Idempotent.
    pub fn collect_dependencies(&mut self) {
        let job_prefix = format!("{}_", self.id.job_id);
        let mut deps: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        fn push(dep: String, deps: &mut Vec<String>, seen: &mut HashSet<String>) {
            if !dep.is_empty() && seen.insert(dep.clone()) {
                deps.push(dep);
            }
        }

        for dep in &self.depends_on {
            if dep.is_empty() {
                continue;
            }
            let key = if dep.starts_with(&job_prefix) {
                dep.clone()
            } else {
                format!("{job_prefix}{dep}")
            };
            push(key, &mut deps, &mut seen);
        }

        for io in &self.inputs {
            if io.origin.is_empty() {
                continue;
            }
            let key = if io.origin.starts_with(&job_prefix) {
                io.origin.clone()
            } else {
                format!("{}{}", job_prefix, io.origin)
            };
            push(key, &mut deps, &mut seen);
        }

        self.depends_on = deps;
    }

    /// Output descriptor producing `file_name`, if any.
    pub fn output(&self, file_name: &str) -> Option<&IoFile> {
        self.outputs.iter().find(|io| io.file_name == file_name)
    }

    /// Predicted slice size for one workunit of this task.
    pub fn work_size(&self) -> i64 {
        let total: i64 = self.inputs.iter().map(|io| io.size.max(0)).sum();
        total / i64::from(self.total_work.max(1))
    }
}
