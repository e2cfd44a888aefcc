use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::acl::Acl;
use crate::error::{HiveError, Result};
use crate::model::task::{Task, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Init,
    Queuing,
    Queued,
    InProgress,
    Completed,
    Suspend,
    FailedPermanent,
    Deleted,
}

impl JobState {
    /// States in which the job's workunits may be dispatched or requeued.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobState::Queuing | JobState::Queued | JobState::InProgress
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Init => "init",
            JobState::Queuing => "queuing",
            JobState::Queued => "queued",
            JobState::InProgress => "in-progress",
            JobState::Completed => "completed",
            JobState::Suspend => "suspend",
            JobState::FailedPermanent => "failed-permanent",
            JobState::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// States worth reloading from the document store after a restart.
pub const RECOVERABLE_STATES: &[JobState] = &[
    JobState::Init,
    JobState::Queuing,
    JobState::Queued,
    JobState::InProgress,
    JobState::Suspend,
];

/// Submission metadata shared by a job and its workunits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pipeline: String,
    pub submit_time: DateTime<Utc>,
    #[serde(default)]
    pub started_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: i32,
    /// Comma-separated clientgroups allowed to run this job's work;
    /// empty means any group.
    #[serde(default)]
    pub client_groups: String,
    #[serde(default)]
    pub data_token: String,
    #[serde(default)]
    pub auth: bool,
}

impl Default for JobInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            pipeline: String::new(),
            submit_time: Utc::now(),
            started_time: None,
            completed_time: None,
            priority: 0,
            client_groups: String::new(),
            data_token: String::new(),
            auth: false,
        }
    }
}

/// Error record attached to a suspended job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobError {
    #[serde(default)]
    pub client_failed: String,
    #[serde(default)]
    pub work_failed: String,
    #[serde(default)]
    pub task_failed: String,
    #[serde(default)]
    pub server_notes: String,
    #[serde(default)]
    pub work_notes: String,
    #[serde(default)]
    pub app_error: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(default)]
    pub acl: Acl,
    pub info: JobInfo,
    pub state: JobState,
    pub remain_tasks: u32,
    /// Task keys in submission order; the tasks themselves live in the
    /// scheduler's task map.
    #[serde(default)]
    pub tasks: Vec<String>,
    /// Name of the task flagged as entrypoint.
    #[serde(default)]
    pub entrypoint: String,
    /// Pre-parsed workflow description, opaque to the scheduler.
    #[serde(default)]
    pub workflow: Option<Value>,
    #[serde(default)]
    pub resumed: u32,
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
    pub update_time: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<JobError>,
}

impl Job {
    pub fn new() -> Self {
        Self {
            id: String::new(),
            acl: Acl::default(),
            info: JobInfo::default(),
            state: JobState::Init,
            remain_tasks: 0,
            tasks: Vec::new(),
            entrypoint: String::new(),
            workflow: None,
            resumed: 0,
            expiration: None,
            update_time: Utc::now(),
            error: None,
        }
    }

    /// Absolute expiration from a `<n>M|H|D` suffix string.
    pub fn parse_expiration(expire: &str) -> Result<DateTime<Utc>> {
        let (num, unit) = expire.split_at(expire.len().saturating_sub(1));
        let n: i64 = num
            .parse()
            .map_err(|_| HiveError::Validation(format!("expiration format '{expire}' is invalid")))?;
        if n <= 0 {
            return Err(HiveError::Validation(format!(
                "expiration format '{expire}' is invalid"
            )));
        }
        let span = match unit {
            "M" => Duration::minutes(n),
            "H" => Duration::hours(n),
            "D" => Duration::days(n),
            _ => {
                return Err(HiveError::Validation(format!(
                    "expiration format '{expire}' is invalid"
                )))
            }
        };
        Ok(Utc::now() + span)
    }
}

impl Default for Job {
    fn default() -> Self {
        Self::new()
    }
}

/// Persisted form of a job: the job record with its task array embedded,
/// one document per job in the `jobs` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDocument {
    #[serde(flatten)]
    pub job: Job,
    #[serde(rename = "task_list", default)]
    pub tasks: Vec<Task>,
}

impl JobDocument {
    pub fn new(job: Job, tasks: Vec<Task>) -> Self {
        Self { job, tasks }
    }

    /// Normalize a submitted or reloaded document: allocate an id, floor
    /// the priority, initialize every task, recompute `remain_tasks` and
    /// repair inconsistent completion state.
    pub fn normalize(&mut self, base_priority: i32) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(HiveError::Validation("job task list is empty".to_string()));
        }

        if self.job.id.is_empty() {
            self.job.id = Uuid::new_v4().to_string();
        }
        if self.job.info.priority < base_priority {
            self.job.info.priority = base_priority;
        }

        let mut flagged = self.tasks.iter().filter(|t| t.entrypoint).count();
        if flagged == 0 {
            self.tasks[0].entrypoint = true;
            flagged = 1;
        }
        if flagged != 1 {
            return Err(HiveError::Validation(
                "job must flag exactly one entrypoint task".to_string(),
            ));
        }

        let info = self.job.info.clone();
        let mut remain = 0u32;
        let mut keys = Vec::with_capacity(self.tasks.len());
        for task in &mut self.tasks {
            task.init(&self.job.id, &info)?;
            if task.state != TaskState::Completed {
                remain += 1;
            }
            keys.push(task.key());
        }
        self.job.remain_tasks = remain;
        self.job.tasks = keys;
        self.job.entrypoint = self
            .tasks
            .iter()
            .find(|t| t.entrypoint)
            .map(|t| t.id.name.clone())
            .unwrap_or_default();

        // repair drifted completion state
        if remain == 0 && self.job.state != JobState::Completed {
            self.job.state = JobState::Completed;
            if self.job.info.completed_time.is_none() {
                self.job.info.completed_time = Some(Utc::now());
            }
        }
        if remain > 0 && self.job.state == JobState::Completed {
            self.job.state = JobState::Queued;
        }

        self.job.update_time = Utc::now();
        Ok(())
    }
}
