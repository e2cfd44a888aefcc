use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::RwLock;

use crate::config::SchedulerConfig;
use crate::error::{HiveError, Result};
use crate::event::{self, Event};
use crate::lock::TracedRwLock;
use crate::model::job::RECOVERABLE_STATES;
use crate::model::{
    Job, JobDocument, JobError, JobState, PartInfo, Task, TaskId, TaskState, WorkState, Workunit,
};
use crate::scheduler::queue::WorkQueue;
use crate::store::{with_backoff, BlobStore, DataStore};

const BACKOFF_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Jobs keyed by id; each behind its own traced reader-writer lock.
#[derive(Default)]
pub struct JobMap {
    inner: RwLock<HashMap<String, Arc<TracedRwLock<Job>>>>,
}

impl JobMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, job: Job) -> Arc<TracedRwLock<Job>> {
        let id = job.id.clone();
        let arc = Arc::new(TracedRwLock::new(format!("job_{id}"), job));
        self.inner.write().await.insert(id, arc.clone());
        arc
    }

    pub async fn get(&self, id: &str) -> Option<Arc<TracedRwLock<Job>>> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.contains_key(id)
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<TracedRwLock<Job>>> {
        self.inner.write().await.remove(id)
    }

    pub async fn entries(&self) -> Vec<(String, Arc<TracedRwLock<Job>>)> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// Tasks keyed by task key (`<jobId>_<taskName>`).
#[derive(Default)]
pub struct TaskMap {
    inner: RwLock<HashMap<String, Arc<TracedRwLock<Task>>>>,
}

impl TaskMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, task: Task) -> Arc<TracedRwLock<Task>> {
        let key = task.key();
        let arc = Arc::new(TracedRwLock::new(format!("task_{key}"), task));
        self.inner.write().await.insert(key, arc.clone());
        arc
    }

    pub async fn get(&self, key: &str) -> Option<Arc<TracedRwLock<Task>>> {
        self.inner.read().await.get(key).cloned()
    }

    pub async fn remove(&self, key: &str) -> Option<Arc<TracedRwLock<Task>>> {
        self.inner.write().await.remove(key)
    }

    pub async fn entries(&self) -> Vec<(String, Arc<TracedRwLock<Task>>)> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// Owns the per-job task DAG and is the only component mutating task and
/// job records (the feedback processor goes through its methods). Every
/// state transition is persisted before the in-memory mutation becomes
/// visible.
#[derive(Clone)]
pub struct TaskManager {
    config: Arc<SchedulerConfig>,
    jobs: Arc<JobMap>,
    tasks: Arc<TaskMap>,
    queue: Arc<WorkQueue>,
    store: Arc<dyn DataStore>,
    blobs: Arc<dyn BlobStore>,
}

impl TaskManager {
    pub fn new(
        config: Arc<SchedulerConfig>,
        jobs: Arc<JobMap>,
        tasks: Arc<TaskMap>,
        queue: Arc<WorkQueue>,
        store: Arc<dyn DataStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            config,
            jobs,
            tasks,
            queue,
            store,
            blobs,
        }
    }

    pub fn jobs(&self) -> &Arc<JobMap> {
        &self.jobs
    }

    pub fn tasks(&self) -> &Arc<TaskMap> {
        &self.tasks
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    /// Insert a normalized job document into the in-memory maps: the job
    /// record plus one task entry per embedded task, with non-terminal
    /// tasks set to `pending`. Dependency ids must resolve within the
    /// document or to an already-completed task.
    pub async fn register_job(&self, doc: JobDocument) -> Result<Arc<TracedRwLock<Job>>> {
        let job_id = doc.job.id.clone();
        let batch: Vec<String> = doc.tasks.iter().map(|t| t.key()).collect();

        for task in &doc.tasks {
            for dep in &task.depends_on {
                if batch.iter().any(|k| k == dep) {
                    continue;
                }
                let completed = match self.tasks.get(dep).await {
                    Some(existing) => existing.read("register_job").await.state == TaskState::Completed,
                    None => false,
                };
                if !completed {
                    return Err(HiveError::Validation(format!(
                        "task {} depends on unknown task {dep}",
                        task.key()
                    )));
                }
            }
        }

        let job_arc = self.jobs.insert(doc.job).await;
        for mut task in doc.tasks {
            if task.state == TaskState::Init {
                self.store
                    .update_task_field(&job_id, &task.key(), "state", json!(TaskState::Pending))
                    .await?;
                task.state = TaskState::Pending;
            }
            self.tasks.insert(task).await;
        }
        Ok(job_arc)
    }

    /// Ready-poll pass: move every ready task's workunits into the work
    /// queue. Idempotent; a task whose enqueue steps keep failing beyond
    /// the retry bound suspends its job with the captured error.
    pub async fn update_queue(&self) {
        for (key, task_arc) in self.tasks.entries().await {
            let (state, job_id) = {
                let task = task_arc.read("update_queue").await;
                (task.state, task.id.job_id.clone())
            };

            match state {
                TaskState::Init => {
                    if let Err(err) = self.set_task_state(&task_arc, TaskState::Pending).await {
                        tracing::warn!(task = %key, %err, "failed to normalize task state");
                    }
                }
                TaskState::Pending | TaskState::Ready => {
                    let job_active = match self.jobs.get(&job_id).await {
                        Some(job_arc) => job_arc.read("update_queue").await.state.is_active(),
                        None => false,
                    };
                    if !job_active {
                        continue;
                    }
                    if !self.task_ready(&task_arc).await {
                        continue;
                    }
                    if let Err(err) = self.enqueue_task(&task_arc).await {
                        self.enqueue_failed(&task_arc, &key, &job_id, err).await;
                    }
                }
                _ => {}
            }
        }
    }

    /// A task is ready when every dependency is completed and every
    /// unresolved input can be filled in from a completed predecessor's
    /// output.
    async fn task_ready(&self, task_arc: &Arc<TracedRwLock<Task>>) -> bool {
        let task = task_arc.read("task_ready").await;
        for dep in &task.depends_on {
            match self.tasks.get(dep).await {
                Some(pre) => {
                    if pre.read("task_ready").await.state != TaskState::Completed {
                        return false;
                    }
                }
                None => return false,
            }
        }
        for io in &task.inputs {
            if io.resolved() || io.origin.is_empty() {
                continue;
            }
            let pre_key = TaskId::new(&task.id.job_id, &io.origin).key();
            match self.tasks.get(&pre_key).await {
                Some(pre) => {
                    let pre = pre.read("task_ready").await;
                    if pre.state != TaskState::Completed || pre.output(&io.file_name).is_none() {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }

    /// Run the enqueue pipeline for one ready task: resolve inputs,
    /// create output nodes, recompute partitioning, materialize
    /// workunits, flip the task to `queued`.
    async fn enqueue_task(&self, task_arc: &Arc<TracedRwLock<Task>>) -> Result<()> {
        self.set_task_state(task_arc, TaskState::Ready).await?;

        let reset = { task_arc.read("enqueue_task").await.reset_task };
        if reset {
            self.set_reset_task(task_arc).await?;
            self.set_task_state(task_arc, TaskState::Ready).await?;
        }

        self.validate_inputs(task_arc).await?;
        self.init_part_index(task_arc).await?;
        self.create_output_nodes(task_arc).await?;

        let workunits = self.materialize(task_arc).await?;
        for work in workunits {
            match self.queue.add(work) {
                Ok(()) | Err(HiveError::AlreadyQueued(_)) => {}
                Err(err) => return Err(err),
            }
        }

        self.set_task_state(task_arc, TaskState::Queued).await?;
        {
            let mut task = task_arc.write("enqueue_task").await;
            task.enqueue_failures = 0;
        }
        let key = task_arc.read("enqueue_task").await.key();
        event::emit(Event::TaskEnqueue, &key);
        Ok(())
    }

    async fn enqueue_failed(
        &self,
        task_arc: &Arc<TracedRwLock<Task>>,
        key: &str,
        job_id: &str,
        err: HiveError,
    ) {
        let failures = {
            let mut task = task_arc.write("enqueue_failed").await;
            task.enqueue_failures += 1;
            task.enqueue_failures
        };
        if failures < self.config.max_enqueue_retries {
            tracing::warn!(task = %key, %err, failures, "task enqueue failed, will retry");
            return;
        }
        tracing::error!(task = %key, %err, "task enqueue failed repeatedly, suspending job");
        let job_err = JobError {
            task_failed: key.to_string(),
            server_notes: err.to_string(),
            status: JobState::Suspend.to_string(),
            ..JobError::default()
        };
        if let Err(err) = self.suspend_job(job_id, job_err, JobState::Suspend).await {
            tracing::error!(job_id, %err, "failed to suspend job");
        }
    }

    /// Resolve unresolved inputs from completed predecessors' outputs by
    /// `(origin, filename)`, refresh missing sizes from the blob store,
    /// and create any required input indexes.
    pub async fn validate_inputs(&self, task_arc: &Arc<TracedRwLock<Task>>) -> Result<()> {
        // read phase: collect resolutions without holding the write lock
        let (job_id, task_key, inputs) = {
            let task = task_arc.read("validate_inputs").await;
            (task.id.job_id.clone(), task.key(), task.inputs.clone())
        };

        let mut resolved = inputs;
        for io in &mut resolved {
            if !io.resolved() {
                if io.origin.is_empty() {
                    return Err(HiveError::Validation(format!(
                        "task {task_key}: input {} has no node and no origin",
                        io.file_name
                    )));
                }
                let pre_key = TaskId::new(&job_id, &io.origin).key();
                let pre = self.tasks.get(&pre_key).await.ok_or_else(|| {
                    HiveError::Validation(format!(
                        "task {task_key}: origin task {pre_key} not found"
                    ))
                })?;
                let pre = pre.read("validate_inputs").await;
                let out = pre.output(&io.file_name).ok_or_else(|| {
                    HiveError::Validation(format!(
                        "task {task_key}: origin task {pre_key} has no output {}",
                        io.file_name
                    ))
                })?;
                if !out.resolved() {
                    return Err(HiveError::Validation(format!(
                        "task {task_key}: origin output {} is unresolved",
                        io.file_name
                    )));
                }
                io.node = out.node.clone();
                io.host = out.host.clone();
                io.size = out.size;
            }

            if io.size == 0 {
                let (host, node) = (io.host.clone(), io.node.clone());
                let blobs = self.blobs.clone();
                let size = with_backoff(BACKOFF_ATTEMPTS, BACKOFF_BASE, || {
                    blobs.node_size(&host, &node)
                })
                .await?;
                io.size = size as i64;
            }
            if !io.index.is_empty() {
                self.blobs
                    .create_index(&io.host, &io.node, &io.index)
                    .await?;
            }
        }

        self.store
            .update_task_field(&job_id, &task_key, "inputs", serde_json::to_value(&resolved).map_err(crate::store::StoreError::from)?)
            .await?;
        let mut task = task_arc.write("validate_inputs").await;
        task.inputs = resolved;
        Ok(())
    }

    /// Refresh output sizes and indexes after a task completes.
    pub async fn validate_outputs(&self, task_arc: &Arc<TracedRwLock<Task>>) -> Result<()> {
        let (job_id, task_key, outputs) = {
            let task = task_arc.read("validate_outputs").await;
            (task.id.job_id.clone(), task.key(), task.outputs.clone())
        };
        let mut refreshed = outputs;
        for io in &mut refreshed {
            if !io.resolved() {
                continue;
            }
            if let Ok(size) = self.blobs.node_size(&io.host, &io.node).await {
                io.size = size as i64;
            }
            if !io.index.is_empty() {
                if let Err(err) = self.blobs.create_index(&io.host, &io.node, &io.index).await {
                    tracing::warn!(task = %task_key, node = %io.node, %err, "output index unavailable");
                }
            }
        }
        self.store
            .update_task_field(&job_id, &task_key, "outputs", serde_json::to_value(&refreshed).map_err(crate::store::StoreError::from)?)
            .await?;
        let mut task = task_arc.write("validate_outputs").await;
        task.outputs = refreshed;
        Ok(())
    }

    /// Create one blob-store node per output; multi-workunit tasks
    /// declare their part count on each node.
    async fn create_output_nodes(&self, task_arc: &Arc<TracedRwLock<Task>>) -> Result<()> {
        let (job_id, task_key, outputs, total_work) = {
            let task = task_arc.read("create_output_nodes").await;
            (
                task.id.job_id.clone(),
                task.key(),
                task.outputs.clone(),
                task.total_work,
            )
        };

        let mut outputs = outputs;
        for io in &mut outputs {
            if io.resolved() {
                continue;
            }
            let (host, token) = (io.host.clone(), io.data_token.clone());
            let blobs = self.blobs.clone();
            let node = with_backoff(BACKOFF_ATTEMPTS, BACKOFF_BASE, || {
                blobs.create_node(&host, &token)
            })
            .await?;
            if total_work > 1 {
                self.blobs.set_parts(&host, &node, total_work).await?;
            }
            tracing::debug!(task = %task_key, file = %io.file_name, node = %node, "output node created");
            io.node = node;
        }

        self.store
            .update_task_field(&job_id, &task_key, "outputs", serde_json::to_value(&outputs).map_err(crate::store::StoreError::from)?)
            .await?;
        let mut task = task_arc.write("create_output_nodes").await;
        task.outputs = outputs;
        Ok(())
    }

    /// Recompute `total_work` from the partition index. A failed index
    /// lookup degrades the task to a single workunit.
    async fn init_part_index(&self, task_arc: &Arc<TracedRwLock<Task>>) -> Result<()> {
        let snapshot = { task_arc.read("init_part_index").await.clone() };
        if snapshot.total_work == 1 && snapshot.max_work_size == 0 {
            return Ok(());
        }
        if snapshot.inputs.is_empty() {
            return self.set_single_workunit(task_arc).await;
        }

        let input = if snapshot.inputs.len() > 1 {
            let named = snapshot
                .partition
                .as_ref()
                .filter(|p| !p.input.is_empty())
                .and_then(|p| snapshot.inputs.iter().find(|io| io.file_name == p.input));
            match named {
                Some(io) => io.clone(),
                None => {
                    tracing::warn!(
                        task = %snapshot.key(),
                        "multiple inputs without partition info, degrading to a single workunit"
                    );
                    return self.set_single_workunit(task_arc).await;
                }
            }
        } else {
            snapshot.inputs[0].clone()
        };

        let index_name = snapshot
            .partition
            .as_ref()
            .filter(|p| !p.index.is_empty())
            .map(|p| p.index.clone())
            .unwrap_or_else(|| self.config.default_index.clone());

        let info = match self
            .blobs
            .create_index(&input.host, &input.node, &index_name)
            .await
        {
            Ok(info) => info,
            Err(err) => {
                tracing::warn!(
                    task = %snapshot.key(),
                    index = %index_name,
                    %err,
                    "index lookup failed, degrading to a single workunit"
                );
                return self.set_single_workunit(task_arc).await;
            }
        };

        let total_units = info.total_units.max(1);
        let mut total_work = snapshot.total_work;
        if snapshot.max_work_size > 0 {
            let need = (total_units * self.config.chunk_size_mb).div_ceil(snapshot.max_work_size);
            total_work = total_work.max(need.min(u64::from(u32::MAX)) as u32);
        }
        if total_units < u64::from(total_work) {
            total_work = total_units as u32;
        }

        if total_work <= 1 {
            return self.set_single_workunit(task_arc).await;
        }

        let partition = PartInfo {
            input: input.file_name,
            index: index_name,
            total_index: total_units,
            max_part_size_mb: snapshot.max_work_size,
        };
        let (job_id, task_key) = (snapshot.id.job_id.clone(), snapshot.key());
        self.store
            .update_task_field(&job_id, &task_key, "total_work", json!(total_work))
            .await?;
        self.store
            .update_task_field(&job_id, &task_key, "remain_work", json!(total_work))
            .await?;
        self.store
            .update_task_field(&job_id, &task_key, "partition", serde_json::to_value(&partition).map_err(crate::store::StoreError::from)?)
            .await?;
        let mut task = task_arc.write("init_part_index").await;
        task.total_work = total_work;
        task.remain_work = total_work;
        task.partition = Some(partition);
        Ok(())
    }

    async fn set_single_workunit(&self, task_arc: &Arc<TracedRwLock<Task>>) -> Result<()> {
        let (job_id, task_key) = {
            let task = task_arc.read("set_single_workunit").await;
            (task.id.job_id.clone(), task.key())
        };
        self.store
            .update_task_field(&job_id, &task_key, "total_work", json!(1))
            .await?;
        self.store
            .update_task_field(&job_id, &task_key, "remain_work", json!(1))
            .await?;
        self.store
            .update_task_field(&job_id, &task_key, "partition", json!(null))
            .await?;
        self.store
            .update_task_field(&job_id, &task_key, "max_work_size", json!(0))
            .await?;
        let mut task = task_arc.write("set_single_workunit").await;
        task.total_work = 1;
        task.remain_work = 1;
        task.partition = None;
        task.max_work_size = 0;
        Ok(())
    }

    /// Emit the task's workunits: rank 0 for a single-work task, ranks
    /// 1..N for a partitioned one.
    async fn materialize(&self, task_arc: &Arc<TracedRwLock<Task>>) -> Result<Vec<Workunit>> {
        // job info first; job locks are never taken under a task lock
        let (job_id, task_key) = {
            let task = task_arc.read("materialize").await;
            (task.id.job_id.clone(), task.key())
        };
        let job_arc = self
            .jobs
            .get(&job_id)
            .await
            .ok_or_else(|| HiveError::NotFound(format!("job {job_id} for task {task_key}")))?;
        let info = job_arc.read("materialize").await.info.clone();

        let task = task_arc.read("materialize").await;
        let mut out = Vec::new();
        if task.total_work == 1 {
            out.push(Workunit::from_task(&task, 0, &info));
        } else {
            for rank in 1..=task.total_work {
                out.push(Workunit::from_task(&task, rank, &info));
            }
        }
        Ok(out)
    }

    /// Wind a previously-run task back to a clean slate before it is
    /// re-enqueued: origin-resolved inputs are cleared for re-resolution
    /// and output nodes (except in-place updates) are deleted.
    pub async fn set_reset_task(&self, task_arc: &Arc<TracedRwLock<Task>>) -> Result<()> {
        let (job_id, task_key) = {
            let task = task_arc.read("set_reset_task").await;
            (task.id.job_id.clone(), task.key())
        };

        let mut task = task_arc.write("set_reset_task").await;

        self.store
            .update_task_field(&job_id, &task_key, "compute_time", json!(0))
            .await?;
        task.compute_time = 0;
        self.store
            .update_task_field(&job_id, &task_key, "completed_date", json!(null))
            .await?;
        task.completed_date = None;
        self.store
            .update_task_field(&job_id, &task_key, "remain_work", json!(task.total_work))
            .await?;
        task.remain_work = task.total_work;

        for io in &mut task.inputs {
            if !io.origin.is_empty() {
                io.clear_node();
            }
        }
        let inputs = serde_json::to_value(&task.inputs).map_err(crate::store::StoreError::from)?;
        self.store
            .update_task_field(&job_id, &task_key, "inputs", inputs)
            .await?;

        for io in &mut task.outputs {
            if io.update {
                continue;
            }
            if io.resolved() {
                if let Err(err) = self
                    .blobs
                    .delete_node(&io.host, &io.node, &io.data_token)
                    .await
                {
                    tracing::warn!(node = %io.node, %err, "failed to delete output node on reset");
                }
            }
            io.clear_node();
        }
        let outputs = serde_json::to_value(&task.outputs).map_err(crate::store::StoreError::from)?;
        self.store
            .update_task_field(&job_id, &task_key, "outputs", outputs)
            .await?;

        self.store
            .update_task_field(&job_id, &task_key, "reset_task", json!(false))
            .await?;
        task.reset_task = false;

        self.store
            .update_task_field(&job_id, &task_key, "state", json!(TaskState::Pending))
            .await?;
        task.state = TaskState::Pending;
        Ok(())
    }

    /// Flag a task for reset on its next enqueue (resume / recompute).
    pub async fn mark_reset(&self, task_arc: &Arc<TracedRwLock<Task>>) -> Result<()> {
        let (job_id, task_key, already) = {
            let task = task_arc.read("mark_reset").await;
            (task.id.job_id.clone(), task.key(), task.reset_task)
        };
        if already {
            return Ok(());
        }
        self.set_task_state(task_arc, TaskState::Pending).await?;
        self.store
            .update_task_field(&job_id, &task_key, "reset_task", json!(true))
            .await?;
        task_arc.write("mark_reset").await.reset_task = true;
        Ok(())
    }

    /// Task state transition with persist-then-update ordering and the
    /// job-level remain-tasks cascade. Completing the last task completes
    /// the job.
    pub async fn set_task_state(
        &self,
        task_arc: &Arc<TracedRwLock<Task>>,
        new_state: TaskState,
    ) -> Result<()> {
        let (job_id, task_key, old_state) = {
            let task = task_arc.read("set_task_state").await;
            (task.id.job_id.clone(), task.key(), task.state)
        };
        if old_state == new_state {
            return Ok(());
        }

        let job_arc = self.jobs.get(&job_id).await;

        // lock ordering: job before task
        match job_arc {
            Some(job_arc) => {
                let mut job = job_arc.write("set_task_state").await;
                let mut task = task_arc.write("set_task_state").await;
                if task.state == new_state {
                    return Ok(());
                }
                self.store
                    .update_task_field(&job_id, &task_key, "state", json!(new_state))
                    .await?;
                let old_state = task.state;
                task.state = new_state;

                if new_state == TaskState::InProgress && task.started_date.is_none() {
                    let now = Utc::now();
                    self.store
                        .update_task_field(&job_id, &task_key, "started_date", json!(now))
                        .await?;
                    task.started_date = Some(now);
                }

                if new_state == TaskState::Completed {
                    let now = Utc::now();
                    self.store
                        .update_task_field(&job_id, &task_key, "completed_date", json!(now))
                        .await?;
                    task.completed_date = Some(now);
                    drop(task);
                    event::emit(Event::TaskDone, &task_key);
                    self.adjust_remain_tasks(&mut job, -1).await?;
                    if job.remain_tasks == 0 {
                        self.complete_job(&mut job).await?;
                    }
                } else if old_state == TaskState::Completed {
                    self.store
                        .update_task_field(&job_id, &task_key, "completed_date", json!(null))
                        .await?;
                    task.completed_date = None;
                    drop(task);
                    self.adjust_remain_tasks(&mut job, 1).await?;
                }
            }
            None => {
                // job already deleted; keep the task record coherent
                let mut task = task_arc.write("set_task_state").await;
                task.state = new_state;
            }
        }
        Ok(())
    }

    async fn adjust_remain_tasks(
        &self,
        job: &mut crate::lock::TracedWriteGuard<'_, Job>,
        delta: i64,
    ) -> Result<()> {
        let next = i64::from(job.remain_tasks) + delta;
        if next < 0 {
            return Err(HiveError::Internal(format!(
                "job {} remain_tasks would go negative",
                job.id
            )));
        }
        self.store
            .update_job_field(&job.id, "remain_tasks", json!(next))
            .await?;
        job.remain_tasks = next as u32;
        Ok(())
    }

    async fn complete_job(
        &self,
        job: &mut crate::lock::TracedWriteGuard<'_, Job>,
    ) -> Result<()> {
        self.store
            .update_job_field(&job.id, "state", json!(JobState::Completed))
            .await?;
        job.state = JobState::Completed;
        let now = Utc::now();
        self.store
            .update_job_field(&job.id, "info.completed_time", json!(now))
            .await?;
        job.info.completed_time = Some(now);
        event::emit(Event::JobDone, &job.id);
        tracing::info!(job_id = %job.id, "job completed");
        Ok(())
    }

    /// Record finished work on a task: fold in the compute time and
    /// decrement `remain_work`, returning the remaining count.
    pub async fn finish_workunit(
        &self,
        task_arc: &Arc<TracedRwLock<Task>>,
        compute_time: u64,
    ) -> Result<u32> {
        let mut task = task_arc.write("finish_workunit").await;
        let (job_id, task_key) = (task.id.job_id.clone(), task.key());
        if task.remain_work == 0 {
            return Err(HiveError::Internal(format!(
                "task {task_key} remain_work would go negative"
            )));
        }
        let remain = task.remain_work - 1;
        self.store
            .update_task_field(&job_id, &task_key, "remain_work", json!(remain))
            .await?;
        task.remain_work = remain;
        if compute_time > 0 {
            let total = task.compute_time + compute_time;
            self.store
                .update_task_field(&job_id, &task_key, "compute_time", json!(total))
                .await?;
            task.compute_time = total;
        }
        Ok(remain)
    }

    /// Job state transition; `from` (when given) restricts the states the
    /// transition may leave. Leaving `suspend` clears the error record.
    pub async fn set_job_state(
        &self,
        job_arc: &Arc<TracedRwLock<Job>>,
        new_state: JobState,
        from: Option<&[JobState]>,
    ) -> Result<()> {
        let mut job = job_arc.write("set_job_state").await;
        if job.state == new_state {
            return Ok(());
        }
        if let Some(allowed) = from {
            if !allowed.contains(&job.state) {
                return Err(HiveError::Validation(format!(
                    "job {} cannot move from {} to {new_state}",
                    job.id, job.state
                )));
            }
        }
        self.store
            .update_job_field(&job.id, "state", json!(new_state))
            .await?;
        job.state = new_state;

        match new_state {
            JobState::Completed => {
                let now = Utc::now();
                self.store
                    .update_job_field(&job.id, "info.completed_time", json!(now))
                    .await?;
                job.info.completed_time = Some(now);
            }
            JobState::InProgress => {
                if job.info.started_time.is_none() {
                    let now = Utc::now();
                    self.store
                        .update_job_field(&job.id, "info.started_time", json!(now))
                        .await?;
                    job.info.started_time = Some(now);
                }
            }
            _ => {}
        }

        if new_state != JobState::Suspend
            && new_state != JobState::FailedPermanent
            && job.error.is_some()
        {
            self.store
                .update_job_field(&job.id, "error", json!(null))
                .await?;
            job.error = None;
        }
        Ok(())
    }

    /// Suspend (or permanently fail) a job: record the error, park its
    /// live tasks, and pull its workunits out of circulation. Checked-out
    /// workunits move to the suspended partition so their clients get a
    /// discard on the next heartbeat.
    pub async fn suspend_job(
        &self,
        job_id: &str,
        error: JobError,
        state: JobState,
    ) -> Result<()> {
        debug_assert!(matches!(state, JobState::Suspend | JobState::FailedPermanent));
        let job_arc = self
            .jobs
            .get(job_id)
            .await
            .ok_or_else(|| HiveError::NotFound(format!("job {job_id}")))?;

        let task_keys = {
            let mut job = job_arc.write("suspend_job").await;
            self.store
                .update_job_field(job_id, "error", serde_json::to_value(&error).map_err(crate::store::StoreError::from)?)
                .await?;
            job.error = Some(error);
            self.store
                .update_job_field(job_id, "state", json!(state))
                .await?;
            job.state = state;
            job.tasks.clone()
        };

        let task_state = if state == JobState::FailedPermanent {
            TaskState::FailedPermanent
        } else {
            TaskState::Suspend
        };
        for key in &task_keys {
            if let Some(task_arc) = self.tasks.get(key).await {
                let current = task_arc.read("suspend_job").await.state;
                if matches!(
                    current,
                    TaskState::Ready | TaskState::Queued | TaskState::InProgress
                ) {
                    if let Err(err) = self.set_task_state(&task_arc, task_state).await {
                        tracing::warn!(task = %key, %err, "failed to park task during job suspend");
                    }
                }
            }
        }

        for work in self.queue.get_all() {
            if work.id.job_id() != job_id {
                continue;
            }
            if matches!(work.state, WorkState::Queued | WorkState::CheckedOut) {
                let wid = work.id.to_string();
                if let Err(err) = self.queue.status_change(&wid, WorkState::Suspend) {
                    tracing::warn!(work = %wid, %err, "failed to suspend workunit");
                } else {
                    event::emit(Event::WorkSuspend, &wid);
                }
            }
        }

        event::emit(Event::JobSuspend, job_id);
        tracing::warn!(job_id, state = %state, "job suspended");
        Ok(())
    }

    /// Resume a suspended job: bump the resume counter, requeue its
    /// suspended workunits with fresh failure counters, and wake its
    /// parked tasks.
    pub async fn resume_job(&self, job_id: &str) -> Result<()> {
        let job_arc = self
            .jobs
            .get(job_id)
            .await
            .ok_or_else(|| HiveError::NotFound(format!("job {job_id}")))?;

        let task_keys = {
            let job = job_arc.read("resume_job").await;
            if job.state == JobState::FailedPermanent {
                return Err(HiveError::PermanentFailure(format!(
                    "job {job_id} cannot be resumed"
                )));
            }
            if job.state != JobState::Suspend {
                return Err(HiveError::Validation(format!(
                    "job {job_id} is not suspended"
                )));
            }
            job.tasks.clone()
        };

        {
            let mut job = job_arc.write("resume_job").await;
            let resumed = job.resumed + 1;
            self.store
                .update_job_field(job_id, "resumed", json!(resumed))
                .await?;
            job.resumed = resumed;
        }
        self.set_job_state(&job_arc, JobState::Queued, None).await?;

        for work in self.queue.get_all() {
            if work.id.job_id() != job_id || work.state != WorkState::Suspend {
                continue;
            }
            let wid = work.id.to_string();
            self.queue.reset_failures(&wid);
            if let Err(err) = self.queue.status_change(&wid, WorkState::Queued) {
                tracing::warn!(work = %wid, %err, "failed to requeue workunit on resume");
            } else {
                event::emit(Event::WorkRequeue, &wid);
            }
        }

        for key in &task_keys {
            if let Some(task_arc) = self.tasks.get(key).await {
                let state = task_arc.read("resume_job").await.state;
                if state != TaskState::Suspend {
                    continue;
                }
                let has_work = {
                    let task = task_arc.read("resume_job").await;
                    let prefix = format!("{}_", task.key());
                    self.queue.list().iter().any(|id| id.starts_with(&prefix))
                };
                let next = if has_work {
                    TaskState::Queued
                } else {
                    TaskState::Pending
                };
                if let Err(err) = self.set_task_state(&task_arc, next).await {
                    tracing::warn!(task = %key, %err, "failed to wake task on resume");
                }
                task_arc.write("resume_job").await.enqueue_failures = 0;
            }
        }

        event::emit(Event::JobResume, job_id);
        self.update_queue().await;
        Ok(())
    }

    /// Remove a job entirely. Waiting and suspended workunits disappear
    /// immediately; checked-out ones are left to finish and their late
    /// notices are dropped as unknown.
    pub async fn delete_job(&self, job_id: &str) -> Result<()> {
        let job_arc = self
            .jobs
            .remove(job_id)
            .await
            .ok_or_else(|| HiveError::NotFound(format!("job {job_id}")))?;

        let task_keys = {
            let mut job = job_arc.write("delete_job").await;
            job.state = JobState::Deleted;
            job.tasks.clone()
        };
        for key in &task_keys {
            self.tasks.remove(key).await;
        }
        for work in self.queue.get_all() {
            if work.id.job_id() == job_id {
                self.queue.delete(&work.id.to_string());
            }
        }
        self.store.delete_job(job_id).await?;
        event::emit(Event::JobDelete, job_id);
        Ok(())
    }

    /// Delete completed jobs whose expiration has passed.
    pub async fn expire_jobs(&self) {
        let now = Utc::now();
        for (job_id, job_arc) in self.jobs.entries().await {
            let expired = {
                let job = job_arc.read("expire_jobs").await;
                job.state == JobState::Completed
                    && job.expiration.map(|exp| exp < now).unwrap_or(false)
            };
            if !expired {
                continue;
            }
            event::emit(Event::JobExpire, &job_id);
            if let Err(err) = self.delete_job(&job_id).await {
                tracing::warn!(job_id = %job_id, %err, "failed to delete expired job");
            }
        }
    }

    /// Reload recoverable jobs from the document store after a restart.
    /// Tasks that were queued or running go back to `pending` with the
    /// reset flag so the ready-poll rebuilds the memory-only work queue.
    pub async fn recover(&self) -> Result<usize> {
        let docs = self.store.load_jobs(RECOVERABLE_STATES).await?;
        let mut count = 0;
        for mut doc in docs {
            let job_id = doc.job.id.clone();
            if self.jobs.contains(&job_id).await {
                continue;
            }
            if let Err(err) = doc.normalize(self.config.base_priority) {
                tracing::warn!(job_id = %job_id, %err, "skipping unrecoverable job document");
                continue;
            }
            for task in &mut doc.tasks {
                if matches!(task.state, TaskState::Queued | TaskState::InProgress) {
                    task.state = TaskState::Pending;
                    task.reset_task = true;
                }
            }
            self.store.upsert_job(&doc).await?;
            if let Err(err) = self.register_job(doc).await {
                tracing::warn!(job_id = %job_id, %err, "skipping unrecoverable job document");
                continue;
            }
            count += 1;
        }
        if count > 0 {
            self.update_queue().await;
        }
        Ok(count)
    }
}
