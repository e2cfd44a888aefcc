//! The scheduler core: work queue, task manager, client manager,
//! dispatcher, feedback processor and their tickers, aggregated behind
//! one explicitly constructed [`Scheduler`] value.

pub mod client_manager;
pub mod dispatcher;
pub mod feedback;
pub mod queue;
pub mod task_manager;
mod timers;

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::acl::User;
use crate::config::SchedulerConfig;
use crate::error::{HiveError, Result};
use crate::event::{self, Event};
use crate::model::{
    Client, ClientGroup, ClientProfile, Job, JobDocument, JobError, JobState, WorkState, Workunit,
};
use crate::store::{BlobStore, DataStore};

pub use client_manager::{ClientManager, ClientMap, HeartbeatReply};
pub use dispatcher::{CheckoutRequest, Dispatcher};
pub use feedback::{FeedbackProcessor, Notice, NoticeStatus, EXIT_FAILED_PERMANENT};
pub use queue::{Policy, WorkQueue};
pub use task_manager::{JobMap, TaskManager, TaskMap};

const CHECKOUT_CHANNEL_CAPACITY: usize = 64;
const NOTICE_CHANNEL_CAPACITY: usize = 1024;

/// The scheduler. Owns every in-memory map, the work queue and the
/// request channels; request handlers hold an `Arc` and call the methods
/// below. There is no process-wide singleton.
pub struct Scheduler {
    config: Arc<SchedulerConfig>,
    queue: Arc<WorkQueue>,
    tm: TaskManager,
    cm: ClientManager,
    dsp: Dispatcher,
    fp: FeedbackProcessor,
    notice_tx: mpsc::Sender<Notice>,
    checkout_rx: StdMutex<Option<mpsc::Receiver<CheckoutRequest>>>,
    notice_rx: StdMutex<Option<mpsc::Receiver<Notice>>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn DataStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let jobs = Arc::new(JobMap::new());
        let tasks = Arc::new(TaskMap::new());
        let clients = Arc::new(ClientMap::new());
        let queue = Arc::new(WorkQueue::new());

        let tm = TaskManager::new(
            config.clone(),
            jobs.clone(),
            tasks.clone(),
            queue.clone(),
            store.clone(),
            blobs,
        );
        let cm = ClientManager::new(
            config.clone(),
            clients.clone(),
            queue.clone(),
            jobs.clone(),
            store.clone(),
        );

        let (checkout_tx, checkout_rx) = mpsc::channel(CHECKOUT_CHANNEL_CAPACITY);
        let (notice_tx, notice_rx) = mpsc::channel(NOTICE_CHANNEL_CAPACITY);

        let dsp = Dispatcher::new(tm.clone(), clients.clone(), queue.clone(), checkout_tx);
        let fp = FeedbackProcessor::new(config.clone(), tm.clone(), queue.clone(), clients);

        Arc::new(Self {
            config,
            queue,
            tm,
            cm,
            dsp,
            fp,
            notice_tx,
            checkout_rx: StdMutex::new(Some(checkout_rx)),
            notice_rx: StdMutex::new(Some(notice_rx)),
        })
    }

    /// Spawn the dispatcher loop, the feedback loop and the three
    /// tickers. Call once; every loop drains when `token` is cancelled.
    pub fn spawn(self: &Arc<Self>, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        let checkout_rx = self
            .checkout_rx
            .lock()
            .unwrap()
            .take()
            .expect("scheduler loops already spawned");
        let notice_rx = self
            .notice_rx
            .lock()
            .unwrap()
            .take()
            .expect("scheduler loops already spawned");

        let mut handles = Vec::new();

        let dsp = self.dsp.clone();
        let dsp_token = token.clone();
        handles.push(tokio::spawn(async move {
            dsp.run(checkout_rx, dsp_token).await;
        }));

        let fp = self.fp.clone();
        let fp_token = token.clone();
        handles.push(tokio::spawn(async move {
            fp.run(notice_rx, fp_token).await;
        }));

        handles.push(timers::spawn_queue_tick(
            self.tm.clone(),
            self.config.queue_tick,
            token.clone(),
        ));
        handles.push(timers::spawn_client_tick(
            self.cm.clone(),
            self.config.client_tick,
            token.clone(),
        ));
        handles.push(timers::spawn_expiration_tick(
            self.tm.clone(),
            self.config.expiration_tick,
            token.clone(),
        ));
        handles
    }

    pub fn config(&self) -> &Arc<SchedulerConfig> {
        &self.config
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn task_manager(&self) -> &TaskManager {
        &self.tm
    }

    pub fn client_manager(&self) -> &ClientManager {
        &self.cm
    }

    pub fn feedback(&self) -> &FeedbackProcessor {
        &self.fp
    }

    pub fn jobs(&self) -> &Arc<JobMap> {
        self.tm.jobs()
    }

    pub fn tasks(&self) -> &Arc<TaskMap> {
        self.tm.tasks()
    }

    // ---- external interface ----

    /// Submit a job document. Idempotent on retry with the same supplied
    /// id. The job's ready tasks are queued before this returns.
    pub async fn submit(&self, mut doc: JobDocument) -> Result<String> {
        if !doc.job.id.is_empty() && self.jobs().contains(&doc.job.id).await {
            return Ok(doc.job.id);
        }
        doc.normalize(self.config.base_priority)?;
        let job_id = doc.job.id.clone();
        let fresh = doc.job.state == JobState::Init;

        self.tm.store().upsert_job(&doc).await?;
        let job_arc = match self.tm.register_job(doc).await {
            Ok(job_arc) => job_arc,
            Err(err) => {
                // do not leave an unregistrable document behind
                let _ = self.tm.store().delete_job(&job_id).await;
                return Err(err);
            }
        };
        if fresh {
            self.tm
                .set_job_state(&job_arc, JobState::Queuing, None)
                .await?;
            self.tm
                .set_job_state(&job_arc, JobState::Queued, None)
                .await?;
        }
        event::emit(Event::JobSubmit, &job_id);
        tracing::info!(job_id = %job_id, "job submitted");

        self.tm.update_queue().await;
        Ok(job_id)
    }

    /// Check out up to `count` workunits for a registered client.
    pub async fn checkout(
        &self,
        client_id: &str,
        policy: Policy,
        available_bytes: i64,
        count: usize,
    ) -> Result<Vec<Workunit>> {
        self.dsp
            .checkout(client_id, policy, available_bytes, count)
            .await
    }

    pub async fn register(
        &self,
        profile: ClientProfile,
        group: Option<&ClientGroup>,
    ) -> Result<Client> {
        self.cm.register(profile, group).await
    }

    pub async fn heartbeat(
        &self,
        client_id: &str,
        group: Option<&ClientGroup>,
    ) -> Result<HeartbeatReply> {
        self.cm.heartbeat(client_id, group).await
    }

    /// Deliver an execution notice to the feedback loop. Fire-and-forget:
    /// a full channel is an error only to the logs.
    pub async fn notify(&self, notice: Notice) {
        if self.notice_tx.send(notice).await.is_err() {
            tracing::error!("feedback loop is gone, notice dropped");
        }
    }

    /// Reload recoverable jobs from the document store after a restart.
    pub async fn recover(&self) -> Result<usize> {
        self.tm.recover().await
    }

    // ---- admin interface ----

    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        let job_arc = self
            .jobs()
            .get(job_id)
            .await
            .ok_or_else(|| HiveError::NotFound(format!("job {job_id}")))?;
        let job = job_arc.read("get_job").await;
        Ok(job.clone())
    }

    pub async fn suspend_job(&self, job_id: &str, notes: &str) -> Result<()> {
        let error = JobError {
            server_notes: notes.to_string(),
            status: JobState::Suspend.to_string(),
            ..JobError::default()
        };
        self.tm.suspend_job(job_id, error, JobState::Suspend).await
    }

    pub async fn resume_job(&self, job_id: &str) -> Result<()> {
        self.tm.resume_job(job_id).await
    }

    pub async fn delete_job(&self, job_id: &str) -> Result<()> {
        self.tm.delete_job(job_id).await
    }

    pub async fn delete_job_by_user(&self, job_id: &str, user: &User) -> Result<()> {
        let job_arc = self
            .jobs()
            .get(job_id)
            .await
            .ok_or_else(|| HiveError::NotFound(format!("job {job_id}")))?;
        {
            let job = job_arc.read("delete_job_by_user").await;
            let rights = job.acl.check(&user.uuid);
            if !(user.admin || job.acl.owner == user.uuid || rights.delete) {
                return Err(HiveError::Unauthorized);
            }
        }
        self.tm.delete_job(job_id).await
    }

    /// Return a parked workunit to the waiting partition.
    pub async fn requeue_work(&self, work_id: &str) -> Result<()> {
        let work = self.queue.get(work_id)?;
        if work.state == WorkState::Queued {
            return Ok(());
        }
        self.queue.status_change(work_id, WorkState::Queued)?;
        event::emit(Event::WorkRequeue, work_id);
        Ok(())
    }

    pub fn suspend_queue(&self) {
        self.dsp.suspend_queue();
    }

    pub fn resume_queue(&self) {
        self.dsp.resume_queue();
    }

    pub fn queue_suspended(&self) -> bool {
        self.dsp.queue_suspended()
    }

    pub async fn suspend_client(&self, client_id: &str, user: &User) -> Result<()> {
        self.cm.suspend_client_by_user(client_id, user).await
    }

    pub async fn resume_client(&self, client_id: &str, user: &User) -> Result<()> {
        self.cm.resume_client_by_user(client_id, user).await
    }

    pub async fn delete_client(&self, client_id: &str, user: &User) -> Result<()> {
        self.cm.delete_client_by_user(client_id, user).await
    }

    /// Jobs visible to `user`: owned, readable through the ACL, or all
    /// for admins.
    pub async fn list_jobs(&self, user: &User) -> Vec<Job> {
        let mut out = Vec::new();
        for (_, job_arc) in self.jobs().entries().await {
            let job = job_arc.read("list_jobs").await;
            if job.acl.readable_by(user) {
                out.push(job.clone());
            }
        }
        out.sort_by_key(|job| job.info.submit_time);
        out
    }

    /// Workunits in `state` (all states when `None`) on jobs `user` may
    /// read.
    pub async fn list_workunits(&self, state: Option<WorkState>, user: &User) -> Vec<Workunit> {
        let mut out = Vec::new();
        for work in self.queue.get_all() {
            if let Some(wanted) = state {
                if work.state != wanted {
                    continue;
                }
            }
            if !user.admin {
                let readable = match self.jobs().get(work.id.job_id()).await {
                    Some(job_arc) => job_arc.read("list_workunits").await.acl.readable_by(user),
                    None => false,
                };
                if !readable {
                    continue;
                }
            }
            out.push(work);
        }
        out
    }

    pub async fn list_clients(&self, user: &User) -> Result<Vec<Client>> {
        self.cm.list_by_user(user).await
    }

    pub async fn set_job_priority(&self, job_id: &str, priority: i32) -> Result<()> {
        let job_arc = self
            .jobs()
            .get(job_id)
            .await
            .ok_or_else(|| HiveError::NotFound(format!("job {job_id}")))?;
        let mut job = job_arc.write("set_job_priority").await;
        self.tm
            .store()
            .update_job_field(job_id, "info.priority", json!(priority))
            .await?;
        job.info.priority = priority;
        Ok(())
    }

    pub async fn set_job_clientgroups(&self, job_id: &str, groups: &str) -> Result<()> {
        let job_arc = self
            .jobs()
            .get(job_id)
            .await
            .ok_or_else(|| HiveError::NotFound(format!("job {job_id}")))?;
        let mut job = job_arc.write("set_job_clientgroups").await;
        self.tm
            .store()
            .update_job_field(job_id, "info.client_groups", json!(groups))
            .await?;
        job.info.client_groups = groups.to_string();
        Ok(())
    }

    /// Set a job's expiration from a `<n>M|H|D` suffix string.
    pub async fn set_job_expiration(&self, job_id: &str, expire: &str) -> Result<()> {
        let when = Job::parse_expiration(expire)?;
        let job_arc = self
            .jobs()
            .get(job_id)
            .await
            .ok_or_else(|| HiveError::NotFound(format!("job {job_id}")))?;
        let mut job = job_arc.write("set_job_expiration").await;
        self.tm
            .store()
            .update_job_field(job_id, "expiration", json!(when))
            .await?;
        job.expiration = Some(when);
        Ok(())
    }

    /// Update a job's data token and re-stamp its tasks' IO descriptors.
    pub async fn set_job_data_token(&self, job_id: &str, token: &str) -> Result<()> {
        let job_arc = self
            .jobs()
            .get(job_id)
            .await
            .ok_or_else(|| HiveError::NotFound(format!("job {job_id}")))?;
        let task_keys = {
            let mut job = job_arc.write("set_job_data_token").await;
            self.tm
                .store()
                .update_job_field(job_id, "info.data_token", json!(token))
                .await?;
            job.info.data_token = token.to_string();
            if !job.info.auth {
                self.tm
                    .store()
                    .update_job_field(job_id, "info.auth", json!(true))
                    .await?;
                job.info.auth = true;
            }
            job.tasks.clone()
        };
        for key in task_keys {
            if let Some(task_arc) = self.tasks().get(&key).await {
                let mut guard = task_arc.write("set_job_data_token").await;
                let task = &mut *guard;
                for io in task
                    .inputs
                    .iter_mut()
                    .chain(task.outputs.iter_mut())
                    .chain(task.predata.iter_mut())
                {
                    io.data_token = token.to_string();
                }
            }
        }
        Ok(())
    }

    /// Queue-side view of one timestamped moment, for diagnostics.
    pub async fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            at: Utc::now(),
            jobs: self.jobs().len().await,
            tasks: self.tasks().len().await,
            clients: self.cm.clients().len().await,
            work_waiting: self.queue.wait_list().len(),
            work_checked_out: self.queue.checkout_list().len(),
            work_suspended: self.queue.suspend_list().len(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStats {
    pub at: chrono::DateTime<Utc>,
    pub jobs: usize,
    pub tasks: usize,
    pub clients: usize,
    pub work_waiting: usize,
    pub work_checked_out: usize,
    pub work_suspended: usize,
}
