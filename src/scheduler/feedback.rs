use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::{HiveError, Result};
use crate::event::{self, Event};
use crate::model::{ClientStatus, JobError, JobState, TaskState, WorkState, WorkunitId};
use crate::scheduler::client_manager::ClientMap;
use crate::scheduler::queue::WorkQueue;
use crate::scheduler::task_manager::TaskManager;

/// Exit code a workload uses to signal an unretryable failure.
pub const EXIT_FAILED_PERMANENT: i32 = 42;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoticeStatus {
    Done,
    Failed,
    FailedPermanent,
    /// A client reported a workunit the scheduler never assigned to it.
    Missing,
}

impl FromStr for NoticeStatus {
    type Err = HiveError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "done" => Ok(NoticeStatus::Done),
            "failed" => Ok(NoticeStatus::Failed),
            "failed-permanent" => Ok(NoticeStatus::FailedPermanent),
            "missing" => Ok(NoticeStatus::Missing),
            _ => Err(HiveError::Validation(format!("unknown notice status: {s}"))),
        }
    }
}

/// Execution feedback from a worker about one workunit. Fire-and-forget;
/// delivered over the single feedback channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    pub work_id: WorkunitId,
    pub status: NoticeStatus,
    pub client_id: String,
    #[serde(default)]
    pub compute_time: u64,
    #[serde(default)]
    pub notes: String,
}

/// Single consumer of the notice channel. Notices are applied strictly
/// in arrival order; that is the only cross-notice ordering guarantee.
#[derive(Clone)]
pub struct FeedbackProcessor {
    config: Arc<SchedulerConfig>,
    tm: TaskManager,
    queue: Arc<WorkQueue>,
    clients: Arc<ClientMap>,
}

impl FeedbackProcessor {
    pub fn new(
        config: Arc<SchedulerConfig>,
        tm: TaskManager,
        queue: Arc<WorkQueue>,
        clients: Arc<ClientMap>,
    ) -> Self {
        Self {
            config,
            tm,
            queue,
            clients,
        }
    }

    pub async fn run(&self, mut rx: mpsc::Receiver<Notice>, token: CancellationToken) {
        loop {
            tokio::select! {
                notice = rx.recv() => {
                    let Some(notice) = notice else { break };
                    if let Err(err) = self.handle(notice).await {
                        tracing::error!(%err, "failed to apply work notice");
                    }
                }
                _ = token.cancelled() => {
                    tracing::debug!("feedback loop shutting down");
                    break;
                }
            }
        }
    }

    /// Apply one notice.
    pub async fn handle(&self, notice: Notice) -> Result<()> {
        let work_id = notice.work_id.to_string();
        tracing::debug!(
            work = %work_id,
            status = ?notice.status,
            client_id = %notice.client_id,
            "work notice received"
        );

        match notice.status {
            NoticeStatus::Done => self.work_done(&notice).await,
            NoticeStatus::Failed => self.work_failed(&notice).await,
            NoticeStatus::FailedPermanent => self.work_failed_permanent(&notice).await,
            NoticeStatus::Missing => {
                self.drop_from_client(&notice.client_id, &work_id).await;
                Ok(())
            }
        }
    }

    async fn work_done(&self, notice: &Notice) -> Result<()> {
        let work_id = notice.work_id.to_string();
        if self.queue.get_opt(&work_id).is_none() {
            // job deleted while the worker was running
            tracing::debug!(work = %work_id, "done notice for an unknown workunit, dropping");
            self.drop_from_client(&notice.client_id, &work_id).await;
            return Ok(());
        }

        self.queue.delete(&work_id);
        event::emit(Event::WorkDone, &work_id);

        let task_key = notice.work_id.task_key();
        if let Some(task_arc) = self.tm.tasks().get(&task_key).await {
            let remain = self
                .tm
                .finish_workunit(&task_arc, notice.compute_time)
                .await?;
            if remain == 0 {
                if let Err(err) = self.tm.validate_outputs(&task_arc).await {
                    tracing::warn!(task = %task_key, %err, "output validation failed");
                }
                self.tm.set_task_state(&task_arc, TaskState::Completed).await?;
                // release dependents
                self.tm.update_queue().await;
            }
        } else {
            tracing::warn!(task = %task_key, "done notice for an unknown task");
        }

        self.drop_from_client(&notice.client_id, &work_id).await;
        Ok(())
    }

    /// Execution failure: below the retry threshold the workunit goes
    /// back to waiting and the failing client is skip-listed for it; at
    /// the threshold the workunit, its task and its job are suspended.
    async fn work_failed(&self, notice: &Notice) -> Result<()> {
        let work_id = notice.work_id.to_string();
        let failures = match self.queue.record_failure(&work_id) {
            Ok(failures) => failures,
            Err(HiveError::NotFound(_)) => {
                tracing::debug!(work = %work_id, "failed notice for an unknown workunit, dropping");
                self.drop_from_client(&notice.client_id, &work_id).await;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        self.drop_from_client(&notice.client_id, &work_id).await;
        event::emit(Event::WorkFail, &work_id);

        if failures < self.config.max_work_failure {
            if let Some(client_arc) = self.clients.get(&notice.client_id).await {
                client_arc
                    .write("work_failed")
                    .await
                    .skip_work
                    .insert(work_id.clone());
            }
            self.queue.status_change(&work_id, WorkState::Queued)?;
            event::emit(Event::WorkRequeue, &work_id);
            tracing::info!(
                work = %work_id,
                client_id = %notice.client_id,
                failures,
                "workunit failed, requeued with the client skip-listed"
            );
            return Ok(());
        }

        self.queue.status_change(&work_id, WorkState::Suspend)?;
        event::emit(Event::WorkSuspend, &work_id);
        let failure = HiveError::WorkFailed(work_id.clone());
        tracing::warn!(
            %failure,
            kind = ?failure.kind(),
            failures,
            "failure threshold reached, suspending the job"
        );
        let task_key = notice.work_id.task_key();
        if let Some(task_arc) = self.tm.tasks().get(&task_key).await {
            self.tm.set_task_state(&task_arc, TaskState::Suspend).await?;
        }
        let error = JobError {
            client_failed: notice.client_id.clone(),
            work_failed: work_id.clone(),
            task_failed: task_key,
            work_notes: notice.notes.clone(),
            status: JobState::Suspend.to_string(),
            ..JobError::default()
        };
        self.tm
            .suspend_job(notice.work_id.job_id(), error, JobState::Suspend)
            .await
    }

    /// Exit code 42: the workload declared itself unrunnable. No retry.
    async fn work_failed_permanent(&self, notice: &Notice) -> Result<()> {
        let work_id = notice.work_id.to_string();
        self.drop_from_client(&notice.client_id, &work_id).await;
        if self.queue.has(&work_id) {
            self.queue.status_change(&work_id, WorkState::Suspend)?;
        }
        event::emit(Event::WorkSuspend, &work_id);
        let failure = HiveError::PermanentFailure(work_id.clone());
        tracing::error!(
            %failure,
            kind = ?failure.kind(),
            client_id = %notice.client_id,
            "workload signalled an unretryable failure"
        );

        let task_key = notice.work_id.task_key();
        if let Some(task_arc) = self.tm.tasks().get(&task_key).await {
            self.tm
                .set_task_state(&task_arc, TaskState::FailedPermanent)
                .await?;
        }
        let error = JobError {
            client_failed: notice.client_id.clone(),
            work_failed: work_id,
            task_failed: task_key,
            work_notes: notice.notes.clone(),
            app_error: format!("exit code {EXIT_FAILED_PERMANENT}"),
            status: JobState::FailedPermanent.to_string(),
            ..JobError::default()
        };
        self.tm
            .suspend_job(notice.work_id.job_id(), error, JobState::FailedPermanent)
            .await
    }

    /// Remove a workunit from a client's current-work set, demoting the
    /// client to idle when the set empties.
    async fn drop_from_client(&self, client_id: &str, work_id: &str) {
        let Some(client_arc) = self.clients.get(client_id).await else {
            return;
        };
        let mut client = client_arc.write("drop_from_client").await;
        client.current_work.remove(work_id);
        if client.current_work.is_empty() && client.status == ClientStatus::ActiveBusy {
            client.status = ClientStatus::ActiveIdle;
        }
    }
}
