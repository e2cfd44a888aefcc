use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{HiveError, Result};
use crate::event::{self, Event};
use crate::model::{ClientStatus, JobState, TaskState, Workunit};
use crate::scheduler::client_manager::ClientMap;
use crate::scheduler::queue::{Policy, WorkQueue};
use crate::scheduler::task_manager::TaskManager;

/// One checkout, answered over its own oneshot channel.
pub struct CheckoutRequest {
    pub client_id: String,
    pub policy: Policy,
    pub available_bytes: i64,
    pub count: usize,
    pub reply: oneshot::Sender<Result<Vec<Workunit>>>,
}

/// Serializes checkout requests system-wide: a one-slot semaphore in
/// front of a single-consumer request loop, so at most one checkout
/// observes and mutates the queue at any instant. The semaphore is taken
/// before any client or queue lock.
#[derive(Clone)]
pub struct Dispatcher {
    tm: TaskManager,
    clients: Arc<ClientMap>,
    queue: Arc<WorkQueue>,
    checkout_sem: Arc<Semaphore>,
    queue_suspended: Arc<AtomicBool>,
    req_tx: mpsc::Sender<CheckoutRequest>,
}

impl Dispatcher {
    pub fn new(
        tm: TaskManager,
        clients: Arc<ClientMap>,
        queue: Arc<WorkQueue>,
        req_tx: mpsc::Sender<CheckoutRequest>,
    ) -> Self {
        Self {
            tm,
            clients,
            queue,
            checkout_sem: Arc::new(Semaphore::new(1)),
            queue_suspended: Arc::new(AtomicBool::new(false)),
            req_tx,
        }
    }

    pub fn suspend_queue(&self) {
        self.queue_suspended.store(true, Ordering::SeqCst);
        event::emit(Event::QueueSuspend, "work queue suspended");
    }

    pub fn resume_queue(&self) {
        self.queue_suspended.store(false, Ordering::SeqCst);
        event::emit(Event::QueueResume, "work queue resumed");
    }

    pub fn queue_suspended(&self) -> bool {
        self.queue_suspended.load(Ordering::SeqCst)
    }

    /// Check out up to `count` workunits for a client.
    ///
    /// The workunits appear in the client's current-work set before this
    /// returns, so a worker never sees a workunit absent from its set.
    pub async fn checkout(
        &self,
        client_id: &str,
        policy: Policy,
        available_bytes: i64,
        count: usize,
    ) -> Result<Vec<Workunit>> {
        if count == 0 {
            return Err(HiveError::Validation(
                "checkout count must be at least 1".to_string(),
            ));
        }

        let client_arc = self
            .clients
            .get(client_id)
            .await
            .ok_or_else(|| HiveError::ClientNotFound(client_id.to_string()))?;
        let status = { client_arc.read("checkout").await.status };
        match status {
            ClientStatus::Suspend => {
                return Err(HiveError::ClientSuspended(client_id.to_string()));
            }
            ClientStatus::Deleted => {
                self.clients.remove(client_id).await;
                return Err(HiveError::ClientDeleted(client_id.to_string()));
            }
            _ => {}
        }

        if self.queue_suspended() {
            return Err(HiveError::QueueSuspend);
        }

        let _permit = self
            .checkout_sem
            .acquire()
            .await
            .map_err(|_| HiveError::Internal("checkout semaphore closed".to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.req_tx
            .send(CheckoutRequest {
                client_id: client_id.to_string(),
                policy,
                available_bytes,
                count,
                reply: reply_tx,
            })
            .await
            .map_err(|_| HiveError::Internal("dispatcher loop is gone".to_string()))?;
        let works = reply_rx
            .await
            .map_err(|_| HiveError::Internal("dispatcher dropped the request".to_string()))??;

        {
            let mut client = client_arc.write("checkout").await;
            for work in &works {
                client.current_work.insert(work.id.to_string());
            }
            if client.status == ClientStatus::ActiveIdle {
                client.status = ClientStatus::ActiveBusy;
            }
        }
        Ok(works)
    }

    /// Single-consumer request loop; the only place workunits move from
    /// waiting to checked-out.
    pub async fn run(&self, mut req_rx: mpsc::Receiver<CheckoutRequest>, token: CancellationToken) {
        loop {
            tokio::select! {
                request = req_rx.recv() => {
                    let Some(request) = request else { break };
                    let result = self
                        .handle(
                            &request.client_id,
                            &request.policy,
                            request.available_bytes,
                            request.count,
                        )
                        .await;
                    let _ = request.reply.send(result);
                }
                _ = token.cancelled() => {
                    tracing::debug!("dispatcher loop shutting down");
                    break;
                }
            }
        }
    }

    async fn handle(
        &self,
        client_id: &str,
        policy: &Policy,
        available_bytes: i64,
        count: usize,
    ) -> Result<Vec<Workunit>> {
        let eligible = self.eligible_for(client_id).await?;
        if eligible.is_empty() {
            return Err(HiveError::NoEligibleWorkunitFound);
        }

        let works = self
            .queue
            .select_eligible(&eligible, policy, available_bytes, count)?;
        if works.is_empty() {
            return Err(HiveError::NoEligibleWorkunitFound);
        }

        let now = Utc::now();
        let mut out = Vec::with_capacity(works.len());
        for work in works {
            let work_id = work.id.to_string();
            let assigned = self.queue.assign(&work_id, client_id, now)?;
            event::emit(Event::WorkCheckout, &work_id);
            self.promote(&assigned).await;
            out.push(assigned);
        }
        Ok(out)
    }

    /// Waiting workunits this client may run: not in its skip-list,
    /// visible to its clientgroup, and with a command in its app set
    /// (or the wildcard).
    async fn eligible_for(&self, client_id: &str) -> Result<Vec<String>> {
        // the client passed the checkout precheck, so a missing entry
        // here means it disappeared while the request was queued
        let client_arc = self
            .clients
            .get(client_id)
            .await
            .ok_or_else(|| HiveError::ClientLost(client_id.to_string()))?;
        let client = { client_arc.read("eligible_for").await.clone() };

        let mut out = Vec::new();
        for id in self.queue.wait_list() {
            let Some(work) = self.queue.get_opt(&id) else {
                tracing::error!(work = %id, "workunit is in the wait list but not in the map");
                continue;
            };
            if client.skips(&id) {
                continue;
            }
            if !work.info.client_groups.is_empty() {
                let allowed = work
                    .info
                    .client_groups
                    .split(',')
                    .any(|g| g.trim() == client.group);
                if !allowed {
                    continue;
                }
            }
            if !client.supports(&work.cmd.name) {
                continue;
            }
            out.push(id);
        }
        Ok(out)
    }

    /// First checkout moves the task (and its job) to in-progress.
    async fn promote(&self, work: &Workunit) {
        let task_key = work.id.task_key();
        if let Some(task_arc) = self.tm.tasks().get(&task_key).await {
            let state = task_arc.read("promote").await.state;
            if state == TaskState::Queued {
                if let Err(err) = self.tm.set_task_state(&task_arc, TaskState::InProgress).await {
                    tracing::warn!(task = %task_key, %err, "failed to mark task in-progress");
                }
            }
        }
        if let Some(job_arc) = self.tm.jobs().get(work.id.job_id()).await {
            let promotable = {
                let job = job_arc.read("promote").await;
                matches!(job.state, JobState::Queuing | JobState::Queued)
            };
            if promotable {
                if let Err(err) = self
                    .tm
                    .set_job_state(&job_arc, JobState::InProgress, None)
                    .await
                {
                    tracing::warn!(job_id = %work.id.job_id(), %err, "failed to mark job in-progress");
                }
            }
        }
    }
}
