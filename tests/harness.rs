//! Shared helpers for the scheduler integration tests: an in-memory
//! scheduler fixture, job/task builders and a polling assertion.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use taskhive::acl::Acl;
use taskhive::config::SchedulerConfig;
use taskhive::model::{
    Client, ClientProfile, Command, IoFile, Job, JobDocument, Task, TaskId, Workunit,
};
use taskhive::scheduler::Scheduler;
use taskhive::store::{BlobStore, DataStore, MemoryBlobStore, MemoryStore};

pub const BLOB_HOST: &str = "http://blob.local";

/// A scheduler wired to in-memory stores with its loops running.
pub struct TestHive {
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<MemoryStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub token: CancellationToken,
}

impl TestHive {
    pub async fn start() -> Self {
        Self::start_with(SchedulerConfig::default()).await
    }

    pub async fn start_with(config: SchedulerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let scheduler = Scheduler::new(
            config,
            store.clone() as Arc<dyn DataStore>,
            blobs.clone() as Arc<dyn BlobStore>,
        );
        let token = CancellationToken::new();
        scheduler.spawn(&token);
        Self {
            scheduler,
            store,
            blobs,
            token,
        }
    }

    pub async fn register_client(&self, group: &str, apps: &[&str]) -> Client {
        let profile = ClientProfile {
            id: None,
            name: format!("worker-{group}"),
            host: "10.0.0.1".to_string(),
            group: group.to_string(),
            apps: apps.iter().map(|a| a.to_string()).collect(),
            current_work: Vec::new(),
        };
        self.scheduler
            .register(profile, None)
            .await
            .expect("client registration failed")
    }
}

impl Drop for TestHive {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn assert_eventually<F, Fut>(mut cond: F, timeout: Duration, msg: &str)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met within {timeout:?}: {msg}");
}

pub fn task(name: &str, app: &str) -> Task {
    let mut task = Task::new(TaskId::new("", name));
    task.cmd = Command::new(app);
    task
}

/// Input already resolved to a preloaded blob node.
pub fn resolved_input(blobs: &MemoryBlobStore, file_name: &str, size: u64) -> IoFile {
    let node = blobs.insert_node(size);
    let mut io = IoFile::new(file_name);
    io.host = BLOB_HOST.to_string();
    io.node = node;
    io.size = size as i64;
    io
}

/// Input produced by a predecessor task; resolved at enqueue time.
pub fn origin_input(file_name: &str, origin: &str) -> IoFile {
    let mut io = IoFile::new(file_name);
    io.host = BLOB_HOST.to_string();
    io.origin = origin.to_string();
    io
}

/// Output whose node the scheduler creates at enqueue time.
pub fn output(file_name: &str) -> IoFile {
    let mut io = IoFile::new(file_name);
    io.host = BLOB_HOST.to_string();
    io
}

pub fn job_with_tasks(tasks: Vec<Task>) -> JobDocument {
    let mut job = Job::new();
    job.acl = Acl::owned_by("tester");
    JobDocument::new(job, tasks)
}

pub fn job_with_priority(tasks: Vec<Task>, priority: i32) -> JobDocument {
    let mut doc = job_with_tasks(tasks);
    doc.job.info.priority = priority;
    doc
}

pub fn work_id(job_id: &str, task_name: &str, rank: u32) -> String {
    format!("{job_id}_{task_name}_{rank}")
}

/// Standalone workunit for direct work-queue tests.
pub fn workunit(job_id: &str, task_name: &str, rank: u32, priority: i32, size: i64) -> Workunit {
    let mut t = Task::new(TaskId::new(job_id, task_name));
    t.cmd = Command::new("app");
    let mut info = taskhive::model::JobInfo::default();
    info.priority = priority;
    let mut work = Workunit::from_task(&t, rank, &info);
    work.size = size;
    work
}
