//! End-to-end scheduler lifecycle tests: submission, ready-polling,
//! checkout, feedback cascades, dependencies, priorities and partitioned
//! tasks.

mod harness;

use std::time::Duration;

use harness::{
    assert_eventually, job_with_priority, job_with_tasks, origin_input, output, resolved_input,
    task, work_id, TestHive,
};
use taskhive::error::HiveError;
use taskhive::model::{JobState, TaskState};
use taskhive::scheduler::{Notice, NoticeStatus, Policy};

fn done_notice(work: &taskhive::model::Workunit, client_id: &str, compute_time: u64) -> Notice {
    Notice {
        work_id: work.id.clone(),
        status: NoticeStatus::Done,
        client_id: client_id.to_string(),
        compute_time,
        notes: String::new(),
    }
}

/// Scenario: single task, single workunit, from submit to job completion.
#[tokio::test]
async fn test_single_task_lifecycle() {
    let hive = TestHive::start().await;

    let mut t1 = task("T1", "blastall");
    t1.inputs.push(resolved_input(&hive.blobs, "in.fa", 2048));
    t1.outputs.push(output("out.fa"));

    let job_id = hive.scheduler.submit(job_with_tasks(vec![t1])).await.unwrap();

    // the ready-poll ran inside submit: one workunit at rank 0 waiting
    let waiting = hive.scheduler.queue().wait_list();
    assert_eq!(waiting, vec![work_id(&job_id, "T1", 0)]);

    let job = hive.scheduler.get_job(&job_id).await.unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.remain_tasks, 1);

    // the task is queued and its inputs are all resolved
    let task_arc = hive
        .scheduler
        .tasks()
        .get(&format!("{job_id}_T1"))
        .await
        .unwrap();
    {
        let t = task_arc.read("test").await;
        assert_eq!(t.state, TaskState::Queued);
        assert!(t.inputs.iter().all(|io| io.resolved()));
        assert!(t.outputs.iter().all(|io| io.resolved()));
    }

    let client = hive.register_client("default", &["blastall"]).await;
    let works = hive
        .scheduler
        .checkout(&client.id, Policy::Fcfs, i64::MAX, 1)
        .await
        .unwrap();
    assert_eq!(works.len(), 1);
    assert_eq!(works[0].id.rank, 0);
    assert_eq!(works[0].client, client.id);

    // checkout is reflected in the client's current work and the task
    let held = hive.scheduler.client_manager().get(&client.id).await.unwrap();
    assert!(held.current_work.contains(&works[0].id.to_string()));
    assert_eq!(task_arc.read("test").await.state, TaskState::InProgress);
    assert_eq!(
        hive.scheduler.get_job(&job_id).await.unwrap().state,
        JobState::InProgress
    );

    hive.scheduler
        .notify(done_notice(&works[0], &client.id, 42))
        .await;

    let scheduler = hive.scheduler.clone();
    let jid = job_id.clone();
    assert_eventually(
        || {
            let scheduler = scheduler.clone();
            let jid = jid.clone();
            async move {
                scheduler
                    .get_job(&jid)
                    .await
                    .map(|j| j.state == JobState::Completed)
                    .unwrap_or(false)
            }
        },
        Duration::from_secs(3),
        "job should complete after the done notice",
    )
    .await;

    let job = hive.scheduler.get_job(&job_id).await.unwrap();
    assert_eq!(job.remain_tasks, 0);
    assert!(job.info.completed_time.is_some());

    let t = task_arc.read("test").await;
    assert_eq!(t.state, TaskState::Completed);
    assert_eq!(t.remain_work, 0);
    assert_eq!(t.compute_time, 42);
    drop(t);

    // the workunit left the queue and the client went idle
    assert!(hive.scheduler.queue().is_empty());
    let idle = hive.scheduler.client_manager().get(&client.id).await.unwrap();
    assert!(idle.current_work.is_empty());
}

/// Scenario: T2 consumes T1's output; it queues only after T1 completes,
/// with its input node populated from T1's output.
#[tokio::test]
async fn test_dependency_resolution() {
    let hive = TestHive::start().await;

    let mut t1 = task("T1", "filter");
    t1.inputs.push(resolved_input(&hive.blobs, "reads.fa", 512));
    t1.outputs.push(output("clean.fa"));
    let mut t2 = task("T2", "assemble");
    t2.inputs.push(origin_input("clean.fa", "T1"));

    let job_id = hive
        .scheduler
        .submit(job_with_tasks(vec![t1, t2]))
        .await
        .unwrap();

    // only T1 is queued initially
    assert_eq!(
        hive.scheduler.queue().wait_list(),
        vec![work_id(&job_id, "T1", 0)]
    );
    let t2_arc = hive
        .scheduler
        .tasks()
        .get(&format!("{job_id}_T2"))
        .await
        .unwrap();
    assert_eq!(t2_arc.read("test").await.state, TaskState::Pending);

    let client = hive
        .register_client("default", &["filter", "assemble"])
        .await;
    let works = hive
        .scheduler
        .checkout(&client.id, Policy::Fcfs, i64::MAX, 1)
        .await
        .unwrap();
    hive.scheduler
        .notify(done_notice(&works[0], &client.id, 1))
        .await;

    let scheduler = hive.scheduler.clone();
    let expected = work_id(&job_id, "T2", 0);
    assert_eventually(
        || {
            let scheduler = scheduler.clone();
            let expected = expected.clone();
            async move { scheduler.queue().wait_list().contains(&expected) }
        },
        Duration::from_secs(3),
        "T2 should queue once T1 completes",
    )
    .await;

    // T2's input now points at T1's output node
    let t1_arc = hive
        .scheduler
        .tasks()
        .get(&format!("{job_id}_T1"))
        .await
        .unwrap();
    let t1_node = t1_arc.read("test").await.outputs[0].node.clone();
    let t2 = t2_arc.read("test").await;
    assert_eq!(t2.state, TaskState::Queued);
    assert_eq!(t2.inputs[0].node, t1_node);
    assert!(t2.inputs[0].resolved());
}

/// Scenario: a higher-priority job's workunit wins the next checkout even
/// though it was enqueued later.
#[tokio::test]
async fn test_priority_wins_checkout() {
    let hive = TestHive::start().await;

    let mut low = task("T1", "app");
    low.inputs.push(resolved_input(&hive.blobs, "a.dat", 64));
    let low_id = hive
        .scheduler
        .submit(job_with_priority(vec![low], 1))
        .await
        .unwrap();

    let mut high = task("T1", "app");
    high.inputs.push(resolved_input(&hive.blobs, "b.dat", 64));
    let high_id = hive
        .scheduler
        .submit(job_with_priority(vec![high], 5))
        .await
        .unwrap();

    let client = hive.register_client("default", &["app"]).await;
    let works = hive
        .scheduler
        .checkout(&client.id, Policy::Fcfs, i64::MAX, 1)
        .await
        .unwrap();
    assert_eq!(works[0].id.to_string(), work_id(&high_id, "T1", 0));

    let works = hive
        .scheduler
        .checkout(&client.id, Policy::Fcfs, i64::MAX, 1)
        .await
        .unwrap();
    assert_eq!(works[0].id.to_string(), work_id(&low_id, "T1", 0));
}

/// Scenario: a task with total_work = 4 yields ranks 1..4 and the job
/// completes only after all four done notices.
#[tokio::test]
async fn test_partitioned_task() {
    let hive = TestHive::start().await;

    let input = resolved_input(&hive.blobs, "big.fa", 4_096);
    hive.blobs.insert_index(&input.node, "chunkrecord", 100, 41);

    let mut t1 = task("T1", "split");
    t1.total_work = 4;
    t1.inputs.push(input);
    t1.outputs.push(output("parts.fa"));

    let job_id = hive.scheduler.submit(job_with_tasks(vec![t1])).await.unwrap();

    let mut waiting = hive.scheduler.queue().wait_list();
    waiting.sort();
    let expected: Vec<String> = (1..=4).map(|r| work_id(&job_id, "T1", r)).collect();
    assert_eq!(waiting, expected);

    // the output node carries the declared part count
    let t1_arc = hive
        .scheduler
        .tasks()
        .get(&format!("{job_id}_T1"))
        .await
        .unwrap();
    let out_node = t1_arc.read("test").await.outputs[0].node.clone();
    assert_eq!(hive.blobs.parts(&out_node), Some(4));

    let client = hive.register_client("default", &["split"]).await;
    let works = hive
        .scheduler
        .checkout(&client.id, Policy::Fcfs, i64::MAX, 4)
        .await
        .unwrap();
    assert_eq!(works.len(), 4);

    for (i, work) in works.iter().enumerate() {
        hive.scheduler
            .feedback()
            .handle(done_notice(work, &client.id, 1))
            .await
            .unwrap();
        let job = hive.scheduler.get_job(&job_id).await.unwrap();
        if i < works.len() - 1 {
            assert_ne!(job.state, JobState::Completed, "completed too early");
        } else {
            assert_eq!(job.state, JobState::Completed);
        }
    }

    let t1_read = t1_arc.read("test").await;
    assert_eq!(t1_read.remain_work, 0);
    assert_eq!(t1_read.state, TaskState::Completed);
}

/// A failed partition-index lookup degrades the task to one workunit.
#[tokio::test]
async fn test_partition_index_fallback() {
    let hive = TestHive::start().await;

    // no index preloaded for this node
    let mut t1 = task("T1", "split");
    t1.total_work = 8;
    t1.inputs.push(resolved_input(&hive.blobs, "big.fa", 4_096));

    let job_id = hive.scheduler.submit(job_with_tasks(vec![t1])).await.unwrap();

    assert_eq!(
        hive.scheduler.queue().wait_list(),
        vec![work_id(&job_id, "T1", 0)]
    );
    let t1_arc = hive
        .scheduler
        .tasks()
        .get(&format!("{job_id}_T1"))
        .await
        .unwrap();
    let t = t1_arc.read("test").await;
    assert_eq!(t.total_work, 1);
    assert!(t.partition.is_none());
    assert_eq!(t.max_work_size, 0);
}

/// `max_work_size` grows the workunit count to fit the index.
#[tokio::test]
async fn test_partition_recompute_from_max_work_size() {
    let hive = TestHive::start().await;

    let input = resolved_input(&hive.blobs, "big.fa", 4_096);
    // 100 units * 1 MB chunks / 30 MB per part -> 4 workunits
    hive.blobs.insert_index(&input.node, "chunkrecord", 100, 41);

    let mut t1 = task("T1", "split");
    t1.total_work = 1;
    t1.max_work_size = 30;
    t1.inputs.push(input);

    let job_id = hive.scheduler.submit(job_with_tasks(vec![t1])).await.unwrap();
    assert_eq!(hive.scheduler.queue().wait_list().len(), 4);

    let t1_arc = hive
        .scheduler
        .tasks()
        .get(&format!("{job_id}_T1"))
        .await
        .unwrap();
    let t = t1_arc.read("test").await;
    assert_eq!(t.total_work, 4);
    assert_eq!(t.remain_work, 4);
    let part = t.partition.as_ref().expect("partition info");
    assert_eq!(part.total_index, 100);
    assert!(!hive.scheduler.queue().has(&work_id(&job_id, "T1", 0)));
}

#[tokio::test]
async fn test_submit_is_idempotent() {
    let hive = TestHive::start().await;

    let mut t1 = task("T1", "app");
    t1.inputs.push(resolved_input(&hive.blobs, "a.dat", 64));
    let mut doc = job_with_tasks(vec![t1]);
    doc.job.id = "11111111-2222-4333-8444-555555555555".to_string();

    let first = hive.scheduler.submit(doc.clone()).await.unwrap();
    let second = hive.scheduler.submit(doc).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(hive.scheduler.jobs().len().await, 1);
    assert_eq!(hive.scheduler.queue().len(), 1);
}

#[tokio::test]
async fn test_submit_rejects_bad_documents() {
    let hive = TestHive::start().await;

    // unknown dependency
    let mut t1 = task("T1", "app");
    t1.depends_on.push("T9".to_string());
    let err = hive
        .scheduler
        .submit(job_with_tasks(vec![t1]))
        .await
        .unwrap_err();
    assert!(matches!(err, HiveError::Validation(_)));

    // duplicate input filenames within a task
    let mut t1 = task("T1", "app");
    t1.inputs.push(resolved_input(&hive.blobs, "a.dat", 1));
    t1.inputs.push(resolved_input(&hive.blobs, "a.dat", 1));
    let err = hive
        .scheduler
        .submit(job_with_tasks(vec![t1]))
        .await
        .unwrap_err();
    assert!(matches!(err, HiveError::Validation(_)));

    // empty task list
    let err = hive
        .scheduler
        .submit(job_with_tasks(vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, HiveError::Validation(_)));
}

/// An unresolvable input suspends the job once the retry bound is hit.
#[tokio::test]
async fn test_repeated_enqueue_failure_suspends_job() {
    let hive = TestHive::start().await;

    let mut t1 = task("T1", "app");
    // no node and no origin: never resolvable
    t1.inputs.push(taskhive::model::IoFile::new("ghost.fa"));

    let job_id = hive.scheduler.submit(job_with_tasks(vec![t1])).await.unwrap();

    for _ in 0..hive.scheduler.config().max_enqueue_retries {
        hive.scheduler.task_manager().update_queue().await;
    }

    let job = hive.scheduler.get_job(&job_id).await.unwrap();
    assert_eq!(job.state, JobState::Suspend);
    let error = job.error.expect("suspended job carries an error record");
    assert_eq!(error.task_failed, format!("{job_id}_T1"));
    assert!(!error.server_notes.is_empty());
}

/// Queue suspension gates checkouts until resumed.
#[tokio::test]
async fn test_queue_suspend_and_resume() {
    let hive = TestHive::start().await;

    let mut t1 = task("T1", "app");
    t1.inputs.push(resolved_input(&hive.blobs, "a.dat", 64));
    hive.scheduler.submit(job_with_tasks(vec![t1])).await.unwrap();
    let client = hive.register_client("default", &["app"]).await;

    hive.scheduler.suspend_queue();
    let err = hive
        .scheduler
        .checkout(&client.id, Policy::Fcfs, i64::MAX, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, HiveError::QueueSuspend));

    hive.scheduler.resume_queue();
    let works = hive
        .scheduler
        .checkout(&client.id, Policy::Fcfs, i64::MAX, 1)
        .await
        .unwrap();
    assert_eq!(works.len(), 1);
}

/// Completed jobs past their expiration are swept away.
#[tokio::test]
async fn test_expiration_sweep() {
    let hive = TestHive::start().await;

    let mut t1 = task("T1", "app");
    t1.inputs.push(resolved_input(&hive.blobs, "a.dat", 64));
    let job_id = hive.scheduler.submit(job_with_tasks(vec![t1])).await.unwrap();

    let client = hive.register_client("default", &["app"]).await;
    let works = hive
        .scheduler
        .checkout(&client.id, Policy::Fcfs, i64::MAX, 1)
        .await
        .unwrap();
    hive.scheduler
        .feedback()
        .handle(done_notice(&works[0], &client.id, 1))
        .await
        .unwrap();
    assert_eq!(
        hive.scheduler.get_job(&job_id).await.unwrap().state,
        JobState::Completed
    );

    // not yet expired
    hive.scheduler
        .set_job_expiration(&job_id, "30M")
        .await
        .unwrap();
    hive.scheduler.task_manager().expire_jobs().await;
    assert!(hive.scheduler.get_job(&job_id).await.is_ok());

    // force the expiration into the past
    {
        let job_arc = hive.scheduler.jobs().get(&job_id).await.unwrap();
        job_arc.write("test").await.expiration =
            Some(chrono::Utc::now() - chrono::Duration::minutes(1));
    }
    hive.scheduler.task_manager().expire_jobs().await;
    assert!(matches!(
        hive.scheduler.get_job(&job_id).await.unwrap_err(),
        HiveError::NotFound(_)
    ));
    assert!(hive.store.job_document(&job_id).is_none());
}

#[tokio::test]
async fn test_expiration_format() {
    use taskhive::model::Job;
    assert!(Job::parse_expiration("30M").is_ok());
    assert!(Job::parse_expiration("2H").is_ok());
    assert!(Job::parse_expiration("7D").is_ok());
    assert!(Job::parse_expiration("7d").is_err());
    assert!(Job::parse_expiration("soon").is_err());
    assert!(Job::parse_expiration("-1H").is_err());
}

/// Deleting a job clears its waiting work; a late done notice for the
/// deleted workunit is dropped without effect.
#[tokio::test]
async fn test_delete_job_drops_late_notices() {
    let hive = TestHive::start().await;

    let mut t1 = task("T1", "app");
    t1.inputs.push(resolved_input(&hive.blobs, "a.dat", 64));
    let job_id = hive.scheduler.submit(job_with_tasks(vec![t1])).await.unwrap();

    let client = hive.register_client("default", &["app"]).await;
    let works = hive
        .scheduler
        .checkout(&client.id, Policy::Fcfs, i64::MAX, 1)
        .await
        .unwrap();

    hive.scheduler.delete_job(&job_id).await.unwrap();
    assert!(hive.scheduler.queue().is_empty());
    assert!(hive
        .scheduler
        .tasks()
        .get(&format!("{job_id}_T1"))
        .await
        .is_none());

    // the running worker reports in afterwards
    hive.scheduler
        .feedback()
        .handle(done_notice(&works[0], &client.id, 1))
        .await
        .unwrap();
    let c = hive.scheduler.client_manager().get(&client.id).await.unwrap();
    assert!(c.current_work.is_empty());
}

/// Restart recovery rebuilds the memory-only work queue from the store.
#[tokio::test]
async fn test_recovery_requeues_running_tasks() {
    let hive = TestHive::start().await;

    let mut t1 = task("T1", "app");
    t1.inputs.push(resolved_input(&hive.blobs, "a.dat", 64));
    let job_id = hive.scheduler.submit(job_with_tasks(vec![t1])).await.unwrap();
    let client = hive.register_client("default", &["app"]).await;
    hive.scheduler
        .checkout(&client.id, Policy::Fcfs, i64::MAX, 1)
        .await
        .unwrap();

    // a second scheduler over the same store: simulated restart
    let restarted = taskhive::scheduler::Scheduler::new(
        taskhive::config::SchedulerConfig::default(),
        hive.store.clone(),
        hive.blobs.clone(),
    );
    let recovered = restarted.recover().await.unwrap();
    assert_eq!(recovered, 1);

    // the checked-out workunit is gone; the task was reset and requeued
    assert_eq!(
        restarted.queue().wait_list(),
        vec![work_id(&job_id, "T1", 0)]
    );
    let job = restarted.get_job(&job_id).await.unwrap();
    assert!(job.state.is_active());
}
