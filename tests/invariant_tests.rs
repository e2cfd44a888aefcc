//! Cross-component invariant checks, driven over a small two-job
//! workload with interleaved checkouts, failures and completions.

mod harness;

use std::collections::HashSet;

use harness::{job_with_tasks, origin_input, output, resolved_input, task, TestHive};
use taskhive::model::{TaskState, WorkState};
use taskhive::scheduler::{Notice, NoticeStatus, Policy};

/// Assert the partition and accounting invariants of the scheduler.
async fn check_invariants(hive: &TestHive) {
    let queue = hive.scheduler.queue();

    // every known workunit lives in exactly one partition
    let waiting: HashSet<String> = queue.wait_list().into_iter().collect();
    let checked_out: HashSet<String> = queue.checkout_list().into_iter().collect();
    let suspended: HashSet<String> = queue.suspend_list().into_iter().collect();
    assert!(waiting.is_disjoint(&checked_out));
    assert!(waiting.is_disjoint(&suspended));
    assert!(checked_out.is_disjoint(&suspended));
    assert_eq!(
        waiting.len() + checked_out.len() + suspended.len(),
        queue.len()
    );

    // the sum of client current-work sets equals the checked-out partition
    let mut held: HashSet<String> = HashSet::new();
    for (_, client_arc) in hive.scheduler.client_manager().clients().entries().await {
        let client = client_arc.read("invariants").await;
        for id in &client.current_work {
            assert!(
                held.insert(id.clone()),
                "workunit {id} held by two clients"
            );
            let work = queue.get(id).expect("held workunit is known to the queue");
            assert_eq!(work.client, client.id);
        }
    }
    let held_checked_out: HashSet<String> = held
        .iter()
        .filter(|id| checked_out.contains(*id))
        .cloned()
        .collect();
    assert_eq!(held_checked_out, checked_out);

    // per-job and per-task accounting
    for (job_id, job_arc) in hive.scheduler.jobs().entries().await {
        let job = job_arc.read("invariants").await;
        let mut not_completed = 0u32;
        for key in &job.tasks {
            let Some(task_arc) = hive.scheduler.tasks().get(key).await else {
                continue;
            };
            let task = task_arc.read("invariants").await;
            assert!(
                task.remain_work <= task.total_work,
                "task {key} remain_work out of bounds"
            );
            assert_eq!(
                task.remain_work == 0,
                task.state == TaskState::Completed,
                "task {key}: remain_work and state disagree"
            );
            if task.state != TaskState::Completed {
                not_completed += 1;
            }
            // a queued task has fully resolved inputs
            if matches!(
                task.state,
                TaskState::Queued | TaskState::InProgress | TaskState::Completed
            ) {
                assert!(
                    task.inputs.iter().all(|io| io.resolved()),
                    "task {key} queued with unresolved input"
                );
            }
        }
        assert_eq!(
            job.remain_tasks, not_completed,
            "job {job_id} remain_tasks drifted"
        );
    }
}

#[tokio::test]
async fn test_invariants_across_lifecycle() {
    let hive = TestHive::start().await;

    // J1: T1 -> T2 pipeline
    let mut t1 = task("T1", "filter");
    t1.inputs.push(resolved_input(&hive.blobs, "reads.fa", 512));
    t1.outputs.push(output("clean.fa"));
    let mut t2 = task("T2", "assemble");
    t2.inputs.push(origin_input("clean.fa", "T1"));
    let j1 = hive
        .scheduler
        .submit(job_with_tasks(vec![t1, t2]))
        .await
        .unwrap();

    // J2: one task split into two workunits
    let input = resolved_input(&hive.blobs, "big.fa", 4_096);
    hive.blobs.insert_index(&input.node, "chunkrecord", 10, 1);
    let mut t = task("T1", "filter");
    t.total_work = 2;
    t.inputs.push(input);
    let j2 = hive.scheduler.submit(job_with_tasks(vec![t])).await.unwrap();

    check_invariants(&hive).await;
    assert_eq!(hive.scheduler.queue().wait_list().len(), 3);

    let c1 = hive.register_client("default", &["filter"]).await;
    let c2 = hive.register_client("default", &["*"]).await;

    // checkout everything eligible across both clients
    let w1 = hive
        .scheduler
        .checkout(&c1.id, Policy::Fcfs, i64::MAX, 2)
        .await
        .unwrap();
    check_invariants(&hive).await;
    let w2 = hive
        .scheduler
        .checkout(&c2.id, Policy::HighPriority, i64::MAX, 2)
        .await
        .unwrap();
    check_invariants(&hive).await;
    assert_eq!(w1.len() + w2.len(), 3);

    // every returned workunit respects the eligibility contract
    for (client, works) in [(&c1, &w1), (&c2, &w2)] {
        for work in works.iter() {
            assert!(!client.skip_work.contains(&work.id.to_string()));
            assert!(
                work.info.client_groups.is_empty()
                    || work
                        .info
                        .client_groups
                        .split(',')
                        .any(|g| g == client.group)
            );
            assert!(
                client.apps.iter().any(|a| a == &work.cmd.name || a == "*"),
                "workunit command outside the client's app set"
            );
        }
    }

    // fail one workunit once, finish the rest
    let victim = &w1[0];
    hive.scheduler
        .feedback()
        .handle(Notice {
            work_id: victim.id.clone(),
            status: NoticeStatus::Failed,
            client_id: c1.id.clone(),
            compute_time: 0,
            notes: "flaky".to_string(),
        })
        .await
        .unwrap();
    check_invariants(&hive).await;
    assert!(hive
        .scheduler
        .queue()
        .wait_list()
        .contains(&victim.id.to_string()));

    // the failed workunit goes to the other client and completes
    let retried = hive
        .scheduler
        .checkout(&c2.id, Policy::ById(victim.id.to_string()), i64::MAX, 1)
        .await
        .unwrap();
    assert_eq!(retried[0].id, victim.id);
    check_invariants(&hive).await;

    for (client_id, work) in w1
        .iter()
        .skip(1)
        .map(|w| (c1.id.clone(), w))
        .chain(w2.iter().map(|w| (c2.id.clone(), w)))
        .chain(retried.iter().map(|w| (c2.id.clone(), w)))
    {
        hive.scheduler
            .feedback()
            .handle(Notice {
                work_id: work.id.clone(),
                status: NoticeStatus::Done,
                client_id,
                compute_time: 1,
                notes: String::new(),
            })
            .await
            .unwrap();
        check_invariants(&hive).await;
    }

    // J1's T2 unlocked; run it to completion as well
    let t2_work = hive
        .scheduler
        .checkout(&c2.id, Policy::Fcfs, i64::MAX, 4)
        .await
        .unwrap();
    assert_eq!(t2_work.len(), 1);
    assert_eq!(t2_work[0].id.task_key(), format!("{j1}_T2"));
    hive.scheduler
        .feedback()
        .handle(Notice {
            work_id: t2_work[0].id.clone(),
            status: NoticeStatus::Done,
            client_id: c2.id.clone(),
            compute_time: 1,
            notes: String::new(),
        })
        .await
        .unwrap();
    check_invariants(&hive).await;

    for job_id in [&j1, &j2] {
        let job = hive.scheduler.get_job(job_id).await.unwrap();
        assert_eq!(job.remain_tasks, 0);
        assert_eq!(job.state, taskhive::model::JobState::Completed);
    }
    assert!(hive.scheduler.queue().is_empty());

    // both clients are idle again
    for client in [&c1, &c2] {
        let c = hive
            .scheduler
            .client_manager()
            .get(&client.id)
            .await
            .unwrap();
        assert!(c.current_work.is_empty());
        assert_eq!(c.status, taskhive::model::ClientStatus::ActiveIdle);
    }

    // the suspended partition is empty and nothing references WorkState::Failed
    assert!(hive.scheduler.queue().suspend_list().is_empty());
    for work in hive.scheduler.queue().get_all() {
        assert_ne!(work.state, WorkState::Failed);
    }
}
