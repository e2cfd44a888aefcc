//! Direct tests of the priority work queue: partitions, policies,
//! stale-entry handling and the size filter.

mod harness;

use chrono::Duration;
use harness::workunit;
use taskhive::error::HiveError;
use taskhive::model::WorkState;
use taskhive::scheduler::{Policy, WorkQueue};

#[test]
fn test_add_and_duplicate() {
    let queue = WorkQueue::new();
    let work = workunit("j1", "T1", 0, 1, 0);
    let id = work.id.to_string();

    queue.add(work.clone()).unwrap();
    assert!(queue.has(&id));
    assert_eq!(queue.wait_list(), vec![id.clone()]);

    let err = queue.add(work).unwrap_err();
    assert!(matches!(err, HiveError::AlreadyQueued(_)));
}

#[test]
fn test_partitions_are_disjoint() {
    let queue = WorkQueue::new();
    let w1 = workunit("j1", "T1", 0, 1, 0);
    let w2 = workunit("j1", "T2", 0, 1, 0);
    let w3 = workunit("j1", "T3", 0, 1, 0);
    let (id1, id2, id3) = (w1.id.to_string(), w2.id.to_string(), w3.id.to_string());
    queue.add(w1).unwrap();
    queue.add(w2).unwrap();
    queue.add(w3).unwrap();

    queue.status_change(&id2, WorkState::CheckedOut).unwrap();
    queue.status_change(&id3, WorkState::Suspend).unwrap();

    assert_eq!(queue.wait_list(), vec![id1.clone()]);
    assert_eq!(queue.checkout_list(), vec![id2.clone()]);
    assert_eq!(queue.suspend_list(), vec![id3.clone()]);
    assert_eq!(
        queue.wait_list().len() + queue.checkout_list().len() + queue.suspend_list().len(),
        queue.len()
    );

    // a suspended workunit can re-enter the waiting partition
    queue.status_change(&id3, WorkState::Queued).unwrap();
    assert_eq!(queue.suspend_list().len(), 0);
    assert_eq!(queue.wait_list().len(), 2);

    queue.delete(&id1);
    assert!(!queue.has(&id1));
    assert!(queue.get(&id1).is_err());
}

#[test]
fn test_fcfs_orders_by_priority_then_submit_time() {
    let queue = WorkQueue::new();
    let mut early_low = workunit("j1", "T1", 0, 1, 0);
    early_low.info.submit_time = early_low.info.submit_time - Duration::seconds(60);
    let mut late_low = workunit("j2", "T1", 0, 1, 0);
    late_low.info.submit_time = late_low.info.submit_time - Duration::seconds(30);
    let high = workunit("j3", "T1", 0, 5, 0);

    let eligible: Vec<String> = [&early_low, &late_low, &high]
        .iter()
        .map(|w| w.id.to_string())
        .collect();
    queue.add(early_low.clone()).unwrap();
    queue.add(late_low.clone()).unwrap();
    queue.add(high.clone()).unwrap();

    let picked = queue
        .select_eligible(&eligible, &Policy::Fcfs, i64::MAX, 3)
        .unwrap();
    let order: Vec<String> = picked.iter().map(|w| w.id.to_string()).collect();
    assert_eq!(
        order,
        vec![
            high.id.to_string(),
            early_low.id.to_string(),
            late_low.id.to_string()
        ]
    );
    // selection promotes atomically
    assert_eq!(queue.wait_list().len(), 0);
    assert_eq!(queue.checkout_list().len(), 3);
    for work in picked {
        assert_eq!(work.state, WorkState::CheckedOut);
    }
}

#[test]
fn test_high_priority_skips_stale_heap_entries() {
    let queue = WorkQueue::new();
    let w1 = workunit("j1", "T1", 0, 9, 0);
    let w2 = workunit("j2", "T1", 0, 1, 0);
    let (id1, id2) = (w1.id.to_string(), w2.id.to_string());
    queue.add(w1).unwrap();
    queue.add(w2).unwrap();

    // w1's heap entry goes stale
    queue.delete(&id1);

    let picked = queue
        .select_eligible(&[id2.clone()], &Policy::HighPriority, i64::MAX, 1)
        .unwrap();
    assert_eq!(picked.len(), 1);
    assert_eq!(picked[0].id.to_string(), id2);
}

#[test]
fn test_high_priority_keeps_ineligible_entries() {
    let queue = WorkQueue::new();
    let big = workunit("j1", "T1", 0, 9, 0);
    let small = workunit("j2", "T1", 0, 1, 0);
    let (big_id, small_id) = (big.id.to_string(), small.id.to_string());
    queue.add(big).unwrap();
    queue.add(small).unwrap();

    // only the low-priority workunit is eligible; the high-priority one
    // must survive in the heap for the next selection
    let picked = queue
        .select_eligible(&[small_id.clone()], &Policy::HighPriority, i64::MAX, 1)
        .unwrap();
    assert_eq!(picked[0].id.to_string(), small_id);

    let picked = queue
        .select_eligible(&[big_id.clone()], &Policy::HighPriority, i64::MAX, 1)
        .unwrap();
    assert_eq!(picked[0].id.to_string(), big_id);
}

#[test]
fn test_high_priority_does_not_double_pick_requeued_work() {
    let queue = WorkQueue::new();
    let work = workunit("j1", "T1", 0, 1, 0);
    let id = work.id.to_string();
    queue.add(work).unwrap();

    // an FCFS checkout leaves the add-time heap entry resident
    let picked = queue
        .select_eligible(&[id.clone()], &Policy::Fcfs, i64::MAX, 1)
        .unwrap();
    assert_eq!(picked.len(), 1);

    // requeueing pushes a second heap entry for the same id
    queue.status_change(&id, WorkState::Queued).unwrap();

    let picked = queue
        .select_eligible(&[id.clone()], &Policy::HighPriority, i64::MAX, 2)
        .unwrap();
    assert_eq!(picked.len(), 1);
    assert_eq!(picked[0].id.to_string(), id);
    assert!(queue.wait_list().is_empty());
    assert_eq!(queue.checkout_list(), vec![id]);
}

#[test]
fn test_by_id_policy() {
    let queue = WorkQueue::new();
    let w1 = workunit("j1", "T1", 0, 1, 0);
    let w2 = workunit("j1", "T2", 0, 1, 0);
    let (id1, id2) = (w1.id.to_string(), w2.id.to_string());
    queue.add(w1).unwrap();
    queue.add(w2).unwrap();

    let eligible = vec![id1.clone(), id2.clone()];
    let picked = queue
        .select_eligible(&eligible, &Policy::ById(id2.clone()), i64::MAX, 1)
        .unwrap();
    assert_eq!(picked[0].id.to_string(), id2);

    // no longer waiting
    let err = queue
        .select_eligible(&eligible, &Policy::ById(id2), i64::MAX, 1)
        .unwrap_err();
    assert!(matches!(err, HiveError::NotFound(_)));
}

#[test]
fn test_size_filter_returns_fewer() {
    let queue = WorkQueue::new();
    let small = workunit("j1", "T1", 0, 1, 100);
    let big = workunit("j1", "T2", 0, 1, 1_000_000);
    let eligible = vec![small.id.to_string(), big.id.to_string()];
    let small_id = small.id.to_string();
    queue.add(small).unwrap();
    queue.add(big).unwrap();

    let picked = queue
        .select_eligible(&eligible, &Policy::Fcfs, 1_000, 2)
        .unwrap();
    assert_eq!(picked.len(), 1);
    assert_eq!(picked[0].id.to_string(), small_id);
    // the oversized workunit stays waiting
    assert_eq!(queue.wait_list().len(), 1);
}

#[test]
fn test_requeue_clears_checkout_binding() {
    let queue = WorkQueue::new();
    let work = workunit("j1", "T1", 0, 1, 0);
    let id = work.id.to_string();
    queue.add(work).unwrap();

    queue.assign(&id, "client-1", chrono::Utc::now()).unwrap();
    let held = queue.get(&id).unwrap();
    assert_eq!(held.client, "client-1");
    assert!(held.checkout_time.is_some());

    queue.status_change(&id, WorkState::Queued).unwrap();
    let requeued = queue.get(&id).unwrap();
    assert!(requeued.client.is_empty());
    assert!(requeued.checkout_time.is_none());
}

#[test]
fn test_policy_parsing() {
    assert_eq!("FCFS".parse::<Policy>().unwrap(), Policy::Fcfs);
    assert_eq!(
        "HighPriority".parse::<Policy>().unwrap(),
        Policy::HighPriority
    );
    assert_eq!(
        "ById:j1_T1_0".parse::<Policy>().unwrap(),
        Policy::ById("j1_T1_0".to_string())
    );
    assert!("LIFO".parse::<Policy>().is_err());
}
