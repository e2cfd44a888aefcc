use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::config::PRIORITY_WEIGHT;
use crate::error::{HiveError, Result};
use crate::model::{WorkState, Workunit};

/// Checkout ordering policies recognized by [`WorkQueue::select_eligible`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    /// Earliest submit time first; ties broken by lower rank.
    Fcfs,
    /// Exactly this workunit; an error if it is not waiting.
    ById(String),
    /// Queue score descending; ties broken FCFS.
    HighPriority,
}

impl FromStr for Policy {
    type Err = HiveError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "FCFS" => Ok(Policy::Fcfs),
            "HighPriority" => Ok(Policy::HighPriority),
            _ => match s.split_once(':') {
                Some(("ById", id)) if !id.is_empty() => Ok(Policy::ById(id.to_string())),
                _ => Err(HiveError::Validation(format!("unknown checkout policy: {s}"))),
            },
        }
    }
}

/// Queue score: priority bands dominate, earlier submissions win within a
/// band. Larger score wins.
fn score(priority: i32, submit_time: DateTime<Utc>) -> i64 {
    i64::from(priority) * PRIORITY_WEIGHT - submit_time.timestamp()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeapEntry {
    score: i64,
    seq: u64,
    id: String,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap on score; equal scores pop in insertion order
        self.score
            .cmp(&other.score)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Inner {
    works: HashMap<String, Workunit>,
    heap: BinaryHeap<HeapEntry>,
    waiting: HashSet<String>,
    checked_out: HashSet<String>,
    suspended: HashSet<String>,
    seq: u64,
}

impl Inner {
    fn push_heap(&mut self, work: &Workunit) {
        let entry = HeapEntry {
            score: score(work.info.priority, work.info.submit_time),
            seq: self.seq,
            id: work.id.to_string(),
        };
        self.seq += 1;
        self.heap.push(entry);
    }

    fn detach(&mut self, id: &str) {
        self.waiting.remove(id);
        self.checked_out.remove(id);
        self.suspended.remove(id);
    }
}

/// Priority-ordered store of every known workunit, partitioned into
/// waiting / checked-out / suspended. One mutex guards the map, the heap
/// and the partition sets; the heap may hold stale entries which are
/// discarded on pop.
#[derive(Default)]
pub struct WorkQueue {
    inner: Mutex<Inner>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new workunit into the waiting partition.
    pub fn add(&self, work: Workunit) -> Result<()> {
        let id = work.id.to_string();
        if id.is_empty() {
            return Err(HiveError::Validation(
                "tried to queue a workunit with an empty id".to_string(),
            ));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.works.contains_key(&id) {
            return Err(HiveError::AlreadyQueued(id));
        }
        let mut work = work;
        work.state = WorkState::Queued;
        inner.push_heap(&work);
        inner.waiting.insert(id.clone());
        inner.works.insert(id, work);
        Ok(())
    }

    /// Move a workunit between partitions. Re-entering the waiting
    /// partition pushes a fresh heap entry.
    pub fn status_change(&self, id: &str, new_state: WorkState) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(mut work) = inner.works.get(id).cloned() else {
            return Err(HiveError::NotFound(format!("workunit {id}")));
        };
        inner.detach(id);
        match new_state {
            WorkState::Queued => {
                work.state = WorkState::Queued;
                work.client.clear();
                work.checkout_time = None;
                inner.push_heap(&work);
                inner.waiting.insert(id.to_string());
            }
            WorkState::CheckedOut => {
                work.state = WorkState::CheckedOut;
                inner.checked_out.insert(id.to_string());
            }
            WorkState::Suspend => {
                work.state = WorkState::Suspend;
                inner.suspended.insert(id.to_string());
            }
            other => {
                return Err(HiveError::Validation(format!(
                    "workunit {id} cannot be parked in state {other}"
                )));
            }
        }
        inner.works.insert(id.to_string(), work);
        Ok(())
    }

    /// Bind a checked-out workunit to a client.
    pub fn assign(&self, id: &str, client: &str, now: DateTime<Utc>) -> Result<Workunit> {
        let mut inner = self.inner.lock().unwrap();
        let Some(work) = inner.works.get_mut(id) else {
            return Err(HiveError::NotFound(format!("workunit {id}")));
        };
        work.client = client.to_string();
        work.checkout_time = Some(now);
        work.state = WorkState::CheckedOut;
        let work = work.clone();
        inner.detach(id);
        inner.checked_out.insert(id.to_string());
        Ok(work)
    }

    /// Count one more execution failure and return the total.
    pub fn record_failure(&self, id: &str) -> Result<u32> {
        let mut inner = self.inner.lock().unwrap();
        let Some(work) = inner.works.get_mut(id) else {
            return Err(HiveError::NotFound(format!("workunit {id}")));
        };
        work.failures += 1;
        Ok(work.failures)
    }

    /// Zero the failure counter, used when a suspended job is resumed.
    pub fn reset_failures(&self, id: &str) {
        if let Some(work) = self.inner.lock().unwrap().works.get_mut(id) {
            work.failures = 0;
        }
    }

    pub fn delete(&self, id: &str) -> Option<Workunit> {
        let mut inner = self.inner.lock().unwrap();
        inner.detach(id);
        inner.works.remove(id)
    }

    pub fn has(&self, id: &str) -> bool {
        self.inner.lock().unwrap().works.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Result<Workunit> {
        self.inner
            .lock()
            .unwrap()
            .works
            .get(id)
            .cloned()
            .ok_or_else(|| HiveError::NotFound(format!("workunit {id}")))
    }

    pub fn get_opt(&self, id: &str) -> Option<Workunit> {
        self.inner.lock().unwrap().works.get(id).cloned()
    }

    pub fn get_set(&self, ids: &[String]) -> Vec<Workunit> {
        let inner = self.inner.lock().unwrap();
        ids.iter()
            .filter_map(|id| inner.works.get(id).cloned())
            .collect()
    }

    pub fn get_all(&self) -> Vec<Workunit> {
        self.inner.lock().unwrap().works.values().cloned().collect()
    }

    pub fn list(&self) -> Vec<String> {
        self.inner.lock().unwrap().works.keys().cloned().collect()
    }

    pub fn wait_list(&self) -> Vec<String> {
        self.inner.lock().unwrap().waiting.iter().cloned().collect()
    }

    pub fn checkout_list(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .checked_out
            .iter()
            .cloned()
            .collect()
    }

    pub fn suspend_list(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .suspended
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().works.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().works.is_empty()
    }

    /// From the supplied eligible ids, pick up to `count` waiting
    /// workunits whose predicted size fits `available_bytes`, ordered by
    /// `policy`, and promote them to checked-out atomically. A
    /// size-filtered selection may return fewer than `count` items.
    pub fn select_eligible(
        &self,
        eligible: &[String],
        policy: &Policy,
        available_bytes: i64,
        count: usize,
    ) -> Result<Vec<Workunit>> {
        let mut inner = self.inner.lock().unwrap();
        let eligible_set: HashSet<&str> = eligible.iter().map(String::as_str).collect();

        let picked_ids: Vec<String> = match policy {
            Policy::ById(id) => {
                if !inner.waiting.contains(id) || !eligible_set.contains(id.as_str()) {
                    return Err(HiveError::NotFound(format!("workunit {id} is not waiting")));
                }
                vec![id.clone()]
            }
            Policy::Fcfs => {
                // FCFS within priority: the queue score already ranks
                // higher-priority bands first and earlier submissions
                // within a band
                let mut candidates: Vec<&Workunit> = eligible_set
                    .iter()
                    .copied()
                    .filter(|id| inner.waiting.contains(*id))
                    .filter_map(|id| inner.works.get(id))
                    .filter(|w| w.size <= available_bytes)
                    .collect();
                candidates.sort_by_key(|w| {
                    (
                        std::cmp::Reverse(score(w.info.priority, w.info.submit_time)),
                        w.id.rank,
                    )
                });
                candidates
                    .into_iter()
                    .take(count)
                    .map(|w| w.id.to_string())
                    .collect()
            }
            Policy::HighPriority => {
                // pop-and-skip: stale entries are dropped for good,
                // waiting-but-ineligible ones go back afterwards. A
                // requeued workunit has two live heap entries, so ids
                // already picked this pass are skipped too.
                let mut picked = Vec::new();
                let mut seen: HashSet<String> = HashSet::new();
                let mut stash = Vec::new();
                while picked.len() < count {
                    let Some(entry) = inner.heap.pop() else { break };
                    if !inner.waiting.contains(&entry.id) {
                        continue;
                    }
                    if seen.contains(&entry.id) {
                        continue;
                    }
                    let fits = eligible_set.contains(entry.id.as_str())
                        && inner
                            .works
                            .get(&entry.id)
                            .map(|w| w.size <= available_bytes)
                            .unwrap_or(false);
                    if fits {
                        seen.insert(entry.id.clone());
                        picked.push(entry.id);
                    } else {
                        stash.push(entry);
                    }
                }
                for entry in stash {
                    inner.heap.push(entry);
                }
                picked
            }
        };

        let mut out = Vec::with_capacity(picked_ids.len());
        for id in picked_ids {
            inner.detach(&id);
            let Some(work) = inner.works.get_mut(&id) else {
                tracing::error!(work = %id, "selected workunit vanished from the map");
                continue;
            };
            work.state = WorkState::CheckedOut;
            out.push(work.clone());
            inner.checked_out.insert(id);
        }
        Ok(out)
    }
}
