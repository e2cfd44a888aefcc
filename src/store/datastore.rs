use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::model::{ClientGroup, JobDocument, JobState};
use crate::store::StoreError;

/// Document store holding one document per job (`jobs` collection) and
/// one per clientgroup (`clientgroups`). Field updates are targeted
/// (`$set` by dotted field path), never whole-document rewrites, so the
/// scheduler's persist-then-update ordering stays cheap.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Reachability probe used at startup.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn upsert_job(&self, doc: &JobDocument) -> Result<(), StoreError>;

    /// `$set` one job field by dotted path, e.g. `info.priority`.
    async fn update_job_field(
        &self,
        job_id: &str,
        field: &str,
        value: Value,
    ) -> Result<(), StoreError>;

    /// `$set` one field of the embedded task identified by `task_key`.
    async fn update_task_field(
        &self,
        job_id: &str,
        task_key: &str,
        field: &str,
        value: Value,
    ) -> Result<(), StoreError>;

    /// Push a task document onto the job's embedded task array.
    async fn push_job_task(&self, job_id: &str, task: Value) -> Result<(), StoreError>;

    async fn delete_job(&self, job_id: &str) -> Result<(), StoreError>;

    /// Jobs whose state is one of `states`, for startup recovery.
    async fn load_jobs(&self, states: &[JobState]) -> Result<Vec<JobDocument>, StoreError>;

    async fn upsert_client_group(&self, group: &ClientGroup) -> Result<(), StoreError>;

    async fn find_client_group(&self, name: &str) -> Result<Option<ClientGroup>, StoreError>;

    async fn list_client_groups(&self) -> Result<Vec<ClientGroup>, StoreError>;
}

/// In-process implementation over raw JSON documents.
#[derive(Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<String, Value>>,
    groups: Mutex<HashMap<String, ClientGroup>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw job document, for assertions on persisted state.
    pub fn job_document(&self, job_id: &str) -> Option<Value> {
        self.jobs.lock().unwrap().get(job_id).cloned()
    }
}

fn set_path(doc: &mut Value, path: &str, value: Value) {
    let mut cursor = doc;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            cursor[part] = value;
            return;
        }
        if !cursor[part].is_object() {
            cursor[part] = json!({});
        }
        cursor = &mut cursor[part];
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert_job(&self, doc: &JobDocument) -> Result<(), StoreError> {
        let value = serde_json::to_value(doc)?;
        self.jobs
            .lock()
            .unwrap()
            .insert(doc.job.id.clone(), value);
        Ok(())
    }

    async fn update_job_field(
        &self,
        job_id: &str,
        field: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let doc = jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        set_path(doc, field, value);
        Ok(())
    }

    async fn update_task_field(
        &self,
        job_id: &str,
        task_key: &str,
        field: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let doc = jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        let tasks = doc["task_list"]
            .as_array_mut()
            .ok_or_else(|| StoreError::NotFound(format!("{job_id}: no task array")))?;
        let task = tasks
            .iter_mut()
            .find(|t| t["id"].as_str() == Some(task_key))
            .ok_or_else(|| StoreError::NotFound(format!("{job_id}: task {task_key}")))?;
        set_path(task, field, value);
        Ok(())
    }

    async fn push_job_task(&self, job_id: &str, task: Value) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let doc = jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        if !doc["task_list"].is_array() {
            doc["task_list"] = json!([]);
        }
        doc["task_list"].as_array_mut().unwrap().push(task);
        Ok(())
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), StoreError> {
        self.jobs.lock().unwrap().remove(job_id);
        Ok(())
    }

    async fn load_jobs(&self, states: &[JobState]) -> Result<Vec<JobDocument>, StoreError> {
        let wanted: Vec<String> = states.iter().map(|s| s.to_string()).collect();
        let jobs = self.jobs.lock().unwrap();
        let mut out = Vec::new();
        for doc in jobs.values() {
            let state = doc["state"].as_str().unwrap_or_default();
            if wanted.iter().any(|w| w == state) {
                out.push(serde_json::from_value(doc.clone())?);
            }
        }
        Ok(out)
    }

    async fn upsert_client_group(&self, group: &ClientGroup) -> Result<(), StoreError> {
        self.groups
            .lock()
            .unwrap()
            .insert(group.name.clone(), group.clone());
        Ok(())
    }

    async fn find_client_group(&self, name: &str) -> Result<Option<ClientGroup>, StoreError> {
        Ok(self.groups.lock().unwrap().get(name).cloned())
    }

    async fn list_client_groups(&self) -> Result<Vec<ClientGroup>, StoreError> {
        Ok(self.groups.lock().unwrap().values().cloned().collect())
    }
}
