use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::acl::{User, PUBLIC};
use crate::config::SchedulerConfig;
use crate::error::{HiveError, Result};
use crate::event::{self, Event};
use crate::lock::TracedRwLock;
use crate::model::{Client, ClientGroup, ClientProfile, ClientStatus, WorkState, WorkunitId};
use crate::scheduler::task_manager::JobMap;
use crate::scheduler::queue::WorkQueue;
use crate::store::DataStore;

/// Reply to a heartbeat: workunit ids the client must stop working on,
/// and a stop order when the client itself has been deleted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HeartbeatReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discard: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<String>,
}

/// Clients keyed by id; each behind its own traced reader-writer lock.
#[derive(Default)]
pub struct ClientMap {
    inner: RwLock<HashMap<String, Arc<TracedRwLock<Client>>>>,
}

impl ClientMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, client: Client) -> Arc<TracedRwLock<Client>> {
        let id = client.id.clone();
        let arc = Arc::new(TracedRwLock::new(format!("client_{id}"), client));
        self.inner.write().await.insert(id, arc.clone());
        arc
    }

    pub async fn get(&self, id: &str) -> Option<Arc<TracedRwLock<Client>>> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.contains_key(id)
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<TracedRwLock<Client>>> {
        self.inner.write().await.remove(id)
    }

    pub async fn entries(&self) -> Vec<(String, Arc<TracedRwLock<Client>>)> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// Authoritative in-memory table of worker clients: registration,
/// heartbeats, liveness, suspension and per-client current-work
/// accounting. Clients are not persisted; workers re-register after a
/// scheduler restart.
#[derive(Clone)]
pub struct ClientManager {
    config: Arc<SchedulerConfig>,
    clients: Arc<ClientMap>,
    queue: Arc<WorkQueue>,
    jobs: Arc<JobMap>,
    store: Arc<dyn DataStore>,
}

impl ClientManager {
    pub fn new(
        config: Arc<SchedulerConfig>,
        clients: Arc<ClientMap>,
        queue: Arc<WorkQueue>,
        jobs: Arc<JobMap>,
        store: Arc<dyn DataStore>,
    ) -> Self {
        Self {
            config,
            clients,
            queue,
            jobs,
            store,
        }
    }

    pub fn clients(&self) -> &Arc<ClientMap> {
        &self.clients
    }

    /// Register a worker. With no group token, the client's group must
    /// either not exist yet (a public one is created) or allow public
    /// execution. A re-registering client's surviving checkouts are
    /// promoted back to the checked-out partition.
    pub async fn register(
        &self,
        profile: ClientProfile,
        group: Option<&ClientGroup>,
    ) -> Result<Client> {
        let client = Client::from_profile(profile);
        if client.group.is_empty() {
            return Err(HiveError::Validation(
                "client profile has no clientgroup".to_string(),
            ));
        }

        match group {
            Some(cg) => {
                if client.group != cg.name {
                    return Err(HiveError::ClientGroupBadName);
                }
            }
            None => {
                if self.config.client_auth_required {
                    return Err(HiveError::Unauthorized);
                }
                match self.store.find_client_group(&client.group).await? {
                    Some(cg) => {
                        if !cg.allows_public_execute() {
                            return Err(HiveError::Unauthorized);
                        }
                    }
                    None => {
                        let cg = ClientGroup::public(&client.group);
                        self.store.upsert_client_group(&cg).await?;
                        tracing::info!(group = %cg.name, "created public clientgroup");
                    }
                }
            }
        }

        let snapshot = client.clone();
        self.clients.insert(client).await;

        // re-registration: surviving checkouts go back to checked-out
        for work_id in &snapshot.current_work {
            if self.queue.has(work_id) {
                if let Err(err) = self.queue.status_change(work_id, WorkState::CheckedOut) {
                    tracing::warn!(work = %work_id, %err, "failed to restore checkout");
                }
            }
        }

        event::emit(Event::ClientRegister, &snapshot.id);
        tracing::info!(client_id = %snapshot.id, group = %snapshot.group, "client registered");
        Ok(snapshot)
    }

    /// Record a heartbeat. Returns the ids of suspended workunits the
    /// client must discard and, for a deleted client, a stop order.
    /// Idempotent within a sweep interval apart from the tag flip.
    pub async fn heartbeat(
        &self,
        client_id: &str,
        group: Option<&ClientGroup>,
    ) -> Result<HeartbeatReply> {
        let client_arc = self
            .clients
            .get(client_id)
            .await
            .ok_or_else(|| HiveError::ClientNotFound(client_id.to_string()))?;

        let mut client = client_arc.write("heartbeat").await;
        if let Some(cg) = group {
            if client.group != cg.name {
                return Err(HiveError::ClientGroupBadName);
            }
        }
        client.tag = true;

        let current: Vec<String> = client.current_work.iter().cloned().collect();
        let suspended: Vec<String> = self
            .queue
            .get_set(&current)
            .into_iter()
            .filter(|w| w.state == WorkState::Suspend)
            .map(|w| w.id.to_string())
            .collect();

        let mut reply = HeartbeatReply::default();
        if !suspended.is_empty() {
            reply.discard = Some(suspended.join(","));
        }
        if client.status == ClientStatus::Deleted {
            reply.stop = Some(client.id.clone());
        }
        Ok(reply)
    }

    pub async fn get(&self, client_id: &str) -> Result<Client> {
        let arc = self
            .clients
            .get(client_id)
            .await
            .ok_or_else(|| HiveError::ClientNotFound(client_id.to_string()))?;
        let client = arc.read("get_client").await;
        Ok(client.clone())
    }

    /// Suspend an active client and requeue its checked-out work.
    pub async fn suspend_client(&self, client_id: &str) -> Result<()> {
        let client_arc = self
            .clients
            .get(client_id)
            .await
            .ok_or_else(|| HiveError::ClientNotFound(client_id.to_string()))?;
        {
            let mut client = client_arc.write("suspend_client").await;
            if !client.status.is_active() {
                return Err(HiveError::ClientNotActive(client_id.to_string()));
            }
            client.status = ClientStatus::Suspend;
        }
        event::emit(Event::ClientSuspend, client_id);
        self.requeue_client(client_id).await
    }

    pub async fn resume_client(&self, client_id: &str) -> Result<()> {
        let client_arc = self
            .clients
            .get(client_id)
            .await
            .ok_or_else(|| HiveError::ClientNotFound(client_id.to_string()))?;
        let mut client = client_arc.write("resume_client").await;
        if client.status != ClientStatus::Suspend {
            return Err(HiveError::ClientNotSuspended(client_id.to_string()));
        }
        client.status = ClientStatus::ActiveIdle;
        Ok(())
    }

    /// Mark a client deleted. The client learns of it on its next
    /// heartbeat or checkout; the liveness sweep reaps the entry once
    /// heartbeats stop.
    pub async fn delete_client(&self, client_id: &str) -> Result<()> {
        let client_arc = self
            .clients
            .get(client_id)
            .await
            .ok_or_else(|| HiveError::ClientNotFound(client_id.to_string()))?;
        let mut client = client_arc.write("delete_client").await;
        client.status = ClientStatus::Deleted;
        Ok(())
    }

    pub async fn suspend_client_by_user(&self, client_id: &str, user: &User) -> Result<()> {
        self.authorize(client_id, user).await?;
        self.suspend_client(client_id).await
    }

    pub async fn resume_client_by_user(&self, client_id: &str, user: &User) -> Result<()> {
        self.authorize(client_id, user).await?;
        self.resume_client(client_id).await
    }

    pub async fn delete_client_by_user(&self, client_id: &str, user: &User) -> Result<()> {
        self.authorize(client_id, user).await?;
        self.delete_client(client_id).await
    }

    pub async fn resume_suspended_clients(&self) -> usize {
        let mut count = 0;
        for (_, client_arc) in self.clients.entries().await {
            let mut client = client_arc.write("resume_suspended_clients").await;
            if client.status == ClientStatus::Suspend {
                client.status = ClientStatus::ActiveIdle;
                count += 1;
            }
        }
        count
    }

    pub async fn update_sub_clients(&self, client_id: &str, count: u32) -> Result<()> {
        let client_arc = self
            .clients
            .get(client_id)
            .await
            .ok_or_else(|| HiveError::ClientNotFound(client_id.to_string()))?;
        client_arc.write("update_sub_clients").await.sub_clients = count;
        Ok(())
    }

    /// Clients visible to `user` through clientgroup ACLs.
    pub async fn list_by_user(&self, user: &User) -> Result<Vec<Client>> {
        let groups = self.authorized_groups(user).await?;
        let mut out = Vec::new();
        for (_, client_arc) in self.clients.entries().await {
            let client = client_arc.read("list_by_user").await;
            if groups.contains(&client.group) {
                out.push(client.clone());
            }
        }
        Ok(out)
    }

    /// Return a lost or suspended client's checked-out workunits to the
    /// waiting partition, skipping jobs that are no longer active.
    pub async fn requeue_client(&self, client_id: &str) -> Result<()> {
        let work_ids: Vec<String> = match self.clients.get(client_id).await {
            Some(client_arc) => {
                let client = client_arc.read("requeue_client").await;
                client.current_work.iter().cloned().collect()
            }
            None => return Ok(()),
        };

        for work_id in work_ids {
            if !self.queue.has(&work_id) {
                continue;
            }
            let job_id = match work_id.parse::<WorkunitId>() {
                Ok(wid) => wid.job_id().to_string(),
                Err(err) => {
                    tracing::warn!(work = %work_id, %err, "unparseable workunit id in current work");
                    continue;
                }
            };
            let active = match self.jobs.get(&job_id).await {
                Some(job_arc) => job_arc.read("requeue_client").await.state.is_active(),
                None => false,
            };
            if !active {
                continue;
            }
            if let Err(err) = self.queue.status_change(&work_id, WorkState::Queued) {
                tracing::warn!(work = %work_id, %err, "failed to requeue workunit");
                continue;
            }
            event::emit(Event::WorkRequeue, &work_id);
        }
        Ok(())
    }

    /// Liveness sweep. Clients that heartbeat since the last sweep get
    /// their tag cleared and serve/idle accounting updated; the rest are
    /// declared lost, their work requeued, their entries removed. A lost
    /// client is detected between one and two sweep intervals after its
    /// final heartbeat.
    pub async fn liveness_sweep(&self) {
        let sweep_secs = self.config.client_tick.as_secs();
        let mut lost = Vec::new();

        for (client_id, client_arc) in self.clients.entries().await {
            let mut client = client_arc.write("liveness_sweep").await;
            if client.tag {
                client.tag = false;
                client.serve_time = (Utc::now() - client.reg_time).num_seconds().max(0) as u64;
                if client.current_work.is_empty() {
                    client.idle_time += sweep_secs;
                } else {
                    client.idle_time = 0;
                }
            } else {
                lost.push((client_id, client.name.clone()));
            }
        }

        for (client_id, name) in lost {
            event::emit(Event::ClientUnregister, &client_id);
            let loss = HiveError::ClientLost(client_id.clone());
            tracing::warn!(%loss, kind = ?loss.kind(), name = %name, "client missed heartbeat, removing");
            if let Err(err) = self.requeue_client(&client_id).await {
                tracing::error!(client_id = %client_id, %err, "failed to requeue lost client's work");
            }
            self.clients.remove(&client_id).await;
        }
    }

    /// Clientgroup names `user` may administer: groups they own, public
    /// groups, or everything for admins.
    async fn authorized_groups(&self, user: &User) -> Result<HashSet<String>> {
        let mut out = HashSet::new();
        for group in self.store.list_client_groups().await? {
            let allowed = if user.uuid != PUBLIC {
                user.admin || group.acl.owner == user.uuid || group.acl.owner == PUBLIC
            } else {
                !self.config.client_auth_required && group.acl.owner == PUBLIC
            };
            if allowed {
                out.insert(group.name);
            }
        }
        Ok(out)
    }

    async fn authorize(&self, client_id: &str, user: &User) -> Result<()> {
        let client_arc = self
            .clients
            .get(client_id)
            .await
            .ok_or_else(|| HiveError::ClientNotFound(client_id.to_string()))?;
        let group = client_arc.read("authorize").await.group.clone();
        let groups = self.authorized_groups(user).await?;
        if !groups.contains(&group) {
            return Err(HiveError::Unauthorized);
        }
        Ok(())
    }
}
