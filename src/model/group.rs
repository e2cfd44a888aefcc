use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::acl::{Acl, PUBLIC};

/// Named ACL bucket of clients. Registration and workunit visibility are
/// authorized against the group's ACL; persisted in the `clientgroups`
/// collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientGroup {
    pub id: String,
    pub name: String,
    /// Registration token, empty for token-less public groups.
    #[serde(default)]
    pub token: String,
    pub acl: Acl,
    pub created: DateTime<Utc>,
}

impl ClientGroup {
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            token: Uuid::new_v4().to_string(),
            acl: Acl::owned_by(owner),
            created: Utc::now(),
        }
    }

    /// Publicly owned group created implicitly on token-less registration.
    pub fn public(name: impl Into<String>) -> Self {
        let mut group = Self::new(name, PUBLIC);
        group.token = String::new();
        group.acl.execute = vec![PUBLIC.to_string()];
        group
    }

    pub fn allows_public_execute(&self) -> bool {
        self.acl.check(PUBLIC).execute
    }
}
