use serde::{Deserialize, Serialize};

/// Uuid standing in for unauthenticated callers and publicly owned
/// resources.
pub const PUBLIC: &str = "public";

/// Caller identity as resolved by the (external) authentication layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub uuid: String,
    #[serde(default)]
    pub admin: bool,
}

impl User {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            admin: false,
        }
    }

    pub fn admin(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            admin: true,
        }
    }

    pub fn public() -> Self {
        Self::new(PUBLIC)
    }
}

/// Per-resource access-control list: an owner plus per-right uuid lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Acl {
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub read: Vec<String>,
    #[serde(default)]
    pub write: Vec<String>,
    #[serde(default)]
    pub delete: Vec<String>,
    #[serde(default)]
    pub execute: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Rights {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
    pub execute: bool,
}

impl Acl {
    pub fn owned_by(owner: impl Into<String>) -> Self {
        let owner = owner.into();
        Self {
            owner: owner.clone(),
            read: vec![owner.clone()],
            write: vec![owner.clone()],
            delete: vec![owner.clone()],
            execute: vec![owner],
        }
    }

    /// Rights granted to `uuid`. The owner holds every right; everyone
    /// holds the rights granted to `public`.
    pub fn check(&self, uuid: &str) -> Rights {
        if uuid == self.owner && !self.owner.is_empty() {
            return Rights {
                read: true,
                write: true,
                delete: true,
                execute: true,
            };
        }
        let held = |list: &[String]| {
            list.iter()
                .any(|entry| entry == uuid || entry == PUBLIC)
        };
        Rights {
            read: held(&self.read),
            write: held(&self.write),
            delete: held(&self.delete),
            execute: held(&self.execute),
        }
    }

    /// Whether `user` may see the resource (owner, read right or admin).
    pub fn readable_by(&self, user: &User) -> bool {
        user.admin || self.owner == user.uuid || self.check(&user.uuid).read
    }
}
