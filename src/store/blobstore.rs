use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::store::BlobError;

/// Index built over a blob-store node; `total_units` drives the
/// partition-size recomputation for multi-workunit tasks.
#[derive(Debug, Clone, Copy)]
pub struct IndexInfo {
    pub total_units: u64,
    pub avg_unit_size: u64,
}

/// Content store holding task input/output data. Each artifact is a node
/// on a host; multi-part outputs declare their part count up front.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Create an empty node and return its id.
    async fn create_node(&self, host: &str, token: &str) -> Result<String, BlobError>;

    /// Declare `parts` upload slots on a node.
    async fn set_parts(&self, host: &str, node: &str, parts: u32) -> Result<(), BlobError>;

    async fn node_size(&self, host: &str, node: &str) -> Result<u64, BlobError>;

    /// Create (or wait for) `index` on a node and return its shape.
    async fn create_index(
        &self,
        host: &str,
        node: &str,
        index: &str,
    ) -> Result<IndexInfo, BlobError>;

    async fn delete_node(&self, host: &str, node: &str, token: &str) -> Result<(), BlobError>;
}

#[derive(Debug, Default, Clone)]
struct MemoryNode {
    size: u64,
    parts: u32,
    indexes: HashMap<String, IndexInfo>,
}

/// In-process blob store; tests preload node sizes and index tables.
#[derive(Default)]
pub struct MemoryBlobStore {
    nodes: Mutex<HashMap<String, MemoryNode>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload a node with a known size, returning its id.
    pub fn insert_node(&self, size: u64) -> String {
        let id = Uuid::new_v4().to_string();
        self.nodes.lock().unwrap().insert(
            id.clone(),
            MemoryNode {
                size,
                parts: 0,
                indexes: HashMap::new(),
            },
        );
        id
    }

    /// Preload an index on an existing node.
    pub fn insert_index(&self, node: &str, index: &str, total_units: u64, avg_unit_size: u64) {
        if let Some(entry) = self.nodes.lock().unwrap().get_mut(node) {
            entry.indexes.insert(
                index.to_string(),
                IndexInfo {
                    total_units,
                    avg_unit_size,
                },
            );
        }
    }

    pub fn parts(&self, node: &str) -> Option<u32> {
        self.nodes.lock().unwrap().get(node).map(|n| n.parts)
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.lock().unwrap().contains_key(node)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn create_node(&self, _host: &str, _token: &str) -> Result<String, BlobError> {
        Ok(self.insert_node(0))
    }

    async fn set_parts(&self, _host: &str, node: &str, parts: u32) -> Result<(), BlobError> {
        let mut nodes = self.nodes.lock().unwrap();
        let entry = nodes
            .get_mut(node)
            .ok_or_else(|| BlobError::NodeNotFound(node.to_string()))?;
        entry.parts = parts;
        Ok(())
    }

    async fn node_size(&self, _host: &str, node: &str) -> Result<u64, BlobError> {
        self.nodes
            .lock()
            .unwrap()
            .get(node)
            .map(|n| n.size)
            .ok_or_else(|| BlobError::NodeNotFound(node.to_string()))
    }

    async fn create_index(
        &self,
        _host: &str,
        node: &str,
        index: &str,
    ) -> Result<IndexInfo, BlobError> {
        let nodes = self.nodes.lock().unwrap();
        let entry = nodes
            .get(node)
            .ok_or_else(|| BlobError::NodeNotFound(node.to_string()))?;
        entry
            .indexes
            .get(index)
            .copied()
            .ok_or_else(|| BlobError::IndexUnavailable {
                node: node.to_string(),
                index: index.to_string(),
            })
    }

    async fn delete_node(&self, _host: &str, node: &str, _token: &str) -> Result<(), BlobError> {
        self.nodes.lock().unwrap().remove(node);
        Ok(())
    }
}
