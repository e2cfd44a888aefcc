//! Reader-writer lock with named acquisitions.
//!
//! Job, task and client records each sit behind one of these; every
//! acquire records the lock name and the caller-supplied tag at trace
//! level so lock-ordering problems can be reconstructed from a trace
//! capture. Lock ordering is job -> task -> workunit and, separately,
//! client map -> client -> workunit.

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub struct TracedRwLock<T> {
    name: String,
    inner: RwLock<T>,
}

pub struct TracedReadGuard<'a, T> {
    guard: RwLockReadGuard<'a, T>,
    name: &'a str,
    tag: &'static str,
}

pub struct TracedWriteGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    name: &'a str,
    tag: &'static str,
}

impl<T> TracedRwLock<T> {
    pub fn new(name: impl Into<String>, value: T) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(value),
        }
    }

    pub async fn read(&self, tag: &'static str) -> TracedReadGuard<'_, T> {
        tracing::trace!(lock = %self.name, tag, mode = "read", "acquire");
        TracedReadGuard {
            guard: self.inner.read().await,
            name: &self.name,
            tag,
        }
    }

    pub async fn write(&self, tag: &'static str) -> TracedWriteGuard<'_, T> {
        tracing::trace!(lock = %self.name, tag, mode = "write", "acquire");
        TracedWriteGuard {
            guard: self.inner.write().await,
            name: &self.name,
            tag,
        }
    }
}

impl<T> std::ops::Deref for TracedReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> std::ops::Deref for TracedWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> std::ops::DerefMut for TracedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for TracedReadGuard<'_, T> {
    fn drop(&mut self) {
        tracing::trace!(lock = %self.name, tag = self.tag, mode = "read", "release");
    }
}

impl<T> Drop for TracedWriteGuard<'_, T> {
    fn drop(&mut self) {
        tracing::trace!(lock = %self.name, tag = self.tag, mode = "write", "release");
    }
}
