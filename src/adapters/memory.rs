//! In-memory Backing Store
//!
//! A [`BackingStore`] over nested `DashMap`s (tenant -> key -> object).
//! Used by tests and by single-node deployments that only need the cache
//! semantics. Failure and latency can be injected to exercise the
//! timeout and rollback paths.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

use crate::domain::ports::{BackingStore, ObjectMeta};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct StoredObject {
    value: Bytes,
    meta: ObjectMeta,
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStoreStats {
    pub objects: u64,
    pub bytes: u64,
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}

#[derive(Debug, Default)]
pub struct InMemoryBackingStore {
    tenants: DashMap<String, DashMap<String, StoredObject>>,
    objects: AtomicU64,
    bytes: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    failing: AtomicBool,
    write_delay: RwLock<Option<Duration>>,
}

impl InMemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`Error::Backend`] until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Delay applied to each write and delete.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.write() = delay;
    }

    pub fn stats(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            objects: self.objects.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(Error::Backend("injected failure".into()));
        }
        Ok(())
    }

    async fn write_latency(&self) {
        let delay = *self.write_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl BackingStore for InMemoryBackingStore {
    async fn put(&self, tenant: &str, key: &str, value: Bytes, version: u64) -> Result<ObjectMeta> {
        self.write_latency().await;
        self.check()?;
        self.writes.fetch_add(1, Ordering::Relaxed);

        let objects = self
            .tenants
            .entry(tenant.to_string())
            .or_insert_with(DashMap::new);

        let meta = ObjectMeta {
            tenant: tenant.to_string(),
            key: key.to_string(),
            size: value.len() as u64,
            version,
            modified: Utc::now(),
        };
        let stored = StoredObject {
            value,
            meta: meta.clone(),
        };
        match objects.entry(key.to_string()) {
            // Newer versions win, whatever order they arrive in
            Entry::Occupied(existing) if existing.get().meta.version > version => {
                return Ok(existing.get().meta.clone());
            }
            Entry::Occupied(mut existing) => {
                let old = existing.insert(stored);
                self.bytes.fetch_sub(old.meta.size, Ordering::Relaxed);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(stored);
                self.objects.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.bytes.fetch_add(meta.size, Ordering::Relaxed);
        Ok(meta)
    }

    async fn get(&self, tenant: &str, key: &str) -> Result<Option<(Bytes, ObjectMeta)>> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.tenants.get(tenant).and_then(|objects| {
            objects
                .get(key)
                .map(|o| (o.value.clone(), o.meta.clone()))
        }))
    }

    async fn delete(&self, tenant: &str, key: &str) -> Result<bool> {
        self.write_latency().await;
        self.check()?;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        let removed = self
            .tenants
            .get(tenant)
            .and_then(|objects| objects.remove(key));
        match removed {
            Some((_, old)) => {
                self.objects.fetch_sub(1, Ordering::Relaxed);
                self.bytes.fetch_sub(old.meta.size, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn head(&self, tenant: &str, key: &str) -> Result<Option<ObjectMeta>> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .tenants
            .get(tenant)
            .and_then(|objects| objects.get(key).map(|o| o.meta.clone())))
    }

    async fn list(&self, tenant: &str, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        let mut listed: Vec<ObjectMeta> = self
            .tenants
            .get(tenant)
            .map(|objects| {
                objects
                    .iter()
                    .filter(|o| o.key().starts_with(prefix))
                    .map(|o| o.meta.clone())
                    .collect()
            })
            .unwrap_or_default();
        listed.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(listed)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.failing.load(Ordering::Relaxed))
    }
}
