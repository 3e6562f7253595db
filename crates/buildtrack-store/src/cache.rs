use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use buildtrack_core::{MilestoneId, normalize_name};

use crate::{ProgressStore, StoreError};

pub const DEFAULT_NAME_CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameScope {
    Milestone,
    Implementation,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NameKey {
    pub scope: NameScope,
    pub name: String,
    pub parent_id: Option<MilestoneId>,
}

impl NameKey {
    pub fn milestone(name: &str, parent_id: Option<MilestoneId>) -> Self {
        Self {
            scope: NameScope::Milestone,
            name: normalize_name(name),
            parent_id,
        }
    }

    pub fn implementation(name: &str) -> Self {
        Self {
            scope: NameScope::Implementation,
            name: normalize_name(name),
            parent_id: None,
        }
    }
}

/// Name → library id lookups shared by every reconciliation in a run.
pub trait NameCache: Send + Sync {
    fn get(&self, key: &NameKey) -> Option<MilestoneId>;

    /// Stores `id` unless a live entry already exists; returns the id that won.
    fn put(&self, key: NameKey, id: MilestoneId) -> MilestoneId;

    fn get_or_try_insert_with(
        &self,
        key: NameKey,
        load: &mut dyn FnMut() -> Result<Option<MilestoneId>, StoreError>,
    ) -> Result<Option<MilestoneId>, StoreError> {
        if let Some(id) = self.get(&key) {
            return Ok(Some(id));
        }

        match load()? {
            Some(id) => Ok(Some(self.put(key, id))),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedId {
    id: MilestoneId,
    stored_at: Instant,
}

#[derive(Debug)]
pub struct TtlNameCache {
    ttl: Duration,
    entries: Mutex<HashMap<NameKey, CachedId>>,
}

impl Default for TtlNameCache {
    fn default() -> Self {
        Self::new(DEFAULT_NAME_CACHE_TTL)
    }
}

impl TtlNameCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NameKey, CachedId>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("name cache lock poisoned, continuing with inner state");
            poisoned.into_inner()
        })
    }

    fn is_live(&self, entry: &CachedId) -> bool {
        entry.stored_at.elapsed() < self.ttl
    }
}

impl NameCache for TtlNameCache {
    fn get(&self, key: &NameKey) -> Option<MilestoneId> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if self.is_live(entry) => Some(entry.id),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: NameKey, id: MilestoneId) -> MilestoneId {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(&key).filter(|entry| self.is_live(entry)) {
            return existing.id;
        }

        entries.insert(
            key,
            CachedId {
                id,
                stored_at: Instant::now(),
            },
        );
        id
    }
}

/// Library lookups routed through a [`NameCache`].
pub struct CachedLibrary<'a, S: ProgressStore + ?Sized> {
    store: &'a S,
    cache: &'a dyn NameCache,
}

impl<'a, S: ProgressStore + ?Sized> CachedLibrary<'a, S> {
    pub fn new(store: &'a S, cache: &'a dyn NameCache) -> Self {
        Self { store, cache }
    }

    /// Find-or-create of a control-point milestone.
    pub fn milestone_id(
        &self,
        name: &str,
        parent_id: Option<MilestoneId>,
        display_name: &str,
    ) -> Result<MilestoneId, StoreError> {
        let key = NameKey::milestone(name, parent_id);
        let id = self.cache.get_or_try_insert_with(key, &mut || {
            self.store
                .get_or_create_milestone(name, parent_id, display_name)
                .map(|entry| Some(entry.id))
        })?;

        id.ok_or_else(|| StoreError::InvalidData(format!("library entry '{name}' not created")))
    }

    pub fn find_milestone_id(
        &self,
        name: &str,
        parent_id: Option<MilestoneId>,
    ) -> Result<Option<MilestoneId>, StoreError> {
        let key = NameKey::milestone(name, parent_id);
        self.cache.get_or_try_insert_with(key, &mut || {
            self.store
                .find_milestone_by_name(name, parent_id)
                .map(|entry| entry.map(|entry| entry.id))
        })
    }

    /// Looks up an implementation-timeline milestone. Never creates one.
    pub fn implementation_id(&self, name: &str) -> Result<Option<MilestoneId>, StoreError> {
        let key = NameKey::implementation(name);
        self.cache.get_or_try_insert_with(key, &mut || {
            self.store
                .find_implementation_milestone(name)
                .map(|entry| entry.map(|entry| entry.id))
        })
    }
}
