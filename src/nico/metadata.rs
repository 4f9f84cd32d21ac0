//! In-memory id -> type/title table
//!
//! Video server URLs carry only the numeric id, so the type prefix (`sm`,
//! `nm`, ...) and the title are learned from other pages and remembered
//! here. The table is bounded; the least recently used id is evicted first.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// What is known about one video id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdInfo {
    pub kind: String,
    pub id: String,
    /// `None` until a title lookup succeeded
    pub title: Option<String>,
}

impl IdInfo {
    pub fn title_valid(&self) -> bool {
        self.title.is_some()
    }
}

struct Table {
    entries: HashMap<String, IdInfo>,
    recent: VecDeque<String>,
}

impl Table {
    fn touch(&mut self, id: &str) {
        if let Some(pos) = self.recent.iter().position(|r| r == id) {
            if let Some(key) = self.recent.remove(pos) {
                self.recent.push_back(key);
            }
        }
    }
}

/// Bounded LRU table of [`IdInfo`], keyed by numeric id
pub struct MetadataCache {
    capacity: usize,
    table: Mutex<Table>,
}

impl MetadataCache {
    pub fn new(capacity: usize) -> Self {
        MetadataCache {
            capacity: capacity.max(1),
            table: Mutex::new(Table {
                entries: HashMap::new(),
                recent: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &str) -> Option<IdInfo> {
        let mut table = self.lock();
        let info = table.entries.get(id).cloned()?;
        table.touch(id);
        Some(info)
    }

    /// Remember the type and title of `id`
    pub fn put(&self, kind: &str, id: &str, title: &str) {
        self.insert(IdInfo {
            kind: kind.to_string(),
            id: id.to_string(),
            title: Some(title.to_string()),
        });
    }

    /// Remember only the type of `id`; a known title is kept
    pub fn put_pending(&self, kind: &str, id: &str) {
        if self.get(id).is_some_and(|info| info.title_valid()) {
            return;
        }
        self.insert(IdInfo {
            kind: kind.to_string(),
            id: id.to_string(),
            title: None,
        });
    }

    fn insert(&self, info: IdInfo) {
        let mut table = self.lock();
        let id = info.id.clone();
        if table.entries.insert(id.clone(), info).is_some() {
            table.touch(&id);
            return;
        }

        if table.recent.len() >= self.capacity {
            if let Some(evicted) = table.recent.pop_front() {
                table.entries.remove(&evicted);
                debug!("title cache expunged: {}", evicted);
            }
        }
        table.recent.push_back(id);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let cache = MetadataCache::new(10);
        assert!(cache.get("9").is_none());

        cache.put("sm", "9", "Title");
        let info = cache.get("9").unwrap();
        assert_eq!(info.kind, "sm");
        assert_eq!(info.title.as_deref(), Some("Title"));
        assert!(info.title_valid());
    }

    #[test]
    fn test_pending_does_not_clobber_title() {
        let cache = MetadataCache::new(10);
        cache.put("sm", "9", "Title");
        cache.put_pending("nm", "9");
        assert_eq!(cache.get("9").unwrap().kind, "sm");

        cache.put_pending("nm", "10");
        let info = cache.get("10").unwrap();
        assert_eq!(info.kind, "nm");
        assert!(!info.title_valid());

        // a later title replaces the pending entry
        cache.put("nm", "10", "Found");
        assert!(cache.get("10").unwrap().title_valid());
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = MetadataCache::new(2);
        cache.put("sm", "1", "a");
        cache.put("sm", "2", "b");
        assert!(cache.get("1").is_some());

        cache.put("sm", "3", "c");
        assert_eq!(cache.len(), 2);
        assert!(cache.get("1").is_some());
        assert!(cache.get("2").is_none());
        assert!(cache.get("3").is_some());
    }
}
