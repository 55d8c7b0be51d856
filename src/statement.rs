//! Server side statement and portal identity, and the prepared statement
//! cache.
use std::{
    num::NonZeroUsize,
    sync::Arc,
    sync::atomic::{AtomicU32, Ordering},
};

use lru::LruCache;

use crate::protocol::{Oid, backend::FieldDescription};

/// A generated server side object name.
///
/// `None` is the unnamed statement or portal, which the wire selects with
/// an empty string. Generated names are `pw_s<n>` / `pw_p<n>` from a
/// process wide counter, so a name is never reissued within one process
/// and cannot collide with user prepared statements unless they adopt the
/// driver prefix.
#[derive(Clone, PartialEq, Eq)]
pub struct WireName(Option<Arc<str>>);

impl WireName {
    fn unnamed() -> Self {
        Self(None)
    }

    fn generate(kind: char, counter: &AtomicU32) -> Self {
        let n = counter.fetch_add(1, Ordering::Relaxed);
        let mut name = String::with_capacity(14);
        name.push_str("pw_");
        name.push(kind);
        name.push_str(itoa::Buffer::new().format(n));
        Self(Some(name.into()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_deref().unwrap_or("")
    }

    pub fn is_unnamed(&self) -> bool {
        self.0.is_none()
    }
}

impl std::fmt::Display for WireName {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for WireName {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("WireName").field(&self.as_str()).finish()
    }
}

impl AsRef<str> for WireName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

macro_rules! wire_name {
    ($(#[$doc:meta])* $name:ident, $kind:literal) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq)]
        pub struct $name(WireName);

        impl $name {
            pub(crate) fn unnamed() -> Self {
                Self(WireName::unnamed())
            }

            pub(crate) fn next() -> Self {
                static COUNTER: AtomicU32 = AtomicU32::new(0);
                Self(WireName::generate($kind, &COUNTER))
            }
        }

        impl std::ops::Deref for $name {
            type Target = WireName;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.as_str()).finish()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_name! {
    /// Name of a server side prepared statement.
    StatementName, 's'
}
wire_name! {
    /// Name of a server side portal.
    PortalName, 'p'
}

/// A named prepared statement on the backend.
///
/// Shared between the cache and in-flight executions; the server side name
/// stays live for as long as any holder keeps the handle.
#[derive(Debug)]
pub struct StoredStatement {
    /// The generated wire name.
    pub name: StatementName,
    /// Parameter type Oids, populated from `ParameterDescription`.
    pub param_oids: Vec<Oid>,
    /// Result column descriptors, populated from `RowDescription` of a
    /// statement Describe; `None` for statements returning no rows.
    pub fields: Option<Vec<FieldDescription>>,
    /// Source sql length, the unit of the cache byte watermark.
    pub sql_bytes: usize,
}

/// LRU cache of server side prepared statements, sized by entry count and
/// by total source bytes.
///
/// Eviction does not talk to the server; evicted names are queued and the
/// connection piggy-backs `Close(statement)` on the next Sync.
pub struct StatementCache {
    stmts: LruCache<u64, Arc<StoredStatement>>,
    /// Per-sql execution counter driving the prepare threshold.
    uses: LruCache<u64, u32>,
    bytes: usize,
    max_bytes: usize,
    pending_close: Vec<StatementName>,
}

impl std::fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("StatementCache")
            .field("len", &self.stmts.len())
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl StatementCache {
    pub fn new(max_queries: NonZeroUsize, max_bytes: usize) -> Self {
        Self {
            stmts: LruCache::new(max_queries),
            uses: LruCache::new(
                max_queries.saturating_mul(NonZeroUsize::new(8).unwrap()),
            ),
            bytes: 0,
            max_bytes,
            pending_close: Vec::new(),
        }
    }

    /// Look up a live prepared statement, refreshing its recency.
    pub fn get(&mut self, sqlid: u64) -> Option<Arc<StoredStatement>> {
        self.stmts.get(&sqlid).cloned()
    }

    /// Bump and return the per-sql execution counter.
    pub fn note_use(&mut self, sqlid: u64) -> u32 {
        match self.uses.get_mut(&sqlid) {
            Some(n) => {
                *n = n.saturating_add(1);
                *n
            }
            None => {
                self.uses.put(sqlid, 1);
                1
            }
        }
    }

    /// Insert a freshly prepared statement, evicting by count then by byte
    /// watermark.
    pub fn insert(&mut self, sqlid: u64, stmt: Arc<StoredStatement>) {
        self.bytes += stmt.sql_bytes;
        if let Some((_, evicted)) = self.stmts.push(sqlid, stmt) {
            self.evict(evicted);
        }
        while self.bytes > self.max_bytes && self.stmts.len() > 1 {
            let Some((_, evicted)) = self.stmts.pop_lru() else {
                break;
            };
            self.evict(evicted);
        }
    }

    fn evict(&mut self, stmt: Arc<StoredStatement>) {
        self.bytes -= stmt.sql_bytes.min(self.bytes);
        self.pending_close.push(stmt.name.clone());
    }

    /// Server names queued for a lazy `Close(statement)`.
    pub fn take_pending_close(&mut self) -> Vec<StatementName> {
        std::mem::take(&mut self.pending_close)
    }

    /// Drop every entry without queueing closes; used after
    /// `DEALLOCATE ALL` made the names gone server side.
    pub fn clear(&mut self) {
        self.stmts.clear();
        self.uses.clear();
        self.bytes = 0;
        self.pending_close.clear();
    }

    pub fn len(&self) -> usize {
        self.stmts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn stored(sql_bytes: usize) -> Arc<StoredStatement> {
        Arc::new(StoredStatement {
            name: StatementName::next(),
            param_oids: vec![],
            fields: None,
            sql_bytes,
        })
    }

    #[test]
    fn generated_names_are_unique() {
        let a = StatementName::next();
        let b = StatementName::next();
        assert_ne!(a.as_str(), b.as_str());
        assert!(a.as_str().starts_with("pw_s"));
        assert!(PortalName::next().as_str().starts_with("pw_p"));
        assert!(PortalName::unnamed().as_str().is_empty());
        assert!(PortalName::unnamed().is_unnamed());
    }

    #[test]
    fn count_eviction_queues_close() {
        let mut cache = StatementCache::new(NonZeroUsize::new(2).unwrap(), usize::MAX);
        cache.insert(1, stored(10));
        cache.insert(2, stored(10));
        cache.insert(3, stored(10));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.take_pending_close().len(), 1);
        assert!(cache.get(1).is_none());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn byte_watermark_evicts_lru() {
        let mut cache = StatementCache::new(NonZeroUsize::new(16).unwrap(), 100);
        cache.insert(1, stored(60));
        cache.insert(2, stored(60));
        // 120 bytes > 100, entry 1 is least recently used
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
        assert_eq!(cache.take_pending_close().len(), 1);
    }

    #[test]
    fn use_counter_increments() {
        let mut cache = StatementCache::new(NonZeroUsize::new(4).unwrap(), usize::MAX);
        assert_eq!(cache.note_use(7), 1);
        assert_eq!(cache.note_use(7), 2);
        assert_eq!(cache.note_use(8), 1);
    }

    #[test]
    fn clear_forgets_pending_closes() {
        let mut cache = StatementCache::new(NonZeroUsize::new(1).unwrap(), usize::MAX);
        cache.insert(1, stored(1));
        cache.insert(2, stored(1));
        cache.clear();
        assert!(cache.take_pending_close().is_empty());
        assert!(cache.is_empty());
    }
}
