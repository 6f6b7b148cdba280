use std::cell::RefCell;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::assert::assert_send_sync;
use crate::storage::btree::{Page, PageRef, Ref, RefState};
use crate::storage::hazard::HazardTable;
use crate::{ChertError, Result};

const DEFAULT_SESSIONS: usize = 32;
const DEFAULT_HAZARD_SLOTS: usize = 15;

#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
    /// Maximum number of concurrently open sessions.
    pub sessions: usize,
    /// Hazard slots reserved per session.
    pub hazard_slots: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            sessions: DEFAULT_SESSIONS,
            hazard_slots: DEFAULT_HAZARD_SLOTS,
        }
    }
}

/// Eviction counters, kept as plain atomics so any thread can bump them.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Interior pages evicted during normal operation.
    pub evict_internal: AtomicU64,
    /// Clean pages evicted.
    pub evict_unmodified: AtomicU64,
    /// Reconciled pages evicted.
    pub evict_modified: AtomicU64,
    /// Eviction requests that targeted a split-merge page and were skipped.
    pub evict_split_merge: AtomicU64,
    /// Hazard conflicts observed while acquiring exclusivity.
    pub evict_hazard: AtomicU64,
    /// Exclusivity attempts abandoned because of a hazard conflict.
    pub evict_hazard_fail: AtomicU64,
}

/// Shared cache state: the hazard table, the read generation, and the
/// eviction counters.
pub struct Cache {
    pub(crate) hazard: HazardTable,
    read_gen: AtomicU64,
    stats: CacheStats,
    next_session: AtomicUsize,
    sessions: usize,
}

impl Cache {
    pub fn new(options: CacheOptions) -> Arc<Cache> {
        Arc::new(Cache {
            hazard: HazardTable::new(options.sessions, options.hazard_slots),
            read_gen: AtomicU64::new(0),
            stats: CacheStats::default(),
            next_session: AtomicUsize::new(0),
            sessions: options.sessions,
        })
    }

    /// Allocate a session slot. Each thread of control gets its own
    /// session; slots are not recycled.
    pub fn open_session(self: &Arc<Self>) -> Result<Session> {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        if id >= self.sessions {
            return Err(ChertError::Busy("session slots exhausted"));
        }
        Ok(Session {
            id,
            cache: self.clone(),
            snapshot: RefCell::new(Vec::with_capacity(self.hazard.capacity())),
        })
    }

    pub fn read_gen(&self) -> u64 {
        self.read_gen.load(Ordering::Acquire)
    }

    /// Advance and return the read generation; pages are stamped with it
    /// as they are touched.
    pub fn read_gen_next(&self) -> u64 {
        self.read_gen.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

/// Per-thread handle on the cache: a hazard slot row plus scratch space
/// for the evictor's hazard snapshots.
pub struct Session {
    id: usize,
    cache: Arc<Cache>,
    /// Snapshot scratch, reused across exclusivity retries to keep the
    /// hot path allocation-free.
    snapshot: RefCell<Vec<*const Page>>,
}

// SAFETY: the snapshot buffer holds page addresses for ordering
// comparisons only; they are never dereferenced through this buffer.
unsafe impl Send for Session {}

impl Session {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Publish a hazard reference on `page`. The caller must re-validate
    /// the edge it came from before relying on the page.
    pub fn hazard_publish(&self, page: &PageRef) -> Result<()> {
        self.cache
            .hazard
            .set(self.id, Arc::as_ptr(page) as *mut Page)
    }

    /// Withdraw a hazard reference published by this session.
    pub fn hazard_withdraw(&self, page: &PageRef) {
        self.cache
            .hazard
            .clear(self.id, Arc::as_ptr(page) as *mut Page);
    }

    /// The reader half of the hazard handshake: publish a reference on
    /// the edge's resident page, then re-validate the edge. Returns the
    /// protected page, or `None` when the edge is not readable (being
    /// evicted, loaded, or not resident).
    pub fn hazard_acquire<'s>(&'s self, r: &Ref) -> Result<Option<HazardGuard<'s>>> {
        if r.state() != RefState::Mem {
            return Ok(None);
        }
        let ptr = r.page_raw();
        if ptr.is_null() {
            return Ok(None);
        }
        self.cache.hazard.set(self.id, ptr)?;
        // Re-check: if an evictor locked the edge after we read it, the
        // published reference may not have been seen; back off.
        if r.state() == RefState::Mem && r.page_raw() == ptr {
            let page = r.page().expect("an edge in memory must hold a page");
            Ok(Some(HazardGuard {
                session: self,
                page,
            }))
        } else {
            self.cache.hazard.clear(self.id, ptr);
            Ok(None)
        }
    }

    /// Rebuild the hazard snapshot and look `page` up in it. Hazard
    /// references are transient, so the snapshot is rebuilt on every call.
    pub(crate) fn hazard_present(&self, page: *const Page) -> bool {
        let mut snapshot = self.snapshot.borrow_mut();
        self.cache.hazard.copy_into(&mut snapshot);
        snapshot.binary_search(&page).is_ok()
    }
}

/// Holds a validated hazard reference; the reference is withdrawn on drop.
pub struct HazardGuard<'s> {
    session: &'s Session,
    page: PageRef,
}

impl HazardGuard<'_> {
    pub fn page(&self) -> &PageRef {
        &self.page
    }
}

impl Deref for HazardGuard<'_> {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for HazardGuard<'_> {
    fn drop(&mut self) {
        self.session.hazard_withdraw(&self.page);
    }
}

assert_send_sync!(Cache);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::PageType;

    fn small_cache() -> Arc<Cache> {
        Cache::new(CacheOptions {
            sessions: 4,
            hazard_slots: 4,
        })
    }

    #[test]
    fn test_read_gen_advances() {
        let cache = small_cache();
        assert_eq!(cache.read_gen(), 0);
        assert_eq!(cache.read_gen_next(), 1);
        assert_eq!(cache.read_gen_next(), 2);
        assert_eq!(cache.read_gen(), 2);
    }

    #[test]
    fn test_session_ids_distinct() {
        let cache = small_cache();
        let s1 = cache.open_session().unwrap();
        let s2 = cache.open_session().unwrap();
        assert_ne!(s1.id(), s2.id());
    }

    #[test]
    fn test_session_slots_exhausted() {
        let cache = Cache::new(CacheOptions {
            sessions: 1,
            hazard_slots: 1,
        });
        let _s = cache.open_session().unwrap();
        assert!(matches!(
            cache.open_session(),
            Err(ChertError::Busy(_))
        ));
    }

    #[test]
    fn test_hazard_acquire_and_release() {
        let cache = small_cache();
        let session = cache.open_session().unwrap();

        let page = Arc::new(Page::new(7, PageType::TableLeaf));
        let r = Ref::new_mem(page.clone(), None);

        {
            let guard = session.hazard_acquire(&r).unwrap().unwrap();
            assert_eq!(guard.id(), 7);
            assert!(session.hazard_present(Arc::as_ptr(&page)));
        }
        // Guard dropped: the reference is withdrawn.
        assert!(!session.hazard_present(Arc::as_ptr(&page)));
    }

    #[test]
    fn test_hazard_acquire_backs_off_locked_edge() {
        let cache = small_cache();
        let session = cache.open_session().unwrap();

        let page = Arc::new(Page::new(9, PageType::TableLeaf));
        let r = Ref::new_mem(page.clone(), None);
        r.set_state(RefState::Locked);

        assert!(session.hazard_acquire(&r).unwrap().is_none());
        assert!(!session.hazard_present(Arc::as_ptr(&page)));
    }
}
