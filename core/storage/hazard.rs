use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::assert::{chert_assert, chert_debug_assert};
use crate::storage::btree::Page;
use crate::{ChertError, Result};

/// One hazard slot: the address of a page a reader is using, or null when
/// the slot is free. Slots are written only by their owning session; the
/// evictor reads the whole table.
struct HazardSlot {
    page: AtomicPtr<Page>,
}

/// The connection-wide hazard reference table, `sessions` rows of
/// `slots_per_session` slots each, stored flat.
pub struct HazardTable {
    slots: Box<[HazardSlot]>,
    sessions: usize,
    slots_per_session: usize,
}

impl HazardTable {
    pub(crate) fn new(sessions: usize, slots_per_session: usize) -> HazardTable {
        chert_assert!(
            sessions > 0 && slots_per_session > 0,
            "hazard table must have at least one slot"
        );
        let slots = (0..sessions * slots_per_session)
            .map(|_| HazardSlot {
                page: AtomicPtr::new(ptr::null_mut()),
            })
            .collect();
        HazardTable {
            slots,
            sessions,
            slots_per_session,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.sessions * self.slots_per_session
    }

    fn session_slots(&self, session: usize) -> &[HazardSlot] {
        chert_debug_assert!(session < self.sessions, "session index out of range");
        let start = session * self.slots_per_session;
        &self.slots[start..start + self.slots_per_session]
    }

    /// Publish a hazard reference in one of the session's slots.
    ///
    /// The sequentially consistent store pairs with the evictor's
    /// lock-then-scan: a reader that publishes and then re-reads the edge
    /// state is guaranteed that either it sees the edge locked, or the
    /// evictor sees this reference in its snapshot.
    pub(crate) fn set(&self, session: usize, page: *mut Page) -> Result<()> {
        for slot in self.session_slots(session) {
            if slot.page.load(Ordering::Relaxed).is_null() {
                slot.page.store(page, Ordering::SeqCst);
                return Ok(());
            }
        }
        Err(ChertError::Busy("session is out of hazard slots"))
    }

    /// Withdraw a previously published hazard reference.
    pub(crate) fn clear(&self, session: usize, page: *mut Page) {
        for slot in self.session_slots(session) {
            if slot.page.load(Ordering::Relaxed) == page {
                slot.page.store(ptr::null_mut(), Ordering::SeqCst);
                return;
            }
        }
        chert_debug_assert!(false, "hazard reference to clear was not found");
    }

    /// Copy the live hazard references into `snapshot`, compacted and
    /// sorted by page address so the evictor can binary-search it. The
    /// buffer is caller-owned scratch, reused across retries.
    pub(crate) fn copy_into(&self, snapshot: &mut Vec<*const Page>) {
        snapshot.clear();
        for slot in self.slots.iter() {
            let page = slot.page.load(Ordering::SeqCst);
            if page.is_null() {
                continue;
            }
            snapshot.push(page as *const Page);
        }
        snapshot.sort_unstable();
    }
}
