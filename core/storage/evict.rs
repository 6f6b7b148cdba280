use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{instrument, trace, Level};

use crate::assert::{chert_assert, chert_debug_assert};
use crate::storage::block::Addr;
use crate::storage::btree::{
    page_out, Btree, Page, PageModify, PageRef, RecOutcome, Ref, RefState, PAGE_REC_EMPTY,
    PAGE_REC_REPLACE, PAGE_REC_SPLIT, PAGE_REC_SPLIT_MERGE,
};
use crate::storage::cache::Session;
use crate::storage::reconcile::Reconciler;
use crate::{ChertError, Result};

/// Root splits settle on a replacement once the new interior level fits a
/// single page; anything deeper than this is a corrupted tree, not a very
/// large bulk load.
const ROOT_SPLIT_CASCADE_MAX: usize = 100;

#[derive(Debug, Clone, Copy, Default)]
pub struct EvictFlags(pub u8);

impl EvictFlags {
    /// The caller holds tree-wide exclusivity (sync/close): skip hazard
    /// coordination and unlock-on-failure.
    pub const SINGLE: u8 = 0b01;
    /// Spin-yield on hazard contention instead of giving up.
    pub const WAIT: u8 = 0b10;

    pub fn new_single() -> Self {
        Self(EvictFlags::SINGLE)
    }

    pub fn new_wait() -> Self {
        Self(EvictFlags::WAIT)
    }

    pub fn is_single(&self) -> bool {
        (self.0 & EvictFlags::SINGLE) != 0
    }

    pub fn is_wait(&self) -> bool {
        (self.0 & EvictFlags::WAIT) != 0
    }
}

#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkEvent {
    Lock(usize),
    Unlock(usize),
}

/// Evicts one candidate page at a time: reviews and locks the page's
/// subtree, runs reconciliation for dirty pages, splices the parent edge
/// to match the reconciliation outcome, and discards what came out of the
/// tree.
pub struct Evictor<'e> {
    session: &'e Session,
    btree: &'e Btree,
    rec: &'e dyn Reconciler,
    #[cfg(test)]
    walk_log: std::cell::RefCell<Vec<WalkEvent>>,
}

impl<'e> Evictor<'e> {
    pub fn new(session: &'e Session, btree: &'e Btree, rec: &'e dyn Reconciler) -> Evictor<'e> {
        Evictor {
            session,
            btree,
            rec,
            #[cfg(test)]
            walk_log: std::cell::RefCell::new(Vec::new()),
        }
    }

    #[cfg(test)]
    fn record(&self, event: WalkEvent) {
        self.walk_log.borrow_mut().push(event);
    }

    /// Evict `page`, reconciling it first if it is dirty.
    ///
    /// Returns [`ChertError::Busy`] when the page or its subtree cannot be
    /// taken right now; every edge touched has been restored before the
    /// error surfaces.
    #[instrument(skip_all, level = Level::DEBUG)]
    pub fn evict(&self, page: &PageRef, flags: EvictFlags) -> Result<()> {
        trace!("evict(page={}, type={})", page.id(), page.page_type());

        // Merge-split pages are evicted only as a side effect of evicting
        // their parent: written on their own they would lose the merge
        // flag and permanently deepen the tree. Put the page back in use
        // with a fresh read generation so it isn't selected again soon.
        if page.has_rec_flag(PAGE_REC_SPLIT_MERGE) {
            page.set_read_gen(self.session.cache().read_gen_next());
            self.owning_ref(page).set_state(RefState::Mem);
            self.session
                .cache()
                .stats()
                .evict_split_merge
                .fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        // Get exclusive access and check the subtree for anything that
        // blocks eviction; review cleans up after itself on failure.
        self.review(page, flags)?;

        match self.evict_reviewed(page, flags) {
            Ok(()) => Ok(()),
            Err(e) => {
                if !flags.is_single() {
                    self.excl_clear(page, None);
                }
                Err(e)
            }
        }
    }

    fn evict_reviewed(&self, page: &PageRef, flags: EvictFlags) -> Result<()> {
        if page.is_dirty() {
            self.rec.reconcile(self.session, page)?;
        }

        let stats = self.session.cache().stats();
        if !flags.is_single() && page.is_interior() {
            stats.evict_internal.fetch_add(1, Ordering::Relaxed);
        }

        if page.rec_flags() == 0 {
            stats.evict_unmodified.fetch_add(1, Ordering::Relaxed);
            if page.is_root() {
                self.root_clean_update(page)
            } else {
                self.page_clean_update(page)
            }
        } else {
            stats.evict_modified.fetch_add(1, Ordering::Relaxed);
            if page.is_root() {
                self.root_dirty_update(page)
            } else {
                self.page_dirty_update(page, flags)
            }
        }
    }

    /// Splice out a clean page: the edge keeps its existing address, the
    /// page goes away.
    fn page_clean_update(&self, page: &PageRef) -> Result<()> {
        let parent_ref = self.owning_ref(page);
        chert_debug_assert!(
            parent_ref.slot().addr.is_some(),
            "clean page has no disk address"
        );
        parent_ref.install_page(None);
        parent_ref.set_state(RefState::Disk);
        self.discard(page)
    }

    fn root_clean_update(&self, page: &PageRef) -> Result<()> {
        self.btree.root.install_page(None);
        self.btree.root.set_state(RefState::Disk);
        self.discard(page)
    }

    /// Splice out a reconciled page according to its outcome.
    fn page_dirty_update(&self, page: &PageRef, flags: EvictFlags) -> Result<()> {
        let parent_ref = self.owning_ref(page);

        match page.rec_flags() {
            PAGE_REC_EMPTY => {
                // Not evicting after all: the page stays resident until a
                // parent eviction merges it away. Return it, and whatever
                // we locked below it, to use.
                if !flags.is_single() {
                    self.excl_clear(page, None);
                }
                Ok(())
            }
            PAGE_REC_REPLACE => {
                let addr = match &self.modify(page).outcome {
                    RecOutcome::Replace { addr } => addr.clone(),
                    out => unreachable!("replace flag with outcome {out:?}"),
                };
                if let Some(old) = parent_ref.slot().addr.take() {
                    if let Err(e) = self.btree.block.free(&old) {
                        parent_ref.slot().addr = Some(old);
                        return Err(e);
                    }
                }
                parent_ref.slot().addr = Some(addr);
                parent_ref.install_page(None);
                // Publish: the slot fields must be set before the state
                // change makes the edge available to readers.
                parent_ref.set_state(RefState::Disk);
                self.discard(page)
            }
            PAGE_REC_SPLIT => {
                let new_page = match &self.modify(page).outcome {
                    RecOutcome::Split { page } => page.clone(),
                    out => unreachable!("split flag with outcome {out:?}"),
                };
                new_page.get().parent = page.get().parent.clone();
                new_page.get().parent_ref = Some(Arc::downgrade(&parent_ref));
                parent_ref.install_page(Some(new_page));
                parent_ref.set_state(RefState::Mem);
                self.discard(page)
            }
            other => unreachable!("dirty update with reconciliation flags {other:#x}"),
        }
    }

    /// Install a new root address, releasing the previous one.
    fn root_addr_update(&self, addr: Option<Addr>) -> Result<()> {
        let mut root_addr = self.btree.root_addr.lock();
        if let Some(old) = root_addr.take() {
            if let Err(e) = self.btree.block.free(&old) {
                *root_addr = Some(old);
                return Err(e);
            }
        }
        *root_addr = addr;
        self.btree.root_update.store(true, Ordering::Release);
        Ok(())
    }

    fn root_dirty_update(&self, page: &PageRef) -> Result<()> {
        let root_ref = self.btree.root.clone();
        let mut page = page.clone();

        // A split of the root produces a page with no parent to absorb it
        // later, so it is written out immediately; the sync or close that
        // triggered the eviction would not see the new root during its
        // traversal otherwise. Bulk loads can cascade through several
        // split levels before settling on a replacement.
        for _ in 0..ROOT_SPLIT_CASCADE_MAX {
            let next = match page.rec_flags() {
                PAGE_REC_EMPTY => {
                    trace!("root page empty");
                    self.root_addr_update(None)?;
                    None
                }
                PAGE_REC_REPLACE => {
                    trace!("root page replaced");
                    let addr = match &self.modify(&page).outcome {
                        RecOutcome::Replace { addr } => addr.clone(),
                        out => unreachable!("replace flag with outcome {out:?}"),
                    };
                    self.root_addr_update(Some(addr))?;
                    None
                }
                PAGE_REC_SPLIT => {
                    let new_page = match &self.modify(&page).outcome {
                        RecOutcome::Split { page } => page.clone(),
                        out => unreachable!("split flag with outcome {out:?}"),
                    };
                    trace!("root page split {} -> {}", page.id(), new_page.id());
                    Some(new_page)
                }
                other => unreachable!("dirty update with reconciliation flags {other:#x}"),
            };

            let Some(next) = next else {
                root_ref.install_page(None);
                root_ref.set_state(RefState::Disk);
                return self.discard(&page);
            };

            next.get().parent = None;
            next.get().parent_ref = Some(Arc::downgrade(&root_ref));
            root_ref.install_page(Some(next.clone()));
            self.discard(&page)?;

            // Make the new root look like any other modified page, write
            // it, and deal with whatever outcome that produces.
            next.get().modify = None;
            next.clear_rec_flags();
            next.set_dirty();
            self.rec.reconcile(self.session, &next)?;
            page = next;
        }
        Err(ChertError::Corrupt(format!(
            "root split cascade exceeded {ROOT_SPLIT_CASCADE_MAX} levels"
        )))
    }

    /// Get exclusive access to the page and review it, together with any
    /// descendants that would be merged into it, for conditions that block
    /// eviction. On failure every lock taken here has been released.
    fn review(&self, page: &PageRef, flags: EvictFlags) -> Result<()> {
        let mut last_page: Option<PageRef> = None;

        if !flags.is_single() {
            self.hazard_exclusive(&self.owning_ref(page), flags.is_wait())?;
            last_page = Some(page.clone());
        }

        // Only interior pages can reference resident descendants that
        // need merge-locking; leaves are self-contained.
        let ret = if page.is_interior() {
            self.excl(page, &mut last_page, flags)
        } else {
            Ok(())
        };

        if ret.is_err() && !flags.is_single() {
            if let Some(last) = &last_page {
                self.excl_clear(page, Some(last));
            }
        }
        ret
    }

    /// Walk an interior page's subtree depth-first in child-index order,
    /// locking resident children and checking that each can be merged.
    /// `last_page` tracks the furthest page locked, the boundary for the
    /// unlock walk.
    fn excl(
        &self,
        parent: &PageRef,
        last_page: &mut Option<PageRef>,
        flags: EvictFlags,
    ) -> Result<()> {
        for r in parent.children() {
            match r.state() {
                RefState::Disk => continue,
                RefState::Locked | RefState::Reading => {
                    return Err(ChertError::Busy("child page is busy"));
                }
                RefState::Mem => {}
            }
            let page = r.page().expect("an edge in memory must hold a page");
            self.excl_page(r, &page, flags)?;
            *last_page = Some(page.clone());

            if page.is_interior() {
                self.excl(&page, last_page, flags)?;
            }
        }
        Ok(())
    }

    /// Lock one resident child and decide whether it can be merged into
    /// the eviction candidate.
    fn excl_page(&self, r: &Arc<Ref>, page: &PageRef, flags: EvictFlags) -> Result<()> {
        // Cheap test first: without one of the merge flags the child has
        // no chance of being absorbed, and the candidate cannot be
        // evicted. Not a problem, just a bad victim choice.
        if page.rec_flags() & (PAGE_REC_EMPTY | PAGE_REC_SPLIT | PAGE_REC_SPLIT_MERGE) == 0 {
            return Err(ChertError::Busy("child page cannot be merged"));
        }

        if !flags.is_single() {
            self.hazard_exclusive(r, flags.is_wait())?;
        }

        // Careful test, holding the lock: merge-split pages can always be
        // absorbed; split or empty pages only once they are clean. A
        // dirty split or empty page must be written first so the parent
        // knows what it will look like.
        if page.has_rec_flag(PAGE_REC_SPLIT_MERGE) {
            return Ok(());
        }
        if page.rec_flags() & (PAGE_REC_SPLIT | PAGE_REC_EMPTY) != 0 && !page.is_dirty() {
            return Ok(());
        }

        // Back out of the lock taken above; nothing below this child was
        // entered, so this edge is the only one to restore.
        if !flags.is_single() {
            r.set_state(RefState::Mem);
            #[cfg(test)]
            self.record(WalkEvent::Unlock(page.id()));
        }
        Err(ChertError::Busy(
            "child page must be written before it can be merged",
        ))
    }

    /// Release exclusive access over a subtree, unlocking in exactly the
    /// order pages were locked and stopping once `upto` is released.
    /// Returns true when `upto` was reached.
    fn excl_clear(&self, page: &PageRef, upto: Option<&PageRef>) -> bool {
        self.owning_ref(page).set_state(RefState::Mem);
        #[cfg(test)]
        self.record(WalkEvent::Unlock(page.id()));
        if let Some(upto) = upto {
            if Arc::ptr_eq(page, upto) {
                return true;
            }
        }

        if page.is_interior() {
            for r in page.children() {
                let state = r.state();
                if state == RefState::Disk {
                    continue;
                }
                // The acquisition walk locked everything resident it
                // passed, and a child cannot re-enter memory under a
                // locked ancestor: any other state here is a protocol
                // violation.
                chert_assert!(
                    state == RefState::Locked,
                    "child edge in state {state:?} during unlock walk"
                );
                let child = r.page().expect("a locked edge must hold a page");
                if self.excl_clear(&child, upto) {
                    return true;
                }
            }
        }
        false
    }

    /// Move an edge from `Mem` to `Locked`, respecting hazard readers.
    ///
    /// The sequentially consistent store of `Locked` pairs with the
    /// reader's publish-then-revalidate: whatever the interleaving, either
    /// the reader sees the lock and backs off, or the snapshot taken here
    /// contains the reader's hazard reference.
    fn hazard_exclusive(&self, r: &Arc<Ref>, force: bool) -> Result<()> {
        let state = r.state();
        chert_debug_assert!(
            matches!(state, RefState::Mem | RefState::Locked),
            "exclusivity requested on an edge in state {state:?}"
        );

        // Hazard references are acquired down the tree, which means this
        // cannot deadlock: readers never wait on the evictor.
        r.set_state(RefState::Locked);

        let target = r.page_raw() as *const Page;
        let stats = self.session.cache().stats();
        loop {
            // Hazard references are transient; rebuild the snapshot on
            // every pass.
            if !self.session.hazard_present(target) {
                #[cfg(test)]
                self.record(WalkEvent::Lock(
                    r.page().expect("a locked edge must hold a page").id(),
                ));
                return Ok(());
            }
            stats.evict_hazard.fetch_add(1, Ordering::Relaxed);

            if force {
                std::thread::yield_now();
                continue;
            }

            trace!("hazard conflict on page {:p}, giving up", target);
            stats.evict_hazard_fail.fetch_add(1, Ordering::Relaxed);
            r.set_state(RefState::Mem);
            return Err(ChertError::Busy("page is in use by a reader"));
        }
    }

    /// Discard pages merged into an evicted page, then the page itself.
    /// Merged descendants are by construction resident and locked, so the
    /// recursion terminates.
    fn discard(&self, page: &PageRef) -> Result<()> {
        if page.is_interior() {
            for r in page.children() {
                if r.state() == RefState::Disk {
                    continue;
                }
                let child = r.page().expect("a resident edge must hold a page");
                self.discard(&child)?;
            }
        }
        self.discard_page(page)
    }

    fn discard_page(&self, page: &PageRef) -> Result<()> {
        // Resolve whatever reconciliation staged against the page before
        // its memory goes away.
        if page.modify().is_some() {
            self.rec.track_wrapup(self.session, page)?;
        }
        page_out(page);
        Ok(())
    }

    fn modify<'p>(&self, page: &'p PageRef) -> &'p PageModify {
        page.modify()
            .expect("a reconciled page must carry a modify record")
    }

    fn owning_ref(&self, page: &PageRef) -> Arc<Ref> {
        page.parent_ref()
            .expect("page is not connected to the tree")
    }
}
