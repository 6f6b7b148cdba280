use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::assert::{assert_send_sync, chert_assert, chert_debug_assert};
use crate::storage::block::{Addr, BlockManager};

/// Page has been modified since it was last reconciled.
const PAGE_DIRTY: usize = 0b00001;
/// Reconciliation found no live content; the page is merged into its
/// parent when the parent is evicted.
pub const PAGE_REC_EMPTY: usize = 0b00010;
/// Reconciliation produced a single replacement on-disk image.
pub const PAGE_REC_REPLACE: usize = 0b00100;
/// Reconciliation produced a new interior page replacing this one.
pub const PAGE_REC_SPLIT: usize = 0b01000;
/// Transient interior page created by another page's split; absorbed by
/// its parent on the parent's eviction, never written on its own.
pub const PAGE_REC_SPLIT_MERGE: usize = 0b10000;
/// Mask of the mutually exclusive reconciliation-outcome flags.
pub const PAGE_REC_MASK: usize =
    PAGE_REC_EMPTY | PAGE_REC_REPLACE | PAGE_REC_SPLIT | PAGE_REC_SPLIT_MERGE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    TableLeaf,
    TableInterior,
    IndexLeaf,
    IndexInterior,
}

impl PageType {
    pub fn is_interior(&self) -> bool {
        matches!(self, PageType::TableInterior | PageType::IndexInterior)
    }

    pub fn is_leaf(&self) -> bool {
        !self.is_interior()
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PageType::TableLeaf => "table leaf",
            PageType::TableInterior => "table interior",
            PageType::IndexLeaf => "index leaf",
            PageType::IndexInterior => "index interior",
        };
        f.write_str(s)
    }
}

/// State of a tree edge, the single serialization point between the
/// lock-free read path and the locking eviction path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefState {
    /// Not resident; the edge's address names the on-disk image.
    Disk,
    /// Resident and available to readers.
    Mem,
    /// Resident but reserved by an evictor.
    Locked,
    /// Being instantiated from disk by a reader.
    Reading,
}

/// Atomic wrapper for [`RefState`].
///
/// All accesses are sequentially consistent: the evictor's
/// store-`Locked`-then-scan-hazards must pair with the reader's
/// publish-hazard-then-reload-state so that at least one side observes
/// the other.
#[derive(Debug)]
pub struct AtomicRefState(AtomicU8);

impl AtomicRefState {
    #[inline]
    fn to_storage(val: RefState) -> u8 {
        match val {
            RefState::Disk => 0,
            RefState::Mem => 1,
            RefState::Locked => 2,
            RefState::Reading => 3,
        }
    }

    #[inline]
    fn from_storage(val: u8) -> RefState {
        match val {
            0 => RefState::Disk,
            1 => RefState::Mem,
            2 => RefState::Locked,
            3 => RefState::Reading,
            _ => panic!("Invalid RefState discriminant: {val}"),
        }
    }

    #[inline]
    pub const fn new(val: RefState) -> Self {
        let storage = match val {
            RefState::Disk => 0,
            RefState::Mem => 1,
            RefState::Locked => 2,
            RefState::Reading => 3,
        };
        Self(AtomicU8::new(storage))
    }

    #[inline]
    pub fn get(&self) -> RefState {
        Self::from_storage(self.0.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn set(&self, val: RefState) {
        self.0.store(Self::to_storage(val), Ordering::SeqCst)
    }

    #[inline]
    pub fn swap(&self, val: RefState) -> RefState {
        Self::from_storage(self.0.swap(Self::to_storage(val), Ordering::SeqCst))
    }
}

/// The owned half of an edge: the resident page (if any) and the
/// persistent address of the on-disk image (if any).
#[derive(Debug)]
pub struct RefSlot {
    pub page: Option<PageRef>,
    pub addr: Option<Addr>,
}

/// A tree edge: a slot in an interior page (or the tree head) naming one
/// child. Readers traverse edges lock-free; evictors serialize through
/// the edge state.
#[derive(Debug)]
pub struct Ref {
    state: AtomicRefState,
    /// Lock-free mirror of `slot.page`; readers publish hazard references
    /// against this pointer before touching the slot.
    page_ptr: AtomicPtr<Page>,
    slot: UnsafeCell<RefSlot>,
}

// SAFETY: the slot is mutated only by the edge's exclusive owner (the
// evictor holding state Locked, or single-threaded construction); readers
// reach it only after the hazard handshake has excluded such an owner.
unsafe impl Send for Ref {}
unsafe impl Sync for Ref {}

impl Ref {
    fn new(state: RefState, page: Option<PageRef>, addr: Option<Addr>) -> Arc<Ref> {
        let page_ptr = page
            .as_ref()
            .map_or(ptr::null_mut(), |p| Arc::as_ptr(p) as *mut Page);
        Arc::new(Ref {
            state: AtomicRefState::new(state),
            page_ptr: AtomicPtr::new(page_ptr),
            slot: UnsafeCell::new(RefSlot { page, addr }),
        })
    }

    pub fn new_mem(page: PageRef, addr: Option<Addr>) -> Arc<Ref> {
        Ref::new(RefState::Mem, Some(page), addr)
    }

    pub fn new_disk(addr: Addr) -> Arc<Ref> {
        Ref::new(RefState::Disk, None, Some(addr))
    }

    pub fn state(&self) -> RefState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: RefState) {
        self.state.set(state)
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) fn slot(&self) -> &mut RefSlot {
        unsafe { &mut *self.slot.get() }
    }

    /// The resident page. Callers must hold the edge exclusively or a
    /// validated hazard reference on the page.
    pub fn page(&self) -> Option<PageRef> {
        self.slot().page.clone()
    }

    pub fn addr(&self) -> Option<Addr> {
        self.slot().addr.clone()
    }

    /// Raw page pointer for the hazard protocol; null when nothing is
    /// resident. Safe to load from any thread, never dereferenced here.
    pub(crate) fn page_raw(&self) -> *mut Page {
        self.page_ptr.load(Ordering::SeqCst)
    }

    /// Replace the resident page and its lock-free mirror. Exclusive
    /// owner only; the caller publishes the edge state afterwards.
    pub(crate) fn install_page(&self, page: Option<PageRef>) {
        let ptr = page
            .as_ref()
            .map_or(ptr::null_mut(), |p| Arc::as_ptr(p) as *mut Page);
        self.slot().page = page;
        self.page_ptr.store(ptr, Ordering::SeqCst);
    }
}

/// The reconciliation outcome recorded on a page's modify record.
#[derive(Debug, Clone)]
pub enum RecOutcome {
    /// No live content; the page merges away.
    Empty,
    /// One replacement on-disk image.
    Replace { addr: Addr },
    /// A new interior page replacing this one.
    Split { page: PageRef },
}

/// Reconciliation output attached to a page, written only by the
/// reconciler while the page is held exclusively.
#[derive(Debug)]
pub struct PageModify {
    pub outcome: RecOutcome,
    /// Addresses staged during reconciliation, resolved by track-wrapup
    /// when the page is discarded.
    pub track: Vec<Addr>,
}

impl PageModify {
    pub fn new(outcome: RecOutcome) -> Self {
        Self {
            outcome,
            track: Vec::new(),
        }
    }
}

pub struct PageInner {
    pub flags: AtomicUsize,
    pub id: usize,
    pub page_type: PageType,
    /// Read generation, refreshed from the cache when the page is touched;
    /// the eviction server prefers low-generation pages.
    pub read_gen: AtomicU64,
    /// Back-pointer to the parent page, for navigation only. `None` marks
    /// the root.
    pub parent: Option<Weak<Page>>,
    /// Back-pointer to the edge that owns this page. Non-owning: the edge
    /// owns the page, never the reverse.
    pub parent_ref: Option<Weak<Ref>>,
    pub modify: Option<PageModify>,
    /// Ordered child edges; non-empty only for interior pages. Fixed at
    /// construction, never resized.
    pub children: Vec<Arc<Ref>>,
}

#[derive(Debug)]
pub struct Page {
    inner: UnsafeCell<PageInner>,
}

// SAFETY: Page state is either atomic (flags, read generation) or mutated
// only while the owning edge is held exclusively per the edge-state
// protocol.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

pub type PageRef = Arc<Page>;

impl Page {
    pub fn new(id: usize, page_type: PageType) -> Self {
        Self {
            inner: UnsafeCell::new(PageInner {
                flags: AtomicUsize::new(0),
                id,
                page_type,
                read_gen: AtomicU64::new(0),
                parent: None,
                parent_ref: None,
                modify: None,
                children: Vec::new(),
            }),
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn get(&self) -> &mut PageInner {
        unsafe { &mut *self.inner.get() }
    }

    pub fn id(&self) -> usize {
        self.get().id
    }

    pub fn page_type(&self) -> PageType {
        self.get().page_type
    }

    pub fn is_interior(&self) -> bool {
        self.get().page_type.is_interior()
    }

    /// The root page is the one page not owned by an interior page.
    pub fn is_root(&self) -> bool {
        self.get().parent.is_none()
    }

    pub fn parent(&self) -> Option<PageRef> {
        self.get().parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn parent_ref(&self) -> Option<Arc<Ref>> {
        self.get().parent_ref.as_ref().and_then(Weak::upgrade)
    }

    pub fn children(&self) -> &[Arc<Ref>] {
        &self.get().children
    }

    pub fn is_dirty(&self) -> bool {
        self.get().flags.load(Ordering::Acquire) & PAGE_DIRTY != 0
    }

    pub fn set_dirty(&self) {
        tracing::debug!("set_dirty(page={})", self.id());
        self.get().flags.fetch_or(PAGE_DIRTY, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        tracing::debug!("clear_dirty(page={})", self.id());
        self.get().flags.fetch_and(!PAGE_DIRTY, Ordering::Release);
    }

    /// The reconciliation-outcome bits currently set (at most one).
    pub fn rec_flags(&self) -> usize {
        self.get().flags.load(Ordering::Acquire) & PAGE_REC_MASK
    }

    pub fn has_rec_flag(&self, flag: usize) -> bool {
        chert_debug_assert!(flag & !PAGE_REC_MASK == 0);
        self.get().flags.load(Ordering::Acquire) & flag != 0
    }

    /// Record a reconciliation outcome, replacing any previous one. The
    /// outcome flags are mutually exclusive.
    pub fn set_rec_flag(&self, flag: usize) {
        chert_assert!(
            flag & !PAGE_REC_MASK == 0 && flag.count_ones() == 1,
            "invalid reconciliation flag {flag:#x}"
        );
        let flags = &self.get().flags;
        flags.fetch_and(!PAGE_REC_MASK, Ordering::Release);
        flags.fetch_or(flag, Ordering::Release);
    }

    pub fn clear_rec_flags(&self) {
        self.get().flags.fetch_and(!PAGE_REC_MASK, Ordering::Release);
    }

    pub fn read_gen(&self) -> u64 {
        self.get().read_gen.load(Ordering::Acquire)
    }

    pub fn set_read_gen(&self, gen: u64) {
        self.get().read_gen.store(gen, Ordering::Release)
    }

    pub fn modify(&self) -> Option<&PageModify> {
        self.get().modify.as_ref()
    }

    pub fn set_modify(&self, modify: PageModify) {
        self.get().modify = Some(modify);
    }
}

/// Sever a page's owned structure once it leaves the tree: child edges
/// and the modify record are dropped; the memory itself is released when
/// the last reference goes away.
pub(crate) fn page_out(page: &PageRef) {
    tracing::trace!("page_out(page={})", page.id());
    let inner = page.get();
    inner.children.clear();
    inner.modify = None;
}

/// Append an in-memory child to an interior page, wiring the child's
/// navigation back-pointers.
pub fn btree_link_child(parent: &PageRef, child: &PageRef, addr: Option<Addr>) -> Arc<Ref> {
    chert_debug_assert!(parent.is_interior(), "only interior pages have children");
    let r = Ref::new_mem(child.clone(), addr);
    child.get().parent = Some(Arc::downgrade(parent));
    child.get().parent_ref = Some(Arc::downgrade(&r));
    parent.get().children.push(r.clone());
    r
}

/// Append an on-disk child edge to an interior page.
pub fn btree_link_disk_child(parent: &PageRef, addr: Addr) -> Arc<Ref> {
    chert_debug_assert!(parent.is_interior(), "only interior pages have children");
    let r = Ref::new_disk(addr);
    parent.get().children.push(r.clone());
    r
}

/// A tree head: the root edge plus the durable root address.
///
/// The durable root address lives here, not on the root edge; a root edge
/// in state `Disk` with no address means "consult the tree head" (or, when
/// the head holds no address either, an empty tree).
pub struct Btree {
    pub(crate) root: Arc<Ref>,
    pub(crate) root_addr: Mutex<Option<Addr>>,
    /// Set when the root address changes; the next checkpoint must
    /// rewrite the tree's root information.
    pub(crate) root_update: AtomicBool,
    pub(crate) block: Arc<dyn BlockManager>,
}

impl Btree {
    pub fn new(
        root_page: PageRef,
        root_addr: Option<Addr>,
        block: Arc<dyn BlockManager>,
    ) -> Btree {
        let root = Ref::new_mem(root_page.clone(), None);
        root_page.get().parent = None;
        root_page.get().parent_ref = Some(Arc::downgrade(&root));
        Btree {
            root,
            root_addr: Mutex::new(root_addr),
            root_update: AtomicBool::new(false),
            block,
        }
    }

    pub fn root(&self) -> &Arc<Ref> {
        &self.root
    }

    pub fn root_page(&self) -> Option<PageRef> {
        self.root.page()
    }

    pub fn root_addr(&self) -> Option<Addr> {
        self.root_addr.lock().clone()
    }

    pub fn root_update(&self) -> bool {
        self.root_update.load(Ordering::Acquire)
    }
}

assert_send_sync!(Page, Ref, Btree);

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopBlock;
    impl BlockManager for NoopBlock {
        fn free(&self, _addr: &Addr) -> crate::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_rec_flags_mutually_exclusive() {
        let page = Page::new(1, PageType::TableLeaf);
        page.set_rec_flag(PAGE_REC_EMPTY);
        assert_eq!(page.rec_flags(), PAGE_REC_EMPTY);
        page.set_rec_flag(PAGE_REC_REPLACE);
        assert_eq!(page.rec_flags(), PAGE_REC_REPLACE);
        page.clear_rec_flags();
        assert_eq!(page.rec_flags(), 0);
    }

    #[test]
    fn test_rec_flags_do_not_disturb_dirty() {
        let page = Page::new(1, PageType::TableLeaf);
        page.set_dirty();
        page.set_rec_flag(PAGE_REC_SPLIT);
        assert!(page.is_dirty());
        page.clear_rec_flags();
        assert!(page.is_dirty());
        page.clear_dirty();
        assert!(!page.is_dirty());
    }

    #[test]
    #[should_panic(expected = "invalid reconciliation flag")]
    fn test_rec_flag_rejects_combined_bits() {
        let page = Page::new(1, PageType::TableLeaf);
        page.set_rec_flag(PAGE_REC_EMPTY | PAGE_REC_SPLIT);
    }

    #[test]
    fn test_atomic_ref_state_swap() {
        let state = AtomicRefState::new(RefState::Mem);
        assert_eq!(state.get(), RefState::Mem);
        assert_eq!(state.swap(RefState::Locked), RefState::Mem);
        assert_eq!(state.get(), RefState::Locked);
        state.set(RefState::Disk);
        assert_eq!(state.get(), RefState::Disk);
    }

    #[test]
    fn test_link_child_wires_back_pointers() {
        let parent = Arc::new(Page::new(1, PageType::TableInterior));
        let child = Arc::new(Page::new(2, PageType::TableLeaf));
        let r = btree_link_child(&parent, &child, Some(Addr::new(vec![0xA0], 8)));

        assert_eq!(r.state(), RefState::Mem);
        assert_eq!(parent.children().len(), 1);
        assert!(Arc::ptr_eq(&child.parent().unwrap(), &parent));
        assert!(Arc::ptr_eq(&child.parent_ref().unwrap(), &r));
        assert_eq!(r.page_raw(), Arc::as_ptr(&child) as *mut Page);
    }

    #[test]
    fn test_disk_edge_holds_addr_only() {
        let parent = Arc::new(Page::new(1, PageType::IndexInterior));
        let r = btree_link_disk_child(&parent, Addr::new(vec![0xB0, 0xB1], 16));
        assert_eq!(r.state(), RefState::Disk);
        assert!(r.page().is_none());
        assert!(r.page_raw().is_null());
        assert_eq!(r.addr().unwrap().size, 16);
    }

    #[test]
    fn test_install_page_updates_mirror() {
        let parent = Arc::new(Page::new(1, PageType::TableInterior));
        let child = Arc::new(Page::new(2, PageType::TableLeaf));
        let r = btree_link_child(&parent, &child, None);

        r.install_page(None);
        assert!(r.page().is_none());
        assert!(r.page_raw().is_null());

        let other = Arc::new(Page::new(3, PageType::TableLeaf));
        r.install_page(Some(other.clone()));
        assert_eq!(r.page_raw(), Arc::as_ptr(&other) as *mut Page);
    }

    #[test]
    fn test_btree_root_wiring() {
        let root_page = Arc::new(Page::new(1, PageType::TableInterior));
        let btree = Btree::new(root_page.clone(), None, Arc::new(NoopBlock));

        assert!(root_page.is_root());
        assert!(Arc::ptr_eq(
            &root_page.parent_ref().unwrap(),
            btree.root()
        ));
        assert!(Arc::ptr_eq(&btree.root_page().unwrap(), &root_page));
        assert!(!btree.root_update());
    }

    #[test]
    fn test_page_type_display() {
        assert_eq!(PageType::TableLeaf.to_string(), "table leaf");
        assert_eq!(PageType::IndexInterior.to_string(), "index interior");
        assert!(PageType::TableInterior.is_interior());
        assert!(PageType::IndexLeaf.is_leaf());
    }
}
