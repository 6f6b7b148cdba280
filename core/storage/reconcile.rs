use crate::storage::btree::PageRef;
use crate::storage::cache::Session;
use crate::Result;

/// Reconciliation: the external process that turns a dirty in-memory page
/// into its next durable form. The eviction core calls it synchronously
/// while holding the page exclusively.
pub trait Reconciler {
    /// Serialize `page`. On success exactly one of the page's
    /// reconciliation-outcome flags is set, the page's modify record holds
    /// the matching [`RecOutcome`](crate::RecOutcome), and the dirty flag
    /// is clear.
    fn reconcile(&self, session: &Session, page: &PageRef) -> Result<()>;

    /// Resolve side allocations staged on the page's modify record during
    /// reconciliation. Called once per page as it is discarded.
    fn track_wrapup(&self, session: &Session, page: &PageRef) -> Result<()>;
}
