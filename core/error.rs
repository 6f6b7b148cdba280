use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChertError {
    /// A non-fatal eviction block: a reader holds a hazard reference, a
    /// child edge is busy, or a child cannot be merged yet. The tree has
    /// been restored to its pre-call state; the caller selects another
    /// victim or retries later.
    #[error("Cache operation blocked: {0}")]
    Busy(&'static str),
    #[error("Corrupt tree: {0}")]
    Corrupt(String),
    #[error("Block manager error: {0}")]
    Block(String),
    #[error("Reconciliation error: {0}")]
    Reconcile(String),
}
