/// Failures reported by [`OrderedIndex`](crate::OrderedIndex) and
/// [`ListPool`](crate::ListPool).
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum IndexError {
    /// The node limit was reached or node storage could not grow.
    #[error("no node storage left")]
    OutOfNodes,
    #[error("key {0:#x} is already present")]
    DuplicateKey(u64),
    /// The handle does not refer to a live node.
    #[error("stale or foreign node handle")]
    InvalidHandle,
    /// A structural self-check failed.
    #[error("index corrupted: {0}")]
    Corrupted(&'static str),
}
