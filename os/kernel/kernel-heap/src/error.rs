/// Errors reported by heap creation, growth and destruction.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("invalid heap parameter")]
    BadParameter,
    #[error("no memory available for the heap")]
    OutOfMemory,
    #[error("heap operation failed")]
    Failure,
    #[error("heap is busy logging its users")]
    Busy,
    #[error("heap destroyed while allocations were outstanding")]
    NonEmpty,
}
