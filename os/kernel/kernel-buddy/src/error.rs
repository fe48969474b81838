/// Errors reported by a [`MemorySpace`](crate::MemorySpace).
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BuddyError {
    /// Malformed range, misaligned location or undersized scratch memory.
    #[error("bad parameter")]
    BadParameter,
    /// The request is zero or larger than the maximum buffer size.
    #[error("unsupported buffer size")]
    Unsupported,
    /// No free buffer of a fitting size (and color) is left.
    #[error("no free buffers")]
    NoBuffers,
    /// The supplied scratch memory does not cover the requested blocks.
    #[error("out of memory")]
    OutOfMemory,
    /// The space was destroyed.
    #[error("invalid memory space handle")]
    InvalidHandle,
    /// The space is being destroyed, or the operation does not apply to it.
    #[error("operation failed")]
    Failure,
}
