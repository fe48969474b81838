use kernel_buddy::BuddyError;
use kernel_heap::HeapError;

/// Errors reported by the heap manager.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapMgrError {
    /// Oversized request, foreign address or unusable mapper window.
    #[error("bad parameter")]
    BadParameter,
    /// No large pages or management memory left.
    #[error("out of memory")]
    OutOfMemory,
    /// The mapper could not find virtual address space.
    #[error("no address space")]
    NoAddressSpace,
    #[error("buddy allocator: {0}")]
    Buddy(#[from] BuddyError),
}

impl From<HeapMgrError> for HeapError {
    fn from(value: HeapMgrError) -> Self {
        match value {
            HeapMgrError::BadParameter => Self::BadParameter,
            HeapMgrError::OutOfMemory
            | HeapMgrError::NoAddressSpace
            | HeapMgrError::Buddy(BuddyError::NoBuffers | BuddyError::OutOfMemory) => {
                Self::OutOfMemory
            }
            HeapMgrError::Buddy(_) => Self::Failure,
        }
    }
}
