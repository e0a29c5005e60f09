use crate::driver::DriverError;
use crate::memory::Status;
use thiserror::Error;

/// An error raised by a virtual memory operation.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// The underlying driver call failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// The allocation is not in a state that permits the operation.
    #[error("can't {operation} an allocation in the {status:?} state")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The state the allocation was found in.
        status: Status,
    },

    /// An allocation with the same handle key is already registered.
    #[error("an allocation with handle key {key:#x} is already registered")]
    DuplicateHandle {
        /// The conflicting handle key.
        key: u64,
    },

    /// Zero-sized allocations are rejected.
    #[error("can't allocate zero bytes")]
    ZeroAllocation,

    /// No virtual address allocator is active on the stack.
    #[error("no virtual address allocator is active")]
    EmptyAllocatorStack,
}
