//! The allocator adapter exposing the manager to a tensor library.
//!
//! An adapter configuration carries a tag, a backing mode and a stream. The
//! configurations form a process-wide stack so that routing allocations
//! through virtual memory is lexically scoped in the embedding runtime:
//! push a configuration, allocate, pop.

use crate::MemoryError;
use crate::driver::{
    AccessDescriptor, AllocationProperties, DevicePtr, DeviceId, Stream,
    VirtualAddressReservation,
};
use crate::memory::MemoryStage;
use crate::memory::manager::VirtualMemoryManager;
use crate::memory::stages::{BackingKind, BackupStage, LocalProducer, UnicastMapStage, ZeroFillStage};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// How the content of an allocation is treated across a release/materialize
/// cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BackedMode {
    /// Not backed; content is uninitialized after rematerialize.
    #[default]
    #[serde(rename = "none")]
    None,
    /// Zero-filled on every rematerialize.
    #[serde(rename = "memset")]
    Memset,
    /// Saved to pageable host memory and restored on rematerialize.
    #[serde(rename = "host")]
    Host,
    /// Saved to pinned host memory and restored on rematerialize.
    #[serde(rename = "host_pinned")]
    HostPinned,
}

/// The immutable configuration of a [`VirtualAddressAllocator`].
pub struct AllocatorConfig {
    manager: Arc<VirtualMemoryManager>,
    tag: String,
    mode: BackedMode,
    /// Stream used for restoring and saving content; the address
    /// reservation itself is not stream-ordered.
    stream: Stream,
    on_demand_backing: bool,
    page_size: u64,
}

impl AllocatorConfig {
    /// Captures a configuration against `manager`; the host page size is
    /// read from the driver once, here.
    pub fn new(
        manager: Arc<VirtualMemoryManager>,
        tag: impl Into<String>,
        mode: BackedMode,
        stream: Stream,
    ) -> Self {
        let page_size = manager.driver().host_page_size();
        Self {
            manager,
            tag: tag.into(),
            mode,
            stream,
            on_demand_backing: false,
            page_size,
        }
    }

    /// Holds backup buffers only while the memory is released, at the cost
    /// of allocating them on every cycle.
    pub fn with_on_demand_backing(mut self) -> Self {
        self.on_demand_backing = true;
        self
    }

    /// The tag applied to allocations made under this configuration.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The backing mode.
    pub fn mode(&self) -> BackedMode {
        self.mode
    }

    /// The manager tracking allocations made under this configuration.
    pub fn manager(&self) -> &Arc<VirtualMemoryManager> {
        &self.manager
    }
}

/// Allocates tensor-library memory as reversible virtual allocations.
///
/// `allocate` hands out a device pointer whose virtual address range
/// doubles as the allocation's handle key: the reservation guarantees the
/// key is unique, and the pointer is the only identity the tensor library
/// can give back at deallocation time.
#[derive(Clone)]
pub struct VirtualAddressAllocator {
    config: Arc<AllocatorConfig>,
}

impl VirtualAddressAllocator {
    /// An allocator over the given configuration.
    pub fn new(config: Arc<AllocatorConfig>) -> Self {
        Self { config }
    }

    /// The configuration behind this allocator.
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Reserves, materializes and registers `bytes` bytes on `device`,
    /// returning the stable device pointer.
    pub fn allocate(&self, bytes: u64, device: DeviceId) -> Result<DevicePtr, MemoryError> {
        if bytes == 0 {
            return Err(MemoryError::ZeroAllocation);
        }

        let config = self.config.as_ref();
        let driver = config.manager.driver();
        let properties = AllocationProperties::device(device);
        let alignment = driver.granularity(&properties).max(config.page_size);
        let size = bytes.next_multiple_of(alignment);

        let reservation = VirtualAddressReservation::reserve(driver.clone(), size, alignment)?;
        let address = reservation.address();

        let producer = Box::new(LocalProducer::new(properties, size));
        let mut stages: Vec<Box<dyn MemoryStage>> = vec![Box::new(UnicastMapStage::new(
            reservation,
            size,
            AccessDescriptor::read_write(device),
        ))];
        match config.mode {
            BackedMode::None => {}
            BackedMode::Memset => {
                stages.push(Box::new(ZeroFillStage::new(address, size, 0, config.stream)));
            }
            BackedMode::Host | BackedMode::HostPinned => {
                let kind = match config.mode {
                    BackedMode::Host => BackingKind::Host,
                    _ => BackingKind::HostPinned,
                };
                let mut backup =
                    BackupStage::new(driver.clone(), address, size, kind, config.stream);
                if config.on_demand_backing {
                    backup = backup.on_demand();
                }
                stages.push(Box::new(backup));
            }
        }

        // A failed materialize drops the stage list, and with it the
        // reservation, before the error leaves this frame.
        config
            .manager
            .add_and_materialize(address, config.tag.clone(), producer, stages)?;
        Ok(address)
    }

    /// Unregisters the allocation behind `ptr`; dropping it releases the
    /// memory and frees the address range. Unknown pointers are ignored.
    pub fn deallocate(&self, ptr: DevicePtr, _bytes: u64) {
        drop(self.config.manager.remove(ptr));
    }
}

static ALLOCATORS: Mutex<Vec<VirtualAddressAllocator>> = Mutex::new(Vec::new());

fn stack() -> MutexGuard<'static, Vec<VirtualAddressAllocator>> {
    ALLOCATORS.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pushes a configuration onto the process-wide allocator stack.
pub fn push_allocator(config: AllocatorConfig) {
    stack().push(VirtualAddressAllocator::new(Arc::new(config)));
}

/// Pops the top of the allocator stack.
pub fn pop_allocator() -> Result<(), MemoryError> {
    stack()
        .pop()
        .map(|_| ())
        .ok_or(MemoryError::EmptyAllocatorStack)
}

/// The allocator currently in effect, if any.
pub fn current_allocator() -> Option<VirtualAddressAllocator> {
    stack().last().cloned()
}

/// Deallocates through whatever allocator is currently in effect.
///
/// Escape hatch for frameworks that do not track per-allocation allocator
/// identity and can only report the pointer.
// TODO: remove once the tensor integration records the owning allocator per
// allocation and calls `VirtualAddressAllocator::deallocate` directly.
pub fn deallocate(ptr: DevicePtr, bytes: u64) -> Result<(), MemoryError> {
    let allocator = current_allocator().ok_or(MemoryError::EmptyAllocatorStack)?;
    allocator.deallocate(ptr, bytes);
    Ok(())
}
