#[cfg(feature = "bytes-driver")]
mod bytes;
#[cfg(feature = "bytes-driver")]
pub use bytes::*;

use std::sync::Arc;
use thiserror::Error;

/// A device virtual address.
pub type DevicePtr = u64;

/// Opaque driver token for a physical memory allocation.
///
/// Zero is never a valid produced handle and doubles as the "no handle"
/// sentinel throughout the crate.
pub type PhysicalHandle = u64;

/// Opaque driver token for a multi-device multicast object.
pub type MulticastObject = u64;

/// Opaque driver token for a host-side staging buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HostBufferId(pub u64);

/// Opaque driver token for an ordering stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Stream(pub u64);

/// Opaque driver token for a recorded event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Event(pub u64);

/// A device ordinal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DeviceId(pub i32);

/// Where a physical allocation lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryLocation {
    /// Memory on the given device.
    Device(DeviceId),
    /// Page-locked host memory addressable by the device.
    HostPinned,
}

/// Placement properties for a physical allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationProperties {
    /// Target location of the allocation.
    pub location: MemoryLocation,
}

impl AllocationProperties {
    /// Properties for device-resident memory.
    pub fn device(device: DeviceId) -> Self {
        Self {
            location: MemoryLocation::Device(device),
        }
    }

    /// Properties for pinned host memory.
    pub fn host_pinned() -> Self {
        Self {
            location: MemoryLocation::HostPinned,
        }
    }
}

/// Access protection applied to a mapped range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessFlags {
    /// Loads only.
    ReadOnly,
    /// Loads and stores.
    ReadWrite,
}

/// Which device may access a mapped range, and how.
#[derive(Clone, Copy, Debug, PartialEq, Eq, new)]
pub struct AccessDescriptor {
    /// The accessing device.
    pub device: DeviceId,
    /// The granted protection.
    pub flags: AccessFlags,
}

impl AccessDescriptor {
    /// Read/write access for the given device.
    pub fn read_write(device: DeviceId) -> Self {
        Self::new(device, AccessFlags::ReadWrite)
    }
}

/// An error reported by a [`MemoryDriver`] realization.
#[derive(Error, Debug, Clone)]
pub enum DriverError {
    /// The driver could not satisfy an allocation of the given size.
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory {
        /// The requested size in bytes.
        size: u64,
    },

    /// A handle or address passed to the driver is unknown or in the wrong
    /// state for the operation.
    #[error("invalid handle passed to `{op}`")]
    InvalidHandle {
        /// The rejecting driver operation.
        op: &'static str,
    },

    /// Any other driver-side failure.
    #[error("driver call `{op}` failed: {reason}")]
    Call {
        /// The failing driver operation.
        op: &'static str,
        /// Driver-provided failure detail.
        reason: String,
    },
}

/// The driver capability surface consumed by the crate.
///
/// Concrete realizations wrap a device driver API (for CUDA, the virtual
/// memory management entry points around `cuMemCreate` / `cuMemMap`). All
/// methods take `&self`: real drivers are process-global and stateless on
/// the Rust side, and simulated drivers use interior mutability.
///
/// "Async" operations are asynchronous with respect to the given stream;
/// from the calling thread they may block for arbitrary time, like any
/// other driver call.
pub trait MemoryDriver: Send + Sync {
    /// Reserves a virtual address range without backing it.
    fn reserve_virtual_address(&self, size: u64, alignment: u64)
    -> Result<DevicePtr, DriverError>;

    /// Returns a reserved range to the driver. The range must not have live
    /// mappings.
    fn release_virtual_address(&self, address: DevicePtr, size: u64) -> Result<(), DriverError>;

    /// Creates a physical allocation of `size` bytes.
    fn create_physical(
        &self,
        properties: &AllocationProperties,
        size: u64,
    ) -> Result<PhysicalHandle, DriverError>;

    /// Frees a physical allocation. The handle must be unmapped.
    fn release_physical(&self, handle: PhysicalHandle) -> Result<(), DriverError>;

    /// Maps a physical allocation at `address` for `size` bytes.
    fn map(&self, address: DevicePtr, size: u64, handle: PhysicalHandle)
    -> Result<(), DriverError>;

    /// Unmaps the range previously mapped at `address`.
    fn unmap(&self, address: DevicePtr, size: u64) -> Result<(), DriverError>;

    /// Grants access to a mapped range. Required after [`MemoryDriver::map`]
    /// before the range may be dereferenced.
    fn set_access(
        &self,
        address: DevicePtr,
        size: u64,
        descriptor: &AccessDescriptor,
    ) -> Result<(), DriverError>;

    /// Binds a physical allocation into a multicast object.
    fn multicast_bind(
        &self,
        multicast: MulticastObject,
        multicast_offset: u64,
        handle: PhysicalHandle,
        bind_offset: u64,
        size: u64,
    ) -> Result<(), DriverError>;

    /// Unbinds a range of a multicast object for the given device.
    fn multicast_unbind(
        &self,
        multicast: MulticastObject,
        device: DeviceId,
        multicast_offset: u64,
        size: u64,
    ) -> Result<(), DriverError>;

    /// Fills a mapped range with `value`, ordered on `stream`.
    fn memset_async(
        &self,
        address: DevicePtr,
        size: u64,
        value: u8,
        stream: Stream,
    ) -> Result<(), DriverError>;

    /// Copies a mapped device range into a host buffer, ordered on `stream`.
    fn memcpy_to_host(
        &self,
        dst: HostBufferId,
        src: DevicePtr,
        size: u64,
        stream: Stream,
    ) -> Result<(), DriverError>;

    /// Copies a host buffer into a mapped device range, ordered on `stream`.
    fn memcpy_to_device(
        &self,
        dst: DevicePtr,
        src: HostBufferId,
        size: u64,
        stream: Stream,
    ) -> Result<(), DriverError>;

    /// Creates an event and records it on `stream`.
    fn record_event(&self, stream: Stream) -> Result<Event, DriverError>;

    /// Waits until the event is reached, then destroys it.
    fn sync_event(&self, event: Event) -> Result<(), DriverError>;

    /// Allocates a host buffer of `size` bytes, page-locked if `pinned`.
    fn allocate_host(&self, size: u64, pinned: bool) -> Result<HostBufferId, DriverError>;

    /// Frees a host buffer.
    fn free_host(&self, buffer: HostBufferId) -> Result<(), DriverError>;

    /// The allocation granularity for the given properties. Physical sizes
    /// and mapping addresses must be multiples of it.
    fn granularity(&self, properties: &AllocationProperties) -> u64;

    /// The host page size.
    fn host_page_size(&self) -> u64;
}

/// An owned virtual address reservation.
///
/// The range is returned to the driver when the reservation is dropped,
/// which keeps the address stable across release/materialize cycles: the
/// mapping stage that owns the reservation unmaps on teardown but only
/// frees the range when the whole allocation is destroyed.
pub struct VirtualAddressReservation {
    driver: Arc<dyn MemoryDriver>,
    address: DevicePtr,
    size: u64,
    armed: bool,
}

impl VirtualAddressReservation {
    /// Reserves a range of `size` bytes.
    pub fn reserve(
        driver: Arc<dyn MemoryDriver>,
        size: u64,
        alignment: u64,
    ) -> Result<Self, DriverError> {
        let address = driver.reserve_virtual_address(size, alignment)?;
        Ok(Self {
            driver,
            address,
            size,
            armed: true,
        })
    }

    /// The base address of the reserved range.
    pub fn address(&self) -> DevicePtr {
        self.address
    }

    /// The size of the reserved range in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Disarms the reservation: the range is never returned to the driver.
    ///
    /// Called when an unmap failure leaves the mapping state of the range
    /// unknown. Freeing addresses that may still carry live mappings is
    /// worse than leaking them until process exit.
    pub fn leak(&mut self) {
        self.armed = false;
    }
}

impl Drop for VirtualAddressReservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self
            .driver
            .release_virtual_address(self.address, self.size)
        {
            log::error!(
                "failed to free virtual address range {:#x}+{}: {err}",
                self.address,
                self.size
            );
        }
    }
}

/// An owned host staging buffer.
pub struct HostBacking {
    driver: Arc<dyn MemoryDriver>,
    id: HostBufferId,
    size: u64,
}

impl HostBacking {
    /// Allocates a host buffer of `size` bytes.
    pub fn allocate(
        driver: Arc<dyn MemoryDriver>,
        size: u64,
        pinned: bool,
    ) -> Result<Self, DriverError> {
        let id = driver.allocate_host(size, pinned)?;
        Ok(Self { driver, id, size })
    }

    /// The driver token of the buffer.
    pub fn id(&self) -> HostBufferId {
        self.id
    }

    /// The size of the buffer in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for HostBacking {
    fn drop(&mut self) {
        if let Err(err) = self.driver.free_host(self.id) {
            log::error!("failed to free host backing buffer {:?}: {err}", self.id);
        }
    }
}
