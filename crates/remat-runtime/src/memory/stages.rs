//! The repertoire of producers and stages the allocator composes.

use super::{MemoryStage, Producer};
use crate::MemoryError;
use crate::counters::{CounterKind, MemoryCounters};
use crate::driver::{
    AccessDescriptor, AllocationProperties, DevicePtr, DeviceId, Event, HostBacking, MemoryDriver,
    MemoryLocation, MulticastObject, PhysicalHandle, Stream, VirtualAddressReservation,
};
use std::sync::Arc;

/// Produces physical memory locally through the driver.
///
/// Successful produces and disposes are mirrored into the process-wide
/// [`MemoryCounters`], in the bucket matching the allocation's location.
pub struct LocalProducer {
    properties: AllocationProperties,
    size: u64,
    count: bool,
}

impl LocalProducer {
    /// A producer that reports to the memory counters.
    pub fn new(properties: AllocationProperties, size: u64) -> Self {
        Self {
            properties,
            size,
            count: true,
        }
    }

    /// A producer for internal allocations that stay out of the counters.
    pub fn without_counting(properties: AllocationProperties, size: u64) -> Self {
        Self {
            properties,
            size,
            count: false,
        }
    }

    fn counter_kind(&self) -> CounterKind {
        match self.properties.location {
            MemoryLocation::Device(_) => CounterKind::Device,
            MemoryLocation::HostPinned => CounterKind::Pinned,
        }
    }
}

impl Producer for LocalProducer {
    fn produce(&mut self, driver: &dyn MemoryDriver) -> Result<PhysicalHandle, MemoryError> {
        let handle = driver.create_physical(&self.properties, self.size)?;
        if self.count {
            MemoryCounters::global().allocate(self.counter_kind(), self.size);
        }
        Ok(handle)
    }

    fn dispose(
        &mut self,
        driver: &dyn MemoryDriver,
        handle: PhysicalHandle,
    ) -> Result<(), MemoryError> {
        let result = driver.release_physical(handle);
        // The counter is unwound even when the driver refuses the release,
        // matching what it will report once the handle is gone.
        if self.count {
            MemoryCounters::global().deallocate(self.counter_kind(), self.size);
        }
        Ok(result?)
    }
}

/// Maps the produced handle into a unicast virtual address range.
///
/// Owns the range's [`VirtualAddressReservation`]; teardown only unmaps, so
/// the address stays reserved across release/materialize cycles and is
/// freed when the allocation itself is destroyed.
pub struct UnicastMapStage {
    reservation: VirtualAddressReservation,
    size: u64,
    descriptor: AccessDescriptor,
}

impl UnicastMapStage {
    /// Creates the stage for `size` bytes at the reserved address.
    pub fn new(
        reservation: VirtualAddressReservation,
        size: u64,
        descriptor: AccessDescriptor,
    ) -> Self {
        Self {
            reservation,
            size,
            descriptor,
        }
    }

    /// The mapped virtual address.
    pub fn address(&self) -> DevicePtr {
        self.reservation.address()
    }
}

impl MemoryStage for UnicastMapStage {
    fn setup(
        &mut self,
        driver: &dyn MemoryDriver,
        handle: PhysicalHandle,
    ) -> Result<(), MemoryError> {
        let address = self.reservation.address();
        driver.map(address, self.size, handle)?;
        if let Err(err) = driver.set_access(address, self.size, &self.descriptor) {
            // Undo the fresh mapping before surfacing the failure.
            if let Err(unmap_err) = driver.unmap(address, self.size) {
                log::warn!("failed to unmap {address:#x} while recovering: {unmap_err}");
                self.reservation.leak();
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn teardown(
        &mut self,
        driver: &dyn MemoryDriver,
        _handle: PhysicalHandle,
    ) -> Result<(), MemoryError> {
        if let Err(err) = driver.unmap(self.reservation.address(), self.size) {
            // The mapping state of the range is now unknown; freeing the
            // addresses would be worse than leaking them.
            self.reservation.leak();
            return Err(err.into());
        }
        Ok(())
    }
}

/// Binds the produced handle into a multicast object.
#[derive(new)]
pub struct MulticastBindStage {
    multicast: MulticastObject,
    bind_offset: u64,
    device: DeviceId,
    size: u64,
}

impl MemoryStage for MulticastBindStage {
    fn setup(
        &mut self,
        driver: &dyn MemoryDriver,
        handle: PhysicalHandle,
    ) -> Result<(), MemoryError> {
        driver.multicast_bind(self.multicast, 0, handle, self.bind_offset, self.size)?;
        Ok(())
    }

    fn teardown(
        &mut self,
        driver: &dyn MemoryDriver,
        _handle: PhysicalHandle,
    ) -> Result<(), MemoryError> {
        driver.multicast_unbind(self.multicast, self.device, 0, self.size)?;
        Ok(())
    }
}

/// Fills the range with a byte value on every rematerialize.
///
/// The very first setup is skipped: freshly produced memory is treated as
/// logically uninitialized, and filling it right after production would be
/// redundant work on the stream.
pub struct ZeroFillStage {
    address: DevicePtr,
    size: u64,
    value: u8,
    stream: Stream,
    first_time: bool,
}

impl ZeroFillStage {
    /// Creates the stage; the first setup after construction does not fill.
    pub fn new(address: DevicePtr, size: u64, value: u8, stream: Stream) -> Self {
        Self {
            address,
            size,
            value,
            stream,
            first_time: true,
        }
    }
}

impl MemoryStage for ZeroFillStage {
    fn setup(
        &mut self,
        driver: &dyn MemoryDriver,
        _handle: PhysicalHandle,
    ) -> Result<(), MemoryError> {
        if !self.first_time {
            driver.memset_async(self.address, self.size, self.value, self.stream)?;
        }
        Ok(())
    }

    fn teardown(
        &mut self,
        _driver: &dyn MemoryDriver,
        _handle: PhysicalHandle,
    ) -> Result<(), MemoryError> {
        self.first_time = false;
        Ok(())
    }
}

/// The kind of host memory backing a [`BackupStage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackingKind {
    /// Pageable host memory.
    Host,
    /// Page-locked host memory.
    HostPinned,
}

impl BackingKind {
    fn is_pinned(self) -> bool {
        matches!(self, BackingKind::HostPinned)
    }
}

/// Saves the range to host memory on teardown and restores it on the next
/// setup.
///
/// The save is synchronized before teardown returns, because the physical
/// memory is unmapped and disposed right after. The restore only has to be
/// stream-ordered: downstream work on the same stream observes the restored
/// content without an explicit wait.
///
/// In on-demand mode the backing buffer is dropped as soon as the restore
/// copy is enqueued and allocated anew on the next save, trading allocation
/// traffic for host memory held only while the device memory is released.
pub struct BackupStage {
    driver: Arc<dyn MemoryDriver>,
    address: DevicePtr,
    size: u64,
    kind: BackingKind,
    stream: Stream,
    on_demand: bool,
    backing: Option<HostBacking>,
    restore_event: Option<Event>,
}

impl BackupStage {
    /// Creates the stage. Nothing is saved or restored until the first
    /// teardown.
    pub fn new(
        driver: Arc<dyn MemoryDriver>,
        address: DevicePtr,
        size: u64,
        kind: BackingKind,
        stream: Stream,
    ) -> Self {
        Self {
            driver,
            address,
            size,
            kind,
            stream,
            on_demand: false,
            backing: None,
            restore_event: None,
        }
    }

    /// Switches the stage to on-demand backing.
    pub fn on_demand(mut self) -> Self {
        self.on_demand = true;
        self
    }
}

impl MemoryStage for BackupStage {
    fn setup(
        &mut self,
        driver: &dyn MemoryDriver,
        _handle: PhysicalHandle,
    ) -> Result<(), MemoryError> {
        // On the first setup nothing has ever been saved.
        let Some(backing) = self.backing.as_ref() else {
            return Ok(());
        };

        driver.memcpy_to_device(self.address, backing.id(), self.size, self.stream)?;
        self.restore_event = Some(driver.record_event(self.stream)?);
        if self.on_demand {
            self.backing = None;
        }
        Ok(())
    }

    fn teardown(
        &mut self,
        driver: &dyn MemoryDriver,
        _handle: PhysicalHandle,
    ) -> Result<(), MemoryError> {
        // The save below reuses the buffer a pending restore may still be
        // reading from.
        if let Some(event) = self.restore_event.take() {
            driver.sync_event(event)?;
        }

        let backing = match self.backing.take() {
            Some(backing) => backing,
            None => HostBacking::allocate(self.driver.clone(), self.size, self.kind.is_pinned())?,
        };

        driver.memcpy_to_host(backing.id(), self.address, self.size, self.stream)?;
        let event = driver.record_event(self.stream)?;
        // The physical memory is unmapped and disposed right after this
        // returns; the save must have fully drained by then.
        driver.sync_event(event)?;

        self.backing = Some(backing);
        Ok(())
    }
}
