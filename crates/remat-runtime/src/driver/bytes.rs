//! A heap-backed simulated driver.
//!
//! `BytesDriver` realizes the full capability surface with plain heap
//! allocations: reserved address ranges are simulated by a bump counter, a
//! page table translates mapped ranges to physical byte blocks, and the
//! "async" operations complete synchronously. It is intended for the
//! test-suite and for driverless environments.

use super::{
    AccessDescriptor, AllocationProperties, DeviceId, DevicePtr, DriverError, Event, HostBufferId,
    MemoryDriver, MulticastObject, PhysicalHandle, Stream,
};
use hashbrown::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Counts of the driver calls a [`BytesDriver`] has served.
///
/// Tests assert on these to observe driver traffic exactly.
#[derive(Clone, Debug, Default)]
pub struct DriverStats {
    /// Virtual address ranges reserved.
    pub va_reserves: u64,
    /// Virtual address ranges released.
    pub va_releases: u64,
    /// Physical allocations created.
    pub physical_creates: u64,
    /// Physical allocations released.
    pub physical_releases: u64,
    /// Ranges mapped.
    pub maps: u64,
    /// Ranges unmapped.
    pub unmaps: u64,
    /// Access descriptors applied.
    pub access_sets: u64,
    /// Multicast bindings established.
    pub multicast_binds: u64,
    /// Multicast bindings removed.
    pub multicast_unbinds: u64,
    /// Byte fills issued.
    pub memsets: u64,
    /// Device-to-host copies issued.
    pub copies_to_host: u64,
    /// Host-to-device copies issued.
    pub copies_to_device: u64,
    /// Host buffers currently allocated.
    pub host_buffers_live: u64,
}

struct PhysicalBlock {
    data: Vec<u8>,
    mapped: bool,
}

struct Mapping {
    handle: PhysicalHandle,
    size: u64,
}

struct State {
    next_address: u64,
    next_handle: u64,
    next_host: u64,
    next_event: u64,
    reservations: HashMap<DevicePtr, u64>,
    blocks: HashMap<PhysicalHandle, PhysicalBlock>,
    mappings: HashMap<DevicePtr, Mapping>,
    host: HashMap<HostBufferId, Vec<u8>>,
    stats: DriverStats,
}

impl State {
    /// Translates a device address range to a physical block and offset.
    fn translate(&self, address: DevicePtr, len: u64) -> Result<(PhysicalHandle, usize), DriverError> {
        for (&base, mapping) in &self.mappings {
            if address >= base && address + len <= base + mapping.size {
                return Ok((mapping.handle, (address - base) as usize));
            }
        }
        Err(DriverError::InvalidHandle { op: "translate" })
    }
}

/// A simulated virtual memory driver backed by heap allocations.
pub struct BytesDriver {
    granularity: u64,
    page_size: u64,
    state: Mutex<State>,
}

impl BytesDriver {
    /// Creates a driver with the given allocation granularity.
    pub fn new(granularity: u64) -> Self {
        Self {
            granularity,
            page_size: 4096,
            state: Mutex::new(State {
                // Start at a recognizable simulated base address.
                next_address: 0x1000_0000,
                next_handle: 1,
                next_host: 1,
                next_event: 1,
                reservations: HashMap::new(),
                blocks: HashMap::new(),
                mappings: HashMap::new(),
                host: HashMap::new(),
                stats: DriverStats::default(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A snapshot of the call counters.
    pub fn stats(&self) -> DriverStats {
        self.state().stats.clone()
    }

    /// Writes bytes through the page table, as a device store would.
    ///
    /// Panics when the range is not mapped; tests are expected to only
    /// touch materialized memory.
    pub fn write(&self, address: DevicePtr, data: &[u8]) {
        let mut state = self.state();
        let (handle, offset) = state
            .translate(address, data.len() as u64)
            .expect("address range is not mapped");
        let block = state.blocks.get_mut(&handle).expect("mapped block exists");
        block.data[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Reads bytes through the page table, as a device load would.
    pub fn read(&self, address: DevicePtr, len: u64) -> Vec<u8> {
        let state = self.state();
        let (handle, offset) = state
            .translate(address, len)
            .expect("address range is not mapped");
        let block = state.blocks.get(&handle).expect("mapped block exists");
        block.data[offset..offset + len as usize].to_vec()
    }
}

impl Default for BytesDriver {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl MemoryDriver for BytesDriver {
    fn reserve_virtual_address(
        &self,
        size: u64,
        alignment: u64,
    ) -> Result<DevicePtr, DriverError> {
        if size == 0 {
            return Err(DriverError::Call {
                op: "reserve_virtual_address",
                reason: "zero-sized reservation".into(),
            });
        }
        let mut state = self.state();
        let alignment = alignment.max(1);
        let address = state.next_address.next_multiple_of(alignment);
        state.next_address = address + size.next_multiple_of(alignment);
        state.reservations.insert(address, size);
        state.stats.va_reserves += 1;
        Ok(address)
    }

    fn release_virtual_address(&self, address: DevicePtr, _size: u64) -> Result<(), DriverError> {
        let mut state = self.state();
        let size = state.reservations.remove(&address).ok_or(
            DriverError::InvalidHandle {
                op: "release_virtual_address",
            },
        )?;
        let still_mapped = state
            .mappings
            .keys()
            .any(|&base| base >= address && base < address + size);
        if still_mapped {
            state.reservations.insert(address, size);
            return Err(DriverError::Call {
                op: "release_virtual_address",
                reason: "range still has live mappings".into(),
            });
        }
        state.stats.va_releases += 1;
        Ok(())
    }

    fn create_physical(
        &self,
        _properties: &AllocationProperties,
        size: u64,
    ) -> Result<PhysicalHandle, DriverError> {
        let mut state = self.state();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.blocks.insert(
            handle,
            PhysicalBlock {
                data: vec![0; size as usize],
                mapped: false,
            },
        );
        state.stats.physical_creates += 1;
        Ok(handle)
    }

    fn release_physical(&self, handle: PhysicalHandle) -> Result<(), DriverError> {
        let mut state = self.state();
        let block = state
            .blocks
            .remove(&handle)
            .ok_or(DriverError::InvalidHandle {
                op: "release_physical",
            })?;
        if block.mapped {
            state.blocks.insert(handle, block);
            return Err(DriverError::Call {
                op: "release_physical",
                reason: "handle is still mapped".into(),
            });
        }
        state.stats.physical_releases += 1;
        Ok(())
    }

    fn map(
        &self,
        address: DevicePtr,
        size: u64,
        handle: PhysicalHandle,
    ) -> Result<(), DriverError> {
        let mut state = self.state();
        let in_reservation = state
            .reservations
            .iter()
            .any(|(&base, &len)| address >= base && address + size <= base + len);
        if !in_reservation || state.mappings.contains_key(&address) {
            return Err(DriverError::InvalidHandle { op: "map" });
        }
        let block = state
            .blocks
            .get_mut(&handle)
            .ok_or(DriverError::InvalidHandle { op: "map" })?;
        if block.mapped || (block.data.len() as u64) < size {
            return Err(DriverError::InvalidHandle { op: "map" });
        }
        block.mapped = true;
        state.mappings.insert(address, Mapping { handle, size });
        state.stats.maps += 1;
        Ok(())
    }

    fn unmap(&self, address: DevicePtr, _size: u64) -> Result<(), DriverError> {
        let mut state = self.state();
        let mapping = state
            .mappings
            .remove(&address)
            .ok_or(DriverError::InvalidHandle { op: "unmap" })?;
        if let Some(block) = state.blocks.get_mut(&mapping.handle) {
            block.mapped = false;
        }
        state.stats.unmaps += 1;
        Ok(())
    }

    fn set_access(
        &self,
        address: DevicePtr,
        size: u64,
        _descriptor: &AccessDescriptor,
    ) -> Result<(), DriverError> {
        let mut state = self.state();
        state.translate(address, size).map_err(|_| DriverError::InvalidHandle {
            op: "set_access",
        })?;
        state.stats.access_sets += 1;
        Ok(())
    }

    fn multicast_bind(
        &self,
        _multicast: MulticastObject,
        _multicast_offset: u64,
        handle: PhysicalHandle,
        _bind_offset: u64,
        _size: u64,
    ) -> Result<(), DriverError> {
        let mut state = self.state();
        if !state.blocks.contains_key(&handle) {
            return Err(DriverError::InvalidHandle {
                op: "multicast_bind",
            });
        }
        state.stats.multicast_binds += 1;
        Ok(())
    }

    fn multicast_unbind(
        &self,
        _multicast: MulticastObject,
        _device: DeviceId,
        _multicast_offset: u64,
        _size: u64,
    ) -> Result<(), DriverError> {
        self.state().stats.multicast_unbinds += 1;
        Ok(())
    }

    fn memset_async(
        &self,
        address: DevicePtr,
        size: u64,
        value: u8,
        _stream: Stream,
    ) -> Result<(), DriverError> {
        let mut state = self.state();
        let (handle, offset) = state.translate(address, size)?;
        let block = state
            .blocks
            .get_mut(&handle)
            .ok_or(DriverError::InvalidHandle { op: "memset_async" })?;
        block.data[offset..offset + size as usize].fill(value);
        state.stats.memsets += 1;
        Ok(())
    }

    fn memcpy_to_host(
        &self,
        dst: HostBufferId,
        src: DevicePtr,
        size: u64,
        _stream: Stream,
    ) -> Result<(), DriverError> {
        let mut state = self.state();
        let (handle, offset) = state.translate(src, size)?;
        let bytes = state
            .blocks
            .get(&handle)
            .map(|block| block.data[offset..offset + size as usize].to_vec())
            .ok_or(DriverError::InvalidHandle {
                op: "memcpy_to_host",
            })?;
        let buffer = state.host.get_mut(&dst).ok_or(DriverError::InvalidHandle {
            op: "memcpy_to_host",
        })?;
        if (buffer.len() as u64) < size {
            return Err(DriverError::Call {
                op: "memcpy_to_host",
                reason: "host buffer too small".into(),
            });
        }
        buffer[..size as usize].copy_from_slice(&bytes);
        state.stats.copies_to_host += 1;
        Ok(())
    }

    fn memcpy_to_device(
        &self,
        dst: DevicePtr,
        src: HostBufferId,
        size: u64,
        _stream: Stream,
    ) -> Result<(), DriverError> {
        let mut state = self.state();
        let buffer = state.host.get(&src).ok_or(DriverError::InvalidHandle {
            op: "memcpy_to_device",
        })?;
        if (buffer.len() as u64) < size {
            return Err(DriverError::Call {
                op: "memcpy_to_device",
                reason: "host buffer too small".into(),
            });
        }
        let bytes = buffer[..size as usize].to_vec();
        let (handle, offset) = state.translate(dst, size)?;
        let block = state
            .blocks
            .get_mut(&handle)
            .ok_or(DriverError::InvalidHandle {
                op: "memcpy_to_device",
            })?;
        block.data[offset..offset + size as usize].copy_from_slice(&bytes);
        state.stats.copies_to_device += 1;
        Ok(())
    }

    fn record_event(&self, _stream: Stream) -> Result<Event, DriverError> {
        let mut state = self.state();
        let event = Event(state.next_event);
        state.next_event += 1;
        Ok(event)
    }

    fn sync_event(&self, _event: Event) -> Result<(), DriverError> {
        // Every simulated operation completes synchronously.
        Ok(())
    }

    fn allocate_host(&self, size: u64, _pinned: bool) -> Result<HostBufferId, DriverError> {
        let mut state = self.state();
        let id = HostBufferId(state.next_host);
        state.next_host += 1;
        state.host.insert(id, vec![0; size as usize]);
        state.stats.host_buffers_live += 1;
        Ok(id)
    }

    fn free_host(&self, buffer: HostBufferId) -> Result<(), DriverError> {
        let mut state = self.state();
        state
            .host
            .remove(&buffer)
            .ok_or(DriverError::InvalidHandle { op: "free_host" })?;
        state.stats.host_buffers_live -= 1;
        Ok(())
    }

    fn granularity(&self, _properties: &AllocationProperties) -> u64 {
        self.granularity
    }

    fn host_page_size(&self) -> u64 {
        self.page_size
    }
}
