use std::fmt;
use std::mem;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use raw_sync::locks::{LockGuard, LockImpl, LockInit, Mutex};
use raw_sync::Timeout;
use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::{debug, info};

use crate::config::RegionConfig;
use crate::errors::{AudioShmError, Result};
use crate::shutdown::Shutdown;

pub const MAX_SLOTS: usize = 16;

const REGION_MAGIC: u32 = 0x4155_5348;
const ALIGN: usize = 64;
const READY_WAIT: Duration = Duration::from_secs(2);
const READY_POLL: Duration = Duration::from_millis(1);

#[repr(C)]
pub struct SlotDescriptor {
    pub sequence_id: AtomicU64,
    // Last sequence id the consumer took out of the slot.
    pub consumed: AtomicU64,
    // From the start of the region.
    pub data_offset: u64,
}

#[repr(C)]
struct Header {
    magic: u32,
    ready: AtomicU32,
    slot_count: u32,
    slot_capacity: u32,
    slots: [SlotDescriptor; MAX_SLOTS],
}

#[inline]
fn align_up(v: usize) -> usize {
    (v + ALIGN - 1) / ALIGN * ALIGN
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    slot_count: usize,
    lock_offset: usize,
    lock_stride: usize,
    data_offset: usize,
    data_stride: usize,
    total: usize,
}

impl Layout {
    fn new(slot_count: usize, slot_capacity: usize) -> Layout {
        let lock_offset = align_up(mem::size_of::<Header>());
        let lock_stride = align_up(Mutex::size_of(None));
        let data_offset = lock_offset + lock_stride * slot_count;
        let data_stride = align_up(slot_capacity);
        Layout {
            slot_count,
            lock_offset,
            lock_stride,
            data_offset,
            data_stride,
            total: data_offset + data_stride * slot_count,
        }
    }

    #[inline]
    fn lock_at(&self, slot_index: usize) -> usize {
        self.lock_offset + slot_index * self.lock_stride
    }

    #[inline]
    fn data_at(&self, slot_index: usize) -> usize {
        self.data_offset + slot_index * self.data_stride
    }
}

/// What a slot descriptor says, read without holding the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotView {
    pub sequence_id: u64,
    pub data_offset: u64,
}

/// A shared memory mapping holding N period slots and one process-shared mutex per slot.
///
/// Whichever process opens the region first creates and initializes it; the other one
/// attaches to the existing mapping. Neither side owns the mapping after `open`, the
/// consumer removes it with [`Region::destroy`].
pub struct Region {
    // Dropped before the mapping they point into.
    locks: Vec<Box<dyn LockImpl>>,
    shmem: Shmem,
    layout: Layout,
    slot_capacity: usize,
    name: String,
}

impl Region {
    pub fn open(cfg: &RegionConfig, slot_capacity: usize) -> Result<Region> {
        if cfg.slot_count == 0 || cfg.slot_count > MAX_SLOTS {
            return Err(AudioShmError::Config(format!(
                "slot_count must be within 1..={}, got {}",
                MAX_SLOTS, cfg.slot_count
            )));
        }
        if slot_capacity == 0 || slot_capacity > u32::MAX as usize {
            return Err(AudioShmError::Config(format!(
                "invalid slot capacity {}",
                slot_capacity
            )));
        }
        let layout = Layout::new(cfg.slot_count, slot_capacity);
        let link = cfg.link_path();
        let name = link.display().to_string();

        match ShmemConf::new().size(layout.total).flink(&link).create() {
            Ok(shmem) => Region::initialize(shmem, layout, slot_capacity, name),
            Err(ShmemError::LinkExists) => {
                let shmem = ShmemConf::new().flink(&link).open()?;
                Region::attach(shmem, layout, slot_capacity, name)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn initialize(
        mut shmem: Shmem,
        layout: Layout,
        slot_capacity: usize,
        name: String,
    ) -> Result<Region> {
        let base = shmem.as_ptr();
        let header = base as *mut Header;
        let mut locks = Vec::with_capacity(layout.slot_count);
        unsafe {
            ptr::addr_of_mut!((*header).magic).write(REGION_MAGIC);
            ptr::addr_of_mut!((*header).slot_count).write(layout.slot_count as u32);
            ptr::addr_of_mut!((*header).slot_capacity).write(slot_capacity as u32);
            for i in 0..layout.slot_count {
                let slot = &mut (*header).slots[i];
                slot.sequence_id.store(0, Ordering::Relaxed);
                slot.consumed.store(0, Ordering::Relaxed);
                slot.data_offset = layout.data_at(i) as u64;
                let (lock, _) = Mutex::new(base.add(layout.lock_at(i)), base.add(layout.data_at(i)))
                    .map_err(AudioShmError::lock)?;
                locks.push(lock);
            }
            (*header).ready.store(REGION_MAGIC, Ordering::Release);
        }
        // The creating process must not unlink the region when it goes away.
        shmem.set_owner(false);
        info!(region = name.as_str(), slots = layout.slot_count, slot_capacity, "created shared region");
        Ok(Region {
            locks,
            shmem,
            layout,
            slot_capacity,
            name,
        })
    }

    fn attach(shmem: Shmem, layout: Layout, slot_capacity: usize, name: String) -> Result<Region> {
        if shmem.len() < mem::size_of::<Header>() {
            return Err(AudioShmError::Layout(format!(
                "mapping of {} bytes cannot hold the header",
                shmem.len()
            )));
        }
        let base = shmem.as_ptr();
        let header = unsafe { &*(base as *const Header) };

        let deadline = Instant::now() + READY_WAIT;
        while header.ready.load(Ordering::Acquire) != REGION_MAGIC {
            if Instant::now() >= deadline {
                return Err(AudioShmError::RegionNotReady(name));
            }
            thread::sleep(READY_POLL);
        }
        if header.magic != REGION_MAGIC {
            return Err(AudioShmError::Layout(format!("bad magic {:#x}", header.magic)));
        }
        if header.slot_count as usize != layout.slot_count
            || header.slot_capacity as usize != slot_capacity
        {
            return Err(AudioShmError::Layout(format!(
                "region has {} slots of {} bytes, expected {} slots of {} bytes",
                header.slot_count, header.slot_capacity, layout.slot_count, slot_capacity
            )));
        }
        if shmem.len() < layout.total {
            return Err(AudioShmError::Layout(format!(
                "mapping of {} bytes is smaller than the {} bytes required",
                shmem.len(),
                layout.total
            )));
        }

        let mut locks = Vec::with_capacity(layout.slot_count);
        for i in 0..layout.slot_count {
            let (lock, _) = unsafe {
                Mutex::from_existing(base.add(layout.lock_at(i)), base.add(layout.data_at(i)))
            }
            .map_err(AudioShmError::lock)?;
            locks.push(lock);
        }
        info!(region = name.as_str(), slots = layout.slot_count, slot_capacity, "attached shared region");
        Ok(Region {
            locks,
            shmem,
            layout,
            slot_capacity,
            name,
        })
    }

    #[inline]
    fn header(&self) -> &Header {
        unsafe { &*(self.shmem.as_ptr() as *const Header) }
    }

    pub fn slot_count(&self) -> usize {
        self.layout.slot_count
    }

    /// Capacity of one slot in bytes.
    pub fn slot_capacity(&self) -> usize {
        self.slot_capacity
    }

    #[inline]
    fn check_index(&self, slot_index: usize) -> Result<()> {
        if slot_index < self.layout.slot_count {
            Ok(())
        } else {
            Err(AudioShmError::SlotOutOfRange {
                index: slot_index,
                count: self.layout.slot_count,
            })
        }
    }

    /// Reads a slot descriptor. Does not take the slot's lock, so the sequence id
    /// is only meaningful once the producer has released the slot.
    pub fn slot(&self, slot_index: usize) -> Result<SlotView> {
        self.check_index(slot_index)?;
        let desc = &self.header().slots[slot_index];
        Ok(SlotView {
            sequence_id: desc.sequence_id.load(Ordering::Acquire),
            data_offset: desc.data_offset,
        })
    }

    /// Blocks until the slot's lock is free, then holds it until the guard is dropped.
    pub fn acquire(&self, slot_index: usize) -> Result<SlotGuard<'_>> {
        self.check_index(slot_index)?;
        let guard = self.locks[slot_index].lock().map_err(AudioShmError::lock)?;
        Ok(self.guard(slot_index, guard))
    }

    /// Like [`Region::acquire`], but waits in steps of `poll` and gives up with
    /// [`AudioShmError::Interrupted`] once `shutdown` is requested.
    pub fn acquire_interruptible(
        &self,
        slot_index: usize,
        shutdown: &Shutdown,
        poll: Duration,
    ) -> Result<SlotGuard<'_>> {
        self.check_index(slot_index)?;
        loop {
            match self.locks[slot_index].try_lock(Timeout::Val(poll)) {
                Ok(guard) => return Ok(self.guard(slot_index, guard)),
                Err(e) if is_timeout(e.as_ref()) => {
                    if shutdown.is_requested() {
                        return Err(AudioShmError::Interrupted);
                    }
                }
                Err(e) => return Err(AudioShmError::lock(e)),
            }
        }
    }

    fn guard<'a>(&'a self, slot_index: usize, guard: LockGuard<'a>) -> SlotGuard<'a> {
        let desc = &self.header().slots[slot_index];
        let data = unsafe { self.shmem.as_ptr().add(desc.data_offset as usize) as *mut i16 };
        SlotGuard {
            _guard: guard,
            descriptor: desc,
            data,
            len: self.slot_capacity / mem::size_of::<i16>(),
        }
    }

    /// Detaches from the region, leaving it in place for the other process.
    pub fn close(self) {
        debug!(region = self.name.as_str(), "detached shared region");
    }

    /// Detaches and removes the region and its link file.
    pub fn destroy(mut self) {
        self.shmem.set_owner(true);
        info!(region = self.name.as_str(), "destroyed shared region");
    }
}

// raw_sync only reports the pthread error code inside its message.
fn is_timeout(e: &(dyn std::error::Error + 'static)) -> bool {
    e.to_string().ends_with(&format!(": {}", libc::ETIMEDOUT))
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("name", &self.name)
            .field("slots", &self.layout.slot_count)
            .field("slot_capacity", &self.slot_capacity)
            .field("size", &self.layout.total)
            .finish()
    }
}

/// Exclusive access to one slot. The slot's lock is released when the guard drops.
pub struct SlotGuard<'a> {
    _guard: LockGuard<'a>,
    descriptor: &'a SlotDescriptor,
    data: *mut i16,
    len: usize,
}

impl<'a> SlotGuard<'a> {
    pub fn sequence_id(&self) -> u64 {
        self.descriptor.sequence_id.load(Ordering::Acquire)
    }

    /// Stamps freshly written data. The slot counts as unread until
    /// [`SlotGuard::mark_consumed`].
    pub fn set_sequence_id(&mut self, sequence_id: u64) {
        self.descriptor.consumed.store(0, Ordering::Relaxed);
        self.descriptor.sequence_id.store(sequence_id, Ordering::Release);
    }

    /// Sequence id of the last period the consumer took out of this slot.
    pub fn consumed(&self) -> u64 {
        self.descriptor.consumed.load(Ordering::Acquire)
    }

    pub fn mark_consumed(&mut self) {
        let sequence_id = self.sequence_id();
        self.descriptor.consumed.store(sequence_id, Ordering::Release);
    }

    /// Interleaved S16 samples of one period.
    pub fn samples(&self) -> &[i16] {
        unsafe { slice::from_raw_parts(self.data, self.len) }
    }

    pub fn samples_mut(&mut self) -> &mut [i16] {
        unsafe { slice::from_raw_parts_mut(self.data, self.len) }
    }

    pub fn release(self) {}
}
