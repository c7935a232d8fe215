//! Page-aligned, fabric-registered slot pools.
//!
//! Bounce-buffer payloads, control-message slots and the flush page all need
//! memory that is page-aligned and registered over full pages on every rail
//! (registration must cover whole pages to stay safe across process forks on
//! older kernels). `MmapRegion` owns one anonymous mapping; `RegisteredPool`
//! carves mappings into fixed-size slots, bulk-registers each mapping once
//! per rail, and recycles slots through a free list.

use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::rc::Rc;

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use libfabric::MrDesc;

use crate::error::{Error, Result};
use crate::mr::MrHandle;

/// Round `len` up to a multiple of the system page size.
pub fn page_align(len: usize) -> usize {
    let page = page_size();
    len.next_multiple_of(page)
}

/// The system page size.
pub fn page_size() -> usize {
    // Safety: sysconf is always callable.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    debug_assert!(size > 0);
    size as usize
}

/// An owned anonymous mapping, unmapped on drop.
pub struct MmapRegion {
    ptr: NonNull<std::ffi::c_void>,
    len: usize,
}

impl MmapRegion {
    /// Map `len` bytes (rounded up to whole pages), zero-initialized.
    pub fn alloc(len: usize) -> Result<Self> {
        let len = page_align(len.max(1));
        let ptr = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(len).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))?;
        Ok(Self { ptr, len })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr() as *mut u8
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // Safety: ptr/len describe a live mapping owned by self.
        let _ = unsafe { munmap(self.ptr, self.len) };
    }
}

/// Reference to one slot of a [`RegisteredPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    chunk: usize,
    slot: usize,
}

struct Chunk {
    // The registration is dropped before the mapping (field order).
    mr: Rc<MrHandle>,
    region: MmapRegion,
    num_slots: usize,
}

/// A growable pool of fixed-size registered slots.
pub struct RegisteredPool {
    slot_size: usize,
    slots_per_chunk: usize,
    chunks: Vec<Chunk>,
    free: Vec<SlotRef>,
}

impl RegisteredPool {
    /// Create an empty pool of `slot_size`-byte slots, growing
    /// `slots_per_chunk` slots at a time.
    pub fn new(slot_size: usize, slots_per_chunk: usize) -> Self {
        assert!(slot_size > 0 && slots_per_chunk > 0);
        Self {
            slot_size,
            slots_per_chunk,
            chunks: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Take a free slot, growing the pool through `register` when empty.
    ///
    /// `register` receives the new mapping's base and length and must return
    /// a handle registered on every rail.
    pub fn alloc(
        &mut self,
        register: impl FnOnce(*const u8, usize) -> Result<Rc<MrHandle>>,
    ) -> Result<SlotRef> {
        if let Some(slot) = self.free.pop() {
            return Ok(slot);
        }

        let chunk_len = page_align(self.slot_size * self.slots_per_chunk);
        let region = MmapRegion::alloc(chunk_len)?;
        let mr = register(region.as_ptr(), region.len())?;
        let chunk_id = self.chunks.len();
        self.chunks.push(Chunk {
            mr,
            region,
            num_slots: self.slots_per_chunk,
        });
        for slot in (0..self.slots_per_chunk).rev() {
            self.free.push(SlotRef {
                chunk: chunk_id,
                slot,
            });
        }

        // The chunk was just created with at least one slot.
        Ok(self.free.pop().unwrap())
    }

    /// Return a slot to the free list.
    pub fn release(&mut self, slot: SlotRef) {
        debug_assert!(slot.chunk < self.chunks.len());
        debug_assert!(slot.slot < self.chunks[slot.chunk].num_slots);
        debug_assert!(!self.free.contains(&slot));
        self.free.push(slot);
    }

    /// Base address of a slot.
    pub fn addr(&self, slot: SlotRef) -> *mut u8 {
        let chunk = &self.chunks[slot.chunk];
        unsafe { chunk.region.as_ptr().add(slot.slot * self.slot_size) }
    }

    /// Local descriptor of the slot's chunk on `rail_id`.
    pub fn desc(&self, slot: SlotRef, rail_id: usize) -> MrDesc {
        self.chunks[slot.chunk].mr.desc(rail_id)
    }

    /// Remote key of the slot's chunk on `rail_id`.
    pub fn key(&self, slot: SlotRef, rail_id: usize) -> Result<u64> {
        self.chunks[slot.chunk].mr.key(rail_id)
    }
}
