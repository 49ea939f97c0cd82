//! The destination buffer and the per-frame write capabilities handed to
//! frame tasks.
//!
//! Each slot carries a packed `(generation, state)` word. A [`FrameSlot`]
//! can only write after claiming its slot with a compare-and-swap against
//! the generation it was issued for, so a revoked or reissued slot is never
//! written by a stale task and no two writers ever share a range.

use crate::enums::ElementType;
use crate::error::{AllocationError, SlotError};
use crate::samples::Sample;

use memmap2::MmapMut;
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const VACANT: u64 = 0;
const ISSUED: u64 = 1;
const WRITING: u64 = 2;
const FILLED: u64 = 3;
const STATE_MASK: u64 = 0b11;

const HEAP_ALIGN: usize = 64;

fn checked_size(frames: usize, bytes_per_frame: usize) -> Result<usize, AllocationError> {
    frames
        .checked_mul(bytes_per_frame)
        .ok_or(AllocationError::SizeOverflow {
            frames,
            bytes_per_frame,
        })
}

#[inline]
fn pack(generation: u64, state: u64) -> u64 {
    (generation << 2) | state
}

#[inline]
fn state_of(word: u64) -> u64 {
    word & STATE_MASK
}

#[inline]
fn generation_of(word: u64) -> u64 {
    word >> 2
}

enum Backing {
    Heap(Layout),
    Shared(MmapMut),
}

pub struct DestinationBuffer {
    base: NonNull<u8>,
    backing: Backing,
    size_in_bytes: usize,
    bytes_per_frame: usize,
    element: ElementType,
    slots: Box<[AtomicU64]>,
    modified: AtomicBool,
}

// SAFETY: the allocation is only written through `FrameSlot::write`, which
// claims exclusive access to a disjoint range, and only read through slots in
// the FILLED state, which no writer can hold.
unsafe impl Send for DestinationBuffer {}
unsafe impl Sync for DestinationBuffer {}

impl DestinationBuffer {
    /// Allocate a zeroed private buffer.
    pub fn private(
        frames: usize,
        bytes_per_frame: usize,
        element: ElementType,
    ) -> Result<Self, AllocationError> {
        let size_in_bytes = checked_size(frames, bytes_per_frame)?;
        let layout = Layout::from_size_align(size_in_bytes, HEAP_ALIGN)
            .ok()
            .filter(|layout| layout.size() > 0)
            .ok_or(AllocationError::InvalidLayout(size_in_bytes))?;
        // SAFETY: the layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(base) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        Ok(Self::from_parts(
            base,
            Backing::Heap(layout),
            size_in_bytes,
            frames,
            bytes_per_frame,
            element,
        ))
    }

    /// Allocate a zeroed, page-aligned anonymous mapping that can be shared
    /// with other execution contexts.
    pub fn shared(
        frames: usize,
        bytes_per_frame: usize,
        element: ElementType,
    ) -> Result<Self, AllocationError> {
        let size_in_bytes = checked_size(frames, bytes_per_frame)?;
        if size_in_bytes == 0 {
            return Err(AllocationError::InvalidLayout(size_in_bytes));
        }
        let mut map = MmapMut::map_anon(size_in_bytes)
            .map_err(|e| AllocationError::SharedMemoryUnavailable(e.to_string()))?;
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or(AllocationError::InvalidLayout(size_in_bytes))?;
        Ok(Self::from_parts(
            base,
            Backing::Shared(map),
            size_in_bytes,
            frames,
            bytes_per_frame,
            element,
        ))
    }

    fn from_parts(
        base: NonNull<u8>,
        backing: Backing,
        size_in_bytes: usize,
        frames: usize,
        bytes_per_frame: usize,
        element: ElementType,
    ) -> Self {
        Self {
            base,
            backing,
            size_in_bytes,
            bytes_per_frame,
            element,
            slots: (0..frames).map(|_| AtomicU64::new(VACANT)).collect(),
            modified: AtomicBool::new(false),
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_frame
    }

    pub fn frame_count(&self) -> usize {
        self.slots.len()
    }

    pub fn element(&self) -> ElementType {
        self.element
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.backing, Backing::Shared(_))
    }

    pub fn offset(&self, index: usize) -> usize {
        index * self.bytes_per_frame
    }

    /// Whether any frame was written since the flag was last taken.
    pub fn take_modified(&self) -> bool {
        self.modified.swap(false, Ordering::AcqRel)
    }

    pub fn is_modified(&self) -> bool {
        self.modified.load(Ordering::Acquire)
    }

    pub(crate) fn mark_modified(&self) {
        self.modified.store(true, Ordering::Release);
    }

    /// Issue the write capability for slot `index` in `generation`.
    ///
    /// A slot mid-write from an older generation is waited out; the write is
    /// a single bounded copy.
    pub fn issue_slot(
        self: &Arc<Self>,
        index: usize,
        generation: u64,
    ) -> Result<FrameSlot, SlotError> {
        let slot = self.slots.get(index).ok_or(SlotError::OutOfRange(index))?;
        loop {
            let current = slot.load(Ordering::Acquire);
            match state_of(current) {
                WRITING => {
                    std::hint::spin_loop();
                    continue;
                }
                ISSUED if generation_of(current) == generation => {
                    return Err(SlotError::AlreadyIssued(index));
                }
                _ => {}
            }
            if slot
                .compare_exchange(
                    current,
                    pack(generation, ISSUED),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(FrameSlot {
                    buffer: Arc::clone(self),
                    index,
                    generation,
                });
            }
        }
    }

    /// Revoke every unclaimed slot of `generation`. Returns how many were
    /// revoked.
    pub fn revoke_issued(&self, generation: u64) -> usize {
        self.slots
            .iter()
            .filter(|slot| {
                slot.compare_exchange(
                    pack(generation, ISSUED),
                    pack(generation, VACANT),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            })
            .count()
    }

    pub fn is_filled(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .is_some_and(|slot| state_of(slot.load(Ordering::Acquire)) == FILLED)
    }

    /// Bytes of a filled slot.
    pub fn read_slot(&self, index: usize) -> Option<&[u8]> {
        if !self.is_filled(index) {
            return None;
        }
        // SAFETY: FILLED slots have no writer; a new writer needs a reissue,
        // which the owner only performs through `&mut` access.
        Some(unsafe {
            std::slice::from_raw_parts(
                self.base.as_ptr().add(self.offset(index)),
                self.bytes_per_frame,
            )
        })
    }

    /// Typed elements of a filled slot.
    pub fn read_slot_as<T: Sample>(&self, index: usize) -> Option<&[T]> {
        if T::ELEMENT != self.element {
            return None;
        }
        self.read_slot(index).map(bytemuck::cast_slice)
    }

    /// The whole buffer, available only when every slot is filled or vacant.
    pub(crate) fn read_all_as<T: Sample>(&self) -> Option<&[T]> {
        if T::ELEMENT != self.element {
            return None;
        }
        let quiescent = self.slots.iter().all(|slot| {
            let state = state_of(slot.load(Ordering::Acquire));
            state == FILLED || state == VACANT
        });
        if !quiescent {
            return None;
        }
        // SAFETY: no slot is issued or being written.
        let bytes = unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.size_in_bytes) };
        Some(bytemuck::cast_slice(bytes))
    }
}

impl Drop for DestinationBuffer {
    fn drop(&mut self) {
        if let Backing::Heap(layout) = self.backing {
            // SAFETY: allocated in `private` with this layout.
            unsafe { alloc::dealloc(self.base.as_ptr(), layout) };
        }
    }
}

impl std::fmt::Debug for DestinationBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationBuffer")
            .field("size_in_bytes", &self.size_in_bytes)
            .field("bytes_per_frame", &self.bytes_per_frame)
            .field("element", &self.element)
            .field("shared", &self.is_shared())
            .finish()
    }
}

/// Capability to write exactly one frame's byte range, once.
#[derive(Debug)]
pub struct FrameSlot {
    buffer: Arc<DestinationBuffer>,
    index: usize,
    generation: u64,
}

impl FrameSlot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn offset(&self) -> usize {
        self.buffer.offset(self.index)
    }

    pub fn len(&self) -> usize {
        self.buffer.bytes_per_frame
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element(&self) -> ElementType {
        self.buffer.element
    }

    /// Copy `bytes` into the slot with one bounded write.
    ///
    /// # Errors
    ///
    /// [`SlotError::Revoked`] when the slot was revoked or reissued after
    /// this capability was handed out; the buffer is untouched.
    pub fn write(self, bytes: &[u8]) -> Result<(), SlotError> {
        let expected = self.len();
        if bytes.len() != expected {
            return Err(SlotError::LengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        let slot = &self.buffer.slots[self.index];
        slot.compare_exchange(
            pack(self.generation, ISSUED),
            pack(self.generation, WRITING),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .map_err(|_| SlotError::Revoked(self.index))?;

        // SAFETY: the slot is claimed WRITING for this generation, so this
        // range has exactly one writer and no readers.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.buffer.base.as_ptr().add(self.offset()),
                expected,
            );
        }
        slot.store(pack(self.generation, FILLED), Ordering::Release);
        self.buffer.mark_modified();
        Ok(())
    }
}

impl Drop for FrameSlot {
    fn drop(&mut self) {
        // Hand an unwritten slot back so a reload can reissue it.
        let _ = self.buffer.slots[self.index].compare_exchange(
            pack(self.generation, ISSUED),
            pack(self.generation, VACANT),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(frames: usize) -> Arc<DestinationBuffer> {
        Arc::new(DestinationBuffer::private(frames, 8, ElementType::U16).unwrap())
    }

    #[test]
    fn offsets_partition_the_buffer() {
        let buffer = buffer(5);
        for i in 0..4 {
            assert_eq!(buffer.offset(i + 1) - buffer.offset(i), buffer.bytes_per_frame());
        }
        assert_eq!(buffer.offset(4) + buffer.bytes_per_frame(), buffer.size_in_bytes());
    }

    #[test]
    fn slot_write_lands_at_its_offset() {
        let buffer = buffer(3);
        let slot = buffer.issue_slot(1, 0).unwrap();
        assert_eq!(slot.offset(), 8);
        let values: [u16; 4] = [1, 2, 3, 4];
        slot.write(bytemuck::cast_slice(&values)).unwrap();

        assert_eq!(buffer.read_slot_as::<u16>(1), Some(&values[..]));
        assert_eq!(buffer.read_slot(0), None);
        assert!(buffer.take_modified());
        assert!(!buffer.is_modified());
    }

    #[test]
    fn slot_is_issued_once_per_generation() {
        let buffer = buffer(2);
        let _slot = buffer.issue_slot(0, 0).unwrap();
        assert_eq!(buffer.issue_slot(0, 0).unwrap_err(), SlotError::AlreadyIssued(0));
        assert!(buffer.issue_slot(0, 1).is_ok());
    }

    #[test]
    fn revoked_slot_is_not_written() {
        let buffer = buffer(2);
        let slot = buffer.issue_slot(0, 3).unwrap();
        assert_eq!(buffer.revoke_issued(3), 1);
        assert_eq!(slot.write(&[7; 8]).unwrap_err(), SlotError::Revoked(0));
        assert_eq!(buffer.read_slot(0), None);
        assert!(!buffer.is_modified());
    }

    #[test]
    fn reissued_slot_rejects_the_stale_writer() {
        let buffer = buffer(1);
        let stale = buffer.issue_slot(0, 0).unwrap();
        let fresh = buffer.issue_slot(0, 1).unwrap();
        assert_eq!(stale.write(&[1; 8]).unwrap_err(), SlotError::Revoked(0));
        fresh.write(&[2; 8]).unwrap();
        assert_eq!(buffer.read_slot(0), Some(&[2u8; 8][..]));
    }

    #[test]
    fn dropped_slot_becomes_vacant() {
        let buffer = buffer(1);
        drop(buffer.issue_slot(0, 0).unwrap());
        assert!(buffer.read_all_as::<u16>().is_some());
        assert!(buffer.issue_slot(0, 0).is_ok());
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let buffer = buffer(1);
        let slot = buffer.issue_slot(0, 0).unwrap();
        assert_eq!(
            slot.write(&[0; 3]).unwrap_err(),
            SlotError::LengthMismatch { expected: 8, actual: 3 }
        );
    }

    #[test]
    fn oversized_buffers_are_rejected() {
        assert!(matches!(
            DestinationBuffer::private(usize::MAX, 2, ElementType::U16),
            Err(AllocationError::SizeOverflow {
                frames: usize::MAX,
                bytes_per_frame: 2,
            })
        ));
        assert!(matches!(
            DestinationBuffer::shared(usize::MAX / 2, 4, ElementType::F32),
            Err(AllocationError::SizeOverflow { .. })
        ));
    }

    #[test]
    fn shared_buffer_is_zeroed() {
        let buffer = Arc::new(DestinationBuffer::shared(2, 16, ElementType::F32).unwrap());
        assert!(buffer.is_shared());
        assert!(buffer.read_all_as::<f32>().unwrap().iter().all(|&v| v == 0.0));
    }
}
