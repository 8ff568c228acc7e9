// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::sync::atomic::Ordering;

use log::{debug, trace};
use vm_memory::{Address, Bytes, GuestAddress, GuestMemoryMmap};

use crate::{
    protocol::{
        svga_cb_header, CbStatus, FENCE_CMD_SIZE, PAGE_SIZE, SVGA_CB_ERROR_OFFSET_OFFSET,
        SVGA_CB_HEADER_SIZE, SVGA_CB_STATUS_OFFSET,
    },
    Error, Result,
};

/// Physically contiguous, page-locked memory handed out in whole pages.
///
/// The pool covers a fixed range of guest memory that the host never pages
/// out; allocations are first-fit over a page bitmap.
#[derive(Debug)]
pub struct PagePool {
    base: GuestAddress,
    used: Vec<bool>,
}

impl PagePool {
    pub fn new(base: GuestAddress, pages: usize) -> Self {
        Self {
            base,
            used: vec![false; pages],
        }
    }

    pub fn allocate(&mut self, pages: usize) -> Option<GuestAddress> {
        if pages == 0 || pages > self.used.len() {
            return None;
        }

        let mut start = 0;
        while start + pages <= self.used.len() {
            match self.used[start..start + pages]
                .iter()
                .rposition(|&used| used)
            {
                // Skip past the last busy page of the window.
                Some(busy) => start += busy + 1,
                None => {
                    self.used[start..start + pages].fill(true);
                    return Some(self.base.unchecked_add((start * PAGE_SIZE) as u64));
                }
            }
        }
        None
    }

    pub fn free(&mut self, addr: GuestAddress, pages: usize) {
        let first = (addr.unchecked_offset_from(self.base) as usize) / PAGE_SIZE;
        self.used[first..first + pages].fill(false);
    }

    pub fn free_pages(&self) -> usize {
        self.used.iter().filter(|&&used| !used).count()
    }
}

/// Stable reference to a command buffer allocated by the engine.
///
/// Handles are generation checked: once a buffer is freed, every copy of its
/// handle is rejected with [`Error::InvalidHandle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CmdBufHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct CmdBuf {
    header: GuestAddress,
    capacity: usize,
    pages: usize,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    buf: Option<CmdBuf>,
}

/// Descriptor records, indexed by [`CmdBufHandle`].
///
/// Each record owns a run of pool pages laid out as the device expects it:
/// the 64-byte header immediately followed by the payload, with room for a
/// trailing fence command.
#[derive(Debug)]
pub(crate) struct CmdBufArena {
    pool: PagePool,
    slots: Vec<Slot>,
    vacant: Vec<u32>,
}

impl CmdBufArena {
    pub(crate) fn new(pool: PagePool) -> Self {
        Self {
            pool,
            slots: Vec::new(),
            vacant: Vec::new(),
        }
    }

    pub(crate) fn allocate(&mut self, mem: &GuestMemoryMmap, size: usize) -> Result<CmdBufHandle> {
        let pages = (SVGA_CB_HEADER_SIZE + size + FENCE_CMD_SIZE).div_ceil(PAGE_SIZE);
        let header = self.pool.allocate(pages).ok_or(Error::OutOfMemory(size))?;
        let payload = header.unchecked_add(SVGA_CB_HEADER_SIZE as u64);

        // Unsubmitted buffers read as completed, so waiting on them returns
        // at once.
        let hdr = svga_cb_header {
            status: CbStatus::COMPLETED.0.into(),
            pa: payload.raw_value().into(),
            ..Default::default()
        };
        if let Err(e) = mem.write_obj(hdr, header) {
            self.pool.free(header, pages);
            return Err(Error::GuestMemory(e));
        }

        let buf = CmdBuf {
            header,
            capacity: pages * PAGE_SIZE - SVGA_CB_HEADER_SIZE - FENCE_CMD_SIZE,
            pages,
        };
        let index = match self.vacant.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.buf = Some(buf);

        debug!(
            "Allocated command buffer {index} at {:#x} ({pages} pages)",
            header.raw_value()
        );
        Ok(CmdBufHandle {
            index,
            generation: slot.generation,
        })
    }

    pub(crate) fn release(&mut self, handle: CmdBufHandle) -> Result<()> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or(Error::InvalidHandle)?;
        let buf = slot.buf.take().ok_or(Error::InvalidHandle)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(handle.index);
        self.pool.free(buf.header, buf.pages);
        trace!("Released command buffer {}", handle.index);
        Ok(())
    }

    fn get(&self, handle: CmdBufHandle) -> Result<&CmdBuf> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.buf.as_ref())
            .ok_or(Error::InvalidHandle)
    }

    pub(crate) fn header_addr(&self, handle: CmdBufHandle) -> Result<GuestAddress> {
        Ok(self.get(handle)?.header)
    }

    pub(crate) fn payload_addr(&self, handle: CmdBufHandle) -> Result<GuestAddress> {
        Ok(self
            .get(handle)?
            .header
            .unchecked_add(SVGA_CB_HEADER_SIZE as u64))
    }

    /// Payload bytes the caller may use, excluding the fence tail room.
    pub(crate) fn capacity(&self, handle: CmdBufHandle) -> Result<usize> {
        Ok(self.get(handle)?.capacity)
    }

    pub(crate) fn status(&self, mem: &GuestMemoryMmap, handle: CmdBufHandle) -> Result<CbStatus> {
        let addr = self
            .header_addr(handle)?
            .unchecked_add(SVGA_CB_STATUS_OFFSET);
        mem.load::<u32>(addr, Ordering::Acquire)
            .map(CbStatus)
            .map_err(Error::GuestMemory)
    }

    pub(crate) fn set_status(
        &self,
        mem: &GuestMemoryMmap,
        handle: CmdBufHandle,
        status: CbStatus,
    ) -> Result<()> {
        let addr = self
            .header_addr(handle)?
            .unchecked_add(SVGA_CB_STATUS_OFFSET);
        mem.store(status.0, addr, Ordering::Release)
            .map_err(Error::GuestMemory)
    }

    pub(crate) fn error_offset(&self, mem: &GuestMemoryMmap, handle: CmdBufHandle) -> Result<u32> {
        let addr = self
            .header_addr(handle)?
            .unchecked_add(SVGA_CB_ERROR_OFFSET_OFFSET);
        mem.load::<u32>(addr, Ordering::Acquire)
            .map_err(Error::GuestMemory)
    }

    pub(crate) fn read_header(
        &self,
        mem: &GuestMemoryMmap,
        handle: CmdBufHandle,
    ) -> Result<svga_cb_header> {
        mem.read_obj(self.header_addr(handle)?)
            .map_err(Error::GuestMemory)
    }

    pub(crate) fn write_header(
        &self,
        mem: &GuestMemoryMmap,
        handle: CmdBufHandle,
        header: svga_cb_header,
    ) -> Result<()> {
        mem.write_obj(header, self.header_addr(handle)?)
            .map_err(Error::GuestMemory)
    }

    /// Writes `words` at byte `offset` of the payload. The fence tail room
    /// counts as writable.
    pub(crate) fn write_words(
        &self,
        mem: &GuestMemoryMmap,
        handle: CmdBufHandle,
        offset: usize,
        words: &[u32],
    ) -> Result<()> {
        let buf = self.get(handle)?;
        let len = words.len() * 4;
        if offset + len > buf.capacity + FENCE_CMD_SIZE {
            return Err(Error::PayloadTooLarge {
                size: offset + len,
                max: buf.capacity,
            });
        }
        let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
        let addr = self.payload_addr(handle)?.unchecked_add(offset as u64);
        mem.write_slice(&bytes, addr).map_err(Error::GuestMemory)
    }

    pub(crate) fn read_words(
        &self,
        mem: &GuestMemoryMmap,
        handle: CmdBufHandle,
        len: usize,
    ) -> Result<Vec<u32>> {
        let buf = self.get(handle)?;
        if len > buf.capacity + FENCE_CMD_SIZE {
            return Err(Error::PayloadTooLarge {
                size: len,
                max: buf.capacity,
            });
        }
        let mut bytes = vec![0u8; len];
        mem.read_slice(&mut bytes, self.payload_addr(handle)?)
            .map_err(Error::GuestMemory)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub(crate) fn free_pages(&self) -> usize {
        self.pool.free_pages()
    }
}
